//! Temporal averaging of a time-indexed DataFrame.
//!
//! Applies a [`TimeMethod`](crate::frequency::TimeMethod) classification to a
//! frame carrying a `time` column: instantaneous series keep the first sample
//! of each period, means resample-and-reduce with a configurable anchor for
//! the output timestamp, climatologies collapse onto the calendar field.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use polars::prelude::*;

use crate::error::{CmorError, Result};
use crate::frequency::{PeriodUnit, ResampleSpec, TimeMethod};

/// Name of the temporal axis column every time-dependent frame must carry.
pub const TIME_COLUMN: &str = "time";

/// How many leading data partitions [`compute_file_timespan`] samples.
const SAMPLED_PARTITIONS: usize = 3;

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;
const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;
const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

/// Placement of the output timestamp within each resampled period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnchorOffset {
    /// Linear interpolation between the period's first and last observed
    /// sample: 0 = first, 1 = last.
    Fraction(f64),
    /// Fixed span added to the period start, e.g. 14 days for mid-month.
    Span(chrono::Duration),
}

impl Default for AnchorOffset {
    fn default() -> Self {
        AnchorOffset::Fraction(0.5)
    }
}

impl FromStr for AnchorOffset {
    type Err = CmorError;

    /// Resolution order: named preset, numeric fraction, duration string.
    /// The first successful parse wins.
    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        match trimmed {
            "first" | "start" => return Ok(AnchorOffset::Fraction(0.0)),
            "last" | "end" => return Ok(AnchorOffset::Fraction(1.0)),
            "mid" | "middle" => return Ok(AnchorOffset::Fraction(0.5)),
            _ => {}
        }
        if let Ok(fraction) = trimmed.parse::<f64>() {
            if (0.0..=1.0).contains(&fraction) {
                return Ok(AnchorOffset::Fraction(fraction));
            }
            return Err(CmorError::InvalidAnchorOffset(raw.to_string()));
        }
        parse_span(trimmed).ok_or_else(|| CmorError::InvalidAnchorOffset(raw.to_string()))
    }
}

fn parse_span(raw: &str) -> Option<AnchorOffset> {
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (count, unit) = raw.split_at(split);
    let count: i64 = count.parse().ok()?;
    let span = match unit {
        "d" | "D" => chrono::Duration::days(count),
        "h" | "H" => chrono::Duration::hours(count),
        "m" | "min" => chrono::Duration::minutes(count),
        "s" | "S" => chrono::Duration::seconds(count),
        _ => return None,
    };
    Some(AnchorOffset::Span(span))
}

/// Everything the averaging step needs to know about the target variable.
#[derive(Debug, Clone)]
pub struct AveragingRequest<'a> {
    pub method: TimeMethod,
    pub spec: ResampleSpec,
    pub anchor: AnchorOffset,
    /// CMIP frequency name, consulted for climatology grouping.
    pub frequency_name: &'a str,
    /// Table identity, attached to climatology errors.
    pub table_id: &'a str,
}

/// Resample `df` according to the request.
///
/// The input is expected to be sorted by `time`. A frame without a `time`
/// column fails with `MissingTemporalAxis`, one with zero rows with
/// `EmptyTemporalAxis`.
pub fn average(df: &DataFrame, request: &AveragingRequest<'_>) -> Result<DataFrame> {
    let times = extract_times(df)?;

    match request.method {
        TimeMethod::Instantaneous => resample_first(df, &times, request.spec),
        TimeMethod::Mean => resample_mean(df, &times, request.spec, &request.anchor),
        TimeMethod::Climatology => match request.frequency_name {
            "monC" => climatology(df, &times, "month", |dt| dt.month()),
            "1hrCM" => climatology(df, &times, "hour", |dt| dt.hour()),
            other => Err(CmorError::UnknownClimatology {
                frequency: other.to_string(),
                table_id: request.table_id.to_string(),
            }),
        },
        TimeMethod::None => Ok(df.clone()),
    }
}

/// Estimate the dominant timespan of one data partition, in whole days.
///
/// `partitions` gives the row count of each source partition, one per input
/// file, in stacking order. Only the first few partitions are examined and
/// the maximum observed span is returned. When no partition layout is known
/// (or it does not cover the frame) the whole series counts as one
/// partition. This is an estimate for output segmentation, not an exact
/// guarantee: a partition starting mid-period under-reports its span.
pub fn compute_file_timespan(df: &DataFrame, partitions: &[usize]) -> Result<i64> {
    let times = extract_times(df)?;
    let whole = [times.len()];
    let counts: &[usize] =
        if !partitions.is_empty() && partitions.iter().sum::<usize>() == times.len() {
            partitions
        } else {
            &whole
        };
    let mut max_span = 0;
    let mut offset = 0;
    for &count in counts.iter().take(SAMPLED_PARTITIONS) {
        if count > 0 {
            let first = times[offset];
            let last = times[offset + count - 1];
            max_span = max_span.max((last - first) / MICROS_PER_DAY);
        }
        offset += count;
    }
    Ok(max_span)
}

pub(crate) fn extract_times(df: &DataFrame) -> Result<Vec<i64>> {
    let column = df
        .column(TIME_COLUMN)
        .map_err(|_| CmorError::MissingTemporalAxis)?;
    let chunked = column
        .as_materialized_series()
        .datetime()
        .map_err(|_| CmorError::MissingTemporalAxis)?;
    if chunked.is_empty() {
        return Err(CmorError::EmptyTemporalAxis);
    }
    let mut times = Vec::with_capacity(chunked.len());
    for idx in 0..chunked.len() {
        let micros = chunked.get(idx).ok_or(CmorError::EmptyTemporalAxis)?;
        times.push(micros);
    }
    Ok(times)
}

fn naive_from_micros(micros: i64) -> Result<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .map(|dt| dt.naive_utc())
        .ok_or(CmorError::InvalidTimestamp(micros))
}

fn naive_to_micros(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_micros()
}

/// Start of the period containing `micros`, with periods anchored at the
/// floor of the series' first timestamp.
fn period_start(micros: i64, origin: i64, spec: ResampleSpec) -> Result<i64> {
    let count = spec.count as i64;
    match spec.unit {
        PeriodUnit::Year => {
            let dt = naive_from_micros(micros)?;
            let origin_year = naive_from_micros(origin)?.year() as i64;
            let group = (dt.year() as i64 - origin_year).div_euclid(count);
            let start_year = origin_year + group * count;
            let date = NaiveDate::from_ymd_opt(start_year as i32, 1, 1)
                .ok_or(CmorError::InvalidTimestamp(micros))?;
            Ok(naive_to_micros(
                date.and_hms_opt(0, 0, 0)
                    .ok_or(CmorError::InvalidTimestamp(micros))?,
            ))
        }
        PeriodUnit::Month => {
            let dt = naive_from_micros(micros)?;
            let origin_dt = naive_from_micros(origin)?;
            let month_index = dt.year() as i64 * 12 + dt.month0() as i64;
            let origin_index = origin_dt.year() as i64 * 12 + origin_dt.month0() as i64;
            let group = (month_index - origin_index).div_euclid(count);
            let start_index = origin_index + group * count;
            let year = start_index.div_euclid(12) as i32;
            let month = start_index.rem_euclid(12) as u32 + 1;
            let date = NaiveDate::from_ymd_opt(year, month, 1)
                .ok_or(CmorError::InvalidTimestamp(micros))?;
            Ok(naive_to_micros(
                date.and_hms_opt(0, 0, 0)
                    .ok_or(CmorError::InvalidTimestamp(micros))?,
            ))
        }
        PeriodUnit::Day | PeriodUnit::Hour | PeriodUnit::Minute | PeriodUnit::Second => {
            let unit_micros = match spec.unit {
                PeriodUnit::Day => MICROS_PER_DAY,
                PeriodUnit::Hour => MICROS_PER_HOUR,
                PeriodUnit::Minute => MICROS_PER_MINUTE,
                _ => MICROS_PER_SECOND,
            };
            let period = unit_micros * count;
            let floored_origin = origin.div_euclid(unit_micros) * unit_micros;
            let group = (micros - floored_origin).div_euclid(period);
            Ok(floored_origin + group * period)
        }
    }
}

/// Groups of row indices per period start, in temporal order.
fn group_by_period(times: &[i64], spec: ResampleSpec) -> Result<BTreeMap<i64, Vec<usize>>> {
    let origin = times[0];
    let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (idx, &micros) in times.iter().enumerate() {
        let start = period_start(micros, origin, spec)?;
        groups.entry(start).or_default().push(idx);
    }
    Ok(groups)
}

fn time_series(micros: Vec<i64>) -> Result<Series> {
    let series = Series::new(TIME_COLUMN.into(), micros)
        .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?;
    Ok(series)
}

fn is_reducible(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Float64
            | DataType::Float32
            | DataType::Int64
            | DataType::Int32
            | DataType::Int16
            | DataType::UInt64
            | DataType::UInt32
    )
}

fn resample_first(df: &DataFrame, times: &[i64], spec: ResampleSpec) -> Result<DataFrame> {
    let groups = group_by_period(times, spec)?;
    let mut starts = Vec::with_capacity(groups.len());
    let mut picks = Vec::with_capacity(groups.len());
    for (start, rows) in &groups {
        starts.push(*start);
        picks.push(rows[0] as IdxSize);
    }
    let indices = IdxCa::from_vec("picks".into(), picks);
    let mut out = df.take(&indices)?;
    out.with_column(time_series(starts)?)?;
    Ok(out)
}

fn resample_mean(
    df: &DataFrame,
    times: &[i64],
    spec: ResampleSpec,
    anchor: &AnchorOffset,
) -> Result<DataFrame> {
    let groups = group_by_period(times, spec)?;

    let mut stamps = Vec::with_capacity(groups.len());
    for (start, rows) in &groups {
        let stamp = match anchor {
            AnchorOffset::Fraction(fraction) => {
                let first = times[rows[0]];
                let last = times[rows[rows.len() - 1]];
                first + ((last - first) as f64 * fraction) as i64
            }
            AnchorOffset::Span(span) => {
                start
                    + span
                        .num_microseconds()
                        .ok_or(CmorError::InvalidTimestamp(*start))?
            }
        };
        stamps.push(stamp);
    }

    let mut columns: Vec<Column> = vec![time_series(stamps)?.into()];
    for column in df.get_columns() {
        if column.name().as_str() == TIME_COLUMN || !is_reducible(column.dtype()) {
            continue;
        }
        let values = column
            .as_materialized_series()
            .cast(&DataType::Float64)?
            .f64()?
            .clone();
        let mut means = Vec::with_capacity(groups.len());
        for rows in groups.values() {
            means.push(mean_over(&values, rows));
        }
        columns.push(Series::new(column.name().clone(), means).into());
    }
    Ok(DataFrame::new(columns)?)
}

fn mean_over(values: &Float64Chunked, rows: &[usize]) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &row in rows {
        if let Some(value) = values.get(row) {
            sum += value;
            count += 1;
        }
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Collapse all samples sharing a calendar field (month-of-year or
/// hour-of-day) into one mean, across the whole series.
fn climatology(
    df: &DataFrame,
    times: &[i64],
    field_name: &str,
    field: impl Fn(&NaiveDateTime) -> u32,
) -> Result<DataFrame> {
    let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (idx, &micros) in times.iter().enumerate() {
        let dt = naive_from_micros(micros)?;
        groups.entry(field(&dt)).or_default().push(idx);
    }

    let keys: Vec<u32> = groups.keys().copied().collect();
    let mut columns: Vec<Column> = vec![Series::new(field_name.into(), keys).into()];
    for column in df.get_columns() {
        if column.name().as_str() == TIME_COLUMN || !is_reducible(column.dtype()) {
            continue;
        }
        let values = column
            .as_materialized_series()
            .cast(&DataType::Float64)?
            .f64()?
            .clone();
        let mut means = Vec::with_capacity(groups.len());
        for rows in groups.values() {
            means.push(mean_over(&values, rows));
        }
        columns.push(Series::new(column.name().clone(), means).into());
    }
    Ok(DataFrame::new(columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frequency::{PeriodUnit, ResampleSpec};
    use chrono::NaiveDate;

    fn micros(y: i32, mo: u32, d: u32, h: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_micros()
    }

    fn frame(times: Vec<i64>, values: Vec<f64>) -> DataFrame {
        let time = Series::new(TIME_COLUMN.into(), times)
            .cast(&DataType::Datetime(TimeUnit::Microseconds, None))
            .unwrap();
        let tas = Series::new("tas".into(), values);
        DataFrame::new(vec![time.into(), tas.into()]).unwrap()
    }

    fn monthly_request(anchor: AnchorOffset) -> AveragingRequest<'static> {
        AveragingRequest {
            method: TimeMethod::Mean,
            spec: ResampleSpec::new(1, PeriodUnit::Month),
            anchor,
            frequency_name: "mon",
            table_id: "Amon",
        }
    }

    #[test]
    fn monthly_mean_places_midpoint_timestamps() {
        // Daily samples over January and February 2000.
        let mut times = Vec::new();
        let mut values = Vec::new();
        for day in 1..=31 {
            times.push(micros(2000, 1, day, 0));
            values.push(1.0);
        }
        for day in 1..=29 {
            times.push(micros(2000, 2, day, 0));
            values.push(3.0);
        }
        let df = frame(times, values);

        let out = average(&df, &monthly_request(AnchorOffset::Fraction(0.5))).unwrap();
        assert_eq!(out.height(), 2);

        let out_times = out
            .column(TIME_COLUMN)
            .unwrap()
            .as_materialized_series()
            .datetime()
            .unwrap()
            .clone();
        // Midpoint between Jan 1 and Jan 31 is Jan 16 00:00.
        assert_eq!(out_times.get(0).unwrap(), micros(2000, 1, 16, 0));
        // Midpoint between Feb 1 and Feb 29 is Feb 15 00:00.
        assert_eq!(out_times.get(1).unwrap(), micros(2000, 2, 15, 0));

        let means = out.column("tas").unwrap().f64().unwrap().clone();
        assert_eq!(means.get(0).unwrap(), 1.0);
        assert_eq!(means.get(1).unwrap(), 3.0);
    }

    #[test]
    fn mean_with_span_anchor_offsets_period_start() {
        let times = vec![
            micros(2000, 1, 1, 0),
            micros(2000, 1, 15, 0),
            micros(2000, 2, 1, 0),
        ];
        let df = frame(times, vec![2.0, 4.0, 8.0]);

        let anchor: AnchorOffset = "14d".parse().unwrap();
        let out = average(&df, &monthly_request(anchor)).unwrap();
        let out_times = out
            .column(TIME_COLUMN)
            .unwrap()
            .as_materialized_series()
            .datetime()
            .unwrap()
            .clone();
        assert_eq!(out_times.get(0).unwrap(), micros(2000, 1, 15, 0));
        assert_eq!(out_times.get(1).unwrap(), micros(2000, 2, 15, 0));

        let means = out.column("tas").unwrap().f64().unwrap().clone();
        assert_eq!(means.get(0).unwrap(), 3.0);
        assert_eq!(means.get(1).unwrap(), 8.0);
    }

    #[test]
    fn instantaneous_takes_first_sample_per_period() {
        let times = vec![
            micros(2000, 1, 1, 6),
            micros(2000, 1, 20, 0),
            micros(2000, 2, 2, 0),
            micros(2000, 2, 20, 0),
        ];
        let df = frame(times, vec![10.0, 11.0, 20.0, 21.0]);

        let request = AveragingRequest {
            method: TimeMethod::Instantaneous,
            spec: ResampleSpec::new(1, PeriodUnit::Month),
            anchor: AnchorOffset::default(),
            frequency_name: "monPt",
            table_id: "Amon",
        };
        let out = average(&df, &request).unwrap();
        assert_eq!(out.height(), 2);

        let values = out.column("tas").unwrap().f64().unwrap().clone();
        assert_eq!(values.get(0).unwrap(), 10.0);
        assert_eq!(values.get(1).unwrap(), 20.0);

        let out_times = out
            .column(TIME_COLUMN)
            .unwrap()
            .as_materialized_series()
            .datetime()
            .unwrap()
            .clone();
        assert_eq!(out_times.get(0).unwrap(), micros(2000, 1, 1, 0));
        assert_eq!(out_times.get(1).unwrap(), micros(2000, 2, 1, 0));
    }

    #[test]
    fn monthly_climatology_groups_by_calendar_month() {
        // Two years of monthly samples; January is 1.0/3.0, July 10.0/20.0.
        let mut times = Vec::new();
        let mut values = Vec::new();
        for (year, jan, jul) in [(2000, 1.0, 10.0), (2001, 3.0, 20.0)] {
            for month in 1..=12u32 {
                times.push(micros(year, month, 15, 0));
                values.push(match month {
                    1 => jan,
                    7 => jul,
                    _ => 0.0,
                });
            }
        }
        let df = frame(times, values);

        let request = AveragingRequest {
            method: TimeMethod::Climatology,
            spec: ResampleSpec::new(1, PeriodUnit::Month),
            anchor: AnchorOffset::default(),
            frequency_name: "monC",
            table_id: "Oclim",
        };
        let out = average(&df, &request).unwrap();
        assert_eq!(out.height(), 12);

        let months = out.column("month").unwrap().u32().unwrap().clone();
        assert_eq!(months.get(0).unwrap(), 1);
        let means = out.column("tas").unwrap().f64().unwrap().clone();
        assert_eq!(means.get(0).unwrap(), 2.0);
        assert_eq!(means.get(6).unwrap(), 15.0);
    }

    #[test]
    fn unknown_climatology_is_a_configuration_error() {
        let df = frame(vec![micros(2000, 1, 1, 0)], vec![1.0]);
        let request = AveragingRequest {
            method: TimeMethod::Climatology,
            spec: ResampleSpec::new(1, PeriodUnit::Day),
            anchor: AnchorOffset::default(),
            frequency_name: "dayC",
            table_id: "Eday",
        };
        let err = average(&df, &request).unwrap_err();
        assert!(matches!(err, CmorError::UnknownClimatology { .. }));
    }

    #[test]
    fn missing_and_empty_time_axes_fail() {
        let no_time = DataFrame::new(vec![Series::new("tas".into(), vec![1.0]).into()]).unwrap();
        assert!(matches!(
            average(
                &no_time,
                &monthly_request(AnchorOffset::default())
            )
            .unwrap_err(),
            CmorError::MissingTemporalAxis
        ));

        let empty = frame(Vec::new(), Vec::new());
        assert!(matches!(
            average(&empty, &monthly_request(AnchorOffset::default())).unwrap_err(),
            CmorError::EmptyTemporalAxis
        ));
    }

    #[test]
    fn anchor_offset_parsing_order() {
        assert_eq!(
            "first".parse::<AnchorOffset>().unwrap(),
            AnchorOffset::Fraction(0.0)
        );
        assert_eq!(
            "end".parse::<AnchorOffset>().unwrap(),
            AnchorOffset::Fraction(1.0)
        );
        assert_eq!(
            "0.25".parse::<AnchorOffset>().unwrap(),
            AnchorOffset::Fraction(0.25)
        );
        assert_eq!(
            "14d".parse::<AnchorOffset>().unwrap(),
            AnchorOffset::Span(chrono::Duration::days(14))
        );
        assert!("1.5".parse::<AnchorOffset>().is_err());
        assert!("sideways".parse::<AnchorOffset>().is_err());
    }

    fn daily_frame(days: usize) -> DataFrame {
        let mut times = Vec::new();
        let mut values = Vec::new();
        let start = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        for offset in 0..days {
            let date = start + chrono::Duration::days(offset as i64);
            times.push(date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_micros());
            values.push(0.0);
        }
        frame(times, values)
    }

    #[test]
    fn file_timespan_follows_the_partition_layout() {
        // A year of daily samples from three four-month source files.
        let df = daily_frame(360);
        let span = compute_file_timespan(&df, &[120, 120, 120]).unwrap();
        assert_eq!(span, 119);
        // Without a partition layout the whole series counts as one file.
        let span = compute_file_timespan(&df, &[]).unwrap();
        assert_eq!(span, 359);
    }

    #[test]
    fn file_timespan_of_yearly_files_stays_one_year() {
        // Ten years of daily samples, one file per year. The estimate must
        // track the per-file span, not the length of the stacked series.
        let df = daily_frame(3650);
        let span = compute_file_timespan(&df, &[365; 10]).unwrap();
        assert_eq!(span, 364);
    }

    #[test]
    fn file_timespan_ignores_a_mismatched_partition_layout() {
        // Stale row counts that do not cover the frame are discarded.
        let df = daily_frame(100);
        let span = compute_file_timespan(&df, &[30, 30]).unwrap();
        assert_eq!(span, 99);
    }
}
