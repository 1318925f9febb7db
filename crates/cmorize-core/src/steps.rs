//! Built-in pipeline steps.
//!
//! Each step is a plain function matching [`StepFn`](crate::pipeline::StepFn):
//! it receives the previous step's frame (None for the first step) and the
//! mutable rule context, and returns the next frame. Steps communicate only
//! through the frame and the context.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use polars::prelude::*;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{CmorError, Result};
use crate::frequency::{resolve_interval, TimeMethod};
use crate::rule::RuleContext;
use crate::timeaverage::{average, compute_file_timespan, extract_times, AveragingRequest, TIME_COLUMN};

const MICROS_PER_DAY: i64 = 24 * 60 * 60 * 1_000_000;

fn required(data: Option<DataFrame>, step: &str) -> Result<DataFrame> {
    data.ok_or_else(|| CmorError::Config(format!("step {step} needs an input frame")))
}

fn read_one(path: &Path) -> Result<DataFrame> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match extension {
        "parquet" => Ok(ParquetReader::new(std::fs::File::open(path)?).finish()?),
        "csv" => Ok(LazyCsvReader::new(path)
            .with_has_header(true)
            .with_try_parse_dates(true)
            .finish()?
            .collect()?),
        other => Err(CmorError::Config(format!(
            "unsupported input format {other:?} for {}",
            path.display()
        ))),
    }
}

/// Read every matched input file and stack them into one frame. Each file is
/// sorted along its own temporal axis and files are stacked in order of
/// their first timestamp, so every source file stays one contiguous
/// partition whose row count is recorded in the context.
pub fn load_inputs(_data: Option<DataFrame>, ctx: &mut RuleContext) -> Result<DataFrame> {
    if ctx.matched_files.is_empty() {
        return Err(CmorError::Config(format!(
            "rule {} matched no input files",
            ctx.rule_name
        )));
    }
    info!(
        rule = ctx.rule_name,
        files = ctx.matched_files.len(),
        "loading input files"
    );

    let mut frames = Vec::with_capacity(ctx.matched_files.len());
    for path in &ctx.matched_files {
        debug!(file = %path.display(), "reading input");
        let mut frame = read_one(path)?;
        if let Ok(column) = frame.column(TIME_COLUMN) {
            if column.dtype() == &DataType::Date {
                let casted = column
                    .as_materialized_series()
                    .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?;
                frame.with_column(casted)?;
            }
            frame = frame.sort([TIME_COLUMN], SortMultipleOptions::default())?;
        }
        frames.push(frame);
    }
    frames.sort_by_key(|frame| extract_times(frame).ok().and_then(|t| t.first().copied()));
    ctx.partition_rows = frames.iter().map(|frame| frame.height()).collect();

    let mut iter = frames.into_iter();
    let mut combined = iter.next().unwrap_or_default();
    for frame in iter {
        combined.vstack_mut(&frame)?;
    }
    Ok(combined)
}

/// Narrow the frame to the temporal axis and the target variable, renaming
/// the model's column to the CMOR identifier.
pub fn select_variable(data: Option<DataFrame>, ctx: &mut RuleContext) -> Result<DataFrame> {
    let df = required(data, "select_variable")?;
    let source = ctx
        .attrs
        .model_variable
        .clone()
        .unwrap_or_else(|| ctx.cmor_variable.clone());

    let mut out = if df.column(TIME_COLUMN).is_ok() {
        df.select([TIME_COLUMN, source.as_str()])?
    } else {
        df.select([source.as_str()])?
    };
    if source != ctx.cmor_variable {
        out.rename(&source, ctx.cmor_variable.as_str().into())?;
    }
    Ok(out)
}

/// Resample the frame to the frequency its data-request variable declares,
/// recording the resolved frequency token, time-method and estimated file
/// timespan in the context for the writer step.
pub fn time_average(data: Option<DataFrame>, ctx: &mut RuleContext) -> Result<DataFrame> {
    let df = required(data, "time_average")?;
    let drv = ctx
        .data_request_variable
        .clone()
        .ok_or_else(|| CmorError::MissingDataRequestVariable {
            rule: ctx.rule_name.clone(),
        })?;

    if drv.time_method == TimeMethod::None {
        ctx.time_method = Some(TimeMethod::None);
        return Ok(df);
    }

    // The first source table drives the output frequency.
    let table_id = drv.tables.first().cloned().unwrap_or_default();
    let frequency_name = drv.frequencies.first().cloned().unwrap_or_default();
    let interval = drv.approx_intervals.first().cloned().unwrap_or_default();

    let spec = resolve_interval(&interval)?;
    let anchor = ctx.attrs.anchor_offset()?;
    ctx.file_timespan_days = Some(compute_file_timespan(&df, &ctx.partition_rows)?);
    ctx.frequency_token = Some(spec.to_string());
    ctx.time_method = Some(drv.time_method);
    info!(
        rule = ctx.rule_name,
        token = %spec,
        method = %drv.time_method,
        "resampling to target frequency"
    );

    let request = AveragingRequest {
        method: drv.time_method,
        spec,
        anchor,
        frequency_name: &frequency_name,
        table_id: &table_id,
    };
    average(&df, &request)
}

/// Convert the variable from the model's unit to the data request's unit.
/// A rule without a declared model unit is assumed to already be in the
/// target unit.
pub fn convert_units(data: Option<DataFrame>, ctx: &mut RuleContext) -> Result<DataFrame> {
    let df = required(data, "convert_units")?;
    let drv = ctx
        .data_request_variable
        .as_ref()
        .ok_or_else(|| CmorError::MissingDataRequestVariable {
            rule: ctx.rule_name.clone(),
        })?;

    let Some(from_unit) = ctx.attrs.model_unit.clone() else {
        debug!(rule = ctx.rule_name, "no model unit declared, skipping conversion");
        return Ok(df);
    };
    let to_unit = drv.unit.clone();
    let column = ctx.cmor_variable.clone();
    ctx.services
        .unit_converter
        .convert(df, &column, &from_unit, &to_unit)
}

/// Assemble the global attributes for the output files. The frame passes
/// through unchanged.
pub fn attach_metadata(data: Option<DataFrame>, ctx: &mut RuleContext) -> Result<DataFrame> {
    let df = required(data, "attach_metadata")?;

    let mut attrs = std::collections::BTreeMap::new();
    attrs.insert("variable_id".to_string(), ctx.cmor_variable.clone());
    if let Some(drv) = &ctx.data_request_variable {
        if let Some(table) = drv.tables.first() {
            attrs.insert("table_id".to_string(), table.clone());
        }
        if let Some(frequency) = drv.frequencies.first() {
            attrs.insert("frequency".to_string(), frequency.clone());
        }
        attrs.insert("units".to_string(), drv.unit.clone());
    }
    attrs.insert(
        "institution_id".to_string(),
        ctx.attrs.institution.clone().unwrap_or_else(|| "AWI".to_string()),
    );
    if let Some(source_id) = &ctx.attrs.source_id {
        attrs.insert("source_id".to_string(), source_id.clone());
    }
    if let Some(experiment_id) = &ctx.attrs.experiment_id {
        attrs.insert("experiment_id".to_string(), experiment_id.clone());
    }
    attrs.insert(
        "variant_label".to_string(),
        ctx.attrs
            .variant_label
            .clone()
            .unwrap_or_else(|| "r1i1p1f1".to_string()),
    );
    attrs.insert(
        "grid_label".to_string(),
        ctx.attrs.grid_label.clone().unwrap_or_else(|| "gn".to_string()),
    );
    attrs.insert("creation_date".to_string(), Utc::now().to_rfc3339());
    ctx.global_attrs.extend(attrs);
    Ok(df)
}

fn month_label(micros: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .map(|dt| dt.format("%Y%m").to_string())
        .unwrap_or_else(|| "000000".to_string())
}

fn output_file_name(ctx: &RuleContext, range: Option<(i64, i64)>) -> String {
    let attr = |key: &str, fallback: &str| {
        ctx.global_attrs
            .get(key)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    };
    let stem = format!(
        "{}_{}_{}_{}_{}_{}",
        ctx.cmor_variable,
        attr("table_id", "unknown"),
        attr("source_id", "unknown"),
        attr("experiment_id", "unknown"),
        attr("variant_label", "r1i1p1f1"),
        attr("grid_label", "gn"),
    );
    match range {
        Some((start, end)) => {
            format!("{stem}_{}-{}.parquet", month_label(start), month_label(end))
        }
        None => format!("{stem}.parquet"),
    }
}

/// Contiguous row ranges whose temporal extent stays within the estimated
/// file timespan. With no estimate everything lands in one segment.
fn segment_rows(times: &[i64], timespan_days: Option<i64>) -> Vec<(usize, usize)> {
    let Some(days) = timespan_days.filter(|d| *d > 0) else {
        return vec![(0, times.len())];
    };
    let span_micros = days * MICROS_PER_DAY;
    let mut segments = Vec::new();
    let mut start_row = 0;
    let mut segment_start = times[0];
    for (row, &micros) in times.iter().enumerate() {
        if micros - segment_start >= span_micros {
            segments.push((start_row, row - start_row));
            start_row = row;
            segment_start = micros;
        }
    }
    segments.push((start_row, times.len() - start_row));
    segments
}

/// Write the frame out, segmented into files covering roughly the estimated
/// input-file timespan each. Frames without a temporal axis (climatologies,
/// time-invariant fields) become a single file without a date range.
pub fn write_output(data: Option<DataFrame>, ctx: &mut RuleContext) -> Result<DataFrame> {
    let df = required(data, "write_output")?;
    let output_dir = ctx
        .output_dir
        .clone()
        .or_else(|| ctx.attrs.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));

    if df.column(TIME_COLUMN).is_err() {
        let path = output_dir.join(output_file_name(ctx, None));
        let written = ctx.services.sink.write(&df, &path)?;
        info!(rule = ctx.rule_name, file = %written.display(), "wrote output file");
        ctx.written_files.push(written);
        return Ok(df);
    }

    let times = extract_times(&df)?;
    let segments = segment_rows(&times, ctx.file_timespan_days);
    if segments.len() > 1 {
        info!(
            rule = ctx.rule_name,
            segments = segments.len(),
            "segmenting output by estimated file timespan"
        );
    }
    for (offset, len) in segments {
        if len == 0 {
            continue;
        }
        let slice = df.slice(offset as i64, len);
        let range = (times[offset], times[offset + len - 1]);
        let path = output_dir.join(output_file_name(ctx, Some(range)));
        let written = ctx.services.sink.write(&slice, &path)?;
        debug!(file = %written.display(), rows = len, "wrote output segment");
        ctx.written_files.push(written);
    }
    Ok(df)
}

/// Testing step: fabricate a small daily series instead of reading files.
pub fn dummy_load_data(_data: Option<DataFrame>, ctx: &mut RuleContext) -> Result<DataFrame> {
    debug!(rule = ctx.rule_name, "fabricating dummy input data");
    let mut rng = rand::thread_rng();
    let origin = chrono::NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_micros())
        .unwrap_or(0);
    let times: Vec<i64> = (0..10).map(|day| origin + day * MICROS_PER_DAY).collect();
    let values: Vec<f64> = (0..10).map(|_| rng.gen_range(250.0..310.0)).collect();

    let time = Series::new(TIME_COLUMN.into(), times)
        .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?;
    let tas = Series::new(ctx.cmor_variable.as_str().into(), values);
    Ok(DataFrame::new(vec![time.into(), tas.into()])?)
}

/// Testing step: pass the frame through untouched.
pub fn dummy_logic_step(data: Option<DataFrame>, ctx: &mut RuleContext) -> Result<DataFrame> {
    let df = required(data, "dummy_logic_step")?;
    debug!(rule = ctx.rule_name, rows = df.height(), "dummy logic step");
    Ok(df)
}

/// Testing step: write a single file when an output directory is configured,
/// otherwise pass through.
pub fn dummy_save_data(data: Option<DataFrame>, ctx: &mut RuleContext) -> Result<DataFrame> {
    let df = required(data, "dummy_save_data")?;
    match ctx.output_dir.clone().or_else(|| ctx.attrs.output_dir.clone()) {
        Some(dir) => {
            let path = dir.join(format!("{}_dummy.parquet", ctx.cmor_variable));
            let written = ctx.services.sink.write(&df, &path)?;
            ctx.written_files.push(written);
        }
        None => warn!(rule = ctx.rule_name, "no output directory, skipping dummy save"),
    }
    Ok(df)
}
