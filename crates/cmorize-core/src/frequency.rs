//! Mapping between approximate day-intervals, CMIP frequency names and exact
//! resampling specs.
//!
//! The CMOR tables prescribe an `approx_interval` per table header (30 days
//! for a month, 0.125 for 3-hourly, ...). Resampling needs an exact period,
//! so [`resolve_interval`] walks a descending unit ladder and emits the
//! coarsest unit the interval still fills.

use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{CmorError, Result};

/// How a variable's values relate to time, per the CMIP conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeMethod {
    Mean,
    Instantaneous,
    Climatology,
    /// Time-invariant ("fx") variables.
    None,
}

impl fmt::Display for TimeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimeMethod::Mean => "MEAN",
            TimeMethod::Instantaneous => "INSTANTANEOUS",
            TimeMethod::Climatology => "CLIMATOLOGY",
            TimeMethod::None => "NONE",
        };
        write!(f, "{label}")
    }
}

/// Classify a table or frequency name by its suffix convention.
///
/// `Pt` marks instantaneous sampling, `C`/`CM` climatologies, anything else
/// is a period mean.
pub fn classify(name: &str) -> TimeMethod {
    if name.ends_with("Pt") {
        return TimeMethod::Instantaneous;
    }
    if name.ends_with("C") || name.ends_with("CM") {
        return TimeMethod::Climatology;
    }
    TimeMethod::Mean
}

/// Time method of a frequency name. Catalogued frequencies carry their
/// declared method, which is how `fx` maps to [`TimeMethod::None`]; names
/// outside the catalogue fall back to suffix classification.
pub fn time_method_for(name: &str) -> TimeMethod {
    Frequency::for_name(name)
        .map(|f| f.time_method)
        .unwrap_or_else(|| classify(name))
}

/// Resampling period units, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeriodUnit {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl PeriodUnit {
    /// Token code, pandas-compatible (`YS`/`MS` anchor periods at their start).
    pub fn code(&self) -> &'static str {
        match self {
            PeriodUnit::Year => "YS",
            PeriodUnit::Month => "MS",
            PeriodUnit::Day => "D",
            PeriodUnit::Hour => "h",
            PeriodUnit::Minute => "m",
            PeriodUnit::Second => "s",
        }
    }

    /// Nominal unit length in days, used when decoding tokens back to spans.
    pub fn approx_days(&self) -> f64 {
        match self {
            PeriodUnit::Year => 365.25,
            PeriodUnit::Month => 30.0,
            PeriodUnit::Day => 1.0,
            PeriodUnit::Hour => 1.0 / 24.0,
            PeriodUnit::Minute => 1.0 / 1440.0,
            PeriodUnit::Second => 1.0 / 86_400.0,
        }
    }
}

/// An exact resampling frequency: `count` periods of `unit`.
///
/// Renders as the frequency token used in file names and logs, e.g. `3MS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResampleSpec {
    pub count: u32,
    pub unit: PeriodUnit,
}

impl ResampleSpec {
    pub fn new(count: u32, unit: PeriodUnit) -> Self {
        Self { count, unit }
    }

    /// The span this spec approximates, in days.
    pub fn approx_days(&self) -> f64 {
        self.count as f64 * self.unit.approx_days()
    }
}

impl fmt::Display for ResampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.code())
    }
}

/// Convert an approximate interval in days (string-encoded, as the CMOR table
/// headers carry it) into an exact resampling spec.
///
/// The ladder runs decade, year, month, day, hour, minute, second; the
/// coarsest unit for which `interval / unit_length >= 1` wins, and the count
/// is rounded. Year counts are leap-corrected (365.25-day years). An interval
/// rounding to exactly 60 days is treated as 59 days, otherwise it would sit
/// ambiguously between one and two month tokens.
pub fn resolve_interval(interval: &str) -> Result<ResampleSpec> {
    let days: f64 = interval
        .trim()
        .parse()
        .map_err(|_| CmorError::InvalidInterval(interval.to_string()))?;
    if !days.is_finite() || days <= 0.0 {
        return Err(CmorError::InvalidInterval(interval.to_string()));
    }

    let days = if days.round() == 60.0 { 59.0 } else { days };

    let spec = if days / 365.0 >= 1.0 {
        let count = (days / 365.25).round().max(1.0) as u32;
        ResampleSpec::new(count, PeriodUnit::Year)
    } else if days / 30.0 >= 1.0 {
        ResampleSpec::new((days / 30.0).round() as u32, PeriodUnit::Month)
    } else if days >= 1.0 {
        ResampleSpec::new(days.round() as u32, PeriodUnit::Day)
    } else if days * 24.0 >= 1.0 {
        ResampleSpec::new((days * 24.0).round() as u32, PeriodUnit::Hour)
    } else if days * 1440.0 >= 1.0 {
        ResampleSpec::new((days * 1440.0).round() as u32, PeriodUnit::Minute)
    } else {
        let count = (days * 86_400.0).round().max(1.0) as u32;
        ResampleSpec::new(count, PeriodUnit::Second)
    };
    Ok(spec)
}

/// One entry of the CMIP frequency catalogue.
#[derive(Debug, Clone, PartialEq)]
pub struct Frequency {
    pub name: &'static str,
    pub approx_interval: f64,
    pub time_method: TimeMethod,
}

impl Frequency {
    const fn new(name: &'static str, approx_interval: f64, time_method: TimeMethod) -> Self {
        Self {
            name,
            approx_interval,
            time_method,
        }
    }

    /// Look a frequency up by its CMIP name (`"mon"`, `"3hrPt"`, ...).
    pub fn for_name(name: &str) -> Option<&'static Frequency> {
        ALL_FREQUENCIES.iter().find(|f| f.name == name)
    }
}

/// Every frequency declared in the CMIP data request, ordered by interval.
pub static ALL_FREQUENCIES: Lazy<Vec<Frequency>> = Lazy::new(|| {
    vec![
        Frequency::new("fx", 0.0, TimeMethod::None),
        Frequency::new("subhrPt", 0.017361, TimeMethod::Instantaneous),
        Frequency::new("1hr", 1.0 / 24.0, TimeMethod::Mean),
        Frequency::new("1hrPt", 1.0 / 24.0, TimeMethod::Instantaneous),
        Frequency::new("1hrCM", 1.0 / 24.0, TimeMethod::Climatology),
        Frequency::new("3hr", 3.0 / 24.0, TimeMethod::Mean),
        Frequency::new("3hrPt", 3.0 / 24.0, TimeMethod::Instantaneous),
        Frequency::new("6hr", 6.0 / 24.0, TimeMethod::Mean),
        Frequency::new("6hrPt", 6.0 / 24.0, TimeMethod::Instantaneous),
        Frequency::new("day", 1.0, TimeMethod::Mean),
        Frequency::new("mon", 30.0, TimeMethod::Mean),
        Frequency::new("monPt", 30.0, TimeMethod::Instantaneous),
        Frequency::new("monC", 30.0, TimeMethod::Climatology),
        Frequency::new("yr", 365.0, TimeMethod::Mean),
        Frequency::new("yrPt", 365.0, TimeMethod::Instantaneous),
        Frequency::new("dec", 3650.0, TimeMethod::Mean),
    ]
});
