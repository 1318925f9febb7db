//! External collaborator interfaces, constructed once by the orchestrator
//! and passed down explicitly rather than living in module globals.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use polars::prelude::*;

use crate::error::{CmorError, Result};

/// Black-box unit conversion service. The arithmetic internals are not part
/// of this crate; implementations wrap whatever conversion backend is in use.
pub trait UnitConverter: Send + Sync {
    fn convert(
        &self,
        df: DataFrame,
        column: &str,
        from_unit: &str,
        to_unit: &str,
    ) -> Result<DataFrame>;
}

/// Scale/offset conversion over an explicit mapping, enough for the common
/// model-output cases (g/kg, mm/m, degC/K) and for tests.
#[derive(Debug, Default)]
pub struct LinearUnitConverter {
    conversions: HashMap<(String, String), (f64, f64)>,
}

impl LinearUnitConverter {
    pub fn new() -> Self {
        let mut converter = Self {
            conversions: HashMap::new(),
        };
        converter.register("g/kg", "kg/kg", 1e-3, 0.0);
        converter.register("mm", "m", 1e-3, 0.0);
        converter.register("degC", "K", 1.0, 273.15);
        converter.register("hPa", "Pa", 100.0, 0.0);
        converter
    }

    pub fn register(&mut self, from: &str, to: &str, scale: f64, offset: f64) {
        self.conversions
            .insert((from.to_string(), to.to_string()), (scale, offset));
    }
}

impl UnitConverter for LinearUnitConverter {
    fn convert(
        &self,
        df: DataFrame,
        column: &str,
        from_unit: &str,
        to_unit: &str,
    ) -> Result<DataFrame> {
        if from_unit == to_unit {
            return Ok(df);
        }
        let (scale, offset) = self
            .conversions
            .get(&(from_unit.to_string(), to_unit.to_string()))
            .copied()
            .ok_or_else(|| {
                CmorError::UnitConversion(format!(
                    "no conversion registered from {from_unit:?} to {to_unit:?}"
                ))
            })?;
        let out = df
            .lazy()
            .with_column((col(column) * lit(scale) + lit(offset)).alias(column))
            .collect()?;
        Ok(out)
    }
}

/// File-writing collaborator. The final pipeline step hands the transformed
/// frame over; naming and directory layout are decided by the caller.
pub trait OutputSink: Send + Sync {
    fn write(&self, df: &DataFrame, path: &Path) -> Result<PathBuf>;
}

/// Default sink: one parquet file per segment.
#[derive(Debug, Default)]
pub struct ParquetSink;

impl OutputSink for ParquetSink {
    fn write(&self, df: &DataFrame, path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut frame = df.clone();
        ParquetWriter::new(file).finish(&mut frame)?;
        Ok(path.to_path_buf())
    }
}

/// The service bundle threaded through pipeline steps. Owned by the
/// orchestrator; cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub unit_converter: Arc<dyn UnitConverter>,
    pub sink: Arc<dyn OutputSink>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            unit_converter: Arc::new(LinearUnitConverter::new()),
            sink: Arc::new(ParquetSink),
        }
    }
}
