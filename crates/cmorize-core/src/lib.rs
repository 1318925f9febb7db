//! Core engine for turning raw climate-model output into CMIP-compliant
//! files: rule matching, pipeline execution with checkpointed resumption,
//! frequency resolution and temporal averaging.

pub mod checkpoint;
pub mod cmorizer;
pub mod config;
pub mod data_request;
pub mod error;
pub mod executor;
pub mod frequency;
pub mod pipeline;
pub mod rule;
pub mod services;
pub mod steps;
pub mod timeaverage;

pub use cmorizer::{Cmorizer, ProcessSummary};
pub use config::CmorizeConfig;
pub use error::{CmorError, Result};
pub use pipeline::{Pipeline, StepRegistry};
pub use rule::Rule;
