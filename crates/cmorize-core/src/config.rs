//! YAML configuration: directories, run settings, pipelines, rules and the
//! data-request tables, validated at load time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::data_request::DataRequestTable;
use crate::error::{CmorError, Result};
use crate::pipeline::PipelineSpec;
use crate::rule::RuleSpec;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub input_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// What to do with input files no rule claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedFilePolicy {
    #[default]
    Warn,
    Error,
    Ignore,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Run independent rules concurrently.
    pub parallel: bool,
    pub worker_threads: Option<usize>,
    pub unmatched_file: UnmatchedFilePolicy,
    /// Fail when a data-request variable has no rule producing it.
    pub raise_on_no_rule: bool,
    pub warn_on_no_rule: bool,
    /// Fail when several rules claim the same data-request variable.
    pub raise_on_multiple_rules: bool,
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            worker_threads: None,
            unmatched_file: UnmatchedFilePolicy::default(),
            raise_on_no_rule: false,
            warn_on_no_rule: true,
            raise_on_multiple_rules: true,
            checkpoint_dir: None,
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CmorizeConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default, rename = "cmorize")]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub pipelines: Vec<PipelineSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    /// Attribute values applied to every rule that has not set them itself.
    #[serde(default)]
    pub inherit: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub tables: Vec<DataRequestTable>,
}

impl CmorizeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    fn validate(&self) -> Result<()> {
        let mut rule_names: Vec<&str> = self
            .rules
            .iter()
            .map(|r| r.name.as_deref().unwrap_or(r.cmor_variable.as_str()))
            .collect();
        rule_names.sort_unstable();
        if let Some(dup) = rule_names.windows(2).find(|w| w[0] == w[1]) {
            return Err(CmorError::Config(format!("duplicate rule name {:?}", dup[0])));
        }

        let mut pipeline_names: Vec<&str> = self
            .pipelines
            .iter()
            .filter_map(|p| p.name.as_deref())
            .collect();
        pipeline_names.sort_unstable();
        if let Some(dup) = pipeline_names.windows(2).find(|w| w[0] == w[1]) {
            return Err(CmorError::Config(format!(
                "duplicate pipeline name {:?}",
                dup[0]
            )));
        }

        let mut table_ids: Vec<&str> = self.tables.iter().map(|t| t.table_id.as_str()).collect();
        table_ids.sort_unstable();
        if let Some(dup) = table_ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(CmorError::Config(format!("duplicate table id {:?}", dup[0])));
        }
        Ok(())
    }
}
