//! Rules: which input files feed which pipelines for which CMOR variable.
//!
//! Patterns are compiled to [`regex::Regex`] at construction, so a bad
//! pattern fails the whole configuration up front instead of surfacing
//! mid-run. A file matches a rule when ANY of its patterns match.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::data_request::DataRequestVariable;
use crate::error::{CmorError, Result};
use crate::frequency::TimeMethod;
use crate::pipeline::{Pipeline, PipelineSpec, StepRegistry};
use crate::services::Services;
use crate::timeaverage::AnchorOffset;

/// One pattern or a list of them; YAML accepts both spellings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(pattern) => vec![pattern],
            Self::Many(patterns) => patterns,
        }
    }
}

/// A pipeline reference in a rule spec: the name of a shared pipeline
/// declared elsewhere, or an inline spec private to this rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PipelineRefSpec {
    Name(String),
    Inline(PipelineSpec),
}

/// Typed rule attributes, with unrecognized keys preserved in `extra` so
/// custom steps can consume them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleAttrs {
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub institution: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub variant_label: Option<String>,
    #[serde(default)]
    pub grid_label: Option<String>,
    /// Timestamp anchoring for averaged periods: a preset name, a fraction
    /// or a duration string. YAML numbers are accepted as fractions.
    #[serde(default)]
    pub adjust_timestamp: Option<serde_yaml::Value>,
    #[serde(default)]
    pub model_variable: Option<String>,
    #[serde(default)]
    pub model_unit: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl RuleAttrs {
    pub fn anchor_offset(&self) -> Result<AnchorOffset> {
        match &self.adjust_timestamp {
            None => Ok(AnchorOffset::default()),
            Some(serde_yaml::Value::Number(n)) => {
                let fraction = n.as_f64().ok_or_else(|| {
                    CmorError::InvalidAnchorOffset(n.to_string())
                })?;
                if !(0.0..=1.0).contains(&fraction) {
                    return Err(CmorError::InvalidAnchorOffset(fraction.to_string()));
                }
                Ok(AnchorOffset::Fraction(fraction))
            }
            Some(serde_yaml::Value::String(s)) => s.parse(),
            Some(other) => Err(CmorError::InvalidAnchorOffset(format!("{other:?}"))),
        }
    }

    /// Fill `key` from an inherited value if the rule has not set it.
    pub fn apply_inherit(&mut self, key: &str, value: &serde_yaml::Value) {
        macro_rules! fill_str {
            ($field:ident) => {
                if self.$field.is_none() {
                    if let Some(s) = value.as_str() {
                        self.$field = Some(s.to_string());
                    }
                }
            };
        }
        match key {
            "output_dir" => {
                if self.output_dir.is_none() {
                    if let Some(s) = value.as_str() {
                        self.output_dir = Some(PathBuf::from(s));
                    }
                }
            }
            "institution" => fill_str!(institution),
            "source_id" => fill_str!(source_id),
            "experiment_id" => fill_str!(experiment_id),
            "variant_label" => fill_str!(variant_label),
            "grid_label" => fill_str!(grid_label),
            "model_variable" => fill_str!(model_variable),
            "model_unit" => fill_str!(model_unit),
            "adjust_timestamp" => {
                if self.adjust_timestamp.is_none() {
                    self.adjust_timestamp = Some(value.clone());
                }
            }
            other => {
                self.extra
                    .entry(other.to_string())
                    .or_insert_with(|| value.clone());
            }
        }
    }
}

/// Declarative rule shape as it appears in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub input_patterns: OneOrMany,
    pub cmor_variable: String,
    #[serde(default)]
    pub pipelines: Vec<PipelineRefSpec>,
    #[serde(flatten)]
    pub attrs: RuleAttrs,
}

/// A pipeline attached to a rule: by name, resolved later against the
/// configured pipeline set, or already a shared instance.
#[derive(Debug, Clone)]
pub enum PipelineRef {
    Named(String),
    Resolved(Arc<Pipeline>),
}

/// A validated rule with compiled patterns.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub cmor_variable: String,
    pub attrs: RuleAttrs,
    pub data_request_variable: Option<DataRequestVariable>,
    patterns: Vec<Regex>,
    pipeline_refs: Vec<PipelineRef>,
    pipelines_mapped: bool,
}

impl Rule {
    pub fn from_spec(spec: RuleSpec, registry: &StepRegistry) -> Result<Self> {
        let name = spec.name.unwrap_or_else(|| spec.cmor_variable.clone());

        let mut patterns = Vec::new();
        for pattern in spec.input_patterns.into_vec() {
            let compiled = Regex::new(&pattern).map_err(|source| CmorError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
            patterns.push(compiled);
        }

        let mut pipeline_refs = Vec::new();
        if spec.pipelines.is_empty() {
            // Rules that declare no pipeline get their own default pipeline.
            pipeline_refs.push(PipelineRef::Resolved(Arc::new(
                Pipeline::default_pipeline(registry, None)?,
            )));
        }
        for reference in spec.pipelines {
            pipeline_refs.push(match reference {
                PipelineRefSpec::Name(pipeline_name) => PipelineRef::Named(pipeline_name),
                PipelineRefSpec::Inline(pipeline_spec) => {
                    PipelineRef::Resolved(Arc::new(Pipeline::from_spec(registry, &pipeline_spec)?))
                }
            });
        }

        Ok(Self {
            name,
            cmor_variable: spec.cmor_variable,
            attrs: spec.attrs,
            data_request_variable: None,
            patterns,
            pipeline_refs,
            pipelines_mapped: false,
        })
    }

    /// Whether any input pattern matches `path`.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(path))
    }

    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    /// Replace named pipeline references with shared instances from
    /// `available`. Idempotent: a second call without `force` is a no-op,
    /// with `force` the mapping is redone from the current references.
    pub fn match_pipelines(&mut self, available: &[Arc<Pipeline>], force: bool) -> Result<()> {
        if self.pipelines_mapped && !force {
            debug!(rule = self.name, "pipelines already matched, skipping");
            return Ok(());
        }
        for reference in &mut self.pipeline_refs {
            if let PipelineRef::Named(pipeline_name) = reference {
                let resolved = available
                    .iter()
                    .find(|p| p.name() == pipeline_name.as_str())
                    .ok_or_else(|| CmorError::UnknownPipelineReference {
                        rule: self.name.clone(),
                        pipeline: pipeline_name.clone(),
                    })?;
                *reference = PipelineRef::Resolved(Arc::clone(resolved));
            }
        }
        self.pipelines_mapped = true;
        Ok(())
    }

    /// The resolved pipeline instances, in declared order. Fails if
    /// [`Rule::match_pipelines`] has not resolved every reference.
    pub fn pipelines(&self) -> Result<Vec<Arc<Pipeline>>> {
        self.pipeline_refs
            .iter()
            .map(|reference| match reference {
                PipelineRef::Resolved(pipeline) => Ok(Arc::clone(pipeline)),
                PipelineRef::Named(pipeline_name) => Err(CmorError::UnknownPipelineReference {
                    rule: self.name.clone(),
                    pipeline: pipeline_name.clone(),
                }),
            })
            .collect()
    }

    pub fn pipeline_refs(&self) -> &[PipelineRef] {
        &self.pipeline_refs
    }
}

/// Mutable per-rule state threaded through pipeline steps.
///
/// Owns clones of everything it needs so a pipeline run borrows nothing
/// from the orchestrator and rules can run concurrently.
#[derive(Clone)]
pub struct RuleContext {
    pub rule_name: String,
    pub cmor_variable: String,
    pub attrs: RuleAttrs,
    pub data_request_variable: Option<DataRequestVariable>,
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub matched_files: Vec<PathBuf>,
    /// Row count of each source file in stacking order, set by the loader.
    pub partition_rows: Vec<usize>,
    pub services: Services,
    /// Estimated days per output file, set by the averaging step.
    pub file_timespan_days: Option<i64>,
    /// Resolved resampling token, set by the averaging step.
    pub frequency_token: Option<String>,
    pub time_method: Option<TimeMethod>,
    pub global_attrs: BTreeMap<String, String>,
    pub written_files: Vec<PathBuf>,
}

impl RuleContext {
    pub fn new(rule: &Rule, services: Services) -> Self {
        Self {
            rule_name: rule.name.clone(),
            cmor_variable: rule.cmor_variable.clone(),
            attrs: rule.attrs.clone(),
            data_request_variable: rule.data_request_variable.clone(),
            input_dir: None,
            output_dir: rule.attrs.output_dir.clone(),
            matched_files: Vec::new(),
            partition_rows: Vec::new(),
            services,
            file_timespan_days: None,
            frequency_token: None,
            time_method: None,
            global_attrs: BTreeMap::new(),
            written_files: Vec::new(),
        }
    }

    /// Bare context for step-level tests.
    pub fn bare(rule_name: impl Into<String>, cmor_variable: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            cmor_variable: cmor_variable.into(),
            attrs: RuleAttrs::default(),
            data_request_variable: None,
            input_dir: None,
            output_dir: None,
            matched_files: Vec::new(),
            partition_rows: Vec::new(),
            services: Services::default(),
            file_timespan_days: None,
            frequency_token: None,
            time_method: None,
            global_attrs: BTreeMap::new(),
            written_files: Vec::new(),
        }
    }
}
