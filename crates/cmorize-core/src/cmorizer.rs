//! The orchestrator: owns the validated configuration, the shared pipeline
//! instances and the rules, distributes input files, and drives every rule
//! through its pipelines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::checkpoint::PipelineDb;
use crate::config::{CmorizeConfig, GeneralConfig, SettingsConfig, UnmatchedFilePolicy};
use crate::data_request::DataRequest;
use crate::error::{CmorError, Result};
use crate::executor::{FlowIdentity, LocalRunner, PoolRunner, TaskRunner};
use crate::pipeline::{ExecutionBackend, Pipeline, StepRegistry};
use crate::rule::{Rule, RuleContext};
use crate::services::Services;

/// Outcome of one full processing run.
#[derive(Debug, Default)]
pub struct ProcessSummary {
    pub rules_processed: usize,
    pub written_files: Vec<PathBuf>,
}

pub struct Cmorizer {
    general: GeneralConfig,
    settings: SettingsConfig,
    pipelines: Vec<Arc<Pipeline>>,
    rules: Vec<Rule>,
    data_request: DataRequest,
    services: Services,
    local_runner: LocalRunner,
    pool_runner: Option<PoolRunner>,
}

impl Cmorizer {
    /// Build an orchestrator over the built-in step registry.
    pub fn from_config(config: CmorizeConfig) -> Result<Self> {
        Self::from_config_with(config, &StepRegistry::builtin(), Services::default())
    }

    /// Build an orchestrator with a caller-supplied registry and services,
    /// for custom steps and for tests.
    pub fn from_config_with(
        config: CmorizeConfig,
        registry: &StepRegistry,
        services: Services,
    ) -> Result<Self> {
        let pipelines: Vec<Arc<Pipeline>> = config
            .pipelines
            .iter()
            .map(|spec| Pipeline::from_spec(registry, spec).map(Arc::new))
            .collect::<Result<_>>()?;

        let mut rules: Vec<Rule> = config
            .rules
            .into_iter()
            .map(|spec| Rule::from_spec(spec, registry))
            .collect::<Result<_>>()?;

        for rule in &mut rules {
            for (key, value) in &config.inherit {
                rule.attrs.apply_inherit(key, value);
            }
        }

        let data_request = DataRequest::from_tables(config.tables);
        for rule in &mut rules {
            match data_request.find(&rule.cmor_variable) {
                Some(variable) => rule.data_request_variable = Some(variable.clone()),
                None => warn!(
                    rule = rule.name,
                    variable = rule.cmor_variable,
                    "no data request entry for rule variable"
                ),
            }
        }

        for rule in &mut rules {
            rule.match_pipelines(&pipelines, false)?;
        }

        let needs_pool = rules
            .iter()
            .map(|rule| rule.pipelines())
            .collect::<Result<Vec<_>>>()?
            .iter()
            .flatten()
            .any(|p| p.backend() == ExecutionBackend::Distributed);
        let pool_runner = if needs_pool {
            Some(PoolRunner::new(config.settings.worker_threads.unwrap_or(0))?)
        } else {
            None
        };

        Ok(Self {
            general: config.general,
            settings: config.settings,
            pipelines,
            rules,
            data_request,
            services,
            local_runner: LocalRunner,
            pool_runner,
        })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    pub fn data_request(&self) -> &DataRequest {
        &self.data_request
    }

    /// Every rule whose patterns claim `path`, in declaration order.
    pub fn rules_for_filepath(&self, path: &str) -> Vec<&Rule> {
        self.rules.iter().filter(|rule| rule.matches(path)).collect()
    }

    /// Every rule producing `variable_id`, in declaration order.
    pub fn rules_for_variable(&self, variable_id: &str) -> Vec<&Rule> {
        self.rules
            .iter()
            .filter(|rule| rule.cmor_variable == variable_id)
            .collect()
    }

    /// Variables a table declares that no rule produces.
    pub fn check_rules_for_table(&self, table_id: &str) -> Vec<String> {
        let Some(table) = self.data_request.table(table_id) else {
            return Vec::new();
        };
        table
            .variable_ids()
            .filter(|id| !self.rules.iter().any(|rule| rule.cmor_variable == *id))
            .map(|id| id.to_string())
            .collect()
    }

    /// Files in `dir` that no rule's variable accounts for. Detects leftover
    /// output from renamed or removed rules. Hidden directories are skipped,
    /// which keeps the checkpoint store under the output directory out of
    /// the report.
    pub fn check_rules_for_output_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let pattern = format!("{}/**/*", dir.display());
        let mut orphans = Vec::new();
        for entry in glob::glob(&pattern)
            .map_err(|e| CmorError::Config(format!("bad output glob: {e}")))?
        {
            let path = entry.map_err(|e| CmorError::Config(format!("unreadable entry: {e}")))?;
            if !path.is_file() {
                continue;
            }
            let hidden = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
            if hidden {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let claimed = self
                .rules
                .iter()
                .any(|rule| name.starts_with(&format!("{}_", rule.cmor_variable)));
            if !claimed {
                orphans.push(path);
            }
        }
        Ok(orphans)
    }

    /// Walk the input directory and attach each file to the rules that claim
    /// it, applying the unmatched-file and multiple-rules policies.
    fn gather_inputs(&self) -> Result<BTreeMap<String, Vec<PathBuf>>> {
        let mut matched: BTreeMap<String, Vec<PathBuf>> =
            self.rules.iter().map(|r| (r.name.clone(), Vec::new())).collect();
        let Some(input_dir) = &self.general.input_dir else {
            return Ok(matched);
        };

        let pattern = format!("{}/**/*", input_dir.display());
        for entry in glob::glob(&pattern)
            .map_err(|e| CmorError::Config(format!("bad input glob: {e}")))?
        {
            let path = entry.map_err(|e| CmorError::Config(format!("unreadable entry: {e}")))?;
            if !path.is_file() {
                continue;
            }
            let path_str = path.to_string_lossy().to_string();
            let claimants = self.rules_for_filepath(&path_str);
            match claimants.len() {
                0 => match self.settings.unmatched_file {
                    UnmatchedFilePolicy::Error => {
                        return Err(CmorError::NoMatchingRule(path_str));
                    }
                    UnmatchedFilePolicy::Warn => {
                        warn!(file = %path.display(), "no rule matches input file");
                    }
                    UnmatchedFilePolicy::Ignore => {}
                },
                1 => {
                    if let Some(files) = matched.get_mut(&claimants[0].name) {
                        files.push(path.clone());
                    }
                }
                _ => {
                    warn!(file = %path.display(), "multiple rules claim input file, using all");
                    for rule in claimants {
                        if let Some(files) = matched.get_mut(&rule.name) {
                            files.push(path.clone());
                        }
                    }
                }
            }
        }
        Ok(matched)
    }

    fn checkpoint_dir(&self) -> PathBuf {
        self.settings
            .checkpoint_dir
            .clone()
            .or_else(|| {
                self.general
                    .output_dir
                    .as_ref()
                    .map(|dir| dir.join(".checkpoints"))
            })
            .unwrap_or_else(|| PathBuf::from(".checkpoints"))
    }

    fn runner_for(&self, backend: ExecutionBackend) -> &dyn TaskRunner {
        match backend {
            ExecutionBackend::Local => &self.local_runner,
            ExecutionBackend::Distributed => self
                .pool_runner
                .as_ref()
                .map(|r| r as &dyn TaskRunner)
                .unwrap_or(&self.local_runner),
        }
    }

    fn process_rule(
        &self,
        rule: &Rule,
        files: &[PathBuf],
        checkpoint_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let pipelines = rule.pipelines()?;
        info!(
            rule = rule.name,
            files = files.len(),
            pipelines = pipelines.len(),
            "processing rule"
        );
        let mut written = Vec::new();
        for pipeline in pipelines {
            let mut ctx = RuleContext::new(rule, self.services.clone());
            ctx.input_dir = self.general.input_dir.clone();
            if ctx.output_dir.is_none() {
                ctx.output_dir = self.general.output_dir.clone();
            }
            ctx.matched_files = files.to_vec();

            let flow = FlowIdentity::new(pipeline.name(), rule.name.as_str());
            let mut db = PipelineDb::new(flow.to_string(), checkpoint_dir);
            let runner = self.runner_for(pipeline.backend());
            pipeline.run(None, &mut ctx, &mut db, runner)?;
            written.extend(ctx.written_files);
        }
        Ok(written)
    }

    /// Run every rule through all of its pipelines.
    ///
    /// Under `parallel` the rules run concurrently; pipeline steps within a
    /// rule always run in order. Every rule is attempted even when earlier
    /// ones fail, and the aggregate failure is reported at the end.
    pub fn process(&mut self) -> Result<ProcessSummary> {
        for table in &self.data_request.tables {
            let missing = self.check_rules_for_table(&table.table_id);
            if missing.is_empty() {
                continue;
            }
            if self.settings.raise_on_no_rule {
                return Err(CmorError::Config(format!(
                    "table {} has variables without rules: {}",
                    table.table_id,
                    missing.join(", ")
                )));
            }
            if self.settings.warn_on_no_rule {
                warn!(
                    table = table.table_id,
                    variables = missing.join(", "),
                    "table variables without a producing rule"
                );
            }
        }

        for variable in &self.data_request.variables {
            let producers = self.rules_for_variable(&variable.variable_id);
            if producers.len() > 1 {
                if self.settings.raise_on_multiple_rules {
                    return Err(CmorError::Config(format!(
                        "{} rules produce variable {}",
                        producers.len(),
                        variable.variable_id
                    )));
                }
                warn!(
                    variable = variable.variable_id,
                    rules = producers.len(),
                    "multiple rules produce the same variable"
                );
            }
        }

        let matched = self.gather_inputs()?;
        let checkpoint_dir = self.checkpoint_dir();
        let empty: Vec<PathBuf> = Vec::new();

        let run_one = |rule: &Rule| -> Result<Vec<PathBuf>> {
            let files = matched.get(&rule.name).unwrap_or(&empty);
            self.process_rule(rule, files, &checkpoint_dir)
        };

        let outcomes: Vec<(String, Result<Vec<PathBuf>>)> = if self.settings.parallel {
            self.rules
                .par_iter()
                .map(|rule| (rule.name.clone(), run_one(rule)))
                .collect()
        } else {
            self.rules
                .iter()
                .map(|rule| (rule.name.clone(), run_one(rule)))
                .collect()
        };

        let total = outcomes.len();
        let mut summary = ProcessSummary::default();
        let mut failed = 0usize;
        for (rule_name, outcome) in outcomes {
            match outcome {
                Ok(files) => {
                    summary.rules_processed += 1;
                    summary.written_files.extend(files);
                }
                Err(err) => {
                    failed += 1;
                    error!(rule = rule_name, error = %err, "rule failed");
                }
            }
        }
        if failed > 0 {
            return Err(CmorError::RulesFailed { failed, total });
        }
        info!(
            rules = summary.rules_processed,
            files = summary.written_files.len(),
            "run complete"
        );
        Ok(summary)
    }
}
