//! Ordered, named step sequences and the registry that resolves declarative
//! step references to function pointers.
//!
//! Step resolution happens at construction time: a pipeline spec naming an
//! unknown step fails before anything runs. Step order is the contract —
//! steps are never reordered or deduplicated.

use std::collections::BTreeMap;
use std::fs::File;

use chrono::Utc;
use polars::prelude::*;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::checkpoint::{PipelineDb, StepIdentity};
use crate::error::{CmorError, Result};
use crate::executor::{FlowIdentity, TaskRunner};
use crate::rule::RuleContext;
use crate::steps;

/// One pipeline step: a pure function from the previous step's output (None
/// for the first step) and the rule context to the next frame.
pub type StepFn = fn(Option<DataFrame>, &mut RuleContext) -> Result<DataFrame>;

type PipelineCtor = fn(&StepRegistry, Option<String>) -> Result<Pipeline>;

/// Qualified names of the built-in production pipeline steps.
pub const DEFAULT_PIPELINE_STEPS: [&str; 6] = [
    "cmorize.steps.load_inputs",
    "cmorize.steps.select_variable",
    "cmorize.steps.time_average",
    "cmorize.steps.convert_units",
    "cmorize.steps.attach_metadata",
    "cmorize.steps.write_output",
];

/// Qualified names of the testing pipeline steps.
pub const TESTING_PIPELINE_STEPS: [&str; 3] = [
    "cmorize.steps.dummy_load_data",
    "cmorize.steps.dummy_logic_step",
    "cmorize.steps.dummy_save_data",
];

pub const DEFAULT_PIPELINE_NAME: &str = "cmorize.pipeline.DefaultPipeline";
pub const TESTING_PIPELINE_NAME: &str = "cmorize.pipeline.TestingPipeline";

/// Explicit mapping from qualified step/pipeline names to constructors,
/// populated at process start instead of resolved by reflection.
pub struct StepRegistry {
    steps: BTreeMap<String, StepFn>,
    pipelines: BTreeMap<String, PipelineCtor>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self {
            steps: BTreeMap::new(),
            pipelines: BTreeMap::new(),
        }
    }

    /// Registry preloaded with every built-in step and pipeline.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_step("cmorize.steps.load_inputs", steps::load_inputs);
        registry.register_step("cmorize.steps.select_variable", steps::select_variable);
        registry.register_step("cmorize.steps.time_average", steps::time_average);
        registry.register_step("cmorize.steps.convert_units", steps::convert_units);
        registry.register_step("cmorize.steps.attach_metadata", steps::attach_metadata);
        registry.register_step("cmorize.steps.write_output", steps::write_output);
        registry.register_step("cmorize.steps.dummy_load_data", steps::dummy_load_data);
        registry.register_step("cmorize.steps.dummy_logic_step", steps::dummy_logic_step);
        registry.register_step("cmorize.steps.dummy_save_data", steps::dummy_save_data);
        registry.register_pipeline(DEFAULT_PIPELINE_NAME, Pipeline::default_pipeline);
        registry.register_pipeline(TESTING_PIPELINE_NAME, Pipeline::testing_pipeline);
        registry
    }

    pub fn register_step(&mut self, name: impl Into<String>, step: StepFn) {
        self.steps.insert(name.into(), step);
    }

    pub fn register_pipeline(&mut self, name: impl Into<String>, ctor: PipelineCtor) {
        self.pipelines.insert(name.into(), ctor);
    }

    pub fn resolve_step(&self, name: &str) -> Result<StepFn> {
        self.steps
            .get(name)
            .copied()
            .ok_or_else(|| CmorError::StepResolution {
                name: name.to_string(),
            })
    }

    pub fn resolve_pipeline(&self, name: &str) -> Result<PipelineCtor> {
        self.pipelines
            .get(name)
            .copied()
            .ok_or_else(|| CmorError::StepResolution {
                name: name.to_string(),
            })
    }
}

/// Declarative pipeline spec: either `uses` (a pre-built named pipeline) or
/// `steps` (an explicit qualified-name list), never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub steps: Option<Vec<String>>,
    #[serde(default)]
    pub backend: ExecutionBackend,
}

/// Execution-backend selector, decided by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionBackend {
    #[default]
    Local,
    Distributed,
}

#[derive(Clone)]
pub struct Step {
    name: String,
    func: StepFn,
}

impl Step {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}

/// An ordered, named sequence of steps.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    steps: Vec<Step>,
    backend: ExecutionBackend,
    frozen: bool,
}

impl Pipeline {
    pub fn from_names<S: AsRef<str>>(
        registry: &StepRegistry,
        names: &[S],
        name: Option<String>,
    ) -> Result<Self> {
        let mut steps = Vec::with_capacity(names.len());
        for qualname in names {
            let qualname = qualname.as_ref();
            steps.push(Step {
                name: qualname.to_string(),
                func: registry.resolve_step(qualname)?,
            });
        }
        Ok(Self {
            name: name.unwrap_or_else(generated_name),
            steps,
            backend: ExecutionBackend::Local,
            frozen: false,
        })
    }

    pub fn from_spec(registry: &StepRegistry, spec: &PipelineSpec) -> Result<Self> {
        let mut pipeline = match (&spec.uses, &spec.steps) {
            (Some(_), Some(_)) | (None, None) => return Err(CmorError::AmbiguousPipelineSpec),
            (Some(uses), None) => {
                let ctor = registry.resolve_pipeline(uses)?;
                ctor(registry, spec.name.clone())?
            }
            (None, Some(step_names)) => {
                Self::from_names(registry, step_names, spec.name.clone())?
            }
        };
        pipeline.backend = spec.backend;
        Ok(pipeline)
    }

    /// The built-in production pipeline: load, select, average, convert,
    /// attach metadata, write. Frozen: its steps cannot be changed.
    pub fn default_pipeline(registry: &StepRegistry, name: Option<String>) -> Result<Self> {
        let mut pipeline = Self::from_names(
            registry,
            &DEFAULT_PIPELINE_STEPS,
            Some(name.unwrap_or_else(|| DEFAULT_PIPELINE_NAME.to_string())),
        )?;
        pipeline.frozen = true;
        Ok(pipeline)
    }

    /// The built-in testing pipeline with dummy load/logic/save steps.
    /// Frozen, like the default pipeline.
    pub fn testing_pipeline(registry: &StepRegistry, name: Option<String>) -> Result<Self> {
        let mut pipeline = Self::from_names(
            registry,
            &TESTING_PIPELINE_STEPS,
            Some(name.unwrap_or_else(|| TESTING_PIPELINE_NAME.to_string())),
        )?;
        pipeline.frozen = true;
        Ok(pipeline)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> ExecutionBackend {
        self.backend
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Qualified step names, in declared order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn with_backend(mut self, backend: ExecutionBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Replace the step sequence. Frozen pipelines reject this.
    pub fn set_steps<S: AsRef<str>>(
        &mut self,
        registry: &StepRegistry,
        names: &[S],
    ) -> Result<()> {
        if self.frozen {
            return Err(CmorError::FrozenPipeline(self.name.clone()));
        }
        let replacement = Self::from_names(registry, names, Some(self.name.clone()))?;
        self.steps = replacement.steps;
        Ok(())
    }

    /// Append one step. Frozen pipelines reject this.
    pub fn push_step(&mut self, registry: &StepRegistry, name: &str) -> Result<()> {
        if self.frozen {
            return Err(CmorError::FrozenPipeline(self.name.clone()));
        }
        self.steps.push(Step {
            name: name.to_string(),
            func: registry.resolve_step(name)?,
        });
        Ok(())
    }

    /// Execute the steps strictly in declared order, as one unit of work on
    /// the supplied runner.
    ///
    /// Progress is checkpointed in `db`: a step entry is created when the
    /// step first runs and the store is saved only after the step completes,
    /// so an interrupted run never records a partial step. On entry any
    /// prior progress is reloaded and contiguous completed steps with a
    /// readable cached artifact are skipped. The store is cleared when the
    /// whole pipeline succeeds.
    pub fn run(
        &self,
        data: Option<DataFrame>,
        ctx: &mut RuleContext,
        db: &mut PipelineDb,
        runner: &dyn TaskRunner,
    ) -> Result<DataFrame> {
        let flow = FlowIdentity::new(self.name.clone(), ctx.rule_name.clone());
        runner.submit(&flow, Box::new(move || self.run_steps(data, ctx, db)))
    }

    fn run_steps(
        &self,
        data: Option<DataFrame>,
        ctx: &mut RuleContext,
        db: &mut PipelineDb,
    ) -> Result<DataFrame> {
        db.load()?;

        let mut resume_at = 0;
        let mut resumed_frame: Option<DataFrame> = None;
        for (position, step) in self.steps.iter().enumerate() {
            let identity = StepIdentity::at_position(step.name(), position);
            if !is_completed(db, &identity) {
                break;
            }
            let artifact = db.artifact_path(&identity);
            if !artifact.exists() {
                break;
            }
            resumed_frame = Some(ParquetReader::new(File::open(&artifact)?).finish()?);
            resume_at = position + 1;
        }
        if resume_at > 0 {
            info!(
                pipeline = self.name,
                rule = ctx.rule_name,
                skipped = resume_at,
                "resuming pipeline from checkpoint"
            );
        }

        let mut current = match resumed_frame {
            Some(frame) => Some(frame),
            None => data,
        };

        let total = self.steps.len();
        for (position, step) in self.steps.iter().enumerate().skip(resume_at) {
            let identity = StepIdentity::at_position(step.name(), position);
            debug!(
                pipeline = self.name,
                step = step.name(),
                "[{}/{}] running step",
                position + 1,
                total
            );

            let started = checkpoint_record(&[
                ("status", json!("running")),
                ("started_at", json!(Utc::now().to_rfc3339())),
            ]);
            if db.contains(&identity) {
                db.update(&identity, started)?;
            } else {
                db.create(&identity, started)?;
            }

            let output = (step.func)(current.take(), ctx).map_err(|source| {
                CmorError::StepFailed {
                    pipeline: self.name.clone(),
                    step: step.name.clone(),
                    rule: ctx.rule_name.clone(),
                    source: Box::new(source),
                }
            })?;

            let artifact = db.artifact_path(&identity);
            std::fs::create_dir_all(db.artifact_dir())?;
            let mut cached = output.clone();
            ParquetWriter::new(File::create(&artifact)?).finish(&mut cached)?;

            db.update(
                &identity,
                checkpoint_record(&[
                    ("status", json!("completed")),
                    ("finished_at", json!(Utc::now().to_rfc3339())),
                    ("artifact", json!(artifact.to_string_lossy())),
                ]),
            )?;
            db.save()?;

            current = Some(output);
        }

        db.clear()?;
        current.ok_or_else(|| {
            CmorError::Config(format!("pipeline {} has no steps", self.name))
        })
    }
}

fn is_completed(db: &PipelineDb, identity: &StepIdentity) -> bool {
    db.read(identity)
        .and_then(|entry| entry.get("status"))
        .and_then(Value::as_str)
        .is_some_and(|status| status == "completed")
}

fn checkpoint_record(fields: &[(&str, Value)]) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

const NAME_ADJECTIVES: [&str; 8] = [
    "amber", "brisk", "calm", "dapper", "eager", "mellow", "quiet", "vivid",
];
const NAME_NOUNS: [&str; 8] = [
    "basin", "cirrus", "delta", "fjord", "gyre", "isobar", "monsoon", "strait",
];

/// Human-readable fallback name for pipelines declared without one.
fn generated_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = NAME_ADJECTIVES.choose(&mut rng).unwrap_or(&"plain");
    let noun = NAME_NOUNS.choose(&mut rng).unwrap_or(&"pipeline");
    format!("{adjective}-{noun}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalRunner;
    use crate::rule::RuleContext;
    use crate::timeaverage::TIME_COLUMN;

    fn registry_with_test_steps() -> StepRegistry {
        let mut registry = StepRegistry::builtin();
        registry.register_step("tests.make_frame", make_frame);
        registry.register_step("tests.add_one", add_one);
        registry.register_step("tests.double", double);
        registry.register_step("tests.explode", explode);
        registry
    }

    fn make_frame(_data: Option<DataFrame>, _ctx: &mut RuleContext) -> Result<DataFrame> {
        Ok(DataFrame::new(vec![
            Series::new("value".into(), vec![1.0f64, 2.0, 3.0]).into()
        ])?)
    }

    fn add_one(data: Option<DataFrame>, _ctx: &mut RuleContext) -> Result<DataFrame> {
        let df = data.ok_or_else(|| CmorError::Config("no input frame".into()))?;
        Ok(df
            .lazy()
            .with_column((col("value") + lit(1.0)).alias("value"))
            .collect()?)
    }

    fn double(data: Option<DataFrame>, _ctx: &mut RuleContext) -> Result<DataFrame> {
        let df = data.ok_or_else(|| CmorError::Config("no input frame".into()))?;
        Ok(df
            .lazy()
            .with_column((col("value") * lit(2.0)).alias("value"))
            .collect()?)
    }

    fn explode(_data: Option<DataFrame>, _ctx: &mut RuleContext) -> Result<DataFrame> {
        Err(CmorError::Config("boom".into()))
    }

    fn run_pipeline(pipeline: &Pipeline, dir: &std::path::Path) -> Result<DataFrame> {
        let mut ctx = RuleContext::bare("test_rule", "tas");
        let mut db = PipelineDb::new(
            format!("{}-test_rule", pipeline.name()),
            dir,
        );
        pipeline.run(None, &mut ctx, &mut db, &LocalRunner)
    }

    #[test]
    fn from_names_round_trips_step_order() {
        let registry = registry_with_test_steps();
        let names = ["tests.make_frame", "tests.double", "tests.add_one"];
        let pipeline = Pipeline::from_names(&registry, &names, Some("p".into())).unwrap();
        assert_eq!(pipeline.step_names(), names);
    }

    #[test]
    fn unknown_step_name_fails_at_construction() {
        let registry = registry_with_test_steps();
        let err = Pipeline::from_names(&registry, &["tests.unknown"], None).unwrap_err();
        assert!(matches!(err, CmorError::StepResolution { .. }));
    }

    #[test]
    fn spec_with_both_uses_and_steps_is_ambiguous() {
        let registry = registry_with_test_steps();
        let spec = PipelineSpec {
            uses: Some(TESTING_PIPELINE_NAME.to_string()),
            steps: Some(vec!["tests.make_frame".to_string()]),
            ..Default::default()
        };
        assert!(matches!(
            Pipeline::from_spec(&registry, &spec).unwrap_err(),
            CmorError::AmbiguousPipelineSpec
        ));
        assert!(matches!(
            Pipeline::from_spec(&registry, &PipelineSpec::default()).unwrap_err(),
            CmorError::AmbiguousPipelineSpec
        ));
    }

    #[test]
    fn spec_with_uses_builds_the_named_pipeline() {
        let registry = registry_with_test_steps();
        let spec = PipelineSpec {
            uses: Some(TESTING_PIPELINE_NAME.to_string()),
            name: Some("smoke".to_string()),
            ..Default::default()
        };
        let pipeline = Pipeline::from_spec(&registry, &spec).unwrap();
        assert_eq!(pipeline.name(), "smoke");
        assert_eq!(pipeline.step_names(), TESTING_PIPELINE_STEPS);
    }

    #[test]
    fn frozen_pipeline_rejects_step_mutation() {
        let registry = registry_with_test_steps();
        let mut pipeline = Pipeline::default_pipeline(&registry, None).unwrap();
        assert!(pipeline.is_frozen());
        assert!(matches!(
            pipeline.set_steps(&registry, &["tests.make_frame"]),
            Err(CmorError::FrozenPipeline(_))
        ));
        assert!(matches!(
            pipeline.push_step(&registry, "tests.make_frame"),
            Err(CmorError::FrozenPipeline(_))
        ));
    }

    #[test]
    fn steps_run_in_declared_order() {
        let registry = registry_with_test_steps();
        let dir = tempfile::tempdir().unwrap();
        // (1,2,3) + 1 then *2 is (4,6,8); the reverse order would be (3,5,7).
        let pipeline = Pipeline::from_names(
            &registry,
            &["tests.make_frame", "tests.add_one", "tests.double"],
            Some("ordered".into()),
        )
        .unwrap();
        let out = run_pipeline(&pipeline, dir.path()).unwrap();
        let values = out.column("value").unwrap().f64().unwrap().clone();
        assert_eq!(values.get(0).unwrap(), 4.0);
        assert_eq!(values.get(2).unwrap(), 8.0);
    }

    #[test]
    fn successful_run_clears_the_checkpoint_store() {
        let registry = registry_with_test_steps();
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::from_names(
            &registry,
            &["tests.make_frame", "tests.add_one"],
            Some("clean".into()),
        )
        .unwrap();
        run_pipeline(&pipeline, dir.path()).unwrap();
        let mut db = PipelineDb::new("clean-test_rule", dir.path());
        db.load().unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn failed_run_keeps_completed_steps_and_resumes_after_them() {
        let registry = registry_with_test_steps();
        let dir = tempfile::tempdir().unwrap();
        let failing = Pipeline::from_names(
            &registry,
            &["tests.make_frame", "tests.explode"],
            Some("flaky".into()),
        )
        .unwrap();

        let err = run_pipeline(&failing, dir.path()).unwrap_err();
        assert!(matches!(err, CmorError::StepFailed { .. }));

        // Only the completed first step is recorded.
        let mut db = PipelineDb::new("flaky-test_rule", dir.path());
        db.load().unwrap();
        let keys: Vec<&str> = db.keys().collect();
        assert_eq!(keys, vec!["tests.make_frame_00"]);

        // A repaired pipeline with the same name resumes past the first step.
        let mut fixed_registry = registry_with_test_steps();
        fixed_registry.register_step("tests.explode", double);
        let fixed = Pipeline::from_names(
            &fixed_registry,
            &["tests.make_frame", "tests.explode"],
            Some("flaky".into()),
        )
        .unwrap();
        let out = run_pipeline(&fixed, dir.path()).unwrap();
        let values = out.column("value").unwrap().f64().unwrap().clone();
        assert_eq!(values.get(0).unwrap(), 2.0);
    }

    #[test]
    fn same_step_twice_gets_distinct_identities() {
        let registry = registry_with_test_steps();
        let pipeline = Pipeline::from_names(
            &registry,
            &["tests.make_frame", "tests.double", "tests.double"],
            Some("twice".into()),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = run_pipeline(&pipeline, dir.path()).unwrap();
        let values = out.column("value").unwrap().f64().unwrap().clone();
        assert_eq!(values.get(0).unwrap(), 4.0);
    }

    #[test]
    fn generated_names_are_nonempty() {
        let name = generated_name();
        assert!(name.contains('-'));
    }

    #[test]
    fn dummy_testing_pipeline_runs_end_to_end() {
        let registry = StepRegistry::builtin();
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::testing_pipeline(&registry, None).unwrap();
        let out = run_pipeline(&pipeline, dir.path()).unwrap();
        assert!(out.column(TIME_COLUMN).is_ok());
    }
}
