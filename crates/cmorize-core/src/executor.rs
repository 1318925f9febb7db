//! Task-submission abstraction for pipeline runs.
//!
//! A whole pipeline run is one unit of work. The default [`LocalRunner`]
//! executes it synchronously in the calling thread; [`PoolRunner`] hands it
//! to a worker pool, with a per-run flow identity derived from pipeline and
//! rule name so concurrently submitted rules never collide.

use std::fmt;

use polars::prelude::DataFrame;
use tracing::debug;

use crate::error::{CmorError, Result};

/// Unique identity of one pipeline-run-for-one-rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowIdentity {
    pub pipeline: String,
    pub rule: String,
}

impl FlowIdentity {
    pub fn new(pipeline: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            rule: rule.into(),
        }
    }
}

impl fmt::Display for FlowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pipeline, self.rule)
    }
}

/// One unit of submittable pipeline work.
pub type FlowWork<'a> = Box<dyn FnOnce() -> Result<DataFrame> + Send + 'a>;

/// Where pipeline runs execute.
pub trait TaskRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `work` to completion and return its output. Blocks until the
    /// submitted flow finishes.
    fn submit(&self, flow: &FlowIdentity, work: FlowWork<'_>) -> Result<DataFrame>;
}

/// Synchronous in-process execution, the default and the backend required
/// for deterministic testing.
#[derive(Debug, Default)]
pub struct LocalRunner;

impl TaskRunner for LocalRunner {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit(&self, flow: &FlowIdentity, work: FlowWork<'_>) -> Result<DataFrame> {
        debug!(flow = %flow, "running flow in-process");
        work()
    }
}

/// Execution on a shared worker pool. The pool handle is the "cluster": it
/// is built once by the orchestrator and shared across submitted flows.
pub struct PoolRunner {
    pool: rayon::ThreadPool,
}

impl PoolRunner {
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| CmorError::Config(format!("cannot build worker pool: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: rayon::ThreadPool) -> Self {
        Self { pool }
    }
}

impl TaskRunner for PoolRunner {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn submit(&self, flow: &FlowIdentity, work: FlowWork<'_>) -> Result<DataFrame> {
        debug!(flow = %flow, "submitting flow to worker pool");
        self.pool.install(work)
    }
}
