//! Command fan-out transport.
//!
//! One interface, two implementations selected at startup: [`LocalTransport`]
//! calls the worker engine in-process (single-node deployments), while the
//! cluster transport (feature `grpc`) fans RPCs out to every shard-owning
//! worker. The orchestration logic never branches on the mode.
//!
//! `execute_step` returns once every addressed worker *accepted* the command;
//! step completion arrives later as individual reports through
//! `Conductor::on_worker_report`. The acceptance wait is bounded by a short
//! ack timeout distinct from the per-step deadline.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vf_common::{ExecutionId, Result, WorkerId};

use crate::topology::GraphTopology;

/// Superstep command fanned out to every participating worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCommand {
    pub execution: ExecutionId,
    /// Step number the workers must execute.
    pub step: u64,
    /// One extra round after convergence: materialize results without
    /// re-activating vertices.
    pub final_pass: bool,
    /// Worker-side vertex algorithm name.
    pub algorithm: String,
    /// Worker-side final-pass algorithm name, if configured.
    pub final_algorithm: Option<String>,
    /// Aggregator handle name, if configured.
    pub aggregator: Option<String>,
    /// Job-scoped globals snapshot for this step.
    pub globals: Map<String, Value>,
    /// Result-graph topology; identical for every step of a job.
    pub topology: GraphTopology,
    /// Per-step deadline the workers may use to bound local work.
    pub deadline_ms: Option<u64>,
    /// Conductor node name workers report back to.
    pub conductor: String,
    /// Correlation token echoed in step reports.
    pub token: u64,
}

/// Fan-out capability consumed by the step scheduler.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deployment-mode label ("local" or "cluster") used in metrics.
    fn mode(&self) -> &'static str;

    /// Deliver the step command to every worker; returns once all accepted.
    async fn execute_step(&self, workers: &[WorkerId], command: &StepCommand) -> Result<()>;

    /// Tell every participating worker to release its per-job shard state.
    async fn cleanup_execution(&self, workers: &[WorkerId], execution: ExecutionId) -> Result<()>;
}

/// Worker-side engine contract for the single-process mode.
///
/// Out-of-scope internals (vertex iteration, message routing) live behind
/// this trait; the conductor only needs command acceptance.
#[async_trait]
pub trait WorkerEngine: Send + Sync {
    /// Accept a step command for the shards `worker` owns.
    async fn execute_step(&self, worker: &WorkerId, command: &StepCommand) -> Result<()>;

    /// Release all shard state held for `execution`.
    async fn cleanup(&self, worker: &WorkerId, execution: ExecutionId) -> Result<()>;
}

/// In-process transport: commands are direct calls into the worker engine.
pub struct LocalTransport {
    engine: Arc<dyn WorkerEngine>,
}

impl LocalTransport {
    pub fn new(engine: Arc<dyn WorkerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn mode(&self) -> &'static str {
        "local"
    }

    async fn execute_step(&self, workers: &[WorkerId], command: &StepCommand) -> Result<()> {
        for worker in workers {
            self.engine.execute_step(worker, command).await?;
        }
        Ok(())
    }

    async fn cleanup_execution(&self, workers: &[WorkerId], execution: ExecutionId) -> Result<()> {
        for worker in workers {
            self.engine.cleanup(worker, execution).await?;
        }
        Ok(())
    }
}
