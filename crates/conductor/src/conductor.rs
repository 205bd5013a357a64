//! Conductor state machine and step scheduling logic.
//!
//! Responsibilities:
//! - accept job submissions, build the result-graph topology once, and seed
//!   the execution record;
//! - fan step commands out to every shard-owning worker and arm the per-step
//!   deadline;
//! - route worker step reports through the barrier coordinator and, when a
//!   barrier closes, decide between advancing, one final pass, or cleanup;
//! - expose side-effect-free status queries.
//!
//! Step protocol is strictly synchronous between rounds: step N's barrier
//! fully closes (all acks in, decision taken) before step N+1's fan-out is
//! issued. Within a step, reports from distinct workers arrive concurrently
//! and are serialized by the store's per-execution lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use vf_common::metrics::global_metrics;
use vf_common::{ExecutionId, Result, VfError, WorkerId};

use crate::algorithm::AlgorithmHandles;
use crate::barrier::{apply_report, BarrierOutcome};
use crate::record::{now_ms, ExecutionRecord, ExecutionState, StepReport};
use crate::store::ExecutionStore;
use crate::timer::DeadlineScheduler;
use crate::topology::{build_result_graph, GraphMeta};
use crate::transport::{StepCommand, Transport};

#[derive(Debug, Clone)]
/// Conductor behavior/configuration knobs.
pub struct ConductorConfig {
    /// Default per-step deadline in milliseconds.
    ///
    /// `0` disables the deadline timer unless a job overrides it.
    pub default_step_deadline_ms: u64,
    /// Bounded wait for workers to *accept* a fan-out command.
    ///
    /// Distinct from the per-step deadline: acceptance is synchronous,
    /// step completion arrives asynchronously as reports.
    pub fanout_ack_timeout_ms: u64,
    /// Node name included in commands so workers know where to report.
    pub server_name: String,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            default_step_deadline_ms: 600_000,
            fanout_ack_timeout_ms: 5_000,
            server_name: "conductor".to_string(),
        }
    }
}

/// Per-job options supplied at submission.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Per-step deadline override in milliseconds.
    pub step_deadline_ms: Option<u64>,
    /// Initial job-scoped globals.
    pub globals: serde_json::Map<String, Value>,
    /// Skip result-collection creation (estimation/testing).
    pub dry_run: bool,
}

/// Status snapshot returned by [`Conductor::get_info`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub step: u64,
    pub state: ExecutionState,
}

/// Result payload returned by [`Conductor::get_result`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Recorded error payload; present only for errored executions.
    pub error: Option<Value>,
    pub result: ResultPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Generated result-graph name; empty until the execution finished.
    pub graph_name: String,
    pub state: ExecutionState,
}

/// Decision taken once a step's barrier closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepDecision {
    /// Activity remains: fan out the next ordinary step.
    Advance,
    /// Converged with a final algorithm configured: one extra flagged round.
    FinalPass,
    /// Done: route through cleanup.
    Finish,
}

struct ConductorInner {
    config: ConductorConfig,
    store: ExecutionStore,
    transport: Arc<dyn Transport>,
    graph_meta: Arc<dyn GraphMeta>,
    deadlines: DeadlineScheduler,
    handles: StdMutex<HashMap<ExecutionId, AlgorithmHandles>>,
    next_execution: AtomicU64,
    next_token: AtomicU64,
}

/// Cheaply cloneable conductor facade; clones share all state.
#[derive(Clone)]
pub struct Conductor {
    inner: Arc<ConductorInner>,
}

impl Conductor {
    pub fn new(
        config: ConductorConfig,
        transport: Arc<dyn Transport>,
        graph_meta: Arc<dyn GraphMeta>,
    ) -> Self {
        Self {
            inner: Arc::new(ConductorInner {
                config,
                store: ExecutionStore::new(),
                transport,
                graph_meta,
                deadlines: DeadlineScheduler::new(),
                handles: StdMutex::new(HashMap::new()),
                next_execution: AtomicU64::new(1),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Submit a job: build the result-graph topology, seed the execution
    /// record, and fan out step 0.
    pub async fn start_execution(
        &self,
        graph: &str,
        algorithms: AlgorithmHandles,
        options: ExecutionOptions,
    ) -> Result<ExecutionId> {
        if algorithms.base.trim().is_empty() {
            return Err(VfError::InvalidConfig(
                "algorithm handle must not be empty".to_string(),
            ));
        }

        let setup_started = now_ms();
        let execution = ExecutionId(self.inner.next_execution.fetch_add(1, Ordering::Relaxed));
        let (topology, result_graph) =
            build_result_graph(self.inner.graph_meta.as_ref(), execution, graph, options.dry_run)
                .await?;
        if topology.participants().is_empty() {
            return Err(VfError::InvalidConfig(format!(
                "graph '{graph}' has no shard-owning workers"
            )));
        }
        let vertex_count = self.inner.graph_meta.vertex_count(graph).await?;

        let deadline_ms = options
            .step_deadline_ms
            .or_else(|| match self.inner.config.default_step_deadline_ms {
                0 => None,
                ms => Some(ms),
            });
        let mut record = ExecutionRecord::new(
            execution,
            graph.to_string(),
            result_graph,
            topology,
            vertex_count,
            deadline_ms,
            options.globals,
        );
        record
            .time_used_ms
            .insert("setup".to_string(), now_ms().saturating_sub(setup_started));
        record.start_timer();
        self.inner.store.create(record)?;
        if let Ok(mut handles) = self.inner.handles.lock() {
            handles.insert(execution, algorithms);
        }

        global_metrics().inc_executions_started(self.inner.transport.mode());
        info!(
            execution_id = %execution,
            graph = %graph,
            vertex_count,
            operator = "ConductorStart",
            "execution started"
        );

        self.start_next_step(execution, false).await?;
        Ok(execution)
    }

    /// `{step, state}` snapshot; never mutates the record.
    pub async fn get_info(&self, execution: ExecutionId) -> Result<ExecutionInfo> {
        let record = self.inner.store.snapshot(execution).await?;
        Ok(ExecutionInfo {
            step: record.step,
            state: record.state,
        })
    }

    /// Result snapshot: finished jobs expose the generated result graph,
    /// errored jobs the recorded error payload; never mutates the record.
    pub async fn get_result(&self, execution: ExecutionId) -> Result<ExecutionResult> {
        let record = self.inner.store.snapshot(execution).await?;
        let result = match record.state {
            ExecutionState::Finished => ExecutionResult {
                error: None,
                result: ResultPayload {
                    graph_name: record.result_graph.clone(),
                    state: record.state,
                },
            },
            ExecutionState::Running => ExecutionResult {
                error: None,
                result: ResultPayload {
                    graph_name: String::new(),
                    state: record.state,
                },
            },
            ExecutionState::Error => ExecutionResult {
                error: record.error.clone(),
                result: ResultPayload {
                    graph_name: String::new(),
                    state: record.state,
                },
            },
        };
        Ok(result)
    }

    /// Merge one worker's step-completion report into the barrier.
    ///
    /// Protocol-level rejections (`StepMismatch`, `MalformedReport`,
    /// `UnknownServer`) are returned to the caller and leave the record
    /// untouched; the job keeps waiting for valid reports. The report that
    /// closes the barrier drives the step decision exactly once.
    pub async fn on_worker_report(
        &self,
        execution: ExecutionId,
        worker: &WorkerId,
        report: &StepReport,
    ) -> Result<()> {
        let outcome = self
            .inner
            .store
            .with_record(execution, |record| apply_report(record, worker, report))
            .await?;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                global_metrics()
                    .inc_reports_rejected(&execution.to_string(), reject_reason(&err));
                debug!(
                    execution_id = %execution,
                    worker_id = %worker,
                    reported_step = report.step,
                    error = %err,
                    operator = "ConductorReport",
                    "discarding invalid worker report"
                );
                return Err(err);
            }
        };
        global_metrics().inc_reports_accepted(&execution.to_string());

        match outcome {
            BarrierOutcome::Pending => Ok(()),
            BarrierOutcome::Closed { error: None } => {
                self.inner.deadlines.cancel(execution);
                self.init_next_step(execution).await
            }
            BarrierOutcome::Closed { error: Some(error) } => {
                self.inner.deadlines.cancel(execution);
                warn!(
                    execution_id = %execution,
                    worker_id = %worker,
                    operator = "ConductorReport",
                    "worker reported step failure; terminating execution"
                );
                self.cleanup(execution, Some(error)).await.map(|_| ())
            }
        }
    }

    /// Deadline callback: the barrier did not close in time.
    ///
    /// Idempotent against a concurrently closing barrier: whichever happens
    /// first transitions the job, the loser is a no-op on the terminal record.
    pub async fn timeout_execution(&self, execution: ExecutionId) -> Result<()> {
        let payload = json!({
            "code": "timeout",
            "message": VfError::Timeout.to_string(),
        });
        let transitioned = self.cleanup(execution, Some(payload)).await?;
        if transitioned {
            global_metrics().inc_timeouts(&execution.to_string());
            warn!(
                execution_id = %execution,
                operator = "ConductorTimeout",
                "step deadline fired before barrier closed"
            );
        }
        Ok(())
    }

    /// Arm the step deadline and fan the current step out to all workers.
    async fn start_next_step(&self, execution: ExecutionId, final_pass: bool) -> Result<()> {
        let record = self.inner.store.snapshot(execution).await?;
        if record.state.is_terminal() {
            return Ok(());
        }
        let (algorithm, final_algorithm, aggregator) = {
            let handles = self
                .inner
                .handles
                .lock()
                .map_err(|_| VfError::Transport("handle registry poisoned".to_string()))?;
            let job = handles
                .get(&execution)
                .ok_or(VfError::UnknownExecution(execution))?;
            (job.base.clone(), job.final_pass.clone(), job.aggregator.clone())
        };

        if let Some(deadline_ms) = record.deadline_ms {
            let conductor = self.clone();
            self.inner.deadlines.schedule(
                execution,
                Duration::from_millis(deadline_ms),
                async move {
                    if let Err(err) = conductor.timeout_execution(execution).await {
                        debug!(
                            execution_id = %execution,
                            error = %err,
                            operator = "ConductorTimeout",
                            "timeout transition skipped"
                        );
                    }
                },
            );
        }

        let command = StepCommand {
            execution,
            step: record.step,
            final_pass,
            algorithm,
            final_algorithm,
            aggregator,
            globals: record.globals.clone(),
            topology: record.topology.clone(),
            deadline_ms: record.deadline_ms,
            conductor: self.inner.config.server_name.clone(),
            token: self.inner.next_token.fetch_add(1, Ordering::Relaxed),
        };
        let participants = record.participants();
        debug!(
            execution_id = %execution,
            step = command.step,
            final_pass,
            workers = participants.len(),
            operator = "ConductorFanOut",
            "starting superstep"
        );
        if let Err(err) = self
            .inner
            .transport
            .execute_step(&participants, &command)
            .await
        {
            let payload = json!({
                "code": "transport",
                "message": err.to_string(),
            });
            self.cleanup(execution, Some(payload)).await?;
            return Err(err);
        }
        global_metrics().inc_steps_started(&execution.to_string());
        Ok(())
    }

    /// Close out the finished step and decide how the job continues.
    ///
    /// Runs exactly once per barrier close: increments the step, seals the
    /// completed slot, resets the acks, applies the superstep hook, then
    /// advances, runs the single final pass, or finishes.
    async fn init_next_step(&self, execution: ExecutionId) -> Result<()> {
        let hook = {
            self.inner
                .handles
                .lock()
                .ok()
                .and_then(|handles| handles.get(&execution).and_then(|h| h.superstep.clone()))
        };
        let has_final_algorithm = {
            self.inner
                .handles
                .lock()
                .ok()
                .and_then(|handles| handles.get(&execution).map(|h| h.final_pass.is_some()))
                .unwrap_or(false)
        };

        let decision = self
            .inner
            .store
            .with_record(execution, |record| {
                if record.state.is_terminal() {
                    // lost the race against a concurrent timeout transition
                    return None;
                }
                record.step += 1;
                let completed_step = record.step - 1;
                let slot = record.step as usize;
                record.step_history[slot].is_final = record.step_history[slot].converged();
                let completed = record.step_history[slot].clone();
                record.step_history.push(Default::default());
                let participants = record.participants();
                record.reset_acks(&participants);

                if let Some(hook) = &hook {
                    record
                        .globals
                        .insert("step".to_string(), completed_step.into());
                    if let Err(err) = hook.init_step(&mut record.globals, &completed) {
                        warn!(
                            execution_id = %execution,
                            step = completed_step,
                            error = %err,
                            operator = "ConductorHook",
                            "superstep hook failed; globals left as mutated"
                        );
                    }
                }

                if let Some(elapsed) = record.store_time(&format!("step_{completed_step}")) {
                    global_metrics()
                        .observe_step_seconds(&execution.to_string(), elapsed as f64 / 1000.0);
                }

                let decision = if record.final_pass_started {
                    // the final pass is terminal regardless of reported activity
                    StepDecision::Finish
                } else if completed.active > 0 || completed.messages > 0 {
                    StepDecision::Advance
                } else if has_final_algorithm {
                    record.final_pass_started = true;
                    StepDecision::FinalPass
                } else {
                    StepDecision::Finish
                };
                Some((decision, completed_step))
            })
            .await?;

        let Some((decision, completed_step)) = decision else {
            return Ok(());
        };
        debug!(
            execution_id = %execution,
            completed_step,
            ?decision,
            operator = "ConductorDecision",
            "barrier closed"
        );
        match decision {
            StepDecision::Advance => self.start_next_step(execution, false).await,
            StepDecision::FinalPass => self.start_next_step(execution, true).await,
            StepDecision::Finish => self.cleanup(execution, None).await.map(|_| ()),
        }
    }

    /// Single terminal transition path for success, worker error, and timeout.
    ///
    /// Returns whether this call performed the transition; a record that is
    /// already terminal is left untouched and workers are not contacted again.
    async fn cleanup(&self, execution: ExecutionId, error: Option<Value>) -> Result<bool> {
        let participants = self
            .inner
            .store
            .with_record(execution, |record| {
                if record.state.is_terminal() {
                    return None;
                }
                record.state = if error.is_some() {
                    ExecutionState::Error
                } else {
                    ExecutionState::Finished
                };
                if error.is_some() {
                    record.error = error.clone();
                }
                record.store_time("cleanup");
                Some(record.participants())
            })
            .await?;

        let Some(participants) = participants else {
            debug!(
                execution_id = %execution,
                operator = "ConductorCleanup",
                "execution already terminal; cleanup skipped"
            );
            return Ok(false);
        };

        self.inner.deadlines.cancel(execution);
        if let Ok(mut handles) = self.inner.handles.lock() {
            handles.remove(&execution);
        }
        if let Err(err) = self
            .inner
            .transport
            .cleanup_execution(&participants, execution)
            .await
        {
            warn!(
                execution_id = %execution,
                error = %err,
                operator = "ConductorCleanup",
                "cleanup fan-out failed; worker-side state may linger"
            );
        }

        let state = if error.is_some() { "error" } else { "finished" };
        global_metrics().inc_executions_finished(state);
        info!(
            execution_id = %execution,
            state,
            operator = "ConductorCleanup",
            "execution reached terminal state"
        );
        Ok(true)
    }
}

fn reject_reason(err: &VfError) -> &'static str {
    match err {
        VfError::StepMismatch { .. } => "step_mismatch",
        VfError::MalformedReport(_) => "malformed_report",
        VfError::UnknownServer(_) => "unknown_server",
        _ => "other",
    }
}

#[cfg(test)]
#[path = "conductor_tests.rs"]
mod tests;
