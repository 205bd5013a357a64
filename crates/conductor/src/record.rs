//! Execution record: the single shared mutable resource of the control plane.
//!
//! One [`ExecutionRecord`] exists per running job. It is owned by the
//! [`ExecutionStore`](crate::store::ExecutionStore) and every mutation after
//! job start goes through the store's atomic `with_record` primitive — the
//! barrier merge and the state transitions never touch it by any other path.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vf_common::{ExecutionId, WorkerId};

use crate::topology::GraphTopology;

/// Execution lifecycle states. Terminal states have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    /// Steps are being fanned out and collected.
    Running,
    /// All steps completed and workers released their resources.
    Finished,
    /// The execution failed terminally; `error` holds the payload.
    Error,
}

impl ExecutionState {
    /// True once the execution reached `Finished` or `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Finished | ExecutionState::Error)
    }

    /// Stable lowercase name used in status responses and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Running => "running",
            ExecutionState::Finished => "finished",
            ExecutionState::Error => "error",
        }
    }
}

/// Aggregated statistics of one superstep.
///
/// Reports for the in-flight step merge into the pre-allocated *next* slot
/// of the history; once every worker acked, the slot is immutable and the
/// step scheduler may read it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Vertices that remain active and will execute in the next step.
    pub active: u64,
    /// Messages sent during the step.
    pub messages: u64,
    /// Opaque per-worker contributions, concatenated in arrival order.
    pub data: Vec<Value>,
    /// True once the step produced zero active vertices and zero messages.
    pub is_final: bool,
}

impl StepInfo {
    /// Seed info for step 0: every vertex starts active, no messages yet.
    pub fn seed(vertex_count: u64) -> Self {
        Self {
            active: vertex_count,
            ..Self::default()
        }
    }

    /// A step is converged iff it produced no activity at all.
    pub fn converged(&self) -> bool {
        self.active == 0 && self.messages == 0
    }
}

/// Step-completion report sent by one worker for one superstep.
///
/// `active` and `messages` are optional on the wire; their absence makes the
/// report malformed and the barrier rejects it without merging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepReport {
    /// Step number the worker just completed.
    pub step: u64,
    /// Vertices still active on the worker's shards.
    pub active: Option<u64>,
    /// Messages the worker sent during the step.
    pub messages: Option<u64>,
    /// Aggregator contributions from this worker.
    #[serde(default)]
    pub data: Vec<Value>,
    /// Worker-side computation failure, propagated verbatim.
    #[serde(default)]
    pub error: Option<Value>,
}

/// Durable record of one running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Opaque execution identifier.
    pub id: ExecutionId,
    /// Source graph name as submitted.
    pub graph_name: String,
    /// Generated result graph name, set once by the topology builder.
    pub result_graph: String,
    /// Current superstep index, monotonically increasing from 0.
    pub step: u64,
    /// Lifecycle state; transitions to a terminal state exactly once.
    pub state: ExecutionState,
    /// One slot per superstep plus one pre-allocated "next" slot.
    pub step_history: Vec<StepInfo>,
    /// Barrier for the current in-flight step: worker → acked.
    pub pending_acks: HashMap<WorkerId, bool>,
    /// Per-step deadline in milliseconds; `None` disables the timer.
    pub deadline_ms: Option<u64>,
    /// Job-scoped state visible to the orchestration hooks.
    pub globals: Map<String, Value>,
    /// Shard/result-graph topology, read-only after start.
    pub topology: GraphTopology,
    /// Terminal error payload, present only when `state == Error`.
    pub error: Option<Value>,
    /// Set once the final-pass fan-out has been issued.
    pub final_pass_started: bool,
    /// Elapsed wall time per phase (setup, step N, cleanup), milliseconds.
    pub time_used_ms: HashMap<String, u64>,
    /// Start of the currently measured phase, unix milliseconds.
    pub timer_started_ms: Option<u64>,
}

impl ExecutionRecord {
    /// Build the initial record for a new job: step 0 seeded with the
    /// vertex count, an empty slot for step 1, and an all-false barrier.
    pub fn new(
        id: ExecutionId,
        graph_name: String,
        result_graph: String,
        topology: GraphTopology,
        vertex_count: u64,
        deadline_ms: Option<u64>,
        globals: Map<String, Value>,
    ) -> Self {
        let participants = topology.participants();
        let mut record = Self {
            id,
            graph_name,
            result_graph,
            step: 0,
            state: ExecutionState::Running,
            step_history: vec![StepInfo::seed(vertex_count), StepInfo::default()],
            pending_acks: HashMap::new(),
            deadline_ms,
            globals,
            topology,
            error: None,
            final_pass_started: false,
            time_used_ms: HashMap::new(),
            timer_started_ms: None,
        };
        record.reset_acks(&participants);
        record
    }

    /// Workers participating in this job's barriers, sorted for stable fan-out.
    pub fn participants(&self) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self.pending_acks.keys().cloned().collect();
        workers.sort();
        workers
    }

    /// Re-arm the barrier for a new step: all participants unacked.
    pub fn reset_acks(&mut self, participants: &[WorkerId]) {
        self.pending_acks = participants.iter().cloned().map(|w| (w, false)).collect();
    }

    /// True once every participant acked the current step.
    pub fn all_acked(&self) -> bool {
        self.pending_acks.values().all(|acked| *acked)
    }

    /// Start measuring a phase.
    pub fn start_timer(&mut self) {
        self.timer_started_ms = Some(now_ms());
    }

    /// Close the current phase under `title` and restart the clock; returns
    /// the elapsed milliseconds when a phase was being measured.
    pub fn store_time(&mut self, title: &str) -> Option<u64> {
        let now = now_ms();
        let elapsed = self
            .timer_started_ms
            .map(|started| now.saturating_sub(started));
        if let Some(elapsed) = elapsed {
            self.time_used_ms.insert(title.to_string(), elapsed);
        }
        self.timer_started_ms = Some(now);
        elapsed
    }
}

/// Milliseconds since the unix epoch; saturates to 0 on clock skew.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_record_shape() {
        let record = ExecutionRecord::new(
            ExecutionId(7),
            "g".to_string(),
            "P_7_RESULT_g".to_string(),
            GraphTopology::default(),
            42,
            Some(500),
            Map::new(),
        );
        assert_eq!(record.step, 0);
        assert_eq!(record.state, ExecutionState::Running);
        assert_eq!(record.step_history.len(), 2);
        assert_eq!(record.step_history[0].active, 42);
        assert_eq!(record.step_history[1], StepInfo::default());
        assert!(!record.final_pass_started);
    }

    #[test]
    fn barrier_acks_round_trip() {
        let mut record = ExecutionRecord::new(
            ExecutionId(1),
            "g".to_string(),
            "r".to_string(),
            GraphTopology::default(),
            0,
            None,
            Map::new(),
        );
        let workers = vec![WorkerId::from("w1"), WorkerId::from("w2")];
        record.reset_acks(&workers);
        assert!(!record.all_acked());
        record.pending_acks.insert(WorkerId::from("w1"), true);
        assert!(!record.all_acked());
        record.pending_acks.insert(WorkerId::from("w2"), true);
        assert!(record.all_acked());
    }

    #[test]
    fn converged_requires_both_zero() {
        assert!(StepInfo::default().converged());
        assert!(!StepInfo {
            active: 1,
            ..StepInfo::default()
        }
        .converged());
        assert!(!StepInfo {
            messages: 2,
            ..StepInfo::default()
        }
        .converged());
    }
}
