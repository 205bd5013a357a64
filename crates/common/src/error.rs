use thiserror::Error;

use crate::ids::ExecutionId;

/// Canonical VertexFlow error taxonomy used across crates.
///
/// Classification guidance:
/// - [`VfError::InvalidConfig`]: graph/algorithm/option problems detected before any step runs
/// - [`VfError::StepMismatch`], [`VfError::MalformedReport`], [`VfError::UnknownServer`]:
///   protocol-level report errors; the report is discarded and the execution keeps waiting
/// - [`VfError::Timeout`], [`VfError::Worker`]: terminal execution failures routed through cleanup
/// - [`VfError::Transport`]: fan-out/RPC failures talking to workers
/// - [`VfError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum VfError {
    /// Invalid or inconsistent graph/algorithm/option configuration.
    ///
    /// Examples:
    /// - empty or unregistered algorithm handle
    /// - collections without a consistent shard count (no colocation possible)
    /// - graph with no shard-owning workers
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Lookup of an execution id that was never created or already discarded.
    #[error("unknown execution: {0}")]
    UnknownExecution(ExecutionId),

    /// A worker report carried a step number other than the in-flight step,
    /// or duplicated an ack already counted for this step.
    #[error("step mismatch: report for step {reported}, execution is at step {current}")]
    StepMismatch {
        /// Step number carried by the report.
        reported: u64,
        /// Current in-flight step of the execution.
        current: u64,
    },

    /// A worker report was missing required fields.
    #[error("malformed worker report: {0}")]
    MalformedReport(String),

    /// A report arrived from a worker that is not part of the current barrier.
    #[error("unknown server: {0}")]
    UnknownServer(String),

    /// The per-step deadline fired before the barrier closed.
    #[error("execution deadline exceeded before all workers reported")]
    Timeout,

    /// A worker reported a computation failure for the current step.
    #[error("worker error: {0}")]
    Worker(String),

    /// Command fan-out or reply transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VfError {
    /// True for report-level protocol errors that are recovered locally:
    /// the offending report is rejected and the execution keeps running.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            VfError::StepMismatch { .. } | VfError::MalformedReport(_) | VfError::UnknownServer(_)
        )
    }
}

/// Standard VertexFlow result alias.
pub type Result<T> = std::result::Result<T, VfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_recoverable() {
        assert!(VfError::StepMismatch {
            reported: 3,
            current: 1
        }
        .is_protocol());
        assert!(VfError::MalformedReport("missing active".to_string()).is_protocol());
        assert!(VfError::UnknownServer("w9".to_string()).is_protocol());
        assert!(!VfError::Timeout.is_protocol());
        assert!(!VfError::Worker("boom".to_string()).is_protocol());
        assert!(!VfError::InvalidConfig("bad".to_string()).is_protocol());
    }
}
