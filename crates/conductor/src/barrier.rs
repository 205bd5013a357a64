//! Barrier coordinator: merging worker step reports into the execution record.
//!
//! [`apply_report`] is the whole quorum algorithm; it runs under the store's
//! per-execution lock, so validation, merge, and the all-acked check form a
//! single atomic unit per report. Two concurrent reports can therefore never
//! both observe the barrier as closing: exactly the report that flips the
//! last pending ack returns [`BarrierOutcome::Closed`], and only its caller
//! advances or cleans up the job (the advance-once invariant).
//!
//! Validation failures leave the record completely untouched; the additive
//! merge is commutative over `active`/`messages`, while aggregated data keeps
//! arrival order.

use vf_common::{Result, VfError, WorkerId};

use crate::record::{ExecutionRecord, StepReport};

/// What the merged report means for the current step's barrier.
#[derive(Debug, Clone, PartialEq)]
pub enum BarrierOutcome {
    /// More workers still owe a report for this step.
    Pending,
    /// This report closed the barrier; `error` carries the first worker
    /// failure recorded during the step, if any.
    Closed {
        error: Option<serde_json::Value>,
    },
}

/// Validate and merge one worker report for the record's in-flight step.
///
/// Errors: [`VfError::StepMismatch`] for stale, future, post-terminal, or
/// duplicate reports; [`VfError::MalformedReport`] when counters are absent;
/// [`VfError::UnknownServer`] for workers outside the barrier. All are
/// protocol-level: the caller discards the report and the job keeps running.
pub fn apply_report(
    record: &mut ExecutionRecord,
    worker: &WorkerId,
    report: &StepReport,
) -> Result<BarrierOutcome> {
    if record.state.is_terminal() || report.step != record.step {
        return Err(VfError::StepMismatch {
            reported: report.step,
            current: record.step,
        });
    }
    let (Some(active), Some(messages)) = (report.active, report.messages) else {
        return Err(VfError::MalformedReport(format!(
            "report from '{worker}' for step {} lacks active/messages counters",
            report.step
        )));
    };
    match record.pending_acks.get(worker) {
        None => return Err(VfError::UnknownServer(worker.to_string())),
        // second report from the same worker within one step: the ack was
        // already counted, merging again would double-count
        Some(true) => {
            return Err(VfError::StepMismatch {
                reported: report.step,
                current: record.step,
            });
        }
        Some(false) => {}
    }

    // Reports for step N accumulate in the pre-allocated slot N+1.
    let slot = (record.step + 1) as usize;
    let info = &mut record.step_history[slot];
    info.active += active;
    info.messages += messages;
    info.data.extend(report.data.iter().cloned());
    if record.error.is_none() {
        record.error = report.error.clone();
    }
    record.pending_acks.insert(worker.clone(), true);

    if record.all_acked() {
        Ok(BarrierOutcome::Closed {
            error: record.error.clone(),
        })
    } else {
        Ok(BarrierOutcome::Pending)
    }
}
