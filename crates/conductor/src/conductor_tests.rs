use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use vf_common::{ExecutionId, Result, VfError, WorkerId};

use super::*;
use crate::algorithm::{AlgorithmHandles, SuperstepHook};
use crate::record::{ExecutionState, StepInfo, StepReport};
use crate::topology::{CollectionKind, StaticGraphMeta};
use crate::transport::{StepCommand, Transport};

/// Transport double that records every fan-out instead of delivering it.
#[derive(Default)]
struct RecordingTransport {
    commands: StdMutex<Vec<(Vec<WorkerId>, StepCommand)>>,
    cleanups: StdMutex<Vec<(Vec<WorkerId>, ExecutionId)>>,
    fail_execute: AtomicBool,
}

impl RecordingTransport {
    fn commands(&self) -> Vec<(Vec<WorkerId>, StepCommand)> {
        self.commands.lock().expect("commands lock").clone()
    }

    fn cleanups(&self) -> Vec<(Vec<WorkerId>, ExecutionId)> {
        self.cleanups.lock().expect("cleanups lock").clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn mode(&self) -> &'static str {
        "local"
    }

    async fn execute_step(&self, workers: &[WorkerId], command: &StepCommand) -> Result<()> {
        if self.fail_execute.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(VfError::Transport("worker unreachable".to_string()));
        }
        self.commands
            .lock()
            .expect("commands lock")
            .push((workers.to_vec(), command.clone()));
        Ok(())
    }

    async fn cleanup_execution(&self, workers: &[WorkerId], execution: ExecutionId) -> Result<()> {
        self.cleanups
            .lock()
            .expect("cleanups lock")
            .push((workers.to_vec(), execution));
        Ok(())
    }
}

fn meta_with_workers(workers: &[&str]) -> StaticGraphMeta {
    let vertex_shards: Vec<(String, WorkerId)> = workers
        .iter()
        .enumerate()
        .map(|(i, w)| (format!("v_s{i}"), WorkerId::from(*w)))
        .collect();
    let edge_shards: Vec<(String, WorkerId)> = workers
        .iter()
        .enumerate()
        .map(|(i, w)| (format!("e_s{i}"), WorkerId::from(*w)))
        .collect();
    let mut meta = StaticGraphMeta::new();
    meta.add_graph(
        "social",
        10,
        vec![
            ("people".to_string(), CollectionKind::Vertex, vertex_shards),
            ("knows".to_string(), CollectionKind::Edge, edge_shards),
        ],
    );
    meta
}

fn conductor_with(
    workers: &[&str],
    config: ConductorConfig,
) -> (Conductor, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let meta = Arc::new(meta_with_workers(workers));
    let conductor = Conductor::new(config, transport.clone(), meta);
    (conductor, transport)
}

/// Deadlines off by default; timeout tests opt in per job.
fn test_config() -> ConductorConfig {
    ConductorConfig {
        default_step_deadline_ms: 0,
        ..ConductorConfig::default()
    }
}

fn handles(base: &str) -> AlgorithmHandles {
    AlgorithmHandles {
        base: base.to_string(),
        ..AlgorithmHandles::default()
    }
}

fn report(step: u64, active: u64, messages: u64) -> StepReport {
    StepReport {
        step,
        active: Some(active),
        messages: Some(messages),
        ..StepReport::default()
    }
}

#[tokio::test]
async fn start_seeds_record_and_fans_out_step_zero() {
    let (conductor, transport) = conductor_with(&["w1", "w2"], test_config());
    let execution = conductor
        .start_execution("social", handles("pagerank"), ExecutionOptions::default())
        .await
        .expect("start");

    let info = conductor.get_info(execution).await.expect("info");
    assert_eq!(info.step, 0);
    assert_eq!(info.state, ExecutionState::Running);

    let commands = transport.commands();
    assert_eq!(commands.len(), 1);
    let (workers, command) = &commands[0];
    assert_eq!(
        workers,
        &vec![WorkerId::from("w1"), WorkerId::from("w2")]
    );
    assert_eq!(command.step, 0);
    assert!(!command.final_pass);
    assert_eq!(command.algorithm, "pagerank");
    assert_eq!(command.execution, execution);

    // step 0 is seeded with the graph's vertex count
    let record = conductor.inner.store.snapshot(execution).await.expect("rec");
    assert_eq!(record.step_history[0].active, 10);
    assert_eq!(record.result_graph, format!("P_{execution}_RESULT_social"));
}

#[tokio::test]
async fn report_with_activity_advances_one_step() {
    let (conductor, transport) = conductor_with(&["w1"], test_config());
    let execution = conductor
        .start_execution("social", handles("pagerank"), ExecutionOptions::default())
        .await
        .expect("start");

    conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(0, 4, 6))
        .await
        .expect("report");

    let info = conductor.get_info(execution).await.expect("info");
    assert_eq!(info.step, 1);
    assert_eq!(info.state, ExecutionState::Running);

    let record = conductor.inner.store.snapshot(execution).await.expect("rec");
    assert_eq!(
        record.step_history[1],
        StepInfo {
            active: 4,
            messages: 6,
            data: vec![],
            is_final: false,
        }
    );
    assert!(record.time_used_ms.contains_key("setup"));
    assert!(record.time_used_ms.contains_key("step_0"));

    let commands = transport.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[1].1.step, 1);
    assert!(!commands[1].1.final_pass);
    assert!(transport.cleanups().is_empty());
}

#[tokio::test]
async fn convergence_finishes_and_cleans_up_once() {
    let (conductor, transport) = conductor_with(&["w1", "w2"], test_config());
    let execution = conductor
        .start_execution("social", handles("pagerank"), ExecutionOptions::default())
        .await
        .expect("start");

    conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(0, 0, 0))
        .await
        .expect("w1");
    conductor
        .on_worker_report(execution, &WorkerId::from("w2"), &report(0, 0, 0))
        .await
        .expect("w2");

    let info = conductor.get_info(execution).await.expect("info");
    assert_eq!(info.state, ExecutionState::Finished);

    let result = conductor.get_result(execution).await.expect("result");
    assert!(result.error.is_none());
    assert_eq!(result.result.graph_name, format!("P_{execution}_RESULT_social"));
    assert_eq!(result.result.state, ExecutionState::Finished);

    let record = conductor.inner.store.snapshot(execution).await.expect("rec");
    assert!(record.step_history[1].is_final);

    // exactly one cleanup fan-out, to all participants
    let cleanups = transport.cleanups();
    assert_eq!(cleanups.len(), 1);
    assert_eq!(
        cleanups[0].0,
        vec![WorkerId::from("w1"), WorkerId::from("w2")]
    );
    // and no further step fan-out after the terminal transition
    assert_eq!(transport.commands().len(), 1);
}

#[tokio::test]
async fn worker_error_terminates_with_payload() {
    let (conductor, transport) = conductor_with(&["w1"], test_config());
    let execution = conductor
        .start_execution("social", handles("pagerank"), ExecutionOptions::default())
        .await
        .expect("start");

    let mut failing = report(0, 3, 0);
    failing.error = Some(json!("boom"));
    conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &failing)
        .await
        .expect("report accepted even when it carries a failure");

    let result = conductor.get_result(execution).await.expect("result");
    assert_eq!(result.result.state, ExecutionState::Error);
    assert_eq!(result.error, Some(json!("boom")));
    assert!(result.result.graph_name.is_empty());
    assert_eq!(transport.cleanups().len(), 1);
}

#[tokio::test]
async fn invalid_reports_are_rejected_without_side_effects() {
    let (conductor, transport) = conductor_with(&["w1", "w2"], test_config());
    let execution = conductor
        .start_execution("social", handles("pagerank"), ExecutionOptions::default())
        .await
        .expect("start");

    // stale step
    let err = conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(7, 1, 1))
        .await
        .expect_err("stale");
    assert!(matches!(err, VfError::StepMismatch { reported: 7, current: 0 }));

    // missing counters
    let malformed = StepReport {
        step: 0,
        active: None,
        messages: None,
        ..StepReport::default()
    };
    let err = conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &malformed)
        .await
        .expect_err("malformed");
    assert!(matches!(err, VfError::MalformedReport(_)));

    // worker outside the barrier
    let err = conductor
        .on_worker_report(execution, &WorkerId::from("w9"), &report(0, 1, 1))
        .await
        .expect_err("unknown worker");
    assert!(matches!(err, VfError::UnknownServer(_)));

    // unknown execution
    let err = conductor
        .on_worker_report(ExecutionId(999), &WorkerId::from("w1"), &report(0, 1, 1))
        .await
        .expect_err("unknown execution");
    assert!(matches!(err, VfError::UnknownExecution(_)));

    let info = conductor.get_info(execution).await.expect("info");
    assert_eq!(info.step, 0);
    assert_eq!(info.state, ExecutionState::Running);
    assert_eq!(transport.commands().len(), 1);
}

#[tokio::test]
async fn duplicate_report_does_not_double_count() {
    let (conductor, _transport) = conductor_with(&["w1", "w2"], test_config());
    let execution = conductor
        .start_execution("social", handles("pagerank"), ExecutionOptions::default())
        .await
        .expect("start");

    conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(0, 5, 0))
        .await
        .expect("first");
    let err = conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(0, 5, 0))
        .await
        .expect_err("duplicate");
    assert!(matches!(err, VfError::StepMismatch { .. }));

    conductor
        .on_worker_report(execution, &WorkerId::from("w2"), &report(0, 2, 0))
        .await
        .expect("second worker closes the barrier");

    let record = conductor.inner.store.snapshot(execution).await.expect("rec");
    assert_eq!(record.step, 1);
    assert_eq!(record.step_history[1].active, 7);
}

#[tokio::test]
async fn concurrent_reports_advance_exactly_once() {
    let workers: Vec<String> = (0..8).map(|i| format!("w{i}")).collect();
    let worker_refs: Vec<&str> = workers.iter().map(String::as_str).collect();
    let (conductor, transport) = conductor_with(&worker_refs, test_config());
    let execution = conductor
        .start_execution("social", handles("pagerank"), ExecutionOptions::default())
        .await
        .expect("start");

    let mut tasks = Vec::new();
    for worker in &workers {
        let conductor = conductor.clone();
        let worker = WorkerId::from(worker.as_str());
        tasks.push(tokio::spawn(async move {
            conductor
                .on_worker_report(execution, &worker, &report(0, 1, 0))
                .await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("report");
    }

    let info = conductor.get_info(execution).await.expect("info");
    assert_eq!(info.step, 1);
    assert_eq!(info.state, ExecutionState::Running);

    let record = conductor.inner.store.snapshot(execution).await.expect("rec");
    assert_eq!(record.step_history[1].active, 8);
    // step 0 fan-out plus exactly one step 1 fan-out
    assert_eq!(transport.commands().len(), 2);
}

#[tokio::test]
async fn final_pass_runs_exactly_once_then_terminates() {
    let (conductor, transport) = conductor_with(&["w1"], test_config());
    let mut algorithms = handles("pagerank");
    algorithms.final_pass = Some("store_results".to_string());
    let execution = conductor
        .start_execution("social", algorithms, ExecutionOptions::default())
        .await
        .expect("start");

    // converged step triggers the flagged extra round instead of finishing
    conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(0, 0, 0))
        .await
        .expect("converged");
    let info = conductor.get_info(execution).await.expect("info");
    assert_eq!(info.state, ExecutionState::Running);
    let commands = transport.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands[1].1.final_pass);
    assert_eq!(commands[1].1.step, 1);
    assert_eq!(
        commands[1].1.final_algorithm.as_deref(),
        Some("store_results")
    );

    // the final pass terminates even if it reports fresh activity
    conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(1, 5, 2))
        .await
        .expect("final pass report");
    let info = conductor.get_info(execution).await.expect("info");
    assert_eq!(info.state, ExecutionState::Finished);
    assert_eq!(transport.commands().len(), 2);
    assert_eq!(transport.cleanups().len(), 1);
}

#[tokio::test]
async fn deadline_fires_and_terminates_the_execution() {
    let (conductor, transport) = conductor_with(&["w1"], test_config());
    let options = ExecutionOptions {
        step_deadline_ms: Some(30),
        ..ExecutionOptions::default()
    };
    let execution = conductor
        .start_execution("social", handles("pagerank"), options)
        .await
        .expect("start");

    tokio::time::sleep(Duration::from_millis(150)).await;

    let result = conductor.get_result(execution).await.expect("result");
    assert_eq!(result.result.state, ExecutionState::Error);
    let payload = result.error.expect("timeout payload");
    assert_eq!(payload["code"], json!("timeout"));
    assert_eq!(transport.cleanups().len(), 1);

    // a straggler report after the timeout is rejected
    let err = conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(0, 0, 0))
        .await
        .expect_err("late report");
    assert!(matches!(err, VfError::StepMismatch { .. }));
}

#[tokio::test]
async fn report_beating_the_deadline_cancels_it() {
    let (conductor, transport) = conductor_with(&["w1"], test_config());
    let options = ExecutionOptions {
        step_deadline_ms: Some(5_000),
        ..ExecutionOptions::default()
    };
    let execution = conductor
        .start_execution("social", handles("pagerank"), options)
        .await
        .expect("start");
    assert!(conductor.inner.deadlines.is_scheduled(execution));

    conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(0, 0, 0))
        .await
        .expect("report");

    let info = conductor.get_info(execution).await.expect("info");
    assert_eq!(info.state, ExecutionState::Finished);
    assert!(!conductor.inner.deadlines.is_scheduled(execution));
    assert_eq!(transport.cleanups().len(), 1);
}

#[tokio::test]
async fn timeout_is_a_noop_on_terminal_executions() {
    let (conductor, transport) = conductor_with(&["w1"], test_config());
    let execution = conductor
        .start_execution("social", handles("pagerank"), ExecutionOptions::default())
        .await
        .expect("start");
    conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(0, 0, 0))
        .await
        .expect("finish");

    conductor
        .timeout_execution(execution)
        .await
        .expect("idempotent timeout");

    let result = conductor.get_result(execution).await.expect("result");
    assert_eq!(result.result.state, ExecutionState::Finished);
    assert!(result.error.is_none());
    assert_eq!(transport.cleanups().len(), 1);
}

struct ActivityTracker;

impl SuperstepHook for ActivityTracker {
    fn name(&self) -> &str {
        "activity-tracker"
    }

    fn init_step(&self, globals: &mut Map<String, Value>, completed: &StepInfo) -> Result<()> {
        globals.insert("last_active".to_string(), completed.active.into());
        Ok(())
    }
}

#[tokio::test]
async fn superstep_hook_mutations_reach_the_next_fan_out() {
    let (conductor, transport) = conductor_with(&["w1"], test_config());
    let mut algorithms = handles("pagerank");
    algorithms.superstep = Some(Arc::new(ActivityTracker));
    let execution = conductor
        .start_execution("social", algorithms, ExecutionOptions::default())
        .await
        .expect("start");

    conductor
        .on_worker_report(execution, &WorkerId::from("w1"), &report(0, 3, 1))
        .await
        .expect("report");

    let record = conductor.inner.store.snapshot(execution).await.expect("rec");
    assert_eq!(record.globals.get("step"), Some(&json!(0)));
    assert_eq!(record.globals.get("last_active"), Some(&json!(3)));

    let commands = transport.commands();
    assert_eq!(commands[1].1.globals.get("last_active"), Some(&json!(3)));
}

#[tokio::test]
async fn empty_algorithm_handle_is_rejected() {
    let (conductor, transport) = conductor_with(&["w1"], test_config());
    let err = conductor
        .start_execution("social", handles("  "), ExecutionOptions::default())
        .await
        .expect_err("blank handle");
    assert!(matches!(err, VfError::InvalidConfig(_)));
    assert!(transport.commands().is_empty());
}

#[tokio::test]
async fn unknown_graph_is_rejected() {
    let (conductor, _transport) = conductor_with(&["w1"], test_config());
    let err = conductor
        .start_execution("missing", handles("pagerank"), ExecutionOptions::default())
        .await
        .expect_err("unknown graph");
    assert!(matches!(err, VfError::InvalidConfig(_)));
}

#[tokio::test]
async fn failed_fan_out_terminates_the_execution() {
    let (conductor, transport) = conductor_with(&["w1"], test_config());
    transport
        .fail_execute
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = conductor
        .start_execution("social", handles("pagerank"), ExecutionOptions::default())
        .await
        .expect_err("fan-out fails");
    assert!(matches!(err, VfError::Transport(_)));

    // the record exists and was driven to the error state
    let result = conductor.get_result(ExecutionId(1)).await.expect("result");
    assert_eq!(result.result.state, ExecutionState::Error);
    assert_eq!(result.error.expect("payload")["code"], json!("transport"));
    assert_eq!(transport.cleanups().len(), 1);
}
