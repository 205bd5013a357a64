//! gRPC service/client glue for the conductor and worker services.
//!
//! RPC schema source: `proto/vf_conductor.proto`.
//!
//! Control-plane RPCs (generated under [`v1`]):
//! - `StartExecution`, `GetInfo`, `GetResult`
//! - `ReportStep` (worker → conductor step completion)
//!
//! Worker command RPCs:
//! - `ExecuteStep`
//! - `CleanupExecution`
//!
//! Useful generated request/response types:
//! [`v1::StartExecutionRequest`], [`v1::ReportStepRequest`],
//! [`v1::ExecuteStepRequest`], [`v1::CleanupExecutionRequest`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::{Map, Value};
use tonic::{Request, Response, Status};
use tracing::debug;
use vf_common::{ExecutionId, Result, VfError, WorkerId};

use crate::algorithm::{lookup_superstep_hook, AlgorithmHandles};
use crate::conductor::{Conductor, ExecutionOptions};
use crate::record::StepReport;
use crate::transport::{StepCommand, Transport};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("vf.conductor.v1");
}

pub use v1::conductor_service_client::ConductorServiceClient;
pub use v1::conductor_service_server::{ConductorService, ConductorServiceServer};
pub use v1::worker_service_client::WorkerServiceClient;
pub use v1::worker_service_server::{WorkerService, WorkerServiceServer};

#[derive(Clone)]
/// Control-plane gRPC service backed by a shared [`Conductor`].
pub struct ConductorGrpcService {
    conductor: Conductor,
}

impl ConductorGrpcService {
    pub fn new(conductor: Conductor) -> Self {
        Self { conductor }
    }
}

#[tonic::async_trait]
impl ConductorService for ConductorGrpcService {
    async fn start_execution(
        &self,
        request: Request<v1::StartExecutionRequest>,
    ) -> std::result::Result<Response<v1::StartExecutionResponse>, Status> {
        let req = request.into_inner();

        let superstep = if req.superstep_hook.is_empty() {
            None
        } else {
            let hook = lookup_superstep_hook(&req.superstep_hook).ok_or_else(|| {
                Status::invalid_argument(format!(
                    "unknown superstep hook: {}",
                    req.superstep_hook
                ))
            })?;
            Some(hook)
        };
        let algorithms = AlgorithmHandles {
            base: req.algorithm,
            superstep,
            final_pass: non_empty(req.final_algorithm),
            aggregator: non_empty(req.aggregator),
        };
        let options = ExecutionOptions {
            step_deadline_ms: match req.step_deadline_ms {
                0 => None,
                ms => Some(ms),
            },
            globals: parse_globals(&req.globals_json).map_err(to_status)?,
            dry_run: req.dry_run,
        };

        let execution = self
            .conductor
            .start_execution(&req.graph_name, algorithms, options)
            .await
            .map_err(to_status)?;
        Ok(Response::new(v1::StartExecutionResponse {
            execution_id: execution.0,
        }))
    }

    async fn get_info(
        &self,
        request: Request<v1::GetInfoRequest>,
    ) -> std::result::Result<Response<v1::GetInfoResponse>, Status> {
        let req = request.into_inner();
        let info = self
            .conductor
            .get_info(ExecutionId(req.execution_id))
            .await
            .map_err(to_status)?;
        Ok(Response::new(v1::GetInfoResponse {
            step: info.step,
            state: info.state.as_str().to_string(),
        }))
    }

    async fn get_result(
        &self,
        request: Request<v1::GetResultRequest>,
    ) -> std::result::Result<Response<v1::GetResultResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .conductor
            .get_result(ExecutionId(req.execution_id))
            .await
            .map_err(to_status)?;
        Ok(Response::new(v1::GetResultResponse {
            error_json: result
                .error
                .map(|e| e.to_string())
                .unwrap_or_default(),
            graph_name: result.result.graph_name,
            state: result.result.state.as_str().to_string(),
        }))
    }

    async fn report_step(
        &self,
        request: Request<v1::ReportStepRequest>,
    ) -> std::result::Result<Response<v1::ReportStepResponse>, Status> {
        let req = request.into_inner();
        let report = StepReport {
            step: req.step,
            active: req.has_active.then_some(req.active),
            messages: req.has_messages.then_some(req.messages),
            data: req
                .data_json
                .iter()
                .map(|raw| parse_value(raw))
                .collect::<Result<Vec<Value>>>()
                .map_err(to_status)?,
            error: if req.error_json.is_empty() {
                None
            } else {
                Some(parse_value(&req.error_json).map_err(to_status)?)
            },
        };
        debug!(
            execution_id = req.execution_id,
            worker_id = %req.worker_id,
            step = req.step,
            token = req.token,
            operator = "GrpcReportStep",
            "step report received"
        );

        let worker = WorkerId::from(req.worker_id);
        match self
            .conductor
            .on_worker_report(ExecutionId(req.execution_id), &worker, &report)
            .await
        {
            Ok(()) => Ok(Response::new(v1::ReportStepResponse {
                accepted: true,
                reject_reason: String::new(),
            })),
            // protocol-level rejections are a normal part of the barrier
            // protocol (stragglers, retries); report them in-band
            Err(err) if err.is_protocol() => Ok(Response::new(v1::ReportStepResponse {
                accepted: false,
                reject_reason: err.to_string(),
            })),
            Err(err) => Err(to_status(err)),
        }
    }
}

/// Remote fan-out transport: one gRPC worker endpoint per worker id.
pub struct ClusterTransport {
    endpoints: HashMap<WorkerId, String>,
    ack_timeout: Duration,
}

impl ClusterTransport {
    pub fn new(endpoints: HashMap<WorkerId, String>, ack_timeout: Duration) -> Self {
        Self {
            endpoints,
            ack_timeout,
        }
    }

    fn endpoint(&self, worker: &WorkerId) -> Result<String> {
        self.endpoints
            .get(worker)
            .cloned()
            .ok_or_else(|| VfError::UnknownServer(worker.to_string()))
    }
}

#[async_trait]
impl Transport for ClusterTransport {
    fn mode(&self) -> &'static str {
        "cluster"
    }

    async fn execute_step(&self, workers: &[WorkerId], command: &StepCommand) -> Result<()> {
        let globals_json = serde_json::to_string(&command.globals)
            .map_err(|e| VfError::Transport(format!("globals serialization failed: {e}")))?;
        let topology_json = serde_json::to_string(&command.topology)
            .map_err(|e| VfError::Transport(format!("topology serialization failed: {e}")))?;

        let calls = workers.iter().map(|worker| {
            let endpoint = self.endpoint(worker);
            let request = v1::ExecuteStepRequest {
                execution_id: command.execution.0,
                step: command.step,
                final_pass: command.final_pass,
                algorithm: command.algorithm.clone(),
                final_algorithm: command.final_algorithm.clone().unwrap_or_default(),
                aggregator: command.aggregator.clone().unwrap_or_default(),
                globals_json: globals_json.clone(),
                topology_json: topology_json.clone(),
                deadline_ms: command.deadline_ms.unwrap_or_default(),
                conductor: command.conductor.clone(),
                token: command.token,
            };
            let ack_timeout = self.ack_timeout;
            let worker = worker.clone();
            async move {
                let mut client = connect_worker(&endpoint?).await?;
                let response =
                    tokio::time::timeout(ack_timeout, client.execute_step(request))
                        .await
                        .map_err(|_| VfError::Timeout)?
                        .map_err(|status| {
                            VfError::Transport(format!(
                                "execute_step on '{worker}' failed: {status}"
                            ))
                        })?;
                if !response.into_inner().accepted {
                    return Err(VfError::Worker(format!(
                        "worker '{worker}' refused the step command"
                    )));
                }
                Ok(())
            }
        });
        try_join_all(calls).await.map(|_| ())
    }

    async fn cleanup_execution(&self, workers: &[WorkerId], execution: ExecutionId) -> Result<()> {
        let calls = workers.iter().map(|worker| {
            let endpoint = self.endpoint(worker);
            let ack_timeout = self.ack_timeout;
            let worker = worker.clone();
            async move {
                let mut client = connect_worker(&endpoint?).await?;
                let request = v1::CleanupExecutionRequest {
                    execution_id: execution.0,
                };
                tokio::time::timeout(ack_timeout, client.cleanup_execution(request))
                    .await
                    .map_err(|_| VfError::Timeout)?
                    .map_err(|status| {
                        VfError::Transport(format!("cleanup on '{worker}' failed: {status}"))
                    })?;
                Ok(())
            }
        });
        try_join_all(calls).await.map(|_| ())
    }
}

async fn connect_worker(
    endpoint: &str,
) -> Result<WorkerServiceClient<tonic::transport::Channel>> {
    WorkerServiceClient::connect(endpoint.to_string())
        .await
        .map_err(|err| VfError::Transport(format!("grpc connect failed: {err}")))
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_globals(raw: &str) -> Result<Map<String, Value>> {
    if raw.is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| VfError::InvalidConfig(format!("globals must be a json object: {e}")))
}

fn parse_value(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| VfError::MalformedReport(format!("invalid json: {e}")))
}

fn to_status(err: VfError) -> Status {
    match err {
        VfError::InvalidConfig(msg) => Status::invalid_argument(msg),
        VfError::UnknownExecution(id) => Status::not_found(format!("unknown execution: {id}")),
        VfError::StepMismatch { reported, current } => Status::failed_precondition(format!(
            "step mismatch: reported {reported}, current {current}"
        )),
        VfError::MalformedReport(msg) => Status::invalid_argument(msg),
        VfError::UnknownServer(msg) => Status::not_found(msg),
        VfError::Timeout => Status::deadline_exceeded("step deadline exceeded"),
        VfError::Worker(msg) => Status::internal(msg),
        VfError::Transport(msg) => Status::unavailable(msg),
        VfError::Io(e) => Status::internal(e.to_string()),
    }
}
