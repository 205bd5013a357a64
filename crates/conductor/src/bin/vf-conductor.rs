use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Server;
use tracing_subscriber::EnvFilter;
use vf_common::WorkerId;
use vf_conductor::grpc::{ClusterTransport, ConductorGrpcService, ConductorServiceServer};
use vf_conductor::{Conductor, ConductorConfig, StaticGraphMeta};

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Parse `VF_WORKERS` ("w1=http://host:port,w2=http://host:port") into the
/// worker endpoint map.
fn parse_workers(raw: &str) -> Result<HashMap<WorkerId, String>, Box<dyn std::error::Error>> {
    let mut endpoints = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (worker, endpoint) = entry
            .split_once('=')
            .ok_or_else(|| format!("invalid worker entry '{entry}', expected name=endpoint"))?;
        endpoints.insert(WorkerId::from(worker.trim()), endpoint.trim().to_string());
    }
    if endpoints.is_empty() {
        return Err("VF_WORKERS must list at least one worker".into());
    }
    Ok(endpoints)
}

fn load_graph_meta(path: Option<String>) -> Result<StaticGraphMeta, Box<dyn std::error::Error>> {
    match path {
        Some(p) => {
            let raw = std::fs::read_to_string(&p)?;
            Ok(StaticGraphMeta::from_json(&raw)?)
        }
        None => Ok(StaticGraphMeta::new()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let bind = env_or_default("VF_CONDUCTOR_BIND", "0.0.0.0:7010");
    let addr: SocketAddr = bind.parse()?;
    let server_name = env_or_default("VF_CONDUCTOR_NAME", "conductor");
    let default_step_deadline_ms = env_u64_or_default("VF_STEP_DEADLINE_MS", 600_000);
    let fanout_ack_timeout_ms = env_u64_or_default("VF_FANOUT_ACK_TIMEOUT_MS", 5_000);
    let workers = parse_workers(&env_or_default("VF_WORKERS", ""))?;
    let graph_descriptor_path = env::var("VF_GRAPH_DESCRIPTOR_PATH").ok();
    let graph_meta = load_graph_meta(graph_descriptor_path.clone())?;

    let worker_count = workers.len();
    let transport = Arc::new(ClusterTransport::new(
        workers,
        Duration::from_millis(fanout_ack_timeout_ms),
    ));
    let conductor = Conductor::new(
        ConductorConfig {
            default_step_deadline_ms,
            fanout_ack_timeout_ms,
            server_name: server_name.clone(),
        },
        transport,
        Arc::new(graph_meta),
    );
    let service = ConductorGrpcService::new(conductor);

    println!(
        "vf-conductor listening on {addr} (name={server_name}, workers={worker_count}, step_deadline_ms={default_step_deadline_ms}, ack_timeout_ms={fanout_ack_timeout_ms}, graph_descriptor={})",
        graph_descriptor_path.unwrap_or_else(|| "<none>".to_string())
    );

    Server::builder()
        .add_service(ConductorServiceServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
