//! Control plane of a distributed bulk-synchronous graph engine.
//!
//! The conductor owns the execution lifecycle: it builds the result-graph
//! topology once per job, fans superstep commands out to every shard-owning
//! worker, collects their step reports behind a barrier, and decides between
//! advancing, one final result-materialization pass, and cleanup. Vertex
//! computation itself happens on the workers, behind [`transport::Transport`].

pub mod algorithm;
pub mod barrier;
pub mod conductor;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod record;
pub mod store;
pub mod timer;
pub mod topology;
pub mod transport;

pub use algorithm::{
    deregister_superstep_hook, lookup_superstep_hook, register_superstep_hook, AlgorithmHandles,
    SuperstepHook,
};
pub use conductor::{
    Conductor, ConductorConfig, ExecutionInfo, ExecutionOptions, ExecutionResult, ResultPayload,
};
pub use record::{ExecutionRecord, ExecutionState, StepInfo, StepReport};
pub use topology::{CollectionKind, GraphMeta, GraphTopology, StaticGraphMeta};
pub use transport::{LocalTransport, StepCommand, Transport, WorkerEngine};
