//! Typed algorithm seams.
//!
//! The caller supplies algorithm behavior as typed handles: worker-side
//! algorithms travel by name (workers resolve them locally), while the
//! conductor-side superstep hook is a trait object. Hooks can also be
//! registered process-globally by name so RPC submissions can reference them.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::{Map, Value};
use vf_common::Result;

use crate::record::StepInfo;

/// Orchestration-level hook invoked between supersteps with the job globals
/// and the just-completed step's aggregate statistics. Mutations to `globals`
/// are persisted before the next fan-out.
pub trait SuperstepHook: Send + Sync {
    /// Registry name of this hook.
    fn name(&self) -> &str;

    /// Reduce the completed step into the job globals.
    fn init_step(&self, globals: &mut Map<String, Value>, completed: &StepInfo) -> Result<()>;
}

/// Algorithm handles submitted with a job.
#[derive(Clone, Default)]
pub struct AlgorithmHandles {
    /// Worker-side vertex algorithm, resolved by name on every worker.
    pub base: String,
    /// Conductor-side per-superstep hook.
    pub superstep: Option<Arc<dyn SuperstepHook>>,
    /// Worker-side final-pass algorithm; its presence enables the one extra
    /// result-materialization round after convergence.
    pub final_pass: Option<String>,
    /// Aggregator handle shipped to workers.
    pub aggregator: Option<String>,
}

impl std::fmt::Debug for AlgorithmHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmHandles")
            .field("base", &self.base)
            .field("superstep", &self.superstep.as_ref().map(|h| h.name()))
            .field("final_pass", &self.final_pass)
            .field("aggregator", &self.aggregator)
            .finish()
    }
}

type HookRegistry = RwLock<HashMap<String, Arc<dyn SuperstepHook>>>;

static GLOBAL_HOOKS: OnceLock<HookRegistry> = OnceLock::new();

fn global_hooks() -> &'static HookRegistry {
    GLOBAL_HOOKS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a superstep hook under its name, replacing any previous one.
pub fn register_superstep_hook(hook: Arc<dyn SuperstepHook>) {
    if let Ok(mut hooks) = global_hooks().write() {
        hooks.insert(hook.name().to_string(), hook);
    }
}

/// Remove a registered hook by name.
pub fn deregister_superstep_hook(name: &str) {
    if let Ok(mut hooks) = global_hooks().write() {
        hooks.remove(name);
    }
}

/// Look up a registered hook by name.
pub fn lookup_superstep_hook(name: &str) -> Option<Arc<dyn SuperstepHook>> {
    global_hooks()
        .read()
        .ok()
        .and_then(|hooks| hooks.get(name).cloned())
}
