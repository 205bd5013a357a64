//! Result-graph topology computation.
//!
//! Responsibilities:
//! - create, once per job, result collections co-located with their source
//!   collections ("distribute like source": same shard key, same count);
//! - pair source and result shards positionally;
//! - build the vertex-shard → edge-shard adjacency used for local joins;
//! - derive per-worker shard ownership for the source and result graphs.
//!
//! The shard placement service is consumed through [`GraphMeta`]; the builder
//! never talks to storage directly.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vf_common::{ExecutionId, Result, VfError, WorkerId};

/// Collection role within the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Vertex,
    Edge,
}

/// Sharding-relevant properties of one source collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionProps {
    pub name: String,
    pub kind: CollectionKind,
    pub shard_keys: Vec<String>,
    pub number_of_shards: u32,
}

/// Definition of a generated result collection, distributed like its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCollectionDef {
    pub name: String,
    pub kind: CollectionKind,
    pub shard_keys: Vec<String>,
    pub number_of_shards: u32,
    /// Source collection whose shard placement the new one must follow.
    pub distribute_like: String,
}

/// Graph metadata and shard placement capability consumed by the builder.
///
/// Implementations wrap the underlying storage service; `shard_placement`
/// must return shards in their stable ordinal order, since source and result
/// shards are paired positionally.
#[async_trait]
pub trait GraphMeta: Send + Sync {
    /// Collections of a named graph with their sharding properties.
    async fn graph_collections(&self, graph: &str) -> Result<Vec<CollectionProps>>;

    /// Ordered shard → owning-worker placement of one collection.
    async fn shard_placement(&self, collection: &str) -> Result<Vec<(String, WorkerId)>>;

    /// Create a result collection colocated with its source; returns the
    /// ordered placement of the newly created shards.
    async fn create_result_collection(
        &self,
        def: &ResultCollectionDef,
    ) -> Result<Vec<(String, WorkerId)>>;

    /// Total vertex count of the graph, used to seed step 0.
    async fn vertex_count(&self, graph: &str) -> Result<u64>;
}

/// Computed once at job start, read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphTopology {
    /// Original collection name → generated result-collection name.
    pub collection_map: HashMap<String, String>,
    /// Original shard → result shard (same ordinal index in both lists).
    pub result_shards: HashMap<String, String>,
    /// Vertex shard → edge shards to consult for its outgoing edges.
    pub edge_shards: HashMap<String, Vec<String>>,
    /// Worker → {vertex collection → owned source shards}.
    pub server_shard_map: HashMap<WorkerId, HashMap<String, Vec<String>>>,
    /// Worker → {vertex collection → owned result shards}.
    pub server_result_shard_map: HashMap<WorkerId, HashMap<String, Vec<String>>>,
    /// Collection → shard key attributes.
    pub shard_key_map: HashMap<String, Vec<String>>,
}

impl GraphTopology {
    /// Workers owning at least one vertex shard of the source graph,
    /// sorted for deterministic fan-out order.
    pub fn participants(&self) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self.server_shard_map.keys().cloned().collect();
        workers.sort();
        workers
    }
}

/// Name of the result collection generated for `collection` in `execution`.
pub fn result_collection_name(execution: ExecutionId, collection: &str) -> String {
    format!("P_{execution}_RESULT_{collection}")
}

/// Build the result graph and its topology for one execution.
///
/// With `dry_run` set, no collections are created; result shards are
/// synthesized colocated with their source shard, which keeps the returned
/// maps congruent with the real creation path for estimation and tests.
///
/// Returns the topology plus the generated result-graph name.
pub async fn build_result_graph(
    meta: &dyn GraphMeta,
    execution: ExecutionId,
    graph: &str,
    dry_run: bool,
) -> Result<(GraphTopology, String)> {
    let collections = meta.graph_collections(graph).await?;
    if collections.is_empty() {
        return Err(VfError::InvalidConfig(format!(
            "graph '{graph}' has no collections"
        )));
    }

    let mut topology = GraphTopology::default();
    let mut vertex_shard_lists: Vec<Vec<String>> = Vec::new();
    let mut edge_shard_lists: Vec<Vec<String>> = Vec::new();
    let mut shard_count: Option<usize> = None;

    for props in &collections {
        let source_placement = meta.shard_placement(&props.name).await?;
        if source_placement.is_empty() {
            return Err(VfError::InvalidConfig(format!(
                "collection '{}' has no shards",
                props.name
            )));
        }
        match shard_count {
            None => shard_count = Some(source_placement.len()),
            Some(expected) if expected != source_placement.len() => {
                return Err(VfError::InvalidConfig(format!(
                    "collection '{}' has {} shards, expected {} for colocation",
                    props.name,
                    source_placement.len(),
                    expected
                )));
            }
            Some(_) => {}
        }

        let result_name = result_collection_name(execution, &props.name);
        let def = ResultCollectionDef {
            name: result_name.clone(),
            kind: props.kind,
            shard_keys: props.shard_keys.clone(),
            number_of_shards: props.number_of_shards,
            distribute_like: props.name.clone(),
        };
        let result_placement = if dry_run {
            synthesized_placement(&result_name, &source_placement)
        } else {
            let created = meta.create_result_collection(&def).await?;
            if created.len() != source_placement.len() {
                return Err(VfError::InvalidConfig(format!(
                    "result collection '{result_name}' created {} shards, source has {}",
                    created.len(),
                    source_placement.len()
                )));
            }
            created
        };

        topology
            .collection_map
            .insert(props.name.clone(), result_name);
        topology
            .shard_key_map
            .insert(props.name.clone(), props.shard_keys.clone());
        for ((source_shard, _), (result_shard, _)) in
            source_placement.iter().zip(result_placement.iter())
        {
            topology
                .result_shards
                .insert(source_shard.clone(), result_shard.clone());
        }

        let shards: Vec<String> = source_placement.iter().map(|(s, _)| s.clone()).collect();
        match props.kind {
            CollectionKind::Vertex => {
                for (shard, worker) in &source_placement {
                    topology
                        .server_shard_map
                        .entry(worker.clone())
                        .or_default()
                        .entry(props.name.clone())
                        .or_default()
                        .push(shard.clone());
                }
                for (shard, worker) in &result_placement {
                    topology
                        .server_result_shard_map
                        .entry(worker.clone())
                        .or_default()
                        .entry(props.name.clone())
                        .or_default()
                        .push(shard.clone());
                }
                vertex_shard_lists.push(shards);
            }
            CollectionKind::Edge => {
                edge_shard_lists.push(shards);
            }
        }
    }

    if vertex_shard_lists.is_empty() {
        return Err(VfError::InvalidConfig(format!(
            "graph '{graph}' has no vertex collections"
        )));
    }

    // The i-th shard of every vertex collection joins against the i-th shard
    // of every edge collection; collections sharing a distribution key shard
    // identically, so positional alignment is exact.
    for vertex_shards in &vertex_shard_lists {
        for (index, vertex_shard) in vertex_shards.iter().enumerate() {
            let edges: Vec<String> = edge_shard_lists
                .iter()
                .map(|edge_shards| edge_shards[index].clone())
                .collect();
            topology.edge_shards.insert(vertex_shard.clone(), edges);
        }
    }

    let result_graph = result_collection_name(execution, graph);
    Ok((topology, result_graph))
}

fn synthesized_placement(
    result_name: &str,
    source_placement: &[(String, WorkerId)],
) -> Vec<(String, WorkerId)> {
    source_placement
        .iter()
        .enumerate()
        .map(|(index, (_, worker))| (format!("{result_name}_s{index}"), worker.clone()))
        .collect()
}

/// File- or fixture-backed [`GraphMeta`] for single-node deployments and tests.
///
/// Created result collections are tracked so callers can inspect the side
/// effects of a build.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StaticGraphMeta {
    graphs: HashMap<String, StaticGraph>,
    #[serde(skip)]
    created: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StaticGraph {
    collections: Vec<StaticCollection>,
    vertex_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StaticCollection {
    name: String,
    kind: CollectionKind,
    #[serde(default)]
    shard_keys: Vec<String>,
    /// Ordered shard → worker placement.
    shards: Vec<(String, WorkerId)>,
}

impl StaticGraphMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON graph descriptor (see the conductor binary for the format).
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| VfError::InvalidConfig(format!("invalid graph descriptor json: {e}")))
    }

    /// Register a graph with its collections and total vertex count.
    pub fn add_graph(
        &mut self,
        graph: &str,
        vertex_count: u64,
        collections: Vec<(String, CollectionKind, Vec<(String, WorkerId)>)>,
    ) {
        let collections = collections
            .into_iter()
            .map(|(name, kind, shards)| StaticCollection {
                name,
                kind,
                shard_keys: vec!["_key".to_string()],
                shards,
            })
            .collect();
        self.graphs.insert(
            graph.to_string(),
            StaticGraph {
                collections,
                vertex_count,
            },
        );
    }

    /// Result collections created so far, in creation order.
    pub fn created_collections(&self) -> Vec<String> {
        self.created
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn graph(&self, graph: &str) -> Result<&StaticGraph> {
        self.graphs
            .get(graph)
            .ok_or_else(|| VfError::InvalidConfig(format!("unknown graph: {graph}")))
    }

    fn collection(&self, name: &str) -> Result<&StaticCollection> {
        self.graphs
            .values()
            .flat_map(|g| g.collections.iter())
            .find(|c| c.name == name)
            .ok_or_else(|| VfError::InvalidConfig(format!("unknown collection: {name}")))
    }
}

#[async_trait]
impl GraphMeta for StaticGraphMeta {
    async fn graph_collections(&self, graph: &str) -> Result<Vec<CollectionProps>> {
        Ok(self
            .graph(graph)?
            .collections
            .iter()
            .map(|c| CollectionProps {
                name: c.name.clone(),
                kind: c.kind,
                shard_keys: c.shard_keys.clone(),
                number_of_shards: c.shards.len() as u32,
            })
            .collect())
    }

    async fn shard_placement(&self, collection: &str) -> Result<Vec<(String, WorkerId)>> {
        Ok(self.collection(collection)?.shards.clone())
    }

    async fn create_result_collection(
        &self,
        def: &ResultCollectionDef,
    ) -> Result<Vec<(String, WorkerId)>> {
        let source = self.collection(&def.distribute_like)?;
        if let Ok(mut created) = self.created.lock() {
            created.push(def.name.clone());
        }
        Ok(synthesized_placement(&def.name, &source.shards))
    }

    async fn vertex_count(&self, graph: &str) -> Result<u64> {
        Ok(self.graph(graph)?.vertex_count)
    }
}
