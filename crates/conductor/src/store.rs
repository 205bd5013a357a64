//! Durable execution-record store.
//!
//! The store exclusively owns every record's durable copy; callers only get
//! clones (`snapshot`) or scoped mutable access (`with_record`), the atomic
//! read-merge-write primitive the barrier coordinator relies on. Each record
//! sits behind its own lock, so concurrent reports for one execution
//! serialize against each other while unrelated executions never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use vf_common::{ExecutionId, Result, VfError};

use crate::record::ExecutionRecord;

#[derive(Debug, Default)]
pub struct ExecutionStore {
    records: StdMutex<HashMap<ExecutionId, Arc<Mutex<ExecutionRecord>>>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a freshly created record. Fails if the id already exists.
    pub fn create(&self, record: ExecutionRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| VfError::Transport("execution store poisoned".to_string()))?;
        if records.contains_key(&record.id) {
            return Err(VfError::InvalidConfig(format!(
                "execution '{}' already exists",
                record.id
            )));
        }
        records.insert(record.id, Arc::new(Mutex::new(record)));
        Ok(())
    }

    fn entry(&self, execution: ExecutionId) -> Result<Arc<Mutex<ExecutionRecord>>> {
        let records = self
            .records
            .lock()
            .map_err(|_| VfError::Transport("execution store poisoned".to_string()))?;
        records
            .get(&execution)
            .cloned()
            .ok_or(VfError::UnknownExecution(execution))
    }

    /// Point-in-time copy of the record for side-effect-free reads.
    pub async fn snapshot(&self, execution: ExecutionId) -> Result<ExecutionRecord> {
        let entry = self.entry(execution)?;
        let record = entry.lock().await;
        Ok(record.clone())
    }

    /// Atomic read-merge-write: `f` runs with exclusive access to the record,
    /// serialized against every other mutation of the same execution.
    pub async fn with_record<R>(
        &self,
        execution: ExecutionId,
        f: impl FnOnce(&mut ExecutionRecord) -> R,
    ) -> Result<R> {
        let entry = self.entry(execution)?;
        let mut record = entry.lock().await;
        Ok(f(&mut record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ExecutionState;
    use crate::topology::GraphTopology;
    use serde_json::Map;

    fn record(id: u64) -> ExecutionRecord {
        ExecutionRecord::new(
            ExecutionId(id),
            "g".to_string(),
            "r".to_string(),
            GraphTopology::default(),
            3,
            None,
            Map::new(),
        )
    }

    #[tokio::test]
    async fn create_snapshot_mutate() {
        let store = ExecutionStore::new();
        store.create(record(1)).expect("create");
        assert!(store.create(record(1)).is_err());

        let snap = store.snapshot(ExecutionId(1)).await.expect("snapshot");
        assert_eq!(snap.step, 0);

        store
            .with_record(ExecutionId(1), |rec| {
                rec.step = 4;
                rec.state = ExecutionState::Finished;
            })
            .await
            .expect("mutate");
        let snap = store.snapshot(ExecutionId(1)).await.expect("snapshot");
        assert_eq!(snap.step, 4);
        assert_eq!(snap.state, ExecutionState::Finished);

        // snapshots are copies, not views
        let mut stale = store.snapshot(ExecutionId(1)).await.expect("snapshot");
        stale.step = 99;
        let fresh = store.snapshot(ExecutionId(1)).await.expect("snapshot");
        assert_eq!(fresh.step, 4);
    }

    #[tokio::test]
    async fn unknown_execution_is_reported() {
        let store = ExecutionStore::new();
        let err = store.snapshot(ExecutionId(5)).await.expect_err("missing");
        assert!(matches!(err, VfError::UnknownExecution(ExecutionId(5))));
    }
}
