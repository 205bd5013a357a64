//! Deadline task scheduler.
//!
//! At most one pending task per execution id; scheduling again replaces the
//! previous task, cancelling aborts it. The step scheduler re-arms the
//! deadline on every fan-out and the barrier coordinator cancels it when the
//! barrier closes first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use vf_common::ExecutionId;

#[derive(Debug, Default)]
pub struct DeadlineScheduler {
    tasks: Mutex<HashMap<ExecutionId, JoinHandle<()>>>,
}

impl DeadlineScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `task` to run after `delay`, replacing any pending task for the
    /// same execution.
    pub fn schedule<F>(&self, execution: ExecutionId, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(previous) = tasks.insert(execution, handle) {
                previous.abort();
            }
        }
    }

    /// Abort the pending task for `execution`, if any.
    pub fn cancel(&self, execution: ExecutionId) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(&execution) {
                handle.abort();
            }
        }
    }

    /// True while a task is armed and has not run or been aborted yet.
    pub fn is_scheduled(&self, execution: ExecutionId) -> bool {
        self.tasks
            .lock()
            .map(|tasks| {
                tasks
                    .get(&execution)
                    .is_some_and(|handle| !handle.is_finished())
            })
            .unwrap_or(false)
    }
}
