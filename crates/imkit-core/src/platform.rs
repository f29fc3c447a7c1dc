//! Runtime helpers for background tasks, sleeping and bounded waits.

use std::future::Future;
use std::time::Duration;

use crate::error::ImError;

/// Handle to a spawned background task. Dropping it does not stop the task.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    handle: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn abort(&self) {
        tracing::trace!(task = self.name, "Aborting background task");
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawn a named background task on the current tokio runtime.
pub fn spawn<F>(name: &'static str, future: F) -> TaskHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::trace!(task = name, "Spawning background task");
    TaskHandle {
        name,
        handle: tokio::spawn(future),
    }
}

pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Run a future with a deadline, mapping expiry to `ImError::Timeout`.
pub async fn timeout<F, T>(duration: Duration, future: F) -> Result<T, ImError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ImError::Timeout(duration))
}
