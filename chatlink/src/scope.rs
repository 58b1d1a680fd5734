//! Scope-bound background tasks.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A spawned task tied to the lifetime of its owner.
///
/// Dropping the scope cancels the task's token; the task is expected to
/// check it before every state mutation.
#[derive(Debug)]
pub struct TaskScope {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TaskScope {
    /// Wrap a task spawned with `cancel`.
    #[must_use]
    pub const fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// A scope with nothing running.
    #[must_use]
    pub fn idle() -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        Self { cancel, task: None }
    }

    /// Cancel the task. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the task is neither cancelled nor finished.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(err = %e, "scoped task panicked");
            }
        }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
