//! Start/stop handle for long-running background services.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Handle to a spawned periodic service (scheduler, reconciler, ...).
///
/// Dropping the handle does not stop the task; call [`ServiceHandle::stop`].
pub struct ServiceHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    /// Spawn `body` with a shutdown receiver that flips to `true` on stop.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(body(rx));
        info!(service = name, "Service started");
        Self {
            name,
            shutdown,
            task,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal shutdown and wait for the current iteration to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => info!(service = self.name, "Service stopped"),
            Err(e) => error!(service = self.name, error = %e, "Service task failed"),
        }
    }
}

/// Resolves once the shutdown flag is set (or the sender is gone).
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
