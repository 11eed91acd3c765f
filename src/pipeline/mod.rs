//! Pipeline execution: stage runner, durable progress, cooperative
//! cancellation and the per-batch orchestrator.

mod orchestrator;
mod progress;
mod runner;

use tokio::sync::watch;

pub use orchestrator::{
    BatchReport, Orchestrator, PipelinePorts, ProgressReport, Roster, TicketResult,
};
pub use progress::ProgressStore;
pub use runner::{BackoffPolicy, StageOutput, StagePolicy, StageResult, StageRunner};

/// Create a linked cancellation pair for one batch.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Producer side; owned by the orchestrator's batch registry.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Consumer side, cloned into every stage call. Cancellation is observed
/// at suspension points only; nothing is forcibly terminated.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
