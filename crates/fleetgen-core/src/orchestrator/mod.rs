//! Fleet-wide deployment: bounded parallelism, failure policy, cancellation.

mod executor;
pub mod outcome;
pub mod plan;

pub use executor::Orchestrator;
pub use outcome::{
    DeploymentOutcome, FleetStatus, HostOutcome, HostResult, EXIT_ABORTED, EXIT_INVALID,
    EXIT_PARTIAL_FAILURE, EXIT_SUCCESS,
};
pub use plan::{DeploymentPlan, RollbackPolicy, StageTimeouts};

use tokio::sync::watch;

/// Operator-side handle; `cancel` is observed by workers between stages.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal(self.0.subscribe())
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        CancelSignal(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_seen_by_every_signal() {
        let (handle, signal) = cancellation();
        let other = handle.signal();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
        assert!(other.is_cancelled());
        assert!(!CancelSignal::never().is_cancelled());
    }
}
