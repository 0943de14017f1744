//! Outbound notifications for the UI layer
//!
//! The engine pushes `SyncSignal`s into an unbounded channel and never waits
//! on the receiver. Dropping the receiver silences the engine without
//! affecting sync.

use tokio::sync::mpsc;

/// Signals emitted by the sync engine and transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    /// A sync run acquired the run gate
    SyncStarted,
    /// A sync run finished (successfully or not)
    SyncEnded,
    /// Token refresh failed; the user must sign in again
    AuthenticationFailed,
    /// Remote changes were written to the local store
    TaskListChanged,
}

/// Fire-and-forget sender of [`SyncSignal`]s
#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: Option<mpsc::UnboundedSender<SyncSignal>>,
}

impl SignalBus {
    /// Create a bus and the receiver the UI subscribes with
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A bus nobody listens to
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, signal: SyncSignal) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_receiver() {
        let (bus, mut rx) = SignalBus::channel();
        bus.emit(SyncSignal::SyncStarted);
        bus.clone().emit(SyncSignal::SyncEnded);

        assert_eq!(rx.try_recv().unwrap(), SyncSignal::SyncStarted);
        assert_eq!(rx.try_recv().unwrap(), SyncSignal::SyncEnded);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_without_listener_is_silent() {
        let (bus, rx) = SignalBus::channel();
        drop(rx);
        bus.emit(SyncSignal::TaskListChanged);
        SignalBus::disconnected().emit(SyncSignal::AuthenticationFailed);
    }
}
