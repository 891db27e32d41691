//! Callbacks from a session to its consumer
//!
//! Every callback runs on the scheduler thread with no session lock held.
//! Implementations must not block; they may call [`PtySession::write`] and
//! the other control methods.
//!
//! [`PtySession::write`]: crate::PtySession::write

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Receiver of session output and lifecycle events
pub trait PtyDelegate: Send + Sync {
    /// Raw bytes read from the pty, undecoded
    fn on_read_bytes(&self, data: &[u8]);

    /// The pty became unusable; fires at most once
    fn on_broken_pipe(&self) {}

    /// A coprocess was attached or detached
    fn on_coprocess_status_change(&self) {}

    /// Teardown finished; no callback follows this one
    fn on_deregistered(&self) {}
}

/// Session events as delivered by [`ChannelDelegate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Vec<u8>),
    BrokenPipe,
    CoprocessStatusChanged,
    Deregistered,
}

/// A delegate that queues events for a consumer to poll
#[derive(Debug)]
pub struct ChannelDelegate {
    tx: Sender<SessionEvent>,
}

impl ChannelDelegate {
    pub fn channel() -> (Arc<Self>, Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: SessionEvent) {
        // A consumer that dropped its receiver is no longer interested.
        let _ = self.tx.send(event);
    }
}

impl PtyDelegate for ChannelDelegate {
    fn on_read_bytes(&self, data: &[u8]) {
        self.send(SessionEvent::Output(data.to_vec()));
    }

    fn on_broken_pipe(&self) {
        self.send(SessionEvent::BrokenPipe);
    }

    fn on_coprocess_status_change(&self) {
        self.send(SessionEvent::CoprocessStatusChanged);
    }

    fn on_deregistered(&self) {
        self.send(SessionEvent::Deregistered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_delegate_forwards_in_order() {
        let (delegate, rx) = ChannelDelegate::channel();
        delegate.on_read_bytes(b"abc");
        delegate.on_broken_pipe();
        delegate.on_deregistered();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                SessionEvent::Output(b"abc".to_vec()),
                SessionEvent::BrokenPipe,
                SessionEvent::Deregistered,
            ]
        );
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (delegate, rx) = ChannelDelegate::channel();
        drop(rx);
        delegate.on_read_bytes(b"lost");
    }
}
