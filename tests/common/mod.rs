//! Shared helpers for session integration tests

#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ptytask::{ChannelDelegate, ChildBuilder, PtySession, Scheduler, SessionConfig, SessionEvent};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A scheduler, one session on it, and the session's event stream
pub struct Harness {
    pub session: Arc<PtySession>,
    pub events: Receiver<SessionEvent>,
    // Dropped last so the session is torn down before the test ends.
    pub scheduler: Scheduler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SessionConfig {
            termination_grace_ms: 300,
            ..SessionConfig::default()
        })
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let scheduler = Scheduler::new(config).expect("Failed to start scheduler");
        let session = PtySession::new(&scheduler);
        let (delegate, events) = ChannelDelegate::channel();
        session.set_delegate(delegate);
        Self {
            session,
            events,
            scheduler,
        }
    }

    /// Collect events until `Deregistered` (included) or the timeout
    pub fn events_until_deregistered(&self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let deadline = Instant::now() + TIMEOUT;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.events.recv_timeout(left) {
                Ok(event) => {
                    let done = event == SessionEvent::Deregistered;
                    events.push(event);
                    if done {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        events
    }

    /// Collect output until it contains `needle` or the timeout; other events are kept too
    pub fn output_until(&self, needle: &[u8]) -> (Vec<u8>, Vec<SessionEvent>) {
        let mut output = Vec::new();
        let mut others = Vec::new();
        let deadline = Instant::now() + TIMEOUT;
        while !contains(&output, needle) {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match self.events.recv_timeout(left) {
                Ok(SessionEvent::Output(data)) => output.extend_from_slice(&data),
                Ok(event) => others.push(event),
                Err(_) => break,
            }
        }
        (output, others)
    }

    /// Events that arrive within `window`
    pub fn events_for(&self, window: Duration) -> Vec<SessionEvent> {
        let deadline = Instant::now() + window;
        let mut events = Vec::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.events.recv_timeout(left) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        events
    }
}

/// `/bin/sh -c script`, with `args` as `$0`, `$1`, ...
pub fn sh(script: &str, args: &[&str]) -> ChildBuilder {
    ChildBuilder::new("/bin/sh").arg("-c").arg(script).args(args)
}

/// Concatenated bytes of every `Output` event
pub fn output_of(events: &[SessionEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Output(data) => Some(data.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

pub fn count(events: &[SessionEvent], wanted: &SessionEvent) -> usize {
    events.iter().filter(|event| *event == wanted).count()
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Poll `condition` until it holds or the timeout passes
pub fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
