//! # Shared Bus - Channel Event Dispatcher
//!
//! Delivers committed channel transitions to the participants of each
//! channel as an ordered, replayable stream.
//!
//! ## Model
//!
//! ```text
//!  lifecycle managers                      participants
//!  ┌──────────────┐   publish()    ┌──────────────────────────┐
//!  │ MSContract / │ ─────────────→ │ log[alice]: 1 2 3 5 ...  │ ──→ subscribe / resume
//!  │ VPC / Engine │                │ log[bob]:   1 2 3 4 5 ...│ ──→ subscribe / resume
//!  └──────────────┘                └──────────────────────────┘
//! ```
//!
//! - Every address owns an append-only log; sequence numbers are shared
//!   across logs and strictly increase in commit order.
//! - A subscription replays the log (or a suffix of it) and then receives
//!   live entries through a bounded queue. A full queue never blocks the
//!   publisher; the subscriber re-reads what it missed from the log.
//! - Requesting the next entry acknowledges the previous one. `resume`
//!   restarts a channel stream at the last acknowledged entry
//!   (at-least-once at the boundary).

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod events;
pub mod publisher;
pub mod subscriber;

// Re-export main types
pub use events::{ChannelEvent, EventFilter, EventKind};
pub use publisher::{EventDispatcher, EventPublisher, ReplayFrom};
pub use subscriber::{EventStream, Subscription, SubscriptionError};

/// Entries buffered per live subscriber before it falls back to the log.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_buffer() {
        assert_eq!(DEFAULT_SUBSCRIBER_BUFFER, 256);
        assert_eq!(EventDispatcher::new().capacity(), DEFAULT_SUBSCRIBER_BUFFER);
    }
}
