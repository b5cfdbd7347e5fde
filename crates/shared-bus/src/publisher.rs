//! # Event Dispatcher
//!
//! Publishing side of the event log, and the in-memory dispatcher that owns
//! the per-address logs and the live subscriber queues.

use crate::events::{ChannelEvent, EventFilter, EventKind};
use crate::subscriber::{EventStream, Subscription};
use crate::DEFAULT_SUBSCRIBER_BUFFER;
use parking_lot::Mutex;
use shared_types::{Address, Channel, ChannelId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Trait for appending entries to participants' logs.
pub trait EventPublisher: Send + Sync {
    /// Append one entry per recipient and push it to their live subscribers.
    ///
    /// # Returns
    ///
    /// The sequence number shared by the appended entries.
    fn publish(&self, recipients: &[Address], kind: EventKind, channel: &Channel) -> u64;

    /// Get the total number of publish calls.
    fn events_published(&self) -> u64;
}

/// Where a new subscription starts replaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayFrom {
    /// Replay the whole log.
    Beginning,
    /// Replay entries with `seq >= n`.
    Seq(u64),
}

impl ReplayFrom {
    fn includes(&self, seq: u64) -> bool {
        match self {
            Self::Beginning => true,
            Self::Seq(from) => seq >= *from,
        }
    }
}

pub(crate) struct LiveSubscriber {
    pub(crate) address: Address,
    pub(crate) filter: EventFilter,
    pub(crate) sender: mpsc::Sender<ChannelEvent>,
    /// Set when the queue overflowed; the subscriber re-reads the log.
    pub(crate) lagged: Arc<AtomicBool>,
}

#[derive(Default)]
pub(crate) struct DispatcherState {
    pub(crate) next_seq: u64,
    pub(crate) logs: HashMap<Address, Vec<ChannelEvent>>,
    pub(crate) subscribers: HashMap<Uuid, LiveSubscriber>,
    pub(crate) acknowledged: HashMap<(Address, ChannelId), u64>,
    pub(crate) closed: bool,
}

impl DispatcherState {
    /// Entries of `address`'s log after `after` that pass `filter`.
    pub(crate) fn collect(
        &self,
        address: &Address,
        filter: &EventFilter,
        from: ReplayFrom,
    ) -> Vec<ChannelEvent> {
        self.logs
            .get(address)
            .map(|log| {
                log.iter()
                    .filter(|e| from.includes(e.seq) && filter.matches(e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub(crate) struct DispatcherShared {
    pub(crate) state: Mutex<DispatcherState>,
    pub(crate) capacity: usize,
    pub(crate) events_published: AtomicU64,
}

/// In-memory event dispatcher.
///
/// Each address owns an append-only log. Subscribers get a bounded queue;
/// when it fills up the dispatcher stops pushing to that subscriber and the
/// subscriber catches up from the log, so a slow consumer never blocks a
/// publisher. Logs outlive subscriptions, so a dropped stream can resume.
#[derive(Clone)]
pub struct EventDispatcher {
    shared: Arc<DispatcherShared>,
}

impl EventDispatcher {
    /// Create a dispatcher with the default per-subscriber buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Create a dispatcher with the given per-subscriber buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(DispatcherShared {
                state: Mutex::new(DispatcherState {
                    next_seq: 1,
                    ..DispatcherState::default()
                }),
                capacity: capacity.max(1),
                events_published: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to `address`'s log.
    ///
    /// Entries already in the log (from `from` on) are replayed first, then
    /// new entries follow in commit order.
    #[must_use]
    pub fn subscribe(&self, address: Address, filter: EventFilter, from: ReplayFrom) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.shared.capacity);
        let lagged = Arc::new(AtomicBool::new(false));
        let id = Uuid::new_v4();

        // Snapshot and registration happen under one lock so nothing
        // committed in between is missed or doubled.
        let backlog = {
            let mut state = self.shared.state.lock();
            let backlog = state.collect(&address, &filter, from);
            if !state.closed {
                state.subscribers.insert(
                    id,
                    LiveSubscriber {
                        address,
                        filter: filter.clone(),
                        sender,
                        lagged: lagged.clone(),
                    },
                );
            }
            backlog
        };

        debug!(
            subscriber = %id,
            address = %address,
            channel = ?filter.channel,
            replay = backlog.len(),
            "New subscription created"
        );

        Subscription::new(
            id,
            address,
            filter,
            receiver,
            backlog,
            lagged,
            self.shared.clone(),
        )
    }

    /// Resume a channel stream from the last acknowledged entry.
    ///
    /// The acknowledged entry itself is delivered again. With no
    /// acknowledgement on record the whole channel history is replayed.
    #[must_use]
    pub fn resume(&self, address: Address, channel: ChannelId) -> Subscription {
        let from = self
            .last_acknowledged(&address, &channel)
            .map_or(ReplayFrom::Beginning, ReplayFrom::Seq);
        self.subscribe(address, EventFilter::channel(channel), from)
    }

    /// Subscribe and wrap the subscription as a stream.
    #[must_use]
    pub fn event_stream(&self, address: Address, filter: EventFilter, from: ReplayFrom) -> EventStream {
        self.subscribe(address, filter, from).into_stream()
    }

    /// Last acknowledged sequence number for a channel in `address`'s log.
    #[must_use]
    pub fn last_acknowledged(&self, address: &Address, channel: &ChannelId) -> Option<u64> {
        self.shared
            .state
            .lock()
            .acknowledged
            .get(&(*address, *channel))
            .copied()
    }

    /// Copy of `address`'s log entries passing `filter`.
    #[must_use]
    pub fn history(&self, address: &Address, filter: &EventFilter) -> Vec<ChannelEvent> {
        self.shared
            .state
            .lock()
            .collect(address, filter, ReplayFrom::Beginning)
    }

    /// Get the number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }

    /// Get the per-subscriber buffer size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// End every live subscription. Logs are kept.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.subscribers.clear();
        debug!("Event dispatcher closed");
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for EventDispatcher {
    fn publish(&self, recipients: &[Address], kind: EventKind, channel: &Channel) -> u64 {
        self.shared.events_published.fetch_add(1, Ordering::Relaxed);

        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let mut delivered = 0usize;
        for (i, recipient) in recipients.iter().enumerate() {
            if recipients[..i].contains(recipient) {
                continue;
            }

            let event = ChannelEvent {
                seq,
                recipient: *recipient,
                kind: kind.clone(),
                channel: channel.clone(),
                recorded_at: channel.updated_at,
            };

            for (id, sub) in state.subscribers.iter() {
                if sub.address != *recipient
                    || !sub.filter.matches(&event)
                    || sub.lagged.load(Ordering::Acquire)
                {
                    continue;
                }
                match sub.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        sub.lagged.store(true, Ordering::Release);
                        debug!(subscriber = %id, seq, "Subscriber lagging, will catch up from log");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }

            state.logs.entry(*recipient).or_default().push(event);
        }

        trace!(
            seq,
            kind = kind.name(),
            channel_id = %channel.id,
            recipients = recipients.len(),
            live = delivered,
            "Event appended"
        );
        seq
    }

    fn events_published(&self) -> u64 {
        self.shared.events_published.load(Ordering::Relaxed)
    }
}
