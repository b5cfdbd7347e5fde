//! # Event Subscriber
//!
//! Receiving side of the event log.
//!
//! A subscription first drains its replay backlog, then its live queue.
//! Asking for the next entry acknowledges the previous one, so an entry
//! handed out just before a disconnect is delivered again on resume.

use crate::events::{ChannelEvent, EventFilter};
use crate::publisher::{DispatcherShared, ReplayFrom};
use shared_types::{Address, ChannelId};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::debug;
use uuid::Uuid;

/// Errors from subscription operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The dispatcher was closed.
    #[error("Event dispatcher closed")]
    Closed,
}

/// Boxed stream of log entries.
pub type EventStream = Pin<Box<dyn Stream<Item = ChannelEvent> + Send>>;

/// A subscription handle for receiving entries of one address's log.
///
/// When dropped, the live queue is deregistered. The log and the
/// acknowledgements are kept.
pub struct Subscription {
    id: Uuid,
    address: Address,
    filter: EventFilter,
    receiver: mpsc::Receiver<ChannelEvent>,
    backlog: VecDeque<ChannelEvent>,
    lagged: Arc<AtomicBool>,
    shared: Arc<DispatcherShared>,
    /// Highest sequence number handed out so far.
    last_seq: Option<u64>,
    /// Entry handed out but not yet acknowledged.
    unacked: Option<(ChannelId, u64)>,
}

impl Subscription {
    pub(crate) fn new(
        id: Uuid,
        address: Address,
        filter: EventFilter,
        receiver: mpsc::Receiver<ChannelEvent>,
        backlog: Vec<ChannelEvent>,
        lagged: Arc<AtomicBool>,
        shared: Arc<DispatcherShared>,
    ) -> Self {
        Self {
            id,
            address,
            filter,
            receiver,
            backlog: backlog.into(),
            lagged,
            shared,
            last_seq: None,
            unacked: None,
        }
    }

    /// Receive the next entry, acknowledging the previous one.
    ///
    /// # Returns
    ///
    /// - `Some(event)` - The next entry in commit order
    /// - `None` - The dispatcher was closed and everything was delivered
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.try_recv() {
                Ok(Some(event)) => return Some(event),
                Err(SubscriptionError::Closed) => return None,
                Ok(None) => {}
            }

            let event = self.receiver.recv().await?;
            if let Some(event) = self.accept(event) {
                return Some(event);
            }
        }
    }

    /// Try to receive the next entry without waiting.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(event))` - An entry was available
    /// - `Ok(None)` - Nothing available yet
    /// - `Err(SubscriptionError::Closed)` - The dispatcher was closed
    pub fn try_recv(&mut self) -> Result<Option<ChannelEvent>, SubscriptionError> {
        self.acknowledge();

        loop {
            if let Some(event) = self.backlog.pop_front() {
                if let Some(event) = self.accept(event) {
                    return Ok(Some(event));
                }
                continue;
            }

            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Ok(Some(event));
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    if !self.catch_up() {
                        return Ok(None);
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !self.catch_up() {
                        return Err(SubscriptionError::Closed);
                    }
                }
            }
        }
    }

    /// Record the last handed-out entry as acknowledged.
    pub fn acknowledge(&mut self) {
        let Some((channel, seq)) = self.unacked.take() else {
            return;
        };
        let mut state = self.shared.state.lock();
        let slot = state
            .acknowledged
            .entry((self.address, channel))
            .or_insert(seq);
        if *slot < seq {
            *slot = seq;
        }
    }

    /// Get the filter for this subscription.
    #[must_use]
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Get the address whose log this subscription reads.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Convert into a stream. Each poll acknowledges the previous entry.
    pub fn into_stream(self) -> EventStream {
        Box::pin(futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        }))
    }

    /// Drop duplicates and track the entry as handed out.
    fn accept(&mut self, event: ChannelEvent) -> Option<ChannelEvent> {
        if self.last_seq.is_some_and(|last| event.seq <= last) {
            return None;
        }
        self.last_seq = Some(event.seq);
        self.unacked = Some((event.channel.id, event.seq));
        Some(event)
    }

    /// Refill the backlog from the log after the live queue overflowed.
    ///
    /// Returns `true` if anything was loaded.
    fn catch_up(&mut self) -> bool {
        if !self.lagged.load(Ordering::Acquire) {
            return false;
        }

        let from = self
            .last_seq
            .map_or(ReplayFrom::Beginning, |seq| ReplayFrom::Seq(seq + 1));

        // The lagged flag is cleared under the same lock publishers take, so
        // entries after this snapshot go to the live queue again.
        let missed = {
            let state = self.shared.state.lock();
            let missed = state.collect(&self.address, &self.filter, from);
            self.lagged.store(false, Ordering::Release);
            missed
        };

        debug!(subscriber = %self.id, missed = missed.len(), "Subscriber caught up from log");
        let loaded = !missed.is_empty();
        self.backlog.extend(missed);
        loaded
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.state.lock().subscribers.remove(&self.id);
        debug!(subscriber = %self.id, "Subscription dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::publisher::{EventDispatcher, EventPublisher};
    use shared_types::{Channel, Participants};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    fn channel(byte: u8) -> Channel {
        let participants = Participants::new(Address::new([1u8; 20]), Address::new([2u8; 20]));
        Channel::new_ms_contract(ChannelId::new([byte; 32]), participants, 0, 10)
    }

    async fn next(sub: &mut Subscription) -> ChannelEvent {
        timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timeout")
            .expect("event")
    }

    #[tokio::test]
    async fn test_replays_then_streams_live() {
        let dispatcher = EventDispatcher::new();
        let ch = channel(1);
        let alice = ch.participants.a;

        dispatcher.publish(&ch.participants.both(), EventKind::Created, &ch);
        let mut sub = dispatcher.subscribe(alice, EventFilter::all(), ReplayFrom::Beginning);
        dispatcher.publish(&ch.participants.both(), EventKind::Confirmed, &ch);

        assert_eq!(next(&mut sub).await.kind, EventKind::Created);
        assert_eq!(next(&mut sub).await.kind, EventKind::Confirmed);
        assert!(matches!(sub.try_recv(), Ok(None)));
    }

    #[tokio::test]
    async fn test_channel_filter() {
        let dispatcher = EventDispatcher::new();
        let ch1 = channel(1);
        let ch2 = channel(2);
        let alice = ch1.participants.a;

        let mut sub = dispatcher.subscribe(alice, EventFilter::channel(ch2.id), ReplayFrom::Beginning);
        dispatcher.publish(&ch1.participants.both(), EventKind::Created, &ch1);
        dispatcher.publish(&ch2.participants.both(), EventKind::Created, &ch2);

        assert_eq!(next(&mut sub).await.channel_id(), ch2.id);
    }

    #[tokio::test]
    async fn test_acknowledge_on_next_recv() {
        let dispatcher = EventDispatcher::new();
        let ch = channel(1);
        let alice = ch.participants.a;

        let s1 = dispatcher.publish(&ch.participants.both(), EventKind::Created, &ch);
        dispatcher.publish(&ch.participants.both(), EventKind::Confirmed, &ch);

        let mut sub = dispatcher.subscribe(alice, EventFilter::all(), ReplayFrom::Beginning);
        next(&mut sub).await;
        assert_eq!(dispatcher.last_acknowledged(&alice, &ch.id), None);

        next(&mut sub).await;
        assert_eq!(dispatcher.last_acknowledged(&alice, &ch.id), Some(s1));
    }

    #[tokio::test]
    async fn test_resume_redelivers_boundary_entry() {
        let dispatcher = EventDispatcher::new();
        let ch = channel(1);
        let alice = ch.participants.a;

        dispatcher.publish(&ch.participants.both(), EventKind::Created, &ch);
        dispatcher.publish(&ch.participants.both(), EventKind::Confirmed, &ch);
        dispatcher.publish(&ch.participants.both(), EventKind::StateUpdated, &ch);

        {
            let mut sub = dispatcher.resume(alice, ch.id);
            next(&mut sub).await;
            next(&mut sub).await;
            // Disconnect with `Confirmed` handed out but unacknowledged.
        }

        let mut resumed = dispatcher.resume(alice, ch.id);
        assert_eq!(next(&mut resumed).await.kind, EventKind::Created);
        assert_eq!(next(&mut resumed).await.kind, EventKind::Confirmed);
        assert_eq!(next(&mut resumed).await.kind, EventKind::StateUpdated);
    }

    #[tokio::test]
    async fn test_slow_consumer_catches_up_from_log() {
        let dispatcher = EventDispatcher::with_capacity(2);
        let ch = channel(1);
        let alice = ch.participants.a;

        let mut sub = dispatcher.subscribe(alice, EventFilter::all(), ReplayFrom::Beginning);
        let mut published = Vec::new();
        for _ in 0..6 {
            published.push(dispatcher.publish(&ch.participants.both(), EventKind::StateUpdated, &ch));
        }

        let mut received = Vec::new();
        for _ in 0..6 {
            received.push(next(&mut sub).await.seq);
        }
        assert_eq!(received, published);
        assert!(matches!(sub.try_recv(), Ok(None)));
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let dispatcher = EventDispatcher::new();
        let mut sub = dispatcher.subscribe(Address::new([1u8; 20]), EventFilter::all(), ReplayFrom::Beginning);

        dispatcher.close();

        let result = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timeout");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_event_stream() {
        let dispatcher = EventDispatcher::new();
        let ch = channel(1);

        dispatcher.publish(&ch.participants.both(), EventKind::Created, &ch);
        let mut stream = dispatcher.event_stream(ch.participants.b, EventFilter::all(), ReplayFrom::Beginning);

        let event = timeout(Duration::from_millis(100), stream.next())
            .await
            .expect("timeout")
            .expect("event");
        assert_eq!(event.recipient, ch.participants.b);
    }
}
