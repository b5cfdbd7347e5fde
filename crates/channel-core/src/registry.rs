//! # Channel Registry
//!
//! Authoritative in-memory store of every channel known to the node.
//!
//! ## Locking
//!
//! ```text
//! registry map  (RwLock, short-held, never across an await)
//!   └── ChannelSlot per channel
//!         ├── op:        tokio Mutex - single writer per channel, held only
//!         │                            while validating and committing
//!         ├── in_flight: Mutex       - name of the chain call under way
//!         └── channel:   RwLock      - snapshot reads and the atomic commit
//! ```
//!
//! Writers take `op` first, read a snapshot, validate and commit the new
//! value in one write. A writer that needs the chain marks the slot with
//! [`ChannelGuard::begin_chain_call`] and gives up `op` for the duration of
//! the call; until it takes the lock back with [`ChainCall::relock`] every
//! other writer is turned away with `ChainCallInFlight` instead of queueing
//! behind the retries. Readers never wait for either. When a VPC and its
//! parent are both locked the child is locked first.

use crate::error::{ChannelError, ChannelResult};
use parking_lot::{Mutex as SyncMutex, RwLock};
use shared_types::{Channel, ChannelId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// One registry entry.
pub struct ChannelSlot {
    op: Arc<Mutex<()>>,
    in_flight: SyncMutex<Option<&'static str>>,
    channel: RwLock<Channel>,
}

impl ChannelSlot {
    fn new(channel: Channel) -> Self {
        Self {
            op: Arc::new(Mutex::new(())),
            in_flight: SyncMutex::new(None),
            channel: RwLock::new(channel),
        }
    }

    /// Current value.
    pub fn snapshot(&self) -> Channel {
        self.channel.read().clone()
    }

    /// Chain call currently under way, if any.
    pub fn chain_call(&self) -> Option<&'static str> {
        *self.in_flight.lock()
    }
}

/// Exclusive write access to one channel.
///
/// Dropping the guard releases the channel for the next writer.
pub struct ChannelGuard {
    slot: Arc<ChannelSlot>,
    _op: OwnedMutexGuard<()>,
}

impl ChannelGuard {
    /// Current value.
    pub fn snapshot(&self) -> Channel {
        self.slot.snapshot()
    }

    /// Replace the stored value in one atomic write.
    pub fn commit(&self, channel: Channel) {
        *self.slot.channel.write() = channel;
    }

    /// Mark the channel busy with `operation` and release the lock.
    ///
    /// Nothing can be committed until [`ChainCall::relock`]; other writers
    /// fail fast while the mark is set.
    pub fn begin_chain_call(self, operation: &'static str) -> ChainCall {
        *self.slot.in_flight.lock() = Some(operation);
        ChainCall {
            slot: self.slot,
            operation,
        }
    }
}

/// A chain call running without the channel lock.
///
/// Dropping it without [`relock`](Self::relock) clears the mark.
pub struct ChainCall {
    slot: Arc<ChannelSlot>,
    operation: &'static str,
}

impl ChainCall {
    /// Operation name the channel is marked with.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Take the channel lock back and clear the mark.
    ///
    /// Only this call can acquire the lock while the mark is set, so the
    /// channel is still present and unchanged since `begin_chain_call`.
    pub async fn relock(self) -> ChannelGuard {
        let op = self.slot.op.clone().lock_owned().await;
        *self.slot.in_flight.lock() = None;
        ChannelGuard {
            slot: self.slot.clone(),
            _op: op,
        }
    }
}

impl Drop for ChainCall {
    fn drop(&mut self) {
        let mut in_flight = self.slot.in_flight.lock();
        if *in_flight == Some(self.operation) {
            *in_flight = None;
        }
    }
}

/// Channel registry.
#[derive(Default)]
pub struct ChannelRegistry {
    slots: RwLock<HashMap<ChannelId, Arc<ChannelSlot>>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a channel.
    pub fn get(&self, id: &ChannelId) -> ChannelResult<Channel> {
        self.slot(id).map(|slot| slot.snapshot())
    }

    /// Whether the id is present.
    pub fn contains(&self, id: &ChannelId) -> bool {
        self.slots.read().contains_key(id)
    }

    /// Insert a new channel; the id must be unused.
    pub fn insert(&self, channel: Channel) -> ChannelResult<()> {
        let id = channel.id;
        let mut slots = self.slots.write();
        if slots.contains_key(&id) {
            return Err(ChannelError::AlreadyExists { channel_id: id });
        }
        slots.insert(id, Arc::new(ChannelSlot::new(channel)));
        debug!(channel_id = %id, "Channel inserted");
        Ok(())
    }

    /// Store a channel, replacing any existing value under its id.
    pub fn put(&self, channel: Channel) {
        let id = channel.id;
        let existing = self.slots.read().get(&id).cloned();
        match existing {
            Some(slot) => *slot.channel.write() = channel,
            None => {
                self.slots
                    .write()
                    .entry(id)
                    .or_insert_with(|| Arc::new(ChannelSlot::new(channel.clone())));
            }
        }
    }

    /// Remove a channel. Returns its last value.
    pub fn delete(&self, id: &ChannelId) -> Option<Channel> {
        let removed = self.slots.write().remove(id);
        if removed.is_some() {
            debug!(channel_id = %id, "Channel removed");
        }
        removed.map(|slot| slot.snapshot())
    }

    /// Snapshot of every channel.
    pub fn list_all(&self) -> Vec<Channel> {
        let slots: Vec<Arc<ChannelSlot>> = self.slots.read().values().cloned().collect();
        slots.iter().map(|slot| slot.snapshot()).collect()
    }

    /// Snapshots of every channel nested under `parent`.
    pub fn children_of(&self, parent: &ChannelId) -> Vec<Channel> {
        self.list_all()
            .into_iter()
            .filter(|c| c.parent.as_ref() == Some(parent))
            .collect()
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Take exclusive write access to a channel.
    ///
    /// Fails with `NotFound` if the channel is unknown or was removed while
    /// waiting for the lock, and with `ChainCallInFlight` while another
    /// writer is waiting on the chain.
    pub async fn lock(&self, id: &ChannelId) -> ChannelResult<ChannelGuard> {
        let slot = self.slot(id)?;
        let op = slot.op.clone().lock_owned().await;

        let still_present = self
            .slots
            .read()
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !still_present {
            return Err(ChannelError::NotFound { channel_id: *id });
        }
        if let Some(operation) = slot.chain_call() {
            return Err(ChannelError::ChainCallInFlight {
                channel_id: *id,
                operation,
            });
        }

        Ok(ChannelGuard { slot, _op: op })
    }

    fn slot(&self, id: &ChannelId) -> ChannelResult<Arc<ChannelSlot>> {
        self.slots
            .read()
            .get(id)
            .cloned()
            .ok_or(ChannelError::NotFound { channel_id: *id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{Address, MsContractStatus, ChannelStatus, Participants};
    use std::time::Duration;

    fn channel(byte: u8) -> Channel {
        let participants = Participants::new(Address::new([1u8; 20]), Address::new([2u8; 20]));
        Channel::new_ms_contract(ChannelId::new([byte; 32]), participants, 0, 10)
    }

    #[test]
    fn test_insert_get_delete() {
        let registry = ChannelRegistry::new();
        let ch = channel(1);

        registry.insert(ch.clone()).unwrap();
        assert_eq!(registry.get(&ch.id).unwrap(), ch);
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.delete(&ch.id), Some(ch.clone()));
        assert_eq!(
            registry.get(&ch.id),
            Err(ChannelError::NotFound { channel_id: ch.id })
        );
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let registry = ChannelRegistry::new();
        registry.insert(channel(1)).unwrap();

        assert!(matches!(
            registry.insert(channel(1)),
            Err(ChannelError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_put_replaces() {
        let registry = ChannelRegistry::new();
        let mut ch = channel(1);
        registry.put(ch.clone());

        ch.status = ChannelStatus::MsContract(MsContractStatus::Open);
        registry.put(ch.clone());
        assert_eq!(registry.get(&ch.id).unwrap().status, ch.status);
        assert_eq!(registry.list_all().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_visible_to_readers() {
        let registry = ChannelRegistry::new();
        let ch = channel(1);
        registry.insert(ch.clone()).unwrap();

        let guard = registry.lock(&ch.id).await.unwrap();
        let mut updated = guard.snapshot();
        updated.status = ChannelStatus::MsContract(MsContractStatus::Open);

        // Readers see the old value until commit
        assert_eq!(registry.get(&ch.id).unwrap().status, ch.status);
        guard.commit(updated.clone());
        assert_eq!(registry.get(&ch.id).unwrap(), updated);
    }

    #[tokio::test]
    async fn test_lock_serializes_writers() {
        let registry = Arc::new(ChannelRegistry::new());
        let ch = channel(1);
        registry.insert(ch.clone()).unwrap();

        let guard = registry.lock(&ch.id).await.unwrap();
        let second = {
            let registry = registry.clone();
            let id = ch.id;
            tokio::spawn(async move { registry.lock(&id).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(guard);
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_other_channels_not_blocked() {
        let registry = ChannelRegistry::new();
        registry.insert(channel(1)).unwrap();
        registry.insert(channel(2)).unwrap();

        let _g1 = registry.lock(&ChannelId::new([1u8; 32])).await.unwrap();
        let g2 = tokio::time::timeout(
            Duration::from_millis(50),
            registry.lock(&ChannelId::new([2u8; 32])),
        )
        .await;
        assert!(g2.is_ok());
    }

    #[tokio::test]
    async fn test_lock_after_delete_is_not_found() {
        let registry = Arc::new(ChannelRegistry::new());
        let ch = channel(1);
        registry.insert(ch.clone()).unwrap();

        let guard = registry.lock(&ch.id).await.unwrap();
        let waiter = {
            let registry = registry.clone();
            let id = ch.id;
            tokio::spawn(async move { registry.lock(&id).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        registry.delete(&ch.id);
        drop(guard);

        assert!(matches!(
            waiter.await.unwrap(),
            Err(ChannelError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_chain_call_turns_writers_away() {
        let registry = ChannelRegistry::new();
        let ch = channel(1);
        registry.insert(ch.clone()).unwrap();

        let call = registry.lock(&ch.id).await.unwrap().begin_chain_call("refund");
        assert_eq!(call.operation(), "refund");

        let busy = tokio::time::timeout(Duration::from_millis(50), registry.lock(&ch.id))
            .await
            .unwrap();
        assert!(matches!(
            busy,
            Err(ChannelError::ChainCallInFlight {
                operation: "refund",
                ..
            })
        ));
        assert_eq!(registry.get(&ch.id).unwrap(), ch);

        let guard = call.relock().await;
        let mut updated = guard.snapshot();
        updated.status = ChannelStatus::MsContract(MsContractStatus::Refunded);
        guard.commit(updated);
        drop(guard);

        assert!(registry.lock(&ch.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_chain_call_clears_mark() {
        let registry = ChannelRegistry::new();
        let ch = channel(1);
        registry.insert(ch.clone()).unwrap();

        let call = registry.lock(&ch.id).await.unwrap().begin_chain_call("close_channel");
        drop(call);

        assert!(registry.lock(&ch.id).await.is_ok());
    }
}
