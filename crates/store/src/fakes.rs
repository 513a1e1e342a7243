//! In-memory fakes for the persistence ports (testing only).
//!
//! `MemoryStateStore` and `MemoryOperatorQueue` satisfy the trait contracts
//! (first writer wins, compare-and-set commits) without touching disk.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pipeline::{
    AssetAddress, AssetFingerprint, CommitOutcome, DestinationId, EscalationState, Item, ItemId,
    OperatorNotice, OperatorQueue, PublishRecord, StateStore, StoreError,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct State {
    items: HashMap<ItemId, Item>,
    escalation: EscalationState,
    publish: HashMap<(ItemId, DestinationId), PublishRecord>,
    addresses: HashMap<(DestinationId, AssetFingerprint), AssetAddress>,
    blobs: HashMap<AssetFingerprint, Vec<u8>>,
}

/// In-memory state store. One mutex makes every operation atomic.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<State>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs stored.
    pub fn blob_count(&self) -> usize {
        lock(&self.state).blobs.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put_item(&self, item: &Item) -> Result<(), StoreError> {
        lock(&self.state).items.insert(item.id(), item.clone());
        Ok(())
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        Ok(lock(&self.state).items.get(&id).cloned())
    }

    async fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        let mut items: Vec<Item> = lock(&self.state).items.values().cloned().collect();
        items.sort_by_key(|i| (i.created_at(), i.id()));
        Ok(items)
    }

    async fn load_escalation(&self) -> Result<EscalationState, StoreError> {
        Ok(lock(&self.state).escalation.clone())
    }

    async fn save_escalation(&self, state: &EscalationState) -> Result<(), StoreError> {
        lock(&self.state).escalation = state.clone();
        Ok(())
    }

    async fn get_publish_record(
        &self,
        item: ItemId,
        destination: &DestinationId,
    ) -> Result<Option<PublishRecord>, StoreError> {
        Ok(lock(&self.state)
            .publish
            .get(&(item, destination.clone()))
            .cloned())
    }

    async fn put_publish_intent(&self, intent: &PublishRecord) -> Result<PublishRecord, StoreError> {
        let mut state = lock(&self.state);
        Ok(state
            .publish
            .entry((intent.item, intent.destination.clone()))
            .or_insert_with(|| intent.clone())
            .clone())
    }

    async fn commit_publish_record(
        &self,
        record: &PublishRecord,
    ) -> Result<CommitOutcome, StoreError> {
        let mut state = lock(&self.state);
        let key = (record.item, record.destination.clone());
        if let Some(existing) = state.publish.get(&key) {
            if existing.is_committed() {
                return Ok(CommitOutcome::AlreadyCommitted(existing.clone()));
            }
        }
        state.publish.insert(key, record.clone());
        Ok(CommitOutcome::Committed(record.clone()))
    }

    async fn get_asset_address(
        &self,
        destination: &DestinationId,
        fingerprint: &AssetFingerprint,
    ) -> Result<Option<AssetAddress>, StoreError> {
        Ok(lock(&self.state)
            .addresses
            .get(&(destination.clone(), fingerprint.clone()))
            .cloned())
    }

    async fn put_asset_address(
        &self,
        destination: &DestinationId,
        fingerprint: &AssetFingerprint,
        address: &AssetAddress,
    ) -> Result<AssetAddress, StoreError> {
        let mut state = lock(&self.state);
        Ok(state
            .addresses
            .entry((destination.clone(), fingerprint.clone()))
            .or_insert_with(|| address.clone())
            .clone())
    }

    async fn put_blob(&self, bytes: &[u8]) -> Result<AssetFingerprint, StoreError> {
        let fingerprint = AssetFingerprint::compute(bytes);
        lock(&self.state)
            .blobs
            .entry(fingerprint.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(fingerprint)
    }

    async fn get_blob(&self, fingerprint: &AssetFingerprint) -> Result<Vec<u8>, StoreError> {
        lock(&self.state)
            .blobs
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound {
                fingerprint: fingerprint.as_str().to_owned(),
            })
    }
}

// ---------------------------------------------------------------------------
// MemoryOperatorQueue
// ---------------------------------------------------------------------------

/// In-memory operator queue that keeps every notice for inspection.
#[derive(Debug, Default)]
pub struct MemoryOperatorQueue {
    notices: Mutex<Vec<OperatorNotice>>,
}

impl MemoryOperatorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<OperatorNotice> {
        lock(&self.notices).clone()
    }
}

#[async_trait]
impl OperatorQueue for MemoryOperatorQueue {
    async fn submit(&self, notice: OperatorNotice) -> Result<(), StoreError> {
        lock(&self.notices).push(notice);
        Ok(())
    }
}
