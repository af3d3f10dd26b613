//! Live document registry.
//!
//! Holds exactly one `LiveDocument` per key, hydrated from storage by the
//! registry itself before any session receives it. Documents are reference
//! counted by their handles; the last release parks the document for a
//! grace period so quick reconnects skip storage, and expiry from the park
//! is the eviction.

mod document;
mod key;

pub use document::{DocUpdate, LiveDocument};
pub use key::{is_valid_file_name, is_valid_room_id, DocKey, KeyError};

use moka::notification::RemovalCause;
use moka::sync::Cache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::awareness::{AwarenessTable, ClientId};
use crate::crdt::{DocError, ReplicaId};
use crate::persistence::{PersistenceBridge, StorageError};
use crate::utils::scope_guard::ScopeGuard;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub grace_period: Duration,
    pub update_capacity: usize,
    pub awareness_timeout: Duration,
    pub awareness_sweep: Duration,
    pub awareness_capacity: usize,
    pub relay_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            update_capacity: 256,
            awareness_timeout: Duration::from_secs(30),
            awareness_sweep: Duration::from_secs(5),
            awareness_capacity: 64,
            relay_capacity: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0} is served by another synchronization mode")]
    AuthorityConflict(DocKey),
    #[error("failed to load {key}: {source}")]
    Hydration { key: DocKey, source: StorageError },
    #[error("failed to hydrate {key}: {source}")]
    Seed { key: DocKey, source: DocError },
}

#[derive(Default)]
struct DocSlot {
    cell: OnceCell<Arc<LiveDocument>>,
}

struct SlotEntry {
    slot: Arc<DocSlot>,
    refs: usize,
}

/// Plain text frame relayed between legacy connections.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub sender_id: ClientId,
    pub content: String,
}

struct RelaySlot {
    sender: broadcast::Sender<RelayFrame>,
    refs: usize,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<DocKey, SlotEntry>,
    rooms: HashMap<String, Arc<AwarenessTable>>,
    relays: HashMap<DocKey, RelaySlot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live_documents: usize,
    pub parked_documents: usize,
    pub sessions: usize,
    pub dirty_documents: usize,
    pub rooms: usize,
    pub awareness_entries: usize,
    pub relay_channels: usize,
    pub relay_connections: usize,
}

pub struct DocumentRegistry {
    bridge: PersistenceBridge,
    config: RegistryConfig,
    // Creation, refcounts and authority checks; never held across an await.
    inner: Mutex<Inner>,
    parked: Cache<DocKey, Arc<LiveDocument>>,
}

/// Fresh replica id for a server-side document instance.
pub fn new_replica_id() -> ReplicaId {
    Uuid::new_v4().as_u128() as u64
}

/// Fresh ephemeral client id, kept within 53 bits.
pub fn new_client_id() -> ClientId {
    (Uuid::new_v4().as_u128() as u64) & ((1u64 << 53) - 1)
}

impl DocumentRegistry {
    pub fn new(bridge: PersistenceBridge, config: RegistryConfig) -> Arc<Self> {
        let parked = Cache::builder()
            .time_to_live(config.grace_period)
            .eviction_listener(|key: Arc<DocKey>, doc: Arc<LiveDocument>, cause: RemovalCause| {
                if !cause.was_evicted() {
                    return;
                }
                if doc.is_dirty() {
                    warn!("Evicting {} with unsaved changes", key);
                } else {
                    info!("Evicted idle document {}", key);
                }
            })
            .build();

        Arc::new(Self {
            bridge,
            config,
            inner: Mutex::new(Inner::default()),
            parked,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live document for `key`, creating and hydrating it first
    /// when needed. Concurrent callers for the same key wait for the single
    /// initializer and share its document.
    pub async fn acquire(self: &Arc<Self>, key: DocKey) -> Result<DocumentHandle, RegistryError> {
        let slot = {
            let mut inner = self.inner();
            if inner.relays.contains_key(&key) {
                return Err(RegistryError::AuthorityConflict(key));
            }
            let entry = inner.docs.entry(key.clone()).or_insert_with(|| SlotEntry {
                slot: Arc::new(DocSlot::default()),
                refs: 0,
            });
            entry.refs += 1;
            entry.slot.clone()
        };

        // Give the reference back if opening fails or this future is dropped.
        let guard = ScopeGuard::new(|| self.release_key(&key));
        let document = slot.cell.get_or_try_init(|| self.open_document(&key)).await?.clone();
        guard.dismiss();

        let awareness = self.room_awareness(&key.room_id);
        debug!("Acquired {}", key);
        Ok(DocumentHandle {
            registry: self.clone(),
            key,
            document,
            awareness,
        })
    }

    /// Detach a handle. Equivalent to dropping it.
    pub fn release(&self, handle: DocumentHandle) {
        drop(handle);
    }

    async fn open_document(&self, key: &DocKey) -> Result<Arc<LiveDocument>, RegistryError> {
        if let Some(document) = self.parked.get(key) {
            self.parked.invalidate(key);
            info!("Reattached {} within its grace period", key);
            return Ok(document);
        }

        let document = LiveDocument::new(key.clone(), new_replica_id(), self.config.update_capacity);
        let content = self
            .bridge
            .load(&key.room_id, &key.file_name)
            .await
            .map_err(|source| RegistryError::Hydration {
                key: key.clone(),
                source,
            })?;
        document
            .hydrate(&content)
            .await
            .map_err(|source| RegistryError::Seed {
                key: key.clone(),
                source,
            })?;
        info!("Opened {}", key);
        Ok(Arc::new(document))
    }

    fn release_key(&self, key: &DocKey) {
        let mut inner = self.inner();
        let Some(entry) = inner.docs.get_mut(key) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        if let Some(entry) = inner.docs.remove(key) {
            if let Some(document) = entry.slot.cell.get() {
                debug!("Parking {} for {:?}", key, self.config.grace_period);
                self.parked.insert(key.clone(), document.clone());
            }
        }
        Self::prune_room(&mut inner, &key.room_id);
    }

    fn room_awareness(&self, room_id: &str) -> Arc<AwarenessTable> {
        let mut inner = self.inner();
        inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                let table = Arc::new(AwarenessTable::new(
                    room_id,
                    self.config.awareness_timeout,
                    self.config.awareness_capacity,
                ));
                table.spawn_expiry(self.config.awareness_sweep);
                table
            })
            .clone()
    }

    // A room's table goes away once no document of the room is attached
    // and no presence is left in it.
    fn prune_room(inner: &mut Inner, room_id: &str) {
        let attached = inner.docs.keys().any(|key| key.room_id == room_id);
        let empty = inner.rooms.get(room_id).map_or(false, |table| table.is_empty());
        if !attached && empty {
            inner.rooms.remove(room_id);
            debug!("Dropped awareness table of room {}", room_id);
        }
    }

    pub fn prune_rooms(&self) {
        let mut inner = self.inner();
        let rooms: Vec<String> = inner.rooms.keys().cloned().collect();
        for room_id in rooms {
            Self::prune_room(&mut inner, &room_id);
        }
    }

    /// The document for `key` if it is attached or parked.
    pub fn live_document(&self, key: &DocKey) -> Option<Arc<LiveDocument>> {
        let attached = self
            .inner()
            .docs
            .get(key)
            .and_then(|entry| entry.slot.cell.get().cloned());
        attached.or_else(|| self.parked.get(key))
    }

    /// Attached sessions for `key`.
    pub fn session_count(&self, key: &DocKey) -> usize {
        self.inner().docs.get(key).map_or(0, |entry| entry.refs)
    }

    /// Every attached or parked document.
    pub fn documents(&self) -> Vec<Arc<LiveDocument>> {
        let mut documents: Vec<Arc<LiveDocument>> = self
            .inner()
            .docs
            .values()
            .filter_map(|entry| entry.slot.cell.get().cloned())
            .collect();
        documents.extend(self.parked.iter().map(|(_, document)| document));
        documents
    }

    pub fn awareness(&self, room_id: &str) -> Option<Arc<AwarenessTable>> {
        self.inner().rooms.get(room_id).cloned()
    }

    /// Join the legacy relay channel for `key`. Fails while a replicated
    /// document owns the key.
    pub fn acquire_relay(self: &Arc<Self>, key: DocKey) -> Result<RelayHandle, RegistryError> {
        let mut inner = self.inner();
        if inner.docs.contains_key(&key) || self.parked.contains_key(&key) {
            return Err(RegistryError::AuthorityConflict(key));
        }
        let capacity = self.config.relay_capacity;
        let slot = inner.relays.entry(key.clone()).or_insert_with(|| RelaySlot {
            sender: broadcast::channel(capacity.max(1)).0,
            refs: 0,
        });
        slot.refs += 1;
        Ok(RelayHandle {
            registry: self.clone(),
            sender: slot.sender.clone(),
            key,
        })
    }

    fn release_relay(&self, key: &DocKey) {
        let mut inner = self.inner();
        if let Some(slot) = inner.relays.get_mut(key) {
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs == 0 {
                inner.relays.remove(key);
            }
        }
    }

    /// Flush pending cache maintenance so eviction happens on time, and drop
    /// empty rooms.
    pub fn run_maintenance(&self) {
        self.parked.run_pending_tasks();
        self.prune_rooms();
    }

    pub fn spawn_maintenance(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => registry.run_maintenance(),
                    None => break,
                }
            }
        })
    }

    pub fn stats(&self) -> RegistryStats {
        self.parked.run_pending_tasks();
        let inner = self.inner();
        let live: Vec<&Arc<LiveDocument>> = inner
            .docs
            .values()
            .filter_map(|entry| entry.slot.cell.get())
            .collect();
        let parked_dirty = self.parked.iter().filter(|(_, doc)| doc.is_dirty()).count();
        RegistryStats {
            live_documents: live.len(),
            parked_documents: self.parked.entry_count() as usize,
            sessions: inner.docs.values().map(|entry| entry.refs).sum(),
            dirty_documents: live.iter().filter(|doc| doc.is_dirty()).count() + parked_dirty,
            rooms: inner.rooms.len(),
            awareness_entries: inner.rooms.values().map(|table| table.snapshot().len()).sum(),
            relay_channels: inner.relays.len(),
            relay_connections: inner.relays.values().map(|slot| slot.refs).sum(),
        }
    }
}

/// One session's attachment to a live document and its room's presence.
/// Dropping it detaches.
pub struct DocumentHandle {
    registry: Arc<DocumentRegistry>,
    key: DocKey,
    document: Arc<LiveDocument>,
    awareness: Arc<AwarenessTable>,
}

impl DocumentHandle {
    pub fn key(&self) -> &DocKey {
        &self.key
    }

    pub fn document(&self) -> &Arc<LiveDocument> {
        &self.document
    }

    pub fn awareness(&self) -> &Arc<AwarenessTable> {
        &self.awareness
    }
}

impl Drop for DocumentHandle {
    fn drop(&mut self) {
        self.registry.release_key(&self.key);
        debug!("Released {}", self.key);
    }
}

pub struct RelayHandle {
    registry: Arc<DocumentRegistry>,
    key: DocKey,
    sender: broadcast::Sender<RelayFrame>,
}

impl RelayHandle {
    pub fn key(&self) -> &DocKey {
        &self.key
    }

    pub fn sender(&self) -> &broadcast::Sender<RelayFrame> {
        &self.sender
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.registry.release_relay(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{FileRecord, FileStore, MemoryFileStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Memory store that counts reads and answers slowly, to widen races.
    struct SlowStore {
        inner: MemoryFileStore,
        reads: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl FileStore for SlowStore {
        async fn get_file(&self, room_id: &str, file_name: &str) -> Result<Option<FileRecord>, StorageError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(StorageError::Unavailable("offline".into()));
            }
            self.inner.get_file(room_id, file_name).await
        }

        async fn put_file(&self, room_id: &str, file_name: &str, content: &str) -> Result<(), StorageError> {
            self.inner.put_file(room_id, file_name, content).await
        }
    }

    async fn setup(content: &str, grace: Duration, fail: bool) -> (Arc<DocumentRegistry>, Arc<SlowStore>) {
        let inner = MemoryFileStore::new();
        inner.insert_file("room1", "main.py", content).await;
        let store = Arc::new(SlowStore {
            inner,
            reads: AtomicUsize::new(0),
            fail,
        });
        let config = RegistryConfig {
            grace_period: grace,
            ..RegistryConfig::default()
        };
        let registry = DocumentRegistry::new(PersistenceBridge::new(store.clone()), config);
        (registry, store)
    }

    fn key() -> DocKey {
        DocKey::parse("room1:main.py").unwrap()
    }

    #[tokio::test]
    async fn simultaneous_first_acquires_hydrate_once() {
        let (registry, store) = setup("print('hi')", Duration::from_secs(10), false).await;

        let (a, b) = tokio::join!(registry.acquire(key()), registry.acquire(key()));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(a.document(), b.document()));
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(a.document().text().await, "print('hi')");
        assert_eq!(registry.session_count(&key()), 2);
    }

    #[tokio::test]
    async fn reacquire_within_grace_skips_storage() {
        let (registry, store) = setup("x", Duration::from_secs(10), false).await;
        let handle = registry.acquire(key()).await.unwrap();
        handle.document().insert(1, "y").await.unwrap();
        registry.release(handle);

        assert_eq!(registry.session_count(&key()), 0);
        let handle = registry.acquire(key()).await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        // Unsaved in-memory edits survive the reconnect.
        assert_eq!(handle.document().text().await, "xy");
    }

    #[tokio::test]
    async fn evicted_document_is_rehydrated() {
        let (registry, store) = setup("stored", Duration::from_millis(50), false).await;
        let handle = registry.acquire(key()).await.unwrap();
        let first_epoch = handle.document().epoch();
        handle.document().insert(0, "lost ").await.unwrap();
        drop(handle);

        tokio::time::sleep(Duration::from_millis(150)).await;
        registry.run_maintenance();
        assert!(registry.live_document(&key()).is_none());

        let handle = registry.acquire(key()).await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
        assert_eq!(handle.document().text().await, "stored");
        assert_ne!(handle.document().epoch(), first_epoch);
    }

    #[tokio::test]
    async fn failed_hydration_fails_acquire_and_leaves_nothing() {
        let (registry, _store) = setup("content", Duration::from_secs(10), true).await;
        let err = registry.acquire(key()).await.err().unwrap();
        assert!(matches!(err, RegistryError::Hydration { .. }));
        assert_eq!(registry.session_count(&key()), 0);
        assert!(registry.live_document(&key()).is_none());
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_its_reference() {
        let (registry, _store) = setup("content", Duration::from_secs(10), false).await;
        let attempt = tokio::time::timeout(Duration::from_millis(1), registry.acquire(key())).await;
        assert!(attempt.is_err());
        assert_eq!(registry.session_count(&key()), 0);
    }

    #[tokio::test]
    async fn relay_and_crdt_never_share_a_key() {
        let (registry, _store) = setup("", Duration::from_secs(10), false).await;

        let relay = registry.acquire_relay(key()).unwrap();
        assert!(matches!(
            registry.acquire(key()).await,
            Err(RegistryError::AuthorityConflict(_))
        ));
        drop(relay);

        let handle = registry.acquire(key()).await.unwrap();
        assert!(matches!(
            registry.acquire_relay(key()),
            Err(RegistryError::AuthorityConflict(_))
        ));
        drop(handle);
        // Still parked, so still owned by the document.
        assert!(registry.acquire_relay(key()).is_err());
    }

    #[tokio::test]
    async fn stats_and_room_lifecycle() {
        let (registry, _store) = setup("", Duration::from_secs(10), false).await;
        let handle = registry.acquire(key()).await.unwrap();
        handle
            .awareness()
            .set_local(1, "main.py", crate::awareness::AwarenessState::new("ivy"))
            .unwrap();
        handle.document().insert(0, "a").await.unwrap();

        let stats = registry.stats();
        assert_eq!(stats.live_documents, 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.dirty_documents, 1);
        assert_eq!(stats.rooms, 1);
        assert_eq!(stats.awareness_entries, 1);

        handle.awareness().remove(1);
        drop(handle);
        let stats = registry.stats();
        assert_eq!(stats.live_documents, 0);
        assert_eq!(stats.parked_documents, 1);
        assert_eq!(stats.rooms, 0);
        assert_eq!(registry.documents().len(), 1);
    }
}
