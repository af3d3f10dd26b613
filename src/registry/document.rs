use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use super::DocKey;
use crate::awareness::ClientId;
use crate::crdt::{Delta, DocError, ReplicaId, StateVector, TextDocument};

/// Operations newly integrated into a live document, fanned out to every
/// attached session. `origin` is the session that sent them, `None` for
/// server-side edits.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub origin: Option<ClientId>,
    pub delta: Arc<Delta>,
}

/// One in-memory document shared by every session attached to its key.
///
/// The mutex is the single-writer boundary for the operation log. It is
/// never held across network I/O; updates are published while it is held
/// so subscribers observe them in integration order.
pub struct LiveDocument {
    key: DocKey,
    epoch: ReplicaId,
    doc: Mutex<TextDocument>,
    updates: broadcast::Sender<DocUpdate>,
    dirty: AtomicBool,
}

impl LiveDocument {
    pub fn new(key: DocKey, replica: ReplicaId, update_capacity: usize) -> Self {
        let (updates, _rx) = broadcast::channel(update_capacity.max(1));
        Self {
            key,
            epoch: replica,
            doc: Mutex::new(TextDocument::new(replica)),
            updates,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &DocKey {
        &self.key
    }

    /// The server replica id, fresh for every hydration of the key.
    pub fn epoch(&self) -> ReplicaId {
        self.epoch
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocUpdate> {
        self.updates.subscribe()
    }

    pub async fn text(&self) -> String {
        self.doc.lock().await.current_text()
    }

    pub async fn state_vector(&self) -> StateVector {
        self.doc.lock().await.state_vector()
    }

    pub async fn delta_since(&self, remote: &StateVector) -> Delta {
        self.doc.lock().await.delta_since(remote)
    }

    pub async fn op_count(&self) -> usize {
        self.doc.lock().await.op_count()
    }

    /// Seed an empty document with persisted content as one insert.
    ///
    /// Does nothing when the content is empty or the document already has
    /// text. Returns whether content was inserted.
    pub(crate) async fn hydrate(&self, content: &str) -> Result<bool, DocError> {
        if content.is_empty() {
            return Ok(false);
        }
        let mut doc = self.doc.lock().await;
        if !doc.is_empty() {
            warn!("Skipping hydration of {}: document is not empty", self.key);
            return Ok(false);
        }
        doc.apply_local_insert(0, content)?;
        info!("Hydrated {} with {} chars", self.key, doc.len());
        Ok(true)
    }

    /// Merge a delta received from a session and publish whatever was new.
    pub async fn apply_remote(&self, origin: ClientId, delta: &Delta) -> Result<Delta, DocError> {
        let mut doc = self.doc.lock().await;
        let fresh = doc.apply_remote_delta(delta)?;
        if !fresh.is_empty() {
            self.publish(Some(origin), fresh.clone());
        }
        Ok(fresh)
    }

    pub async fn insert(&self, position: usize, text: &str) -> Result<Delta, DocError> {
        let mut doc = self.doc.lock().await;
        let delta = doc.apply_local_insert(position, text)?;
        if !delta.is_empty() {
            self.publish(None, delta.clone());
        }
        Ok(delta)
    }

    pub async fn delete(&self, range: Range<usize>) -> Result<Delta, DocError> {
        let mut doc = self.doc.lock().await;
        let delta = doc.apply_local_delete(range)?;
        if !delta.is_empty() {
            self.publish(None, delta.clone());
        }
        Ok(delta)
    }

    fn publish(&self, origin: Option<ClientId>, delta: Delta) {
        self.dirty.store(true, Ordering::SeqCst);
        // Nobody listening is fine.
        let _ = self.updates.send(DocUpdate {
            origin,
            delta: Arc::new(delta),
        });
    }

    /// True when the content changed since the last successful save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live() -> LiveDocument {
        LiveDocument::new(DocKey::parse("r1:main.py").unwrap(), 99, 8)
    }

    #[tokio::test]
    async fn hydrate_only_fills_an_empty_document() {
        let doc = live();
        assert!(doc.hydrate("print('hi')").await.unwrap());
        assert!(!doc.hydrate("print('hi')").await.unwrap());
        assert!(!doc.hydrate("").await.unwrap());
        assert_eq!(doc.text().await, "print('hi')");
        // Hydration is not an edit.
        assert!(!doc.is_dirty());
    }

    #[tokio::test]
    async fn remote_deltas_are_published_in_order() {
        let doc = live();
        let mut rx = doc.subscribe();

        let mut peer = TextDocument::new(5);
        let first = peer.apply_local_insert(0, "ab").unwrap();
        let second = peer.apply_local_insert(2, "c").unwrap();

        doc.apply_remote(1, &first).await.unwrap();
        doc.apply_remote(1, &second).await.unwrap();
        // Re-delivery publishes nothing.
        assert!(doc.apply_remote(1, &first).await.unwrap().is_empty());

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.origin, Some(1));
        assert_eq!(*a.delta, first);
        assert_eq!(*b.delta, second);
        assert!(rx.try_recv().is_err());
        assert!(doc.is_dirty());
    }

    #[tokio::test]
    async fn rejected_delta_changes_nothing() {
        let doc = live();
        let mut peer = TextDocument::new(5);
        let _skipped = peer.apply_local_insert(0, "a").unwrap();
        let dependent = peer.apply_local_insert(1, "b").unwrap();

        assert!(doc.apply_remote(1, &dependent).await.is_err());
        assert_eq!(doc.text().await, "");
        assert_eq!(doc.op_count().await, 0);
        assert!(!doc.is_dirty());
    }
}
