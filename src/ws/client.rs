use std::collections::BTreeMap;
use std::ops::Range;
use tracing::warn;

use super::session::SessionError;
use crate::awareness::{AwarenessEntry, AwarenessState, ClientId};
use crate::crdt::{Delta, ReplicaId, StateVector, TextDocument};
use crate::models::{ClientMessage, ServerMessage};
use crate::registry::new_replica_id;

/// Client side of the sync protocol.
///
/// Holds a full replica of one document plus the room's presence as last
/// reported by the server. Transport agnostic: feed it server frames and
/// send back whatever it returns. The same session may be attached again
/// after a reconnect.
pub struct ClientSession {
    doc: TextDocument,
    epoch: Option<u64>,
    client_id: Option<ClientId>,
    synced: bool,
    peers: BTreeMap<ClientId, AwarenessEntry>,
}

impl ClientSession {
    /// `replica` is replaced by a fresh id if the document's epoch changes
    /// between attaches.
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            doc: TextDocument::new(replica),
            epoch: None,
            client_id: None,
            synced: false,
            peers: BTreeMap::new(),
        }
    }

    /// First frame to send once the socket is open.
    pub fn attach(&self) -> Result<ClientMessage, SessionError> {
        Ok(ClientMessage::SyncStep1 {
            state_vector: self.doc.state_vector().encode()?,
        })
    }

    pub fn handle(&mut self, message: ServerMessage) -> Result<Vec<ClientMessage>, SessionError> {
        match message {
            ServerMessage::Hello { client_id, epoch, .. } => {
                let stale = self.epoch.is_some_and(|known| known != epoch);
                self.epoch = Some(epoch);
                self.client_id = Some(client_id);
                self.peers.remove(&client_id);
                if !stale {
                    return Ok(Vec::new());
                }
                // Our history belongs to an evicted incarnation. Start over
                // under a replica id the new one has never seen.
                warn!(
                    "Document epoch changed, dropping {} local ops",
                    self.doc.op_count()
                );
                self.doc = TextDocument::new(new_replica_id());
                self.synced = false;
                Ok(vec![self.attach()?])
            }
            ServerMessage::SyncStep1 { state_vector } => {
                let remote = StateVector::decode(&state_vector)?;
                let delta = self.doc.delta_since(&remote);
                Ok(vec![ClientMessage::SyncStep2 {
                    delta: delta.encode()?,
                }])
            }
            ServerMessage::SyncStep2 { delta } => {
                self.doc.apply_remote_delta(&Delta::decode(&delta)?)?;
                self.synced = true;
                Ok(Vec::new())
            }
            ServerMessage::Update { delta } => {
                self.doc.apply_remote_delta(&Delta::decode(&delta)?)?;
                Ok(Vec::new())
            }
            ServerMessage::AwarenessUpdate { updated, removed } => {
                for entry in updated {
                    self.track_peer(entry);
                }
                for client_id in removed {
                    self.peers.remove(&client_id);
                }
                Ok(Vec::new())
            }
            ServerMessage::AwarenessSnapshot { entries } => {
                self.peers.clear();
                for entry in entries {
                    self.track_peer(entry);
                }
                Ok(Vec::new())
            }
            ServerMessage::Error { code, message } => Err(SessionError::Remote { code, message }),
        }
    }

    fn track_peer(&mut self, entry: AwarenessEntry) {
        if Some(entry.client_id) != self.client_id {
            self.peers.insert(entry.client_id, entry);
        }
    }

    /// Local insert; refused until the initial catch-up has arrived.
    pub fn insert(&mut self, position: usize, text: &str) -> Result<ClientMessage, SessionError> {
        if !self.synced {
            return Err(SessionError::NotSynced);
        }
        let delta = self.doc.apply_local_insert(position, text)?;
        Ok(ClientMessage::Update {
            delta: delta.encode()?,
        })
    }

    pub fn delete(&mut self, range: Range<usize>) -> Result<ClientMessage, SessionError> {
        if !self.synced {
            return Err(SessionError::NotSynced);
        }
        let delta = self.doc.apply_local_delete(range)?;
        Ok(ClientMessage::Update {
            delta: delta.encode()?,
        })
    }

    pub fn set_presence(&self, state: AwarenessState) -> ClientMessage {
        ClientMessage::AwarenessUpdate { state: Some(state) }
    }

    pub fn clear_presence(&self) -> ClientMessage {
        ClientMessage::AwarenessUpdate { state: None }
    }

    pub fn leave(&self) -> ClientMessage {
        ClientMessage::Leave
    }

    pub fn text(&self) -> String {
        self.doc.current_text()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// Presence of everyone else in the room.
    pub fn peers(&self) -> &BTreeMap<ClientId, AwarenessEntry> {
        &self.peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorCode;
    use chrono::Utc;

    fn entry(client_id: ClientId, name: &str) -> AwarenessEntry {
        AwarenessEntry {
            client_id,
            file_name: "main.py".into(),
            state: AwarenessState::new(name).validate().unwrap(),
            clock: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn edits_wait_for_catch_up() {
        let mut server = TextDocument::new(1);
        server.apply_local_insert(0, "abc").unwrap();

        let mut client = ClientSession::new(2);
        assert!(matches!(client.insert(0, "x"), Err(SessionError::NotSynced)));

        let step1 = ServerMessage::SyncStep1 {
            state_vector: server.state_vector().encode().unwrap(),
        };
        let replies = client.handle(step1).unwrap();
        assert!(matches!(replies[0], ClientMessage::SyncStep2 { .. }));

        client
            .handle(ServerMessage::SyncStep2 {
                delta: server.delta_since(&StateVector::new()).encode().unwrap(),
            })
            .unwrap();
        assert!(client.is_synced());
        assert_eq!(client.text(), "abc");

        let update = client.insert(3, "d").unwrap();
        let ClientMessage::Update { delta } = update else {
            panic!("expected an update");
        };
        server.apply_remote_delta(&Delta::decode(&delta).unwrap()).unwrap();
        assert_eq!(server.current_text(), "abcd");
    }

    #[test]
    fn peers_exclude_self() {
        let mut client = ClientSession::new(2);
        client
            .handle(ServerMessage::Hello {
                client_id: 7,
                room_id: "r".into(),
                file_name: "main.py".into(),
                epoch: 1,
            })
            .unwrap();
        client
            .handle(ServerMessage::AwarenessSnapshot {
                entries: vec![entry(7, "me"), entry(8, "other")],
            })
            .unwrap();
        assert_eq!(client.peers().keys().copied().collect::<Vec<_>>(), vec![8]);

        client
            .handle(ServerMessage::AwarenessUpdate {
                updated: Vec::new(),
                removed: vec![8],
            })
            .unwrap();
        assert!(client.peers().is_empty());
        assert_eq!(client.clear_presence(), ClientMessage::AwarenessUpdate { state: None });
    }

    #[test]
    fn new_epoch_drops_stale_history() {
        let hello = |epoch| ServerMessage::Hello {
            client_id: 7,
            room_id: "r".into(),
            file_name: "main.py".into(),
            epoch,
        };
        let mut client = ClientSession::new(2);
        client.handle(hello(1)).unwrap();
        client
            .handle(ServerMessage::SyncStep2 {
                delta: Delta::default().encode().unwrap(),
            })
            .unwrap();
        client.insert(0, "old").unwrap();

        // Reconnecting to the same incarnation keeps everything.
        assert!(client.handle(hello(1)).unwrap().is_empty());
        assert_eq!(client.text(), "old");

        let replies = client.handle(hello(2)).unwrap();
        assert_eq!(
            replies,
            vec![ClientMessage::SyncStep1 {
                state_vector: StateVector::new().encode().unwrap(),
            }]
        );
        assert_eq!(client.text(), "");
        assert!(!client.is_synced());
        assert!(matches!(client.insert(0, "x"), Err(SessionError::NotSynced)));
    }

    #[test]
    fn server_errors_surface() {
        let mut client = ClientSession::new(2);
        let err = client
            .handle(ServerMessage::Error {
                code: ErrorCode::RejectedDelta,
                message: "gap".into(),
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RejectedDelta);
    }
}
