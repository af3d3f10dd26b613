use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::awareness::{AwarenessError, AwarenessEvent, ClientId};
use crate::crdt::{Delta, DocError, StateVector};
use crate::models::{ClientMessage, ErrorCode, ServerMessage};
use crate::registry::{DocUpdate, DocumentHandle};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Doc(#[from] DocError),
    #[error(transparent)]
    Awareness(#[from] AwarenessError),
    #[error("document is not synced yet")]
    NotSynced,
    #[error("server reported {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Doc(DocError::Malformed(_)) => ErrorCode::MalformedFrame,
            SessionError::Doc(_) => ErrorCode::RejectedDelta,
            SessionError::Awareness(_) => ErrorCode::InvalidAwareness,
            SessionError::NotSynced => ErrorCode::Unsupported,
            SessionError::Remote { code, .. } => *code,
        }
    }
}

/// One client's live connection to one document, as seen by the server.
pub struct SyncSession {
    client_id: ClientId,
    handle: DocumentHandle,
    // Operations the client is known to hold.
    last_ack: StateVector,
    // The client's sync-step1 has been answered.
    peer_synced: bool,
    // The client has sent its sync-step2.
    synced: bool,
}

impl SyncSession {
    pub fn new(handle: DocumentHandle, client_id: ClientId) -> Self {
        Self {
            client_id,
            handle,
            last_ack: StateVector::new(),
            peer_synced: false,
            synced: false,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn handle(&self) -> &DocumentHandle {
        &self.handle
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Receivers for document updates and room presence. Taken before the
    /// greeting so nothing published in between is missed.
    pub fn subscribe(&self) -> (broadcast::Receiver<DocUpdate>, broadcast::Receiver<AwarenessEvent>) {
        (self.handle.document().subscribe(), self.handle.awareness().subscribe())
    }

    /// Frames sent right after attach.
    pub async fn greeting(&self) -> Result<Vec<ServerMessage>, SessionError> {
        let key = self.handle.key();
        let state_vector = self.handle.document().state_vector().await.encode()?;
        Ok(vec![
            ServerMessage::Hello {
                client_id: self.client_id,
                room_id: key.room_id.clone(),
                file_name: key.file_name.clone(),
                epoch: self.handle.document().epoch(),
            },
            ServerMessage::SyncStep1 { state_vector },
            self.awareness_snapshot(),
        ])
    }

    pub fn awareness_snapshot(&self) -> ServerMessage {
        ServerMessage::AwarenessSnapshot {
            entries: self.handle.awareness().snapshot().into_values().collect(),
        }
    }

    /// Renew this client's presence.
    pub fn touch(&self) {
        self.handle.awareness().touch(self.client_id);
    }

    /// Handle one inbound frame. Failures are answered with an error frame
    /// to this client only; the connection stays usable.
    pub async fn handle_message(&mut self, message: ClientMessage) -> Vec<ServerMessage> {
        match self.dispatch(message).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!("Session {} on {}: {}", self.client_id, self.handle.key(), e);
                vec![ServerMessage::Error {
                    code: e.code(),
                    message: e.to_string(),
                }]
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<Vec<ServerMessage>, SessionError> {
        match message {
            ClientMessage::SyncStep1 { state_vector } => {
                let remote = StateVector::decode(&state_vector)?;
                let delta = self.handle.document().delta_since(&remote).await;
                self.last_ack = remote;
                self.last_ack.merge(&delta.state_vector());
                self.peer_synced = true;
                debug!("Session {} catching up with {} ops", self.client_id, delta.len());
                Ok(vec![ServerMessage::SyncStep2 {
                    delta: delta.encode()?,
                }])
            }
            ClientMessage::SyncStep2 { delta } => {
                self.apply(&delta).await?;
                if !self.synced {
                    self.synced = true;
                    info!("Session {} synced on {}", self.client_id, self.handle.key());
                }
                Ok(Vec::new())
            }
            ClientMessage::Update { delta } => {
                self.apply(&delta).await?;
                Ok(Vec::new())
            }
            ClientMessage::AwarenessUpdate { state: Some(state) } => {
                self.handle
                    .awareness()
                    .set_local(self.client_id, &self.handle.key().file_name, state)?;
                Ok(Vec::new())
            }
            ClientMessage::AwarenessUpdate { state: None } => {
                self.handle.awareness().remove(self.client_id);
                Ok(Vec::new())
            }
            // Teardown is up to the connection worker.
            ClientMessage::Leave => Ok(Vec::new()),
        }
    }

    async fn apply(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let delta = Delta::decode(bytes)?;
        let fresh = self.handle.document().apply_remote(self.client_id, &delta).await?;
        self.last_ack.merge(&delta.state_vector());
        debug!(
            "Session {} sent {} ops, {} new",
            self.client_id,
            delta.len(),
            fresh.len()
        );
        Ok(())
    }

    /// Forward an update published by the document, minus anything the
    /// client already holds.
    pub fn on_doc_update(&mut self, update: &DocUpdate) -> Option<ServerMessage> {
        // Until the catch-up delta goes out, it covers everything published.
        if !self.peer_synced || update.origin == Some(self.client_id) {
            return None;
        }
        let ops: Vec<_> = update
            .delta
            .ops
            .iter()
            .filter(|op| !self.last_ack.contains(op.id()))
            .cloned()
            .collect();
        if ops.is_empty() {
            return None;
        }
        let delta = Delta { ops };
        match delta.encode() {
            Ok(bytes) => {
                self.last_ack.merge(&delta.state_vector());
                Some(ServerMessage::Update { delta: bytes })
            }
            Err(e) => {
                error!("Failed to encode update for session {}: {}", self.client_id, e);
                None
            }
        }
    }

    /// Catch-up after this session fell behind the update channel.
    pub async fn resync(&mut self) -> Result<Option<ServerMessage>, SessionError> {
        if !self.peer_synced {
            return Ok(None);
        }
        let delta = self.handle.document().delta_since(&self.last_ack).await;
        if delta.is_empty() {
            return Ok(None);
        }
        self.last_ack.merge(&delta.state_vector());
        Ok(Some(ServerMessage::SyncStep2 {
            delta: delta.encode()?,
        }))
    }

    pub fn on_awareness_event(&self, event: &AwarenessEvent) -> Option<ServerMessage> {
        if event.client_id() == self.client_id {
            return None;
        }
        Some(match event {
            AwarenessEvent::Updated(entry) => ServerMessage::AwarenessUpdate {
                updated: vec![entry.clone()],
                removed: Vec::new(),
            },
            AwarenessEvent::Removed { client_id, .. } => ServerMessage::AwarenessUpdate {
                updated: Vec::new(),
                removed: vec![*client_id],
            },
        })
    }

    /// Tear down. An explicit leave clears presence at once; otherwise the
    /// entry is left to expire.
    pub fn detach(self, explicit: bool) {
        if explicit {
            self.handle.awareness().remove(self.client_id);
        }
        info!(
            "Session {} detached from {} ({})",
            self.client_id,
            self.handle.key(),
            if explicit { "left" } else { "dropped" }
        );
    }
}

async fn send_all(
    sink: &mut SplitSink<WebSocket, Message>,
    messages: Vec<ServerMessage>,
) -> Result<(), axum::Error> {
    for message in messages {
        let text = serde_json::to_string(&message).map_err(axum::Error::new)?;
        sink.send(Message::Text(text)).await?;
    }
    Ok(())
}

/// Drive one session over its socket until either side goes away.
pub async fn run(socket: WebSocket, mut session: SyncSession, ping_every: Duration) {
    let (mut sink, mut stream) = socket.split();
    let (mut doc_rx, mut awareness_rx) = session.subscribe();

    let greeting = match session.greeting().await {
        Ok(greeting) => greeting,
        Err(e) => {
            error!("Failed to build greeting for {}: {}", session.handle().key(), e);
            session.detach(false);
            return;
        }
    };
    if send_all(&mut sink, greeting).await.is_err() {
        session.detach(false);
        return;
    }

    let mut ping = tokio::time::interval(ping_every);
    ping.tick().await;

    let explicit = loop {
        let outgoing: Vec<ServerMessage> = tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    session.touch();
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Leave) => break true,
                        Ok(message) => session.handle_message(message).await,
                        Err(e) => vec![ServerMessage::Error {
                            code: ErrorCode::MalformedFrame,
                            message: e.to_string(),
                        }],
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    session.touch();
                    vec![ServerMessage::Error {
                        code: ErrorCode::Unsupported,
                        message: "binary frames are not supported".to_string(),
                    }]
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    session.touch();
                    Vec::new()
                }
                Some(Ok(Message::Close(_))) => break true,
                Some(Err(e)) => {
                    warn!("Session {} read error: {}", session.client_id(), e);
                    break false;
                }
                None => break false,
            },
            update = doc_rx.recv() => match update {
                Ok(update) => session.on_doc_update(&update).into_iter().collect(),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Session {} lagged {} document updates, resyncing", session.client_id(), skipped);
                    match session.resync().await {
                        Ok(message) => message.into_iter().collect(),
                        Err(e) => {
                            error!("Resync of session {} failed: {}", session.client_id(), e);
                            break false;
                        }
                    }
                }
                Err(RecvError::Closed) => break false,
            },
            event = awareness_rx.recv() => match event {
                Ok(event) => session.on_awareness_event(&event).into_iter().collect(),
                Err(RecvError::Lagged(_)) => vec![session.awareness_snapshot()],
                Err(RecvError::Closed) => break false,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break false;
                }
                Vec::new()
            }
        };

        if send_all(&mut sink, outgoing).await.is_err() {
            break false;
        }
    };

    session.detach(explicit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::AwarenessState;
    use crate::crdt::TextDocument;
    use crate::persistence::{MemoryFileStore, PersistenceBridge};
    use crate::registry::{DocKey, DocumentRegistry, RegistryConfig};
    use crate::ws::ClientSession;
    use std::sync::Arc;

    async fn registry_with(content: &str) -> Arc<DocumentRegistry> {
        registry_using(content, RegistryConfig::default()).await
    }

    async fn registry_using(content: &str, config: RegistryConfig) -> Arc<DocumentRegistry> {
        let store = Arc::new(MemoryFileStore::new());
        store.insert_file("room", "main.py", content).await;
        DocumentRegistry::new(PersistenceBridge::new(store), config)
    }

    async fn attach(registry: &Arc<DocumentRegistry>, client_id: ClientId) -> SyncSession {
        let handle = registry.acquire(DocKey::parse("room:main.py").unwrap()).await.unwrap();
        SyncSession::new(handle, client_id)
    }

    /// Exchange frames the way a socket would: the client's attach frame is
    /// already in flight when the greeting goes out.
    async fn handshake(session: &mut SyncSession, client: &mut ClientSession) {
        let mut to_server = vec![client.attach().unwrap()];
        let mut to_client = session.greeting().await.unwrap();
        while !to_server.is_empty() || !to_client.is_empty() {
            for message in to_client.drain(..) {
                to_server.extend(client.handle(message).unwrap());
            }
            for message in std::mem::take(&mut to_server) {
                to_client.extend(session.handle_message(message).await);
            }
        }
    }

    fn delta_of(message: &ServerMessage) -> Delta {
        match message {
            ServerMessage::SyncStep2 { delta } | ServerMessage::Update { delta } => Delta::decode(delta).unwrap(),
            other => panic!("expected a delta frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_converges_a_late_joiner() {
        let registry = registry_with("a = 1").await;
        let mut session = attach(&registry, 1).await;

        let greeting = session.greeting().await.unwrap();
        assert!(matches!(greeting[0], ServerMessage::Hello { client_id: 1, .. }));
        assert!(matches!(greeting[1], ServerMessage::SyncStep1 { .. }));

        let mut client = TextDocument::new(500);
        let replies = session
            .handle_message(ClientMessage::SyncStep1 {
                state_vector: client.state_vector().encode().unwrap(),
            })
            .await;
        client.apply_remote_delta(&delta_of(&replies[0])).unwrap();
        assert_eq!(client.current_text(), "a = 1");

        let replies = session
            .handle_message(ClientMessage::SyncStep2 {
                delta: Delta::default().encode().unwrap(),
            })
            .await;
        assert!(replies.is_empty());
        assert!(session.is_synced());
    }

    #[tokio::test]
    async fn updates_fan_out_without_echo() {
        let registry = registry_with("").await;
        let mut alice = attach(&registry, 1).await;
        let mut bob = attach(&registry, 2).await;
        let (mut alice_rx, _) = alice.subscribe();
        let (mut bob_rx, _) = bob.subscribe();

        for session in [&mut alice, &mut bob] {
            session
                .handle_message(ClientMessage::SyncStep1 {
                    state_vector: StateVector::new().encode().unwrap(),
                })
                .await;
        }

        let mut editor = TextDocument::new(77);
        let delta = editor.apply_local_insert(0, "hey").unwrap();
        alice
            .handle_message(ClientMessage::Update {
                delta: delta.encode().unwrap(),
            })
            .await;

        let update = alice_rx.recv().await.unwrap();
        assert!(alice.on_doc_update(&update).is_none());
        let update = bob_rx.recv().await.unwrap();
        let forwarded = bob.on_doc_update(&update).unwrap();
        assert_eq!(delta_of(&forwarded), delta);
        // Already forwarded, so a resync has nothing left to send.
        assert!(bob.resync().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lagging_session_catches_up_through_resync() {
        let config = RegistryConfig {
            update_capacity: 2,
            ..RegistryConfig::default()
        };
        let registry = registry_using("", config).await;
        let mut session = attach(&registry, 1).await;
        let (mut doc_rx, _) = session.subscribe();

        let mut client = TextDocument::new(600);
        let replies = session
            .handle_message(ClientMessage::SyncStep1 {
                state_vector: client.state_vector().encode().unwrap(),
            })
            .await;
        client.apply_remote_delta(&delta_of(&replies[0])).unwrap();

        let own = client.apply_local_insert(0, "> ").unwrap();
        session
            .handle_message(ClientMessage::Update {
                delta: own.encode().unwrap(),
            })
            .await;
        let document = session.handle().document().clone();
        for word in ["one ", "two ", "three ", "four "] {
            let end = document.text().await.chars().count();
            document.insert(end, word).await.unwrap();
        }

        match doc_rx.recv().await {
            Err(RecvError::Lagged(skipped)) => assert_eq!(skipped, 3),
            other => panic!("expected the receiver to lag, got {other:?}"),
        }
        let catch_up = session.resync().await.unwrap().expect("skipped ops");
        assert!(matches!(catch_up, ServerMessage::SyncStep2 { .. }));
        let delta = delta_of(&catch_up);
        // Everything the server wrote, nothing the client sent itself.
        assert_eq!(delta.len(), 19);
        assert!(delta.ops.iter().all(|op| op.id().replica != 600));
        client.apply_remote_delta(&delta).unwrap();
        assert_eq!(client.current_text(), document.text().await);
        assert_eq!(client.current_text(), "> one two three four ");

        // What is still buffered was covered by the resync.
        while let Ok(update) = doc_rx.try_recv() {
            assert!(session.on_doc_update(&update).is_none());
        }
        assert!(session.resync().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_delta_only_errors_the_sender() {
        let registry = registry_with("abc").await;
        let mut session = attach(&registry, 1).await;

        let replies = session
            .handle_message(ClientMessage::Update {
                delta: vec![0x01, 0x02, 0x03],
            })
            .await;
        assert!(matches!(
            replies[0],
            ServerMessage::Error {
                code: ErrorCode::MalformedFrame,
                ..
            }
        ));

        let mut peer = TextDocument::new(9);
        let _unsent = peer.apply_local_insert(0, "x").unwrap();
        let out_of_order = peer.apply_local_insert(1, "y").unwrap();
        let replies = session
            .handle_message(ClientMessage::Update {
                delta: out_of_order.encode().unwrap(),
            })
            .await;
        assert!(matches!(
            replies[0],
            ServerMessage::Error {
                code: ErrorCode::RejectedDelta,
                ..
            }
        ));
        assert_eq!(session.handle().document().text().await, "abc");
    }

    #[tokio::test]
    async fn presence_is_forwarded_to_others_only() {
        let registry = registry_with("").await;
        let mut alice = attach(&registry, 1).await;
        let bob = attach(&registry, 2).await;
        let (_, mut bob_events) = bob.subscribe();

        alice
            .handle_message(ClientMessage::AwarenessUpdate {
                state: Some(AwarenessState::new("alice").with_cursor(2, 2)),
            })
            .await;
        let event = bob_events.recv().await.unwrap();
        assert!(alice.on_awareness_event(&event).is_none());
        match bob.on_awareness_event(&event) {
            Some(ServerMessage::AwarenessUpdate { updated, removed }) => {
                assert_eq!(updated[0].client_id, 1);
                assert_eq!(updated[0].file_name, "main.py");
                assert!(removed.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        let replies = alice
            .handle_message(ClientMessage::AwarenessUpdate {
                state: Some(AwarenessState::new("")),
            })
            .await;
        assert!(matches!(
            replies[0],
            ServerMessage::Error {
                code: ErrorCode::InvalidAwareness,
                ..
            }
        ));

        alice.detach(true);
        let event = bob_events.recv().await.unwrap();
        assert!(matches!(
            bob.on_awareness_event(&event),
            Some(ServerMessage::AwarenessUpdate { ref removed, .. }) if removed == &vec![1]
        ));
    }

    #[tokio::test]
    async fn reconnect_after_eviction_does_not_duplicate_stored_text() {
        let config = RegistryConfig {
            grace_period: Duration::from_millis(30),
            ..RegistryConfig::default()
        };
        let registry = registry_using("print('hi')", config).await;
        let mut client = ClientSession::new(900);

        let mut session = attach(&registry, 1).await;
        let first_epoch = session.handle().document().epoch();
        handshake(&mut session, &mut client).await;
        assert_eq!(client.text(), "print('hi')");
        session.detach(false);

        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.run_maintenance();
        assert!(registry.live_document(&DocKey::parse("room:main.py").unwrap()).is_none());

        let mut session = attach(&registry, 2).await;
        assert_ne!(session.handle().document().epoch(), first_epoch);
        handshake(&mut session, &mut client).await;
        assert!(client.is_synced());
        assert_eq!(client.text(), "print('hi')");
        assert_eq!(session.handle().document().text().await, "print('hi')");

        let update = client.insert(11, "!").unwrap();
        assert!(session.handle_message(update).await.is_empty());
        assert_eq!(session.handle().document().text().await, "print('hi')!");
    }

    #[tokio::test]
    async fn dropped_session_leaves_presence_to_expiry() {
        let registry = registry_with("").await;
        let mut session = attach(&registry, 5).await;
        session
            .handle_message(ClientMessage::AwarenessUpdate {
                state: Some(AwarenessState::new("zed")),
            })
            .await;
        let awareness = session.handle().awareness().clone();
        session.detach(false);
        assert!(awareness.snapshot().contains_key(&5));
    }
}
