//! Ephemeral per-room presence.
//!
//! Every connection owns exactly one entry, keyed by its client id, and is
//! the only writer of that entry. Changes are pushed to subscribers over a
//! broadcast channel. Entries that are not renewed within the timeout are
//! dropped by a scheduled sweep; `snapshot` also filters them so a stalled
//! sweeper never leaves stale cursors visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use utoipa::ToSchema;

/// Ephemeral id of one connection. Kept within 53 bits so it survives
/// JSON number handling in browsers.
pub type ClientId = u64;

const MAX_NAME_CHARS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CursorRange {
    pub anchor: usize,
    pub head: usize,
}

/// Presence announced by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AwarenessState {
    pub name: String,
    /// `#RRGGBB`. Derived from the name when left empty.
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub cursor: Option<CursorRange>,
}

impl AwarenessState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: String::new(),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, anchor: usize, head: usize) -> Self {
        self.cursor = Some(CursorRange { anchor, head });
        self
    }

    /// Check the state and fill in a default color.
    pub fn validate(mut self) -> Result<Self, AwarenessError> {
        let name = self.name.trim();
        let name_len = name.chars().count();
        if name_len == 0 || name_len > MAX_NAME_CHARS || name.chars().any(char::is_control) {
            return Err(AwarenessError::InvalidName(self.name));
        }
        self.name = name.to_string();

        if self.color.is_empty() {
            self.color = color_for_name(&self.name);
        } else if !is_hex_color(&self.color) {
            return Err(AwarenessError::InvalidColor(self.color));
        }
        Ok(self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AwarenessError {
    #[error("invalid display name {0:?}")]
    InvalidName(String),
    #[error("invalid color {0:?}, expected #RRGGBB")]
    InvalidColor(String),
}

/// Stable color for a display name, so a user keeps the same cursor color
/// across reconnects.
pub fn color_for_name(name: &str) -> String {
    let hash = name
        .encode_utf16()
        .fold(0i32, |hash, unit| (unit as i32).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash)));
    format!("#{:06X}", hash & 0x00FF_FFFF)
}

fn is_hex_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub file_name: String,
    pub state: AwarenessState,
    /// Bumped on every change by the owning client.
    pub clock: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Left,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessEvent {
    Updated(AwarenessEntry),
    Removed {
        client_id: ClientId,
        reason: RemovalReason,
    },
}

impl AwarenessEvent {
    pub fn client_id(&self) -> ClientId {
        match self {
            AwarenessEvent::Updated(entry) => entry.client_id,
            AwarenessEvent::Removed { client_id, .. } => *client_id,
        }
    }
}

struct Slot {
    entry: AwarenessEntry,
    last_seen: Instant,
}

pub struct AwarenessTable {
    room_id: String,
    timeout: Duration,
    entries: Mutex<HashMap<ClientId, Slot>>,
    events: broadcast::Sender<AwarenessEvent>,
}

impl AwarenessTable {
    pub fn new(room_id: impl Into<String>, timeout: Duration, capacity: usize) -> Self {
        let (events, _rx) = broadcast::channel(capacity.max(1));
        Self {
            room_id: room_id.into(),
            timeout,
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ClientId, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the entry owned by `client_id` and notify subscribers.
    ///
    /// Events are sent while the entries lock is held, so subscribers see
    /// them in the order the table changed.
    pub fn set_local(
        &self,
        client_id: ClientId,
        file_name: &str,
        state: AwarenessState,
    ) -> Result<AwarenessEntry, AwarenessError> {
        let state = state.validate()?;
        let mut entries = self.entries();
        let clock = entries.get(&client_id).map_or(0, |slot| slot.entry.clock + 1);
        let entry = AwarenessEntry {
            client_id,
            file_name: file_name.to_string(),
            state,
            clock,
            updated_at: Utc::now(),
        };
        entries.insert(
            client_id,
            Slot {
                entry: entry.clone(),
                last_seen: Instant::now(),
            },
        );
        // No subscribers is fine.
        let _ = self.events.send(AwarenessEvent::Updated(entry.clone()));
        Ok(entry)
    }

    /// Explicit removal. Returns whether an entry existed.
    pub fn remove(&self, client_id: ClientId) -> bool {
        let mut entries = self.entries();
        let existed = entries.remove(&client_id).is_some();
        if existed {
            debug!("Awareness entry {} left room {}", client_id, self.room_id);
            let _ = self.events.send(AwarenessEvent::Removed {
                client_id,
                reason: RemovalReason::Left,
            });
        }
        existed
    }

    /// Renew the liveness of an entry without changing it.
    pub fn touch(&self, client_id: ClientId) {
        if let Some(slot) = self.entries().get_mut(&client_id) {
            slot.last_seen = Instant::now();
        }
    }

    /// Current live entries. Entries past the timeout are never returned,
    /// even when the sweeper has not removed them yet.
    pub fn snapshot(&self) -> BTreeMap<ClientId, AwarenessEntry> {
        let now = Instant::now();
        self.entries()
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.last_seen) < self.timeout)
            .map(|(id, slot)| (*id, slot.entry.clone()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drop every entry not renewed within the timeout and notify
    /// subscribers. Returns the expired ids.
    pub fn expire_stale(&self) -> Vec<ClientId> {
        let now = Instant::now();
        let mut entries = self.entries();
        let expired: Vec<ClientId> = entries
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.last_seen) >= self.timeout)
            .map(|(id, _)| *id)
            .collect();

        for client_id in &expired {
            entries.remove(client_id);
            info!("Awareness entry {} in room {} expired", client_id, self.room_id);
            let _ = self.events.send(AwarenessEvent::Removed {
                client_id: *client_id,
                reason: RemovalReason::Expired,
            });
        }
        expired
    }

    /// Run `expire_stale` every `every` (at least 1 ms) until the table is
    /// dropped.
    pub fn spawn_expiry(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let table = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match table.upgrade() {
                    Some(table) => {
                        table.expire_stale();
                    }
                    None => break,
                }
            }
        })
    }
}
