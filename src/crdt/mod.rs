//! Replicated text document.
//!
//! The document is a sequence of single-character items. Each item remembers
//! the item it was inserted after (its origin) and a Lamport timestamp.
//! Concurrent items sharing an origin are ordered by `(lamport, replica)`
//! descending, so every replica that integrates the same operations lays out
//! the same sequence. Deleted items stay in the sequence as tombstones.

mod codec;

pub use codec::{Delta, StateVector};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;

pub type ReplicaId = u64;

/// Identity of one operation: the replica that produced it and its position
/// in that replica's contiguous clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub clock: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert {
        id: OpId,
        lamport: u64,
        origin: Option<OpId>,
        content: char,
    },
    Delete {
        id: OpId,
        target: OpId,
    },
}

impl Operation {
    pub fn id(&self) -> OpId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => *id,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("operation from replica {replica} has clock {found}, expected {expected}")]
    ClockGap {
        replica: ReplicaId,
        expected: u64,
        found: u64,
    },
    #[error("operation {op:?} depends on unknown operation {dependency:?}")]
    MissingDependency { op: OpId, dependency: OpId },
    #[error("operation {op:?} deletes {target:?}, which is not an insert")]
    InvalidDeleteTarget { op: OpId, target: OpId },
    #[error("position {position} is out of bounds for length {len}")]
    OutOfBounds { position: usize, len: usize },
    #[error("lamport clock exhausted")]
    ClockExhausted,
}

#[derive(Debug, Clone)]
struct Item {
    id: OpId,
    lamport: u64,
    origin: Option<OpId>,
    content: char,
    deleted: bool,
}

impl Item {
    fn key(&self) -> (u64, ReplicaId) {
        (self.lamport, self.id.replica)
    }
}

#[derive(Debug, Clone)]
pub struct TextDocument {
    replica: ReplicaId,
    items: Vec<Item>,
    // Integration order; always causally consistent.
    log: Vec<Operation>,
    state: StateVector,
    lamport: u64,
    // Insert id -> lamport, for dependency checks.
    inserts: HashMap<OpId, u64>,
    visible_len: usize,
    // Most recently integrated insert and its index. Deletes never shift
    // indices, so this stays valid until the next insert replaces it.
    last_insert: Option<(OpId, usize)>,
}

impl TextDocument {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            items: Vec::new(),
            log: Vec::new(),
            state: StateVector::new(),
            lamport: 0,
            inserts: HashMap::new(),
            visible_len: 0,
            last_insert: None,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    /// Number of operations integrated so far, including tombstoning deletes.
    pub fn op_count(&self) -> usize {
        self.log.len()
    }

    pub fn current_text(&self) -> String {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| item.content)
            .collect()
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.clone()
    }

    /// Insert `text` so that it starts at visible char offset `position`.
    ///
    /// Returns the delta to broadcast. The edit is already visible locally.
    pub fn apply_local_insert(&mut self, position: usize, text: &str) -> Result<Delta, DocError> {
        if position > self.visible_len {
            return Err(DocError::OutOfBounds {
                position,
                len: self.visible_len,
            });
        }

        let mut origin = match position {
            0 => None,
            n => self.visible_id(n - 1),
        };
        let mut ops = Vec::with_capacity(text.len());
        for content in text.chars() {
            let lamport = self.lamport.checked_add(1).ok_or(DocError::ClockExhausted)?;
            let op = Operation::Insert {
                id: self.next_id(),
                lamport,
                origin,
                content,
            };
            origin = Some(op.id());
            self.integrate(&op);
            ops.push(op);
        }
        Ok(Delta { ops })
    }

    /// Delete the visible chars in `range`.
    pub fn apply_local_delete(&mut self, range: Range<usize>) -> Result<Delta, DocError> {
        if range.start > range.end || range.end > self.visible_len {
            return Err(DocError::OutOfBounds {
                position: range.end.max(range.start),
                len: self.visible_len,
            });
        }

        let targets: Vec<OpId> = self
            .items
            .iter()
            .filter(|item| !item.deleted)
            .skip(range.start)
            .take(range.end - range.start)
            .map(|item| item.id)
            .collect();

        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            let op = Operation::Delete {
                id: self.next_id(),
                target,
            };
            self.integrate(&op);
            ops.push(op);
        }
        Ok(Delta { ops })
    }

    /// Merge a delta produced by another replica.
    ///
    /// The whole delta is validated before anything is integrated, so a
    /// rejected delta leaves the document untouched. Operations already
    /// known are skipped. Returns the operations that were new.
    ///
    /// An insert's Lamport value is at most one past the number of inserts
    /// its author had seen. Peers only forward what they have integrated, so
    /// anything above `known inserts + 1` is rejected as malformed.
    pub fn apply_remote_delta(&mut self, delta: &Delta) -> Result<Delta, DocError> {
        let mut pending = self.state.clone();
        let mut fresh_inserts: HashMap<OpId, u64> = HashMap::new();
        let mut fresh = Vec::new();

        for op in &delta.ops {
            let id = op.id();
            let expected = pending.get(id.replica);
            if id.clock < expected {
                continue;
            }
            if id.clock > expected {
                return Err(DocError::ClockGap {
                    replica: id.replica,
                    expected,
                    found: id.clock,
                });
            }

            let horizon = (self.inserts.len() + fresh_inserts.len()) as u64 + 1;
            match op {
                Operation::Insert { lamport, .. } if *lamport > horizon => {
                    return Err(DocError::Malformed(format!(
                        "insert {id:?} has lamport {lamport}, past the {horizon} its history allows"
                    )));
                }
                Operation::Insert {
                    lamport,
                    origin: Some(origin),
                    ..
                } => {
                    let origin_lamport = self
                        .inserts
                        .get(origin)
                        .or_else(|| fresh_inserts.get(origin))
                        .copied()
                        .ok_or(DocError::MissingDependency {
                            op: id,
                            dependency: *origin,
                        })?;
                    if *lamport <= origin_lamport {
                        return Err(DocError::Malformed(format!(
                            "insert {id:?} has lamport {lamport} not after its origin"
                        )));
                    }
                    fresh_inserts.insert(id, *lamport);
                }
                Operation::Insert { lamport, origin: None, .. } => {
                    if *lamport == 0 {
                        return Err(DocError::Malformed(format!("insert {id:?} has lamport 0")));
                    }
                    fresh_inserts.insert(id, *lamport);
                }
                Operation::Delete { target, .. } => {
                    let known_insert =
                        self.inserts.contains_key(target) || fresh_inserts.contains_key(target);
                    if !known_insert {
                        if pending.contains(*target) {
                            return Err(DocError::InvalidDeleteTarget {
                                op: id,
                                target: *target,
                            });
                        }
                        return Err(DocError::MissingDependency {
                            op: id,
                            dependency: *target,
                        });
                    }
                }
            }

            pending.advance(id);
            fresh.push(op.clone());
        }

        for op in &fresh {
            self.integrate(op);
        }
        Ok(Delta { ops: fresh })
    }

    /// Every operation not summarized by `remote`, in causal order.
    pub fn delta_since(&self, remote: &StateVector) -> Delta {
        let ops = self
            .log
            .iter()
            .filter(|op| !remote.contains(op.id()))
            .cloned()
            .collect();
        Delta { ops }
    }

    fn next_id(&self) -> OpId {
        OpId {
            replica: self.replica,
            clock: self.state.get(self.replica),
        }
    }

    fn visible_id(&self, index: usize) -> Option<OpId> {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .nth(index)
            .map(|item| item.id)
    }

    fn index_of(&self, id: OpId) -> Option<usize> {
        if let Some((last, index)) = self.last_insert {
            if last == id {
                return Some(index);
            }
        }
        self.items.iter().position(|item| item.id == id)
    }

    // Callers guarantee `op` is causally ready.
    fn integrate(&mut self, op: &Operation) {
        match op {
            Operation::Insert {
                id,
                lamport,
                origin,
                content,
            } => {
                let item = Item {
                    id: *id,
                    lamport: *lamport,
                    origin: *origin,
                    content: *content,
                    deleted: false,
                };
                let mut index = match item.origin {
                    None => 0,
                    Some(origin) => self.index_of(origin).map_or(0, |i| i + 1),
                };
                while index < self.items.len() && self.items[index].key() > item.key() {
                    index += 1;
                }
                self.items.insert(index, item);
                self.inserts.insert(*id, *lamport);
                self.last_insert = Some((*id, index));
                self.visible_len += 1;
                self.lamport = self.lamport.max(*lamport);
            }
            Operation::Delete { target, .. } => {
                if let Some(index) = self.index_of(*target) {
                    let item = &mut self.items[index];
                    if !item.deleted {
                        item.deleted = true;
                        self.visible_len -= 1;
                    }
                }
            }
        }
        self.state.advance(op.id());
        self.log.push(op.clone());
    }
}
