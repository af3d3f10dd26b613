use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{DocError, OpId, Operation, ReplicaId};

/// Summary of which operations a replica has integrated.
///
/// Every replica numbers its operations with a contiguous clock starting at
/// zero, so the number of integrated operations per replica is enough to
/// describe the full set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next clock expected from `replica` (equivalently, how many of its
    /// operations have been seen).
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    pub fn contains(&self, id: OpId) -> bool {
        id.clock < self.get(id.replica)
    }

    pub(crate) fn advance(&mut self, id: OpId) {
        let next = self.0.entry(id.replica).or_insert(0);
        if id.clock + 1 > *next {
            *next = id.clock + 1;
        }
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, clock) in &other.0 {
            let entry = self.0.entry(*replica).or_insert(0);
            if *clock > *entry {
                *entry = *clock;
            }
        }
    }

    /// True when every operation summarized by `other` is also summarized here.
    pub fn covers(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(replica, clock)| self.get(*replica) >= *clock)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|clock| *clock == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.0.iter()
    }

    pub fn encode(&self) -> Result<Vec<u8>, DocError> {
        serde_cbor::to_vec(self).map_err(|e| DocError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocError> {
        serde_cbor::from_slice(bytes).map_err(|e| DocError::Malformed(e.to_string()))
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An ordered batch of operations, causally ordered (every operation's
/// dependencies appear earlier in the batch or are already known to the
/// receiver).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub ops: Vec<Operation>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// State vector covering exactly the operations in this delta.
    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for op in &self.ops {
            sv.advance(op.id());
        }
        sv
    }

    pub fn encode(&self) -> Result<Vec<u8>, DocError> {
        serde_cbor::to_vec(self).map_err(|e| DocError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocError> {
        serde_cbor::from_slice(bytes).map_err(|e| DocError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_takes_pointwise_max() {
        let mut a: StateVector = [(1, 3), (2, 1)].into_iter().collect();
        let b: StateVector = [(2, 5), (3, 2)].into_iter().collect();
        a.merge(&b);
        assert_eq!(a.get(1), 3);
        assert_eq!(a.get(2), 5);
        assert_eq!(a.get(3), 2);
        assert!(a.covers(&b));
        assert!(!b.covers(&a));
    }

    #[test]
    fn contains_uses_contiguous_clocks() {
        let sv: StateVector = [(7, 2)].into_iter().collect();
        assert!(sv.contains(OpId { replica: 7, clock: 1 }));
        assert!(!sv.contains(OpId { replica: 7, clock: 2 }));
        assert!(!sv.contains(OpId { replica: 8, clock: 0 }));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Delta::decode(&[0xff, 0x00, 0x13]), Err(DocError::Malformed(_))));
        assert!(matches!(StateVector::decode(b"not cbor"), Err(DocError::Malformed(_))));
    }

    #[test]
    fn delta_survives_the_wire() {
        let delta = Delta {
            ops: vec![
                Operation::Insert {
                    id: OpId { replica: 9, clock: 0 },
                    lamport: 1,
                    origin: None,
                    content: 'é',
                },
                Operation::Delete {
                    id: OpId { replica: 9, clock: 1 },
                    target: OpId { replica: 9, clock: 0 },
                },
            ],
        };
        let bytes = delta.encode().unwrap();
        assert_eq!(Delta::decode(&bytes).unwrap(), delta);
        assert_eq!(delta.state_vector().get(9), 2);
    }
}
