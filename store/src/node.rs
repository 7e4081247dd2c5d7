use serde::{Deserialize, Serialize};
use vstate_hashes::{Hash, NodeHasher};

/// Content address of a [`StateNode`]
pub type NodeId = Hash;

/// An immutable node of the versioned state tree
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNode {
    pub children: Vec<NodeId>,
    pub value: Vec<u8>,
}

impl StateNode {
    pub fn new(children: Vec<NodeId>, value: Vec<u8>) -> Self {
        Self { children, value }
    }

    pub fn leaf(value: impl Into<Vec<u8>>) -> Self {
        Self { children: Vec::new(), value: value.into() }
    }

    /// The serialized form, which is exactly what the node store persists
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing plain vectors into memory cannot fail
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn id(&self) -> NodeId {
        NodeHasher::hash(self.to_bytes())
    }
}
