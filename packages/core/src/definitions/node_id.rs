use std::fmt::{Debug, Display};

/// A Z-Wave node id. Real nodes live in 1..=232, 0xFF addresses every
/// listening node at once.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u8);

pub const NODE_ID_UNSPECIFIED: NodeId = NodeId(0);
pub const NODE_ID_BROADCAST: NodeId = NodeId(0xff);

/// The highest node id a 500-series network can assign.
pub const MAX_NODE_ID: u8 = 232;

impl NodeId {
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn broadcast() -> Self {
        NODE_ID_BROADCAST
    }

    pub fn unspecified() -> Self {
        NODE_ID_UNSPECIFIED
    }

    pub fn is_valid_unit(&self) -> bool {
        self.0 >= 1 && self.0 <= MAX_NODE_ID
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:0>3}", self.0)
    }
}

impl From<u8> for NodeId {
    fn from(val: u8) -> Self {
        Self(val)
    }
}

impl From<NodeId> for u8 {
    fn from(val: NodeId) -> Self {
        val.0
    }
}

impl PartialEq<u8> for NodeId {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}
