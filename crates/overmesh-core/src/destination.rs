//! Destination policy: where a message is forwarded.

use std::sync::Arc;

use crate::member::Member;

/// Destination meta.
#[derive(Clone, Copy, Debug)]
pub enum Destination {
    /// Forward to up to `node_count` random live candidates that are not the
    /// sender.
    Community { node_count: usize },
    /// Unicast to the listed members' last known addresses.  The target list
    /// is a local routing fact and is never put on the wire.
    Member,
}

impl Destination {
    pub fn node_count(&self) -> Option<usize> {
        match self {
            Destination::Community { node_count } => Some(*node_count),
            Destination::Member => None,
        }
    }
}

/// Per-message destination state.
#[derive(Clone, Debug)]
pub enum DestinationImpl {
    Community,
    Member { targets: Vec<Arc<Member>> },
}

impl DestinationImpl {
    pub fn targets(&self) -> &[Arc<Member>] {
        match self {
            DestinationImpl::Community => &[],
            DestinationImpl::Member { targets } => targets,
        }
    }
}
