//! # Session Errors
//!
//! Internal failure modes of the synchronization layer.
//!
//! These never cross the public session boundary as panics: the public
//! API reports failure through sentinels (`ID_INVALID`) and booleans, and
//! logs the underlying [`SessionError`] instead.

use thiserror::Error;

use crate::node::NodeId;

/// Failures of node-to-node command delivery and session bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The target node has no registered link.
    #[error("node {0} is not connected")]
    NodeUnreachable(NodeId),

    /// The target node's command channel was closed.
    #[error("command channel to node {0} is closed")]
    ChannelClosed(NodeId),

    /// No master node is known for the identifier.
    #[error("no master node for identifier {0}")]
    MasterNotFound(u32),

    /// The identifier space is exhausted.
    #[error("identifier space exhausted")]
    PoolExhausted,
}
