//! # Local Node
//!
//! The session's view of the cluster transport: a reliable, ordered
//! command channel per node plus a peer table of outgoing links.
//!
//! Commands between co-located sessions - including the self-addressed
//! marshals that hop an application call onto the dispatch context - go
//! through the same channel as remote traffic, so ordering is uniform.
//! The channel is unbounded: the protocol tolerates latency but never a
//! dropped command.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::protocol::{Command, SessionCommand};

/// Cluster-wide node identifier.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Sentinel meaning "no node" - the result of a failed master lookup.
    pub const ZERO: NodeId = NodeId(0);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Transport statistics.
#[derive(Debug, Default)]
pub struct NodeStats {
    /// Commands sent, loopback included.
    sent: AtomicU64,
    /// Commands buffered because no object was attached yet.
    buffered: AtomicU64,
    /// Buffered commands re-dispatched after an attach.
    redispatched: AtomicU64,
}

impl NodeStats {
    /// Commands sent, loopback included.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Commands buffered because no object was attached yet.
    #[must_use]
    pub fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Buffered commands re-dispatched after an attach.
    #[must_use]
    pub fn redispatched(&self) -> u64 {
        self.redispatched.load(Ordering::Relaxed)
    }
}

/// One cluster participant's transport endpoint.
///
/// Owns the inbound command queue drained by the dispatch context, the
/// outgoing links to connected peers, and the buffer of object commands
/// that arrived before their target attached.
pub struct LocalNode {
    /// This node's identifier.
    id: NodeId,
    /// Loopback sender for self-addressed commands.
    tx: Sender<Command>,
    /// Inbound queue, drained by the dispatch context.
    rx: Receiver<Command>,
    /// Outgoing links, keyed by peer identifier.
    peers: Mutex<HashMap<NodeId, Sender<Command>>>,
    /// The thread currently acting as dispatch context.
    dispatch_thread: Mutex<Option<ThreadId>>,
    /// Object commands held until their target attaches.
    held: Mutex<VecDeque<Command>>,
    /// Transport statistics.
    stats: NodeStats,
}

impl LocalNode {
    /// Creates a node endpoint with an empty peer table.
    #[must_use]
    pub fn new(id: NodeId) -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(Self {
            id,
            tx,
            rx,
            peers: Mutex::new(HashMap::new()),
            dispatch_thread: Mutex::new(None),
            held: Mutex::new(VecDeque::new()),
            stats: NodeStats::default(),
        })
    }

    /// This node's identifier.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Transport statistics.
    #[must_use]
    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Links two nodes in both directions.
    pub fn link(a: &Arc<LocalNode>, b: &Arc<LocalNode>) {
        a.peers.lock().insert(b.id, b.tx.clone());
        b.peers.lock().insert(a.id, a.tx.clone());
        tracing::debug!("linked {} <-> {}", a.id, b.id);
    }

    /// Removes the outgoing link to `peer`.
    ///
    /// # Returns
    ///
    /// True if a link existed. The session follows up by failing every
    /// request outstanding toward that peer.
    pub fn disconnect(&self, peer: NodeId) -> bool {
        let removed = self.peers.lock().remove(&peer).is_some();
        if removed {
            tracing::info!("{} disconnected from {}", self.id, peer);
        }
        removed
    }

    /// Returns true if `peer` is this node or a linked peer.
    #[must_use]
    pub fn is_connected(&self, peer: NodeId) -> bool {
        peer == self.id || self.peers.lock().contains_key(&peer)
    }

    /// Sends a command to `to`, which may be this node itself.
    pub fn send(&self, to: NodeId, payload: SessionCommand) -> Result<(), SessionError> {
        let sender = if to == self.id {
            self.tx.clone()
        } else {
            self.peers
                .lock()
                .get(&to)
                .cloned()
                .ok_or(SessionError::NodeUnreachable(to))?
        };

        tracing::trace!("{} -> {}: {}", self.id, to, payload.name());
        let command = Command { from: self.id, payload };
        sender
            .send(command)
            .map_err(|_| SessionError::ChannelClosed(to))?;
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Receives the next inbound command, waiting up to `timeout`.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Command> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Receives the next inbound command without blocking.
    #[must_use]
    pub fn try_recv(&self) -> Option<Command> {
        self.rx.try_recv().ok()
    }

    /// Declares the calling thread the dispatch context.
    ///
    /// Called by the dispatch loop before draining the queue; execution
    /// paths use [`LocalNode::in_dispatch_thread`] to decide between
    /// direct execution and a marshaled, blocking request.
    pub fn enter_dispatch(&self) {
        *self.dispatch_thread.lock() = Some(thread::current().id());
    }

    /// Returns true if the calling thread is the dispatch context.
    #[must_use]
    pub fn in_dispatch_thread(&self) -> bool {
        *self.dispatch_thread.lock() == Some(thread::current().id())
    }

    /// Holds an object command whose target has no attached instance yet.
    ///
    /// Attach may be racing with command arrival; held commands are
    /// re-dispatched after every attach instead of being dropped.
    pub fn hold_command(&self, command: Command) {
        self.stats.buffered.fetch_add(1, Ordering::Relaxed);
        self.held.lock().push_back(command);
    }

    /// Takes every held command for re-dispatch.
    #[must_use]
    pub fn take_held(&self) -> Vec<Command> {
        let mut held = self.held.lock();
        let commands: Vec<Command> = held.drain(..).collect();
        self.stats
            .redispatched
            .fetch_add(commands.len() as u64, Ordering::Relaxed);
        commands
    }

    /// Number of commands currently held.
    #[must_use]
    pub fn held_len(&self) -> usize {
        self.held.lock().len()
    }
}
