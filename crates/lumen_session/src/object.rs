//! # Shared Objects
//!
//! The versioned unit of replication and its session-side bookkeeping.
//!
//! Concrete object types implement [`SharedObject`] and embed an
//! [`ObjectBinding`], which carries everything the session needs to track
//! per instance: the shared identifier, the local instance identifier and
//! the replication role. Command routing is capability-style through
//! [`SharedObject::invoke`] - the session never inspects concrete types.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use lumen_core::{Identifier, ID_INVALID};

use crate::node::NodeId;
use crate::protocol::ObjectCommand;

/// Replication policy of a shared object.
///
/// Carried in the subscribe handshake so a slave sets up the same version
/// bookkeeping as its master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    /// The object never changes after registration.
    Static,
    /// Every version ships the full instance data.
    Instance,
    /// Versions ship deltas against the previous version.
    Delta,
    /// Changes are applied immediately, without version buffering.
    Unbuffered,
}

/// Result of delivering a command to one object instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The instance consumed the command.
    Handled,
    /// The command is obsolete and must not reach further instances.
    Discard,
    /// The instance failed to process the command.
    Error,
}

/// Replication role of one attached instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Replication {
    /// Not replicated - unmapped, or a master that was detached.
    None,
    /// The authoritative instance; knows its subscribed mirrors.
    Master {
        /// Subscribed slaves as (node, remote instance identifier).
        slaves: Vec<(NodeId, Identifier)>,
    },
    /// A mirror of a master instance on another node.
    ///
    /// Kept across detach so already-buffered version history stays
    /// consultable after unmapping.
    Slave {
        /// Instance identifier of the master instance.
        master_instance_id: Identifier,
    },
}

/// Mutable binding state, guarded by one mutex.
struct BindingState {
    /// Shared identifier, `ID_INVALID` while unattached.
    id: Identifier,
    /// Local instance identifier, `ID_INVALID` while unattached.
    instance_id: Identifier,
    /// Replication role.
    replication: Replication,
    /// Master snapshot delivered by the subscribe handshake, consumed by
    /// the application context when the map call returns.
    map_data: Option<Vec<u8>>,
}

/// Session-side bookkeeping embedded in every shared object.
///
/// All methods are thread-safe; the dispatch context writes, any context
/// may read.
pub struct ObjectBinding {
    state: Mutex<BindingState>,
}

impl ObjectBinding {
    /// Creates an unattached binding with no replication role.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BindingState {
                id: ID_INVALID,
                instance_id: ID_INVALID,
                replication: Replication::None,
                map_data: None,
            }),
        }
    }

    /// The shared identifier, or `ID_INVALID` while unattached.
    #[must_use]
    pub fn id(&self) -> Identifier {
        self.state.lock().id
    }

    /// The local instance identifier, or `ID_INVALID` while unattached.
    #[must_use]
    pub fn instance_id(&self) -> Identifier {
        self.state.lock().instance_id
    }

    /// Returns true if the object is attached to a session.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state.lock().id != ID_INVALID
    }

    /// Returns true if this instance is the authoritative master.
    #[must_use]
    pub fn is_master(&self) -> bool {
        matches!(self.state.lock().replication, Replication::Master { .. })
    }

    /// The master's instance identifier, or `ID_INVALID` if this instance
    /// is not a slave.
    #[must_use]
    pub fn master_instance_id(&self) -> Identifier {
        match self.state.lock().replication {
            Replication::Slave { master_instance_id } => master_instance_id,
            _ => ID_INVALID,
        }
    }

    /// Links the object under `id` with the given instance identifier.
    ///
    /// Dispatch context only.
    pub fn attach(&self, id: Identifier, instance_id: Identifier) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.id, ID_INVALID, "object is already attached");
        state.id = id;
        state.instance_id = instance_id;
    }

    /// Clears identifier and instance identifier on detach.
    ///
    /// The replication role is untouched; masters additionally call
    /// [`ObjectBinding::reset_replication`].
    pub fn clear(&self) {
        let mut state = self.state.lock();
        debug_assert_ne!(state.id, ID_INVALID, "object was never attached");
        state.id = ID_INVALID;
        state.instance_id = ID_INVALID;
    }

    /// Declares this instance the authoritative master.
    pub fn setup_master(&self) {
        self.state.lock().replication = Replication::Master { slaves: Vec::new() };
    }

    /// Declares this instance a mirror of `master_instance_id`.
    pub fn setup_slave(&self, master_instance_id: Identifier) {
        self.state.lock().replication = Replication::Slave { master_instance_id };
    }

    /// Drops the replication role. Called when a master instance
    /// detaches; slaves keep theirs.
    pub fn reset_replication(&self) {
        self.state.lock().replication = Replication::None;
    }

    /// Registers a subscribed slave on a master instance.
    pub fn add_slave(&self, node: NodeId, instance_id: Identifier) {
        match &mut self.state.lock().replication {
            Replication::Master { slaves } => slaves.push((node, instance_id)),
            _ => debug_assert!(false, "add_slave on a non-master instance"),
        }
    }

    /// Removes every subscription of `node` from a master instance.
    pub fn remove_slave(&self, node: NodeId) {
        if let Replication::Master { slaves } = &mut self.state.lock().replication {
            slaves.retain(|(slave_node, _)| *slave_node != node);
        }
    }

    /// Snapshot of the subscribed slaves of a master instance.
    #[must_use]
    pub fn slaves(&self) -> Vec<(NodeId, Identifier)> {
        match &self.state.lock().replication {
            Replication::Master { slaves } => slaves.clone(),
            _ => Vec::new(),
        }
    }

    /// Stores the master snapshot delivered by a subscribe handshake.
    pub fn stash_map_data(&self, data: Vec<u8>) {
        self.state.lock().map_data = Some(data);
    }

    /// Takes the stored master snapshot, if any.
    #[must_use]
    pub fn take_map_data(&self) -> Option<Vec<u8>> {
        self.state.lock().map_data.take()
    }
}

impl Default for ObjectBinding {
    fn default() -> Self {
        Self::new()
    }
}

/// A distributed object shared across the cluster.
///
/// Implementors embed an [`ObjectBinding`] and expose it through
/// [`SharedObject::binding`]; the session drives attach/detach and the
/// subscribe handshake through that binding.
pub trait SharedObject: Send + Sync {
    /// The session-side bookkeeping of this object.
    fn binding(&self) -> &ObjectBinding;

    /// The replication policy announced to subscribing slaves.
    fn change_type(&self) -> ChangeType;

    /// Serializes the current instance state.
    ///
    /// Called on the master when a slave subscribes; the result is applied
    /// on the slave via [`SharedObject::apply_instance_data`] before its
    /// map call returns.
    fn instance_data(&self) -> Vec<u8>;

    /// Applies a master snapshot to this instance.
    fn apply_instance_data(&self, data: &[u8]);

    /// Delivers an object-addressed command to this instance.
    fn invoke(&self, command: &ObjectCommand) -> CommandOutcome;

    /// The shared identifier, or `ID_INVALID` while unattached.
    fn id(&self) -> Identifier {
        self.binding().id()
    }

    /// The local instance identifier, or `ID_INVALID` while unattached.
    fn instance_id(&self) -> Identifier {
        self.binding().instance_id()
    }

    /// Returns true if this instance is the authoritative master.
    fn is_master(&self) -> bool {
        self.binding().is_master()
    }
}
