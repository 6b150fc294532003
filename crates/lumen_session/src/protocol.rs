//! # Protocol Commands
//!
//! All session-level commands exchanged between cluster nodes.
//!
//! The transport is a reliable, ordered channel between two named nodes,
//! so commands are typed values rather than byte frames. Every command is
//! serde-ready for transports that do need a wire encoding.
//!
//! Request/reply pairs carry a `request_id` minted by the sender's
//! pending-request table; replies are routed back to the blocked caller
//! through that identifier.

use serde::{Deserialize, Serialize};

use lumen_core::{Identifier, RequestId};

use crate::node::NodeId;
use crate::object::ChangeType;

/// A command addressed to the attached instances of one shared object.
///
/// `instance_id` selects a single co-located instance, or every instance
/// when set to [`lumen_core::ID_ANY`]. The payload is opaque to the
/// session; the object's own command handler interprets `opcode`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCommand {
    /// The shared identifier the command is addressed to.
    pub object_id: Identifier,
    /// Target instance identifier, or `ID_ANY` for all instances.
    pub instance_id: Identifier,
    /// Object-defined operation code.
    pub opcode: u16,
    /// Object-defined payload.
    pub payload: Vec<u8>,
}

/// Session protocol commands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionCommand {
    /// Slave -> session master: allocate a block of identifiers.
    GenIds {
        /// Correlation id of the blocked caller.
        request_id: RequestId,
        /// Number of identifiers requested.
        range: u32,
    },
    /// Session master -> slave: result of a [`SessionCommand::GenIds`].
    GenIdsReply {
        /// Correlation id echoed from the request.
        request_id: RequestId,
        /// First identifier of the allocated block, or `ID_INVALID`.
        first_id: Identifier,
    },
    /// Declares the master node of an identifier range.
    SetIdMaster {
        /// First identifier of the range.
        start: Identifier,
        /// Number of identifiers in the range.
        range: u32,
        /// The node owning the range.
        master: NodeId,
    },
    /// Any node -> session master: who owns this identifier?
    GetIdMaster {
        /// Correlation id of the blocked caller.
        request_id: RequestId,
        /// The identifier in question.
        id: Identifier,
    },
    /// Session master -> any node: the owning range, `start == 0` when
    /// unknown (identifier 0 is never allocated).
    GetIdMasterReply {
        /// Correlation id echoed from the request.
        request_id: RequestId,
        /// First identifier of the owning range, 0 if not found.
        start: Identifier,
        /// One past the last identifier of the owning range.
        end: Identifier,
        /// The node owning the range.
        master: NodeId,
    },
    /// Self-directed marshal: attach the request's object on the dispatch
    /// context.
    AttachObject {
        /// Correlation id; its request data carries the object.
        request_id: RequestId,
        /// The identifier to attach under.
        object_id: Identifier,
    },
    /// Detach one instance. Self-directed from the application context,
    /// or sent by a master completing an unsubscribe.
    DetachObject {
        /// Correlation id to serve once detached, 0 for none.
        request_id: RequestId,
        /// The identifier the instance is attached under.
        object_id: Identifier,
        /// The instance to detach.
        instance_id: Identifier,
    },
    /// Self-directed marshal: run the map state machine on the dispatch
    /// context. The request data carries object, identifier and resolved
    /// master node.
    MapObject {
        /// Correlation id; served with the map outcome.
        request_id: RequestId,
    },
    /// Slave -> master node: subscribe an instance to an object.
    SubscribeObject {
        /// Correlation id on the *requesting* node.
        request_id: RequestId,
        /// The shared identifier to subscribe to.
        object_id: Identifier,
        /// Instance identifier reserved by the requester.
        instance_id: Identifier,
    },
    /// Master -> slave: subscription accepted; set up the mirror.
    ///
    /// Sent before [`SessionCommand::SubscribeReply`] so the slave is
    /// fully attached by the time the blocked caller is released.
    SubscribeSuccess {
        /// Correlation id echoed from the subscribe.
        request_id: RequestId,
        /// The shared identifier.
        object_id: Identifier,
        /// Instance identifier echoed from the subscribe.
        instance_id: Identifier,
        /// Replication policy of the master object.
        change_type: ChangeType,
        /// Instance identifier of the master instance.
        master_instance_id: Identifier,
        /// The master's current instance snapshot.
        instance_data: Vec<u8>,
    },
    /// Master -> slave: final subscribe outcome, releases the caller.
    SubscribeReply {
        /// Correlation id echoed from the subscribe.
        request_id: RequestId,
        /// Whether the subscription succeeded.
        result: bool,
    },
    /// Slave -> master node: unsubscribe an instance. The master answers
    /// with a [`SessionCommand::DetachObject`] carrying `request_id`.
    UnsubscribeObject {
        /// Correlation id on the *requesting* node.
        request_id: RequestId,
        /// The shared identifier.
        object_id: Identifier,
        /// Instance identifier of the master instance.
        master_instance_id: Identifier,
        /// Instance identifier of the unsubscribing slave.
        slave_instance_id: Identifier,
    },
    /// A command for the attached instances of one object.
    Object(ObjectCommand),
}

impl SessionCommand {
    /// Short command name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GenIds { .. } => "GenIds",
            Self::GenIdsReply { .. } => "GenIdsReply",
            Self::SetIdMaster { .. } => "SetIdMaster",
            Self::GetIdMaster { .. } => "GetIdMaster",
            Self::GetIdMasterReply { .. } => "GetIdMasterReply",
            Self::AttachObject { .. } => "AttachObject",
            Self::DetachObject { .. } => "DetachObject",
            Self::MapObject { .. } => "MapObject",
            Self::SubscribeObject { .. } => "SubscribeObject",
            Self::SubscribeSuccess { .. } => "SubscribeSuccess",
            Self::SubscribeReply { .. } => "SubscribeReply",
            Self::UnsubscribeObject { .. } => "UnsubscribeObject",
            Self::Object(_) => "Object",
        }
    }
}

/// A command envelope as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// The node that sent the command.
    pub from: NodeId,
    /// The command itself.
    pub payload: SessionCommand,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::ID_ANY;

    #[test]
    fn test_command_names() {
        let cmd = SessionCommand::GenIds { request_id: 1, range: 16 };
        assert_eq!(cmd.name(), "GenIds");

        let cmd = SessionCommand::Object(ObjectCommand {
            object_id: 7,
            instance_id: ID_ANY,
            opcode: 0,
            payload: Vec::new(),
        });
        assert_eq!(cmd.name(), "Object");
    }
}
