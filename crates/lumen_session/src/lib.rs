//! # LUMEN Session - The Mirror Protocol
//!
//! Distributed shared-object synchronization for the render cluster.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SESSION (per node)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │ App Context  │  │ Dispatch     │  │ Peer Links   │       │
//! │  │ (map/unmap)  │──│ Context      │──│ (Channels)   │       │
//! │  └──────────────┘  └──────────────┘  └──────────────┘       │
//! │         │                 │                                 │
//! │         └────── blocks on┼ PendingRequests                  │
//! │                          │                                  │
//! │              ┌───────────▼───────────┐                      │
//! │              │ Shared State          │                      │
//! │              │ - ObjectRegistry      │                      │
//! │              │ - MasterDirectory     │                      │
//! │              │ - IdPool x2           │                      │
//! │              └───────────────────────┘                      │
//! │ └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Every participant runs two logical execution contexts. The
//! **application context** issues `map`/`unmap`/`register`/`gen_ids`
//! calls; the **dispatch context** is the sole mutator of the object
//! registry and master directory and executes all protocol command
//! handlers. Cross-context calls are marshaled into self-addressed
//! commands and the caller blocks on the pending-request table until the
//! dispatch context serves the reply.
//!
//! ## Replication Model
//!
//! Each shared identifier has exactly one **master** instance somewhere in
//! the cluster and any number of **slave** mirrors. Slaves subscribe to
//! the master through an explicit handshake and receive the master's
//! current instance snapshot before their `map` call returns - a caller
//! never observes a half-subscribed object.
//!
//! ## Deadlock Rule
//!
//! A blocking wait issued from a dispatch context must pump that context's
//! own command queue while polling for completion. A plain blocking
//! primitive would deadlock the moment the waited-on reply has to be
//! processed by the waiting thread itself.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lumen_session::{LocalNode, NodeId, Session, SessionConfig};
//!
//! let master = LocalNode::new(NodeId(1));
//! let session = Arc::new(Session::new(
//!     SessionConfig::default(), 1, Arc::clone(&master), NodeId(1), true,
//! ));
//! let dispatch = Session::spawn_dispatch(Arc::clone(&session));
//!
//! let id = session.gen_ids(1); // allocates from the master pool
//! session.free_ids(id, 1);
//!
//! session.shutdown();
//! dispatch.join().unwrap();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod directory;
pub mod error;
pub mod node;
pub mod object;
pub mod protocol;
pub mod registry;
pub mod session;

// Re-exports for convenience
pub use lumen_core::{Identifier, RequestId, ID_ANY, ID_INVALID};

pub use directory::{MasterDirectory, MasterRecord};
pub use error::SessionError;
pub use node::{LocalNode, NodeId, NodeStats};
pub use object::{ChangeType, CommandOutcome, ObjectBinding, Replication, SharedObject};
pub use protocol::{Command, ObjectCommand, SessionCommand};
pub use registry::ObjectRegistry;
pub use session::{Session, SessionConfig, SessionStats};

/// Minimum identifier block fetched from the session master.
///
/// A slave asking for fewer identifiers still fetches this many; the
/// surplus lands in its local cache pool so the next allocations resolve
/// without a round trip.
pub const MIN_ID_RANGE: u32 = 1024;
