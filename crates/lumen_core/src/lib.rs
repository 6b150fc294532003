//! # LUMEN Core Primitives
//!
//! Session-layer building blocks shared by every LUMEN participant:
//!
//! - **[`IdPool`]**: allocates contiguous ranges of globally-unique 32-bit
//!   identifiers from a bounded space. One instance holds the authoritative
//!   space on the session master, a second instance caches pre-fetched
//!   sub-ranges on every other node.
//! - **[`PendingRequests`]**: correlates asynchronous request/reply pairs.
//!   A caller registers a request, ships it to another execution context,
//!   and blocks until the reply is served from the dispatch context.
//!
//! ## Architecture Rules
//!
//! 1. **No transport knowledge** - these types never touch a channel or a
//!    node; they are pure bookkeeping.
//! 2. **Per-request wakeup** - every pending request owns its condition
//!    variable, so serving one request never wakes unrelated waiters.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lumen_core::{IdPool, ID_INVALID};
//!
//! let mut pool = IdPool::new(IdPool::MAX_CAPACITY);
//! let first = pool.gen_ids(1024);
//! assert_ne!(first, ID_INVALID);
//! pool.free_ids(first, 1024);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod pool;
pub mod request;

pub use pool::{IdPool, Identifier, ID_ANY, ID_INVALID};
pub use request::{PendingRequests, Reply, RequestId};
