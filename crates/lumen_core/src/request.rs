//! # Pending-Request Table
//!
//! Correlates asynchronous request/reply pairs by request identifier.
//!
//! An application thread registers a request, marshals it into a command
//! sent to a dispatch context (possibly its own), and blocks in
//! [`PendingRequests::wait`] until the reply arrives. The dispatch context
//! serves the result with [`PendingRequests::serve`]. Each request owns
//! its condition variable, so a served request wakes exactly one waiter
//! and nobody else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::pool::Identifier;

/// Identifies one pending request for the lifetime of its table entry.
///
/// Values are monotonically fresh; reuse after an entry is consumed is
/// permitted (the counter wraps after 2^32 requests).
pub type RequestId = u32;

/// The result value delivered from `serve` to `wait`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Pure synchronization - the request carried no result.
    None,
    /// An allocated identifier (or [`crate::ID_INVALID`]).
    Id(Identifier),
    /// A boolean outcome, e.g. of a map or subscribe operation.
    Flag(bool),
    /// An opaque payload.
    Bytes(Vec<u8>),
    /// The request was failed out: the peer disconnected or the session
    /// shut down before a reply arrived. Callers treat this as the falsy
    /// result of their operation.
    Failed,
}

/// State shared between one waiter and one server.
struct SlotState<D> {
    /// The served result, present once `serve` ran.
    result: Option<Reply>,
    /// Optional caller-supplied payload, readable by command handlers.
    data: Option<D>,
}

/// One pending request: its state plus a dedicated wakeup.
struct Slot<D> {
    state: Mutex<SlotState<D>>,
    served: Condvar,
}

/// Thread-safe request/reply correlation table.
///
/// `D` is the caller-payload type; handlers running on the dispatch
/// context read it with [`PendingRequests::request_data`] while the
/// request is still pending.
pub struct PendingRequests<D> {
    /// Next fresh request identifier.
    next_id: AtomicU32,
    /// Pending entries. Entries are removed when the waiter consumes the
    /// result, not when it is served.
    table: Mutex<HashMap<RequestId, Arc<Slot<D>>>>,
}

impl<D> PendingRequests<D> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new request, optionally carrying `data` for the
    /// handler that will complete it.
    ///
    /// # Returns
    ///
    /// A fresh request identifier to embed in the outgoing command.
    pub fn register(&self, data: Option<D>) -> RequestId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            state: Mutex::new(SlotState { result: None, data }),
            served: Condvar::new(),
        });
        self.table.lock().insert(id, slot);
        id
    }

    /// Serves the request, waking its waiter.
    ///
    /// Each request is fulfilled exactly once; a second serve of the same
    /// identifier is ignored.
    ///
    /// # Returns
    ///
    /// True if a pending, not-yet-served request was completed.
    pub fn serve(&self, id: RequestId, reply: Reply) -> bool {
        let slot = match self.table.lock().get(&id) {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };

        let mut state = slot.state.lock();
        if state.result.is_some() {
            return false;
        }
        state.result = Some(reply);
        slot.served.notify_one();
        true
    }

    /// Blocks the calling thread until the request is served, then
    /// consumes the entry.
    ///
    /// Must NOT be called from a context that is itself responsible for
    /// processing the serving command - such contexts poll with
    /// [`PendingRequests::try_take`] while pumping their queue instead.
    ///
    /// # Returns
    ///
    /// The served [`Reply`], or [`Reply::Failed`] for an unknown request.
    pub fn wait(&self, id: RequestId) -> Reply {
        let slot = match self.table.lock().get(&id) {
            Some(slot) => Arc::clone(slot),
            None => return Reply::Failed,
        };

        let mut state = slot.state.lock();
        while state.result.is_none() {
            slot.served.wait(&mut state);
        }
        let reply = state.result.take().unwrap_or(Reply::Failed);
        drop(state);

        self.table.lock().remove(&id);
        reply
    }

    /// Non-blocking completion check; consumes the entry when served.
    ///
    /// This is the polling half of the reentrant wait loop: a dispatch
    /// context processes one queued command, calls `try_take`, and
    /// repeats.
    pub fn try_take(&self, id: RequestId) -> Option<Reply> {
        let slot = Arc::clone(self.table.lock().get(&id)?);

        let mut state = slot.state.lock();
        let reply = state.result.take()?;
        drop(state);

        self.table.lock().remove(&id);
        Some(reply)
    }

    /// Reads the caller payload of a still-pending request.
    ///
    /// Non-consuming: the original design reads the same payload from two
    /// different handlers of one request (map, then subscribe-success).
    pub fn request_data(&self, id: RequestId) -> Option<D>
    where
        D: Clone,
    {
        let slot = Arc::clone(self.table.lock().get(&id)?);
        let state = slot.state.lock();
        state.data.clone()
    }

    /// Serves a single request with the failure sentinel.
    pub fn fail(&self, id: RequestId) -> bool {
        self.serve(id, Reply::Failed)
    }

    /// Fails every outstanding request.
    ///
    /// Called on shutdown so no application thread hangs forever on a
    /// reply that can no longer arrive.
    pub fn fail_all(&self) {
        let slots: Vec<Arc<Slot<D>>> = self.table.lock().values().map(Arc::clone).collect();
        for slot in slots {
            let mut state = slot.state.lock();
            if state.result.is_none() {
                state.result = Some(Reply::Failed);
                slot.served.notify_one();
            }
        }
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Returns true if no requests are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

impl<D> Default for PendingRequests<D> {
    fn default() -> Self {
        Self::new()
    }
}
