//! # Session
//!
//! The per-node orchestrator of the Mirror Protocol.
//!
//! A session composes the identifier pools, the pending-request table,
//! the master directory and the object registry, and exposes the
//! attach/detach/map/unmap/register surface consumed by the rendering
//! layer. Inbound protocol commands are executed here, on the dispatch
//! context.
//!
//! ## Execution Contexts
//!
//! Operations called from the dispatch context execute directly.
//! Operations called from any other context marshal themselves into a
//! self-addressed command and block on the pending-request table until
//! the dispatch context serves the reply. A blocking wait issued *from*
//! the dispatch context pumps the command queue while polling completion,
//! because the reply it waits for may have to be processed by the waiting
//! thread itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use lumen_core::{IdPool, Identifier, PendingRequests, Reply, RequestId, ID_ANY, ID_INVALID};

use crate::directory::{MasterDirectory, MasterRecord};
use crate::node::{LocalNode, NodeId};
use crate::object::{ChangeType, CommandOutcome, SharedObject};
use crate::protocol::{Command, ObjectCommand, SessionCommand};
use crate::registry::ObjectRegistry;
use crate::MIN_ID_RANGE;

/// Session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Minimum identifier block fetched from the session master per
    /// round trip; the surplus fills the local cache pool.
    pub min_id_range: u32,
    /// Queue poll interval of a reentrant wait on the dispatch context.
    pub poll_interval: Duration,
    /// Queue timeout of one dispatch-loop iteration.
    pub queue_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_id_range: MIN_ID_RANGE,
            poll_interval: Duration::from_millis(1),
            queue_timeout: Duration::from_millis(10),
        }
    }
}

/// Session statistics.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Protocol commands executed on the dispatch context.
    handled: AtomicU64,
    /// Identifier-block fetches sent to the session master.
    id_fetches: AtomicU64,
    /// Master-directory queries sent to the session master.
    master_queries: AtomicU64,
    /// Subscribe handshakes served as the master side.
    subscribes_served: AtomicU64,
    /// Object commands that no instance accepted.
    invoke_errors: AtomicU64,
}

impl SessionStats {
    /// Protocol commands executed on the dispatch context.
    #[must_use]
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Identifier-block fetches sent to the session master.
    #[must_use]
    pub fn id_fetches(&self) -> u64 {
        self.id_fetches.load(Ordering::Relaxed)
    }

    /// Master-directory queries sent to the session master.
    #[must_use]
    pub fn master_queries(&self) -> u64 {
        self.master_queries.load(Ordering::Relaxed)
    }

    /// Subscribe handshakes served as the master side.
    #[must_use]
    pub fn subscribes_served(&self) -> u64 {
        self.subscribes_served.load(Ordering::Relaxed)
    }

    /// Object commands that no instance accepted.
    #[must_use]
    pub fn invoke_errors(&self) -> u64 {
        self.invoke_errors.load(Ordering::Relaxed)
    }
}

/// Caller payload attached to a pending request, consulted by the
/// dispatch-context handler completing it.
#[derive(Clone)]
enum RequestData {
    /// The object an [`SessionCommand::AttachObject`] marshal refers to.
    Attach(Arc<dyn SharedObject>),
    /// The object, target identifier and resolved master node of a
    /// [`SessionCommand::MapObject`] marshal. `master` is
    /// [`NodeId::ZERO`] when the object is itself the master.
    Map {
        object: Arc<dyn SharedObject>,
        object_id: Identifier,
        master: NodeId,
    },
}

/// A session-scoped shared-object synchronization domain.
pub struct Session {
    /// Session identifier, assigned by the create-config protocol.
    id: u32,
    /// True on the node that owns the authoritative identifier space.
    is_master: bool,
    /// Configuration.
    config: SessionConfig,
    /// The local transport endpoint.
    local: Arc<LocalNode>,
    /// The session master node (the server endpoint).
    server: NodeId,
    /// Request/reply correlation.
    requests: PendingRequests<RequestData>,
    /// Target peer of every in-flight remote request, for disconnect
    /// fail-out.
    outstanding: Mutex<HashMap<RequestId, NodeId>>,
    /// Authoritative identifier space; seeded only on the master.
    master_pool: Mutex<IdPool>,
    /// Locally-cached identifier sub-ranges.
    local_pool: Mutex<IdPool>,
    /// Rotating local instance-identifier counter.
    instance_ids: AtomicU32,
    /// Identifier-range ownership, append-only.
    directory: MasterDirectory,
    /// Locally-attached object instances.
    registry: ObjectRegistry,
    /// Cleared by shutdown; stops the dispatch loop.
    running: AtomicBool,
    /// Statistics.
    stats: SessionStats,
}

impl Session {
    /// Creates a session on `local`.
    ///
    /// `server` names the session master node; exactly one participant
    /// passes `is_master = true` and seeds the authoritative pool.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        id: u32,
        local: Arc<LocalNode>,
        server: NodeId,
        is_master: bool,
    ) -> Self {
        let master_capacity = if is_master { IdPool::MAX_CAPACITY } else { 0 };
        tracing::info!("new session {id} on {} (master: {is_master})", local.id());
        Self {
            id,
            is_master,
            config,
            local,
            server,
            requests: PendingRequests::new(),
            outstanding: Mutex::new(HashMap::new()),
            master_pool: Mutex::new(IdPool::new(master_capacity)),
            local_pool: Mutex::new(IdPool::new(0)),
            instance_ids: AtomicU32::new(0),
            directory: MasterDirectory::new(),
            registry: ObjectRegistry::new(),
            running: AtomicBool::new(true),
            stats: SessionStats::default(),
        }
    }

    /// The session identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// True on the session master node.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// The local transport endpoint.
    #[must_use]
    pub fn local(&self) -> &Arc<LocalNode> {
        &self.local
    }

    /// Session statistics.
    #[must_use]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// The master directory (read access).
    #[must_use]
    pub fn directory(&self) -> &MasterDirectory {
        &self.directory
    }

    /// The object registry (read access).
    #[must_use]
    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // identifier generation
    // ------------------------------------------------------------------

    /// Allocates a contiguous block of `range` identifiers.
    ///
    /// The master allocates directly from the authoritative pool when
    /// already on the dispatch context. Everyone else serves from the
    /// local cache pool first and fetches a block of at least
    /// `min_id_range` from the session master on a miss, parking the
    /// surplus in the cache.
    ///
    /// # Returns
    ///
    /// The first identifier of the block, or [`ID_INVALID`] on
    /// exhaustion. Exhaustion is a hard failure, never retried here.
    pub fn gen_ids(&self, range: u32) -> Identifier {
        if range == 0 {
            return ID_INVALID;
        }
        if self.is_master && self.local.in_dispatch_thread() {
            return self.master_pool.lock().gen_ids(range);
        }

        let id = self.local_pool.lock().gen_ids(range);
        if id != ID_INVALID {
            return id;
        }

        let fetch = range.max(self.config.min_id_range);
        let request_id = self.requests.register(None);
        self.stats.id_fetches.fetch_add(1, Ordering::Relaxed);
        self.send_tracked(
            self.server,
            request_id,
            SessionCommand::GenIds { request_id, range: fetch },
        );

        let id = match self.wait_request(request_id) {
            Reply::Id(id) => id,
            _ => ID_INVALID,
        };
        if id == ID_INVALID || range >= fetch {
            return id;
        }

        // The fetched block is larger than asked - let the cache pool
        // hand out the exact range and keep the rest.
        let mut local_pool = self.local_pool.lock();
        local_pool.free_ids(id, fetch);
        local_pool.gen_ids(range)
    }

    /// Returns a block of identifiers to the local cache pool.
    ///
    /// Freed identifiers stay cached on this node; they are not returned
    /// to the session master.
    pub fn free_ids(&self, start: Identifier, range: u32) {
        self.local_pool.lock().free_ids(start, range);
    }

    // ------------------------------------------------------------------
    // identifier master mapping
    // ------------------------------------------------------------------

    /// Declares `master` the owner of `[start, start + range)`.
    ///
    /// Appended locally; non-masters also forward the declaration to the
    /// session master so other participants can resolve it. The master
    /// itself never forwards - it is the authority being told.
    pub fn set_id_master(&self, start: Identifier, range: u32, master: NodeId) {
        self.directory
            .add(MasterRecord { start, end: start + range, master });

        if self.is_master {
            return;
        }
        if let Err(err) = self
            .local
            .send(self.server, SessionCommand::SetIdMaster { start, range, master })
        {
            tracing::warn!("set_id_master not forwarded: {err}");
        }
    }

    /// Local, non-blocking master lookup for `id`.
    #[must_use]
    pub fn poll_id_master(&self, id: Identifier) -> NodeId {
        self.directory.poll(id)
    }

    /// Resolves the master node for `id`, asking the session master and
    /// caching the answer when no local record matches.
    ///
    /// # Returns
    ///
    /// The owning node, or [`NodeId::ZERO`] if nobody knows the
    /// identifier. The session master never asks anyone - its directory
    /// is as good as it gets.
    pub fn get_id_master(&self, id: Identifier) -> NodeId {
        let master = self.directory.poll(id);
        if master != NodeId::ZERO || self.is_master {
            return master;
        }

        let request_id = self.requests.register(None);
        self.stats.master_queries.fetch_add(1, Ordering::Relaxed);
        self.send_tracked(
            self.server,
            request_id,
            SessionCommand::GetIdMaster { request_id, id },
        );
        let _ = self.wait_request(request_id);

        let master = self.directory.poll(id);
        tracing::debug!("master node for id {id}: {master}");
        master
    }

    // ------------------------------------------------------------------
    // object mapping
    // ------------------------------------------------------------------

    /// Attaches `object` under `id`.
    ///
    /// Executes directly on the dispatch context: assigns a fresh local
    /// instance identifier, inserts into the registry and re-dispatches
    /// every held command. From any other context the call marshals
    /// itself to the dispatch context and blocks until acknowledged.
    pub fn attach_object(&self, object: &Arc<dyn SharedObject>, id: Identifier) {
        debug_assert_ne!(id, ID_INVALID);

        if self.local.in_dispatch_thread() {
            self.attach_direct(object, id);
            return;
        }

        let request_id = self
            .requests
            .register(Some(RequestData::Attach(Arc::clone(object))));
        self.send_tracked(
            self.local.id(),
            request_id,
            SessionCommand::AttachObject { request_id, object_id: id },
        );
        let _ = self.wait_request(request_id);
    }

    /// Detaches `object` from its identifier.
    ///
    /// Erases the registry entry entirely when the last instance goes,
    /// clears the object's identifiers, and resets the replication state
    /// of master instances only - slaves keep theirs so buffered version
    /// history stays consultable after unmapping.
    pub fn detach_object(&self, object: &Arc<dyn SharedObject>) {
        if self.local.in_dispatch_thread() {
            self.detach_direct(object);
            return;
        }

        let request_id = self.requests.register(None);
        self.send_tracked(
            self.local.id(),
            request_id,
            SessionCommand::DetachObject {
                request_id,
                object_id: object.id(),
                instance_id: object.instance_id(),
            },
        );
        let _ = self.wait_request(request_id);
    }

    /// Maps `object` under the shared identifier `id`.
    ///
    /// Application context only. Master objects attach directly; slave
    /// objects resolve their master node first and fail without side
    /// effects when it cannot be located or is not connected. On success
    /// a slave has applied the master's current instance snapshot before
    /// this returns - the caller never observes a half-subscribed object.
    ///
    /// # Returns
    ///
    /// True if the object is mapped and fully initialized.
    pub fn map_object(&self, object: &Arc<dyn SharedObject>, id: Identifier) -> bool {
        debug_assert!(
            !self.local.in_dispatch_thread(),
            "map_object is application-context only"
        );
        debug_assert_eq!(object.id(), ID_INVALID, "object is already mapped");
        debug_assert_ne!(id, ID_INVALID);
        tracing::debug!("mapping object to id {id}");

        let mut master = NodeId::ZERO;
        if !object.is_master() {
            master = self.get_id_master(id);
            if master == NodeId::ZERO {
                tracing::warn!("can't find master node for object id {id}");
                return false;
            }
            if !self.local.is_connected(master) {
                tracing::warn!("master {master} for object id {id} is not connected");
                return false;
            }
        }

        let request_id = self.requests.register(Some(RequestData::Map {
            object: Arc::clone(object),
            object_id: id,
            master,
        }));
        self.send_tracked(
            self.local.id(),
            request_id,
            SessionCommand::MapObject { request_id },
        );
        let result = matches!(self.wait_request(request_id), Reply::Flag(true));

        // Apply the master snapshot on slave instances before returning
        // control to the caller.
        if result && !object.is_master() {
            if let Some(data) = object.binding().take_map_data() {
                object.apply_instance_data(&data);
            }
        }

        debug_assert!(!result || object.id() != ID_INVALID);
        result
    }

    /// Unmaps `object` from its identifier.
    ///
    /// Slaves with a known master instance unsubscribe from the master
    /// node, which answers by instructing the detach; masters (or slaves
    /// whose master instance is unknown) detach directly. Unmapping an
    /// object with no identifier is a no-op.
    pub fn unmap_object(&self, object: &Arc<dyn SharedObject>) {
        let id = object.id();
        if id == ID_INVALID {
            return;
        }
        debug_assert!(
            !self.local.in_dispatch_thread(),
            "unmap_object is application-context only"
        );
        tracing::debug!("unmap object from id {id}");

        if !object.is_master() {
            let master_instance_id = object.binding().master_instance_id();
            if master_instance_id != ID_INVALID {
                let master = self.poll_id_master(id);
                if master != NodeId::ZERO && self.local.is_connected(master) {
                    let request_id = self.requests.register(None);
                    self.send_tracked(
                        master,
                        request_id,
                        SessionCommand::UnsubscribeObject {
                            request_id,
                            object_id: id,
                            master_instance_id,
                            slave_instance_id: object.instance_id(),
                        },
                    );
                    let _ = self.wait_request(request_id);
                    return;
                }
                tracing::error!("master node for object id {id} not connected");
            }
        }

        self.detach_object(object);
    }

    /// Registers a fresh master object: allocates one identifier,
    /// declares this node its master, initializes master replication and
    /// maps the object.
    ///
    /// # Returns
    ///
    /// True on success; on failure no identifier stays allocated.
    pub fn register_object(&self, object: &Arc<dyn SharedObject>) -> bool {
        debug_assert_eq!(object.id(), ID_INVALID, "object is already registered");

        let id = self.gen_ids(1);
        if id == ID_INVALID {
            tracing::error!("identifier space exhausted, can't register object");
            return false;
        }

        self.set_id_master(id, 1, self.local.id());
        object.binding().setup_master();

        let mapped = self.map_object(object, id);
        if mapped {
            tracing::debug!("registered object to id {id}");
        } else {
            object.binding().reset_replication();
            self.free_ids(id, 1);
        }
        mapped
    }

    /// Reverses [`Session::register_object`]: unmaps and frees the
    /// identifier.
    pub fn deregister_object(&self, object: &Arc<dyn SharedObject>) {
        let id = object.id();
        if id == ID_INVALID {
            return;
        }
        tracing::debug!("deregister object from id {id}");

        self.unmap_object(object);
        self.free_ids(id, 1);
    }

    // ------------------------------------------------------------------
    // dispatch context
    // ------------------------------------------------------------------

    /// Processes one inbound command, waiting up to `timeout` for it.
    ///
    /// # Returns
    ///
    /// True if a command was processed.
    pub fn process_one(&self, timeout: Duration) -> bool {
        match self.local.recv_timeout(timeout) {
            Some(command) => {
                self.handle_command(command);
                true
            }
            None => false,
        }
    }

    /// Runs the dispatch loop on the calling thread until shutdown.
    ///
    /// The calling thread becomes the dispatch context.
    pub fn run(&self) {
        self.local.enter_dispatch();
        tracing::info!("session {} dispatching on {}", self.id, self.local.id());

        while self.running.load(Ordering::Relaxed) {
            let _ = self.process_one(self.config.queue_timeout);
        }
        tracing::info!("session {} dispatch loop stopped", self.id);
    }

    /// Spawns the dispatch loop on a dedicated thread.
    #[must_use]
    pub fn spawn_dispatch(session: Arc<Session>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("lumen-dispatch-{}", session.local.id()))
            .spawn(move || session.run())
            .expect("failed to spawn dispatch thread")
    }

    /// Stops the dispatch loop and fails every outstanding request so no
    /// blocked caller hangs forever.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.requests.fail_all();
    }

    /// Reacts to a peer disconnect: drops the link and fails every
    /// request outstanding toward that peer with the failure sentinel.
    pub fn handle_disconnect(&self, peer: NodeId) {
        self.local.disconnect(peer);

        let failed: Vec<RequestId> = {
            let mut outstanding = self.outstanding.lock();
            let ids: Vec<RequestId> = outstanding
                .iter()
                .filter(|(_, target)| **target == peer)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                outstanding.remove(id);
            }
            ids
        };

        for request_id in failed {
            tracing::warn!("failing request {request_id}: {peer} disconnected");
            self.requests.fail(request_id);
        }
    }

    /// Executes one protocol command on the dispatch context.
    pub fn handle_command(&self, command: Command) {
        self.stats.handled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("handle {} from {}", command.payload.name(), command.from);

        let Command { from, payload } = command;
        match payload {
            SessionCommand::GenIds { request_id, range } => {
                self.cmd_gen_ids(from, request_id, range);
            }
            SessionCommand::GenIdsReply { request_id, first_id } => {
                self.serve(request_id, Reply::Id(first_id));
            }
            SessionCommand::SetIdMaster { start, range, master } => {
                self.directory
                    .add(MasterRecord { start, end: start + range, master });
            }
            SessionCommand::GetIdMaster { request_id, id } => {
                self.cmd_get_id_master(from, request_id, id);
            }
            SessionCommand::GetIdMasterReply { request_id, start, end, master } => {
                if start != 0 {
                    self.directory.add(MasterRecord { start, end, master });
                }
                // else: not found, cache nothing
                self.serve(request_id, Reply::None);
            }
            SessionCommand::AttachObject { request_id, object_id } => {
                self.cmd_attach_object(request_id, object_id);
            }
            SessionCommand::DetachObject { request_id, object_id, instance_id } => {
                self.cmd_detach_object(request_id, object_id, instance_id);
            }
            SessionCommand::MapObject { request_id } => {
                self.cmd_map_object(request_id);
            }
            SessionCommand::SubscribeObject { request_id, object_id, instance_id } => {
                self.cmd_subscribe_object(from, request_id, object_id, instance_id);
            }
            SessionCommand::SubscribeSuccess {
                request_id,
                object_id,
                instance_id,
                change_type,
                master_instance_id,
                instance_data,
            } => {
                self.cmd_subscribe_success(
                    request_id,
                    object_id,
                    instance_id,
                    change_type,
                    master_instance_id,
                    instance_data,
                );
            }
            SessionCommand::SubscribeReply { request_id, result } => {
                self.serve(request_id, Reply::Flag(result));
            }
            SessionCommand::UnsubscribeObject {
                request_id,
                object_id,
                master_instance_id,
                slave_instance_id,
            } => {
                self.cmd_unsubscribe_object(
                    from,
                    request_id,
                    object_id,
                    master_instance_id,
                    slave_instance_id,
                );
            }
            SessionCommand::Object(object_command) => {
                self.cmd_object(from, object_command);
            }
        }
    }

    // ------------------------------------------------------------------
    // command handlers
    // ------------------------------------------------------------------

    fn cmd_gen_ids(&self, from: NodeId, request_id: RequestId, range: u32) {
        debug_assert!(self.is_master, "GenIds sent to a non-master session");

        let first_id = self.master_pool.lock().gen_ids(range);
        if first_id == ID_INVALID {
            tracing::warn!("master pool exhausted serving {range} ids for {from}");
        }
        self.send_reply(from, SessionCommand::GenIdsReply { request_id, first_id });
    }

    fn cmd_get_id_master(&self, from: NodeId, request_id: RequestId, id: Identifier) {
        let reply = match self.directory.find(id) {
            Some(record) => SessionCommand::GetIdMasterReply {
                request_id,
                start: record.start,
                end: record.end,
                master: record.master,
            },
            None => SessionCommand::GetIdMasterReply {
                request_id,
                start: 0,
                end: 0,
                master: NodeId::ZERO,
            },
        };
        self.send_reply(from, reply);
    }

    fn cmd_attach_object(&self, request_id: RequestId, object_id: Identifier) {
        match self.requests.request_data(request_id) {
            Some(RequestData::Attach(object)) => {
                self.attach_direct(&object, object_id);
                self.serve(request_id, Reply::None);
            }
            _ => {
                debug_assert!(false, "attach marshal without request data");
                tracing::error!("attach command {request_id} carries no object");
            }
        }
    }

    fn cmd_detach_object(&self, request_id: RequestId, object_id: Identifier, instance_id: Identifier) {
        if let Some(object) = self.registry.instance(object_id, instance_id) {
            self.detach_direct(&object);
        }
        if request_id != 0 {
            self.serve(request_id, Reply::None);
        }
    }

    fn cmd_map_object(&self, request_id: RequestId) {
        let Some(RequestData::Map { object, object_id, master }) =
            self.requests.request_data(request_id)
        else {
            debug_assert!(false, "map marshal without request data");
            tracing::error!("map command {request_id} carries no object");
            self.requests.fail(request_id);
            return;
        };

        if !object.is_master() {
            // Slave instantiation: reserve the instance identifier and
            // subscribe at the master node first.
            let instance_id = self.next_instance_id();
            self.outstanding.lock().insert(request_id, master);
            if let Err(err) = self.local.send(
                master,
                SessionCommand::SubscribeObject { request_id, object_id, instance_id },
            ) {
                tracing::warn!("subscribe for object id {object_id} failed: {err}");
                self.serve(request_id, Reply::Flag(false));
            }
            return;
        }

        self.attach_direct(&object, object_id);
        self.serve(request_id, Reply::Flag(true));
    }

    fn cmd_subscribe_object(
        &self,
        from: NodeId,
        request_id: RequestId,
        object_id: Identifier,
        instance_id: Identifier,
    ) {
        if let Some(master_object) = self.registry.master_instance(object_id) {
            self.send_reply(
                from,
                SessionCommand::SubscribeSuccess {
                    request_id,
                    object_id,
                    instance_id,
                    change_type: master_object.change_type(),
                    master_instance_id: master_object.instance_id(),
                    instance_data: master_object.instance_data(),
                },
            );

            master_object.binding().add_slave(from, instance_id);
            self.stats.subscribes_served.fetch_add(1, Ordering::Relaxed);

            self.send_reply(from, SessionCommand::SubscribeReply { request_id, result: true });
            return;
        }

        tracing::warn!("can't find master object for subscribe to id {object_id}");
        self.send_reply(from, SessionCommand::SubscribeReply { request_id, result: false });
    }

    fn cmd_subscribe_success(
        &self,
        request_id: RequestId,
        object_id: Identifier,
        instance_id: Identifier,
        change_type: ChangeType,
        master_instance_id: Identifier,
        instance_data: Vec<u8>,
    ) {
        let Some(RequestData::Map { object, object_id: requested_id, .. }) =
            self.requests.request_data(request_id)
        else {
            tracing::error!("subscribe success for unknown request {request_id}");
            return;
        };
        debug_assert_eq!(object_id, requested_id);
        debug_assert_eq!(
            change_type,
            object.change_type(),
            "all instances of one identifier share the replicated change-type"
        );

        object.binding().setup_slave(master_instance_id);
        object.binding().stash_map_data(instance_data);

        // Not attach_object: the instance identifier was already reserved
        // by the map handler and echoed through the handshake.
        object.binding().attach(object_id, instance_id);
        self.registry.insert(object_id, Arc::clone(&object));
        self.redispatch_held();

        tracing::debug!("subscribed object id {object_id}.{instance_id}");
    }

    fn cmd_unsubscribe_object(
        &self,
        from: NodeId,
        request_id: RequestId,
        object_id: Identifier,
        master_instance_id: Identifier,
        slave_instance_id: Identifier,
    ) {
        if let Some(master_object) = self.registry.instance(object_id, master_instance_id) {
            if master_object.is_master() {
                master_object.binding().remove_slave(from);
            }
        }

        // The slave detaches on its own node; its blocked unmap call is
        // served there once the detach ran.
        self.send_reply(
            from,
            SessionCommand::DetachObject {
                request_id,
                object_id,
                instance_id: slave_instance_id,
            },
        );
    }

    fn cmd_object(&self, from: NodeId, command: ObjectCommand) {
        if !self.registry.contains(command.object_id) {
            // Attach may be racing with arrival: hold, never drop.
            tracing::trace!("no object attached for id {}, holding command", command.object_id);
            self.local
                .hold_command(Command { from, payload: SessionCommand::Object(command) });
            return;
        }

        match self.invoke_object_command(&command) {
            CommandOutcome::Handled | CommandOutcome::Discard => {}
            CommandOutcome::Error => {
                self.stats.invoke_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "error handling command {} for object id {}",
                    command.opcode,
                    command.object_id
                );
            }
        }
    }

    /// Offers an object command to the attached instances in
    /// registration order.
    ///
    /// A wildcard instance identifier reaches every instance until one
    /// discards; an instance-addressed command stops at its target.
    fn invoke_object_command(&self, command: &ObjectCommand) -> CommandOutcome {
        let instances = self.registry.instances(command.object_id);
        debug_assert!(!instances.is_empty(), "dispatch checked the registry entry");

        for object in &instances {
            if command.instance_id == ID_ANY || command.instance_id == object.instance_id() {
                match object.invoke(command) {
                    CommandOutcome::Discard => return CommandOutcome::Discard,
                    CommandOutcome::Error => return CommandOutcome::Error,
                    CommandOutcome::Handled => {
                        if command.instance_id == object.instance_id() {
                            return CommandOutcome::Handled;
                        }
                    }
                }
            }
        }

        if command.instance_id == ID_ANY {
            return CommandOutcome::Handled;
        }
        tracing::warn!(
            "instance {} not found for object id {}",
            command.instance_id,
            command.object_id
        );
        CommandOutcome::Error
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn attach_direct(&self, object: &Arc<dyn SharedObject>, id: Identifier) {
        let instance_id = self.next_instance_id();
        object.binding().attach(id, instance_id);
        self.registry.insert(id, Arc::clone(object));

        // Commands may have arrived before this attach.
        self.redispatch_held();
        tracing::debug!("attached object {id}.{instance_id}");
    }

    fn detach_direct(&self, object: &Arc<dyn SharedObject>) {
        let id = object.id();
        debug_assert_ne!(id, ID_INVALID, "detach of an object that was never attached");

        let was_master = object.is_master();
        if !self.registry.remove(id, object) {
            tracing::warn!("detach: object not registered under id {id}");
            return;
        }

        object.binding().clear();
        if was_master {
            object.binding().reset_replication();
        }
        tracing::debug!("detached object from id {id}");
    }

    fn next_instance_id(&self) -> Identifier {
        self.instance_ids.fetch_add(1, Ordering::Relaxed) % IdPool::MAX_CAPACITY
    }

    /// Registers the request's remote target and ships the command;
    /// failures fail the request immediately so the caller's wait
    /// returns instead of hanging.
    fn send_tracked(&self, to: NodeId, request_id: RequestId, payload: SessionCommand) {
        self.outstanding.lock().insert(request_id, to);
        if let Err(err) = self.local.send(to, payload) {
            tracing::warn!("request {request_id} to {to} not sent: {err}");
            self.requests.fail(request_id);
        }
    }

    /// Ships a reply command, logging delivery failures.
    fn send_reply(&self, to: NodeId, payload: SessionCommand) {
        if let Err(err) = self.local.send(to, payload) {
            tracing::error!("reply to {to} not sent: {err}");
        }
    }

    /// Serves a pending request, logging late or unknown correlations.
    fn serve(&self, request_id: RequestId, reply: Reply) {
        if !self.requests.serve(request_id, reply) {
            tracing::warn!("reply for unknown request {request_id}");
        }
    }

    /// Blocks until the request is served.
    ///
    /// On the dispatch context this pumps the command queue while
    /// polling - the served reply may only ever arrive through the
    /// waiting thread itself. Anywhere else it parks on the request's
    /// condition variable.
    fn wait_request(&self, request_id: RequestId) -> Reply {
        let reply = if self.local.in_dispatch_thread() {
            loop {
                if let Some(reply) = self.requests.try_take(request_id) {
                    break reply;
                }
                if !self.running.load(Ordering::Relaxed) {
                    break Reply::Failed;
                }
                // Process at most one queued command, then re-check.
                if let Some(command) = self.local.recv_timeout(self.config.poll_interval) {
                    self.handle_command(command);
                }
            }
        } else {
            self.requests.wait(request_id)
        };

        self.outstanding.lock().remove(&request_id);
        reply
    }

    fn redispatch_held(&self) {
        for command in self.local.take_held() {
            self.handle_command(command);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let attached = self.registry.attached_ids();
        if !attached.is_empty() {
            tracing::warn!(
                "session {}: {} identifiers still have attached objects at teardown",
                self.id,
                attached.len()
            );
        }
    }
}
