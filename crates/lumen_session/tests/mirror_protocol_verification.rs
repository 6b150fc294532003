//! # Mirror Protocol Verification Tests
//!
//! End-to-end verification of a two-node session cluster:
//!
//! 1. **Replication**: register/map handshake delivers the master snapshot
//! 2. **Identifiers**: block fetch, local caching, cluster-wide disjointness
//! 3. **Directory**: one round trip caches a whole delegation range
//! 4. **Routing**: wildcard fan-out and pre-attach command buffering
//! 5. **Teardown**: unmap, deregister and disconnect leave no hung caller
//!
//! Run with: cargo test --test mirror_protocol_verification

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use lumen_session::{
    ChangeType, CommandOutcome, LocalNode, NodeId, ObjectBinding, ObjectCommand, Session,
    SessionCommand, SessionConfig, SharedObject, ID_ANY, ID_INVALID,
};

// ============================================================================
// TEST HARNESS
// ============================================================================

const SESSION_ID: u32 = 1;
const MASTER_NODE: NodeId = NodeId(1);
const RENDER_NODE: NodeId = NodeId(2);

/// A two-node cluster: the session master plus one render node, each with
/// its own dispatch thread.
struct Cluster {
    master: Arc<Session>,
    render: Arc<Session>,
    threads: Vec<JoinHandle<()>>,
}

impl Cluster {
    fn start() -> Self {
        let master_node = LocalNode::new(MASTER_NODE);
        let render_node = LocalNode::new(RENDER_NODE);
        LocalNode::link(&master_node, &render_node);

        let master = Arc::new(Session::new(
            SessionConfig::default(),
            SESSION_ID,
            master_node,
            MASTER_NODE,
            true,
        ));
        let render = Arc::new(Session::new(
            SessionConfig::default(),
            SESSION_ID,
            render_node,
            MASTER_NODE,
            false,
        ));

        let threads = vec![
            Session::spawn_dispatch(Arc::clone(&master)),
            Session::spawn_dispatch(Arc::clone(&render)),
        ];
        Self { master, render, threads }
    }

    fn stop(self) {
        self.master.shutdown();
        self.render.shutdown();
        for thread in self.threads {
            thread.join().expect("dispatch thread panicked");
        }
    }
}

/// Spins until `condition` holds, or panics after five seconds.
fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A shared byte blob. Opcode `OP_SET` replaces the content.
struct Blob {
    binding: ObjectBinding,
    content: Mutex<Vec<u8>>,
    invoked: AtomicUsize,
}

const OP_SET: u16 = 7;

impl Blob {
    fn new(content: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            binding: ObjectBinding::new(),
            content: Mutex::new(content.to_vec()),
            invoked: AtomicUsize::new(0),
        })
    }

    fn as_object(self: &Arc<Self>) -> Arc<dyn SharedObject> {
        Arc::clone(self) as Arc<dyn SharedObject>
    }

    fn content(&self) -> Vec<u8> {
        self.content.lock().clone()
    }

    fn invoked(&self) -> usize {
        self.invoked.load(Ordering::Relaxed)
    }
}

impl SharedObject for Blob {
    fn binding(&self) -> &ObjectBinding {
        &self.binding
    }

    fn change_type(&self) -> ChangeType {
        ChangeType::Instance
    }

    fn instance_data(&self) -> Vec<u8> {
        self.content()
    }

    fn apply_instance_data(&self, data: &[u8]) {
        *self.content.lock() = data.to_vec();
    }

    fn invoke(&self, command: &ObjectCommand) -> CommandOutcome {
        self.invoked.fetch_add(1, Ordering::Relaxed);
        if command.opcode == OP_SET {
            *self.content.lock() = command.payload.clone();
        }
        CommandOutcome::Handled
    }
}

// ============================================================================
// MISSION 1: REPLICATION HANDSHAKE
// ============================================================================

#[test]
fn verify_map_applies_master_snapshot() {
    let cluster = Cluster::start();

    let master_blob = Blob::new(b"frustum culling tables");
    assert!(cluster.master.register_object(&master_blob.as_object()));
    let id = master_blob.binding.id();
    assert_ne!(id, ID_INVALID);
    assert!(master_blob.binding.is_master());

    // The slave starts empty and must return fully initialized
    let slave_blob = Blob::new(b"");
    assert!(cluster.render.map_object(&slave_blob.as_object(), id));

    assert_eq!(slave_blob.content(), b"frustum culling tables");
    assert_eq!(slave_blob.binding.id(), id);
    assert!(!slave_blob.binding.is_master());
    assert_eq!(
        slave_blob.binding.master_instance_id(),
        master_blob.binding.instance_id()
    );
    assert_eq!(
        master_blob.binding.slaves(),
        vec![(RENDER_NODE, slave_blob.binding.instance_id())]
    );
    assert_eq!(cluster.master.stats().subscribes_served(), 1);

    cluster.stop();
}

#[test]
fn verify_map_fails_cleanly_without_master_record() {
    let cluster = Cluster::start();

    let blob = Blob::new(b"");
    assert!(!cluster.render.map_object(&blob.as_object(), 99_999));

    // No side effects on failure
    assert_eq!(blob.binding.id(), ID_INVALID);
    assert!(cluster.render.registry().is_empty());

    cluster.stop();
}

#[test]
fn verify_subscribe_to_missing_master_object_is_refused() {
    let cluster = Cluster::start();

    // The range is delegated but no master instance is attached
    cluster.master.set_id_master(700, 1, MASTER_NODE);

    let blob = Blob::new(b"");
    assert!(!cluster.render.map_object(&blob.as_object(), 700));
    assert_eq!(blob.binding.id(), ID_INVALID);

    cluster.stop();
}

// ============================================================================
// MISSION 2: IDENTIFIER ALLOCATION
// ============================================================================

#[test]
fn verify_slave_allocation_caches_the_fetched_block() {
    let cluster = Cluster::start();

    let first = cluster.render.gen_ids(1);
    assert_ne!(first, ID_INVALID);
    assert_eq!(cluster.render.stats().id_fetches(), 1);

    // The surplus of the fetched block serves the next allocations
    // without another round trip
    let second = cluster.render.gen_ids(100);
    assert_ne!(second, ID_INVALID);
    assert_ne!(second, first);
    assert_eq!(cluster.render.stats().id_fetches(), 1);

    assert_eq!(cluster.render.gen_ids(0), ID_INVALID);

    cluster.stop();
}

#[test]
fn verify_identifier_blocks_are_disjoint_across_nodes() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let cluster = Cluster::start();

    fn allocate(session: &Arc<Session>, seed: u64) -> Vec<(u32, u32)> {
        let session = Arc::clone(session);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut blocks = Vec::new();
        for _ in 0..50 {
            let range = rng.gen_range(1..=64);
            let start = session.gen_ids(range);
            assert_ne!(start, ID_INVALID);
            blocks.push((start, range));
        }
        blocks
    }

    let master = Arc::clone(&cluster.master);
    let render = Arc::clone(&cluster.render);
    let master_thread = std::thread::spawn(move || allocate(&master, 11));
    let render_thread = std::thread::spawn(move || allocate(&render, 23));

    let mut blocks = master_thread.join().expect("master allocator panicked");
    blocks.extend(render_thread.join().expect("render allocator panicked"));

    blocks.sort_unstable();
    for pair in blocks.windows(2) {
        let (start, range) = pair[0];
        assert!(
            start + range <= pair[1].0,
            "blocks overlap: {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }

    cluster.stop();
}

// ============================================================================
// MISSION 3: MASTER DIRECTORY
// ============================================================================

#[test]
fn verify_directory_query_caches_the_whole_range() {
    let cluster = Cluster::start();

    cluster.master.set_id_master(500, 10, MASTER_NODE);

    assert_eq!(cluster.render.get_id_master(505), MASTER_NODE);
    assert_eq!(cluster.render.stats().master_queries(), 1);

    // A second identifier of the same range resolves locally
    assert_eq!(cluster.render.get_id_master(509), MASTER_NODE);
    assert_eq!(cluster.render.stats().master_queries(), 1);
    assert_eq!(cluster.render.poll_id_master(505), MASTER_NODE);

    cluster.stop();
}

#[test]
fn verify_slave_declaration_reaches_the_session_master() {
    let cluster = Cluster::start();

    cluster.render.set_id_master(300, 5, RENDER_NODE);
    wait_until("declaration forwarded", || {
        cluster.master.poll_id_master(302) == RENDER_NODE
    });

    cluster.stop();
}

// ============================================================================
// MISSION 4: COMMAND ROUTING
// ============================================================================

#[test]
fn verify_wildcard_command_reaches_every_instance() {
    let cluster = Cluster::start();

    let master_blob = Blob::new(b"v1");
    assert!(cluster.master.register_object(&master_blob.as_object()));
    let id = master_blob.binding.id();

    let first = Blob::new(b"");
    let second = Blob::new(b"");
    assert!(cluster.render.map_object(&first.as_object(), id));
    assert!(cluster.render.map_object(&second.as_object(), id));

    cluster
        .master
        .local()
        .send(
            RENDER_NODE,
            SessionCommand::Object(ObjectCommand {
                object_id: id,
                instance_id: ID_ANY,
                opcode: OP_SET,
                payload: b"v2".to_vec(),
            }),
        )
        .expect("send to render node");

    wait_until("both instances invoked", || {
        first.invoked() == 1 && second.invoked() == 1
    });
    assert_eq!(first.content(), b"v2");
    assert_eq!(second.content(), b"v2");

    cluster.stop();
}

#[test]
fn verify_command_before_attach_is_held_then_delivered() {
    let cluster = Cluster::start();

    cluster
        .render
        .local()
        .send(
            RENDER_NODE,
            SessionCommand::Object(ObjectCommand {
                object_id: 4242,
                instance_id: ID_ANY,
                opcode: OP_SET,
                payload: b"early".to_vec(),
            }),
        )
        .expect("loopback send");
    wait_until("command buffered", || {
        cluster.render.local().stats().buffered() == 1
    });

    // Attaching re-dispatches the held command before returning
    let blob = Blob::new(b"");
    cluster.render.attach_object(&blob.as_object(), 4242);

    assert_eq!(blob.invoked(), 1);
    assert_eq!(blob.content(), b"early");
    assert_eq!(cluster.render.local().stats().redispatched(), 1);
    assert_eq!(cluster.render.local().held_len(), 0);

    cluster.stop();
}

// ============================================================================
// MISSION 5: TEARDOWN
// ============================================================================

#[test]
fn verify_unmap_slave_unsubscribes_at_the_master() {
    let cluster = Cluster::start();

    let master_blob = Blob::new(b"payload");
    assert!(cluster.master.register_object(&master_blob.as_object()));
    let id = master_blob.binding.id();

    let slave_blob = Blob::new(b"");
    assert!(cluster.render.map_object(&slave_blob.as_object(), id));

    cluster.render.unmap_object(&slave_blob.as_object());

    assert!(!slave_blob.binding.is_attached());
    assert!(cluster.render.registry().is_empty());
    // The slave keeps its replication record after unmapping
    assert_eq!(
        slave_blob.binding.master_instance_id(),
        master_blob.binding.instance_id()
    );
    assert!(master_blob.binding.slaves().is_empty());

    cluster.stop();
}

#[test]
fn verify_deregister_erases_the_registry_entry() {
    let cluster = Cluster::start();

    let blob = Blob::new(b"transient");
    assert!(cluster.master.register_object(&blob.as_object()));
    assert!(!cluster.master.registry().is_empty());

    cluster.master.deregister_object(&blob.as_object());

    assert!(cluster.master.registry().is_empty());
    assert_eq!(blob.binding.id(), ID_INVALID);
    assert!(!blob.binding.is_master());

    cluster.stop();
}

#[test]
fn verify_disconnect_fails_blocked_callers() {
    // The session master node exists but never dispatches, so the render
    // node's fetch would block forever without the disconnect fail-out.
    let master_node = LocalNode::new(MASTER_NODE);
    let render_node = LocalNode::new(RENDER_NODE);
    LocalNode::link(&master_node, &render_node);

    let render = Arc::new(Session::new(
        SessionConfig::default(),
        SESSION_ID,
        render_node,
        MASTER_NODE,
        false,
    ));
    let dispatch = Session::spawn_dispatch(Arc::clone(&render));

    let blocked = Arc::clone(&render);
    let caller = std::thread::spawn(move || blocked.gen_ids(1));

    std::thread::sleep(Duration::from_millis(50));
    render.handle_disconnect(MASTER_NODE);

    assert_eq!(caller.join().expect("caller panicked"), ID_INVALID);

    render.shutdown();
    dispatch.join().expect("dispatch thread panicked");
}

#[test]
fn verify_reentrant_wait_pumps_the_own_queue() {
    // The test thread itself acts as the render node's dispatch context:
    // its blocking fetch must process the reply on its own thread.
    let master_node = LocalNode::new(MASTER_NODE);
    let render_node = LocalNode::new(RENDER_NODE);
    LocalNode::link(&master_node, &render_node);

    let master = Arc::new(Session::new(
        SessionConfig::default(),
        SESSION_ID,
        master_node,
        MASTER_NODE,
        true,
    ));
    let dispatch = Session::spawn_dispatch(Arc::clone(&master));

    let render = Session::new(
        SessionConfig::default(),
        SESSION_ID,
        Arc::clone(&render_node),
        MASTER_NODE,
        false,
    );
    render_node.enter_dispatch();

    let id = render.gen_ids(1);
    assert_ne!(id, ID_INVALID);
    assert_eq!(render.stats().id_fetches(), 1);

    master.shutdown();
    dispatch.join().expect("dispatch thread panicked");
}
