//! The cluster node: owns the three workers and exposes the node-visible
//! surface (membership queries, sends, barriers, service groups, events).
//!
//! The bootstrap hands in already-bound datagram sockets via
//! [`ClusterNode::pass_socket`]; [`ClusterNode::start`] then begins the
//! join-or-form ladder. One comms worker reads endpoints and drains queued
//! sends, one membership worker drives the protocol state machine, and one
//! service daemon runs service-group callbacks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::warn;

use conclave_core::hash::cluster_id_hash;
use conclave_core::messages::service::SgMessage;
use conclave_core::types::{LeaveReason, ReconfigParam};
use conclave_core::wire::MsgFlags;
use conclave_core::{PORT_MEMBERSHIP, PORT_SERVICES};

use crate::barrier::{self, BarrierAttr, BarrierFlags, BarrierRegistry};
use crate::comms::{
    Comms, CommsHooks, Delivery, EndpointRole, EndpointSet, Gate, PortTable, QueuedMessage,
    TempNodeIds,
};
use crate::config::NodeConfig;
use crate::error::{ClusterError, WaitOutcome};
use crate::events::ClusterEvent;
use crate::membership::node_table::{ClusterView, Node, NodeStore};
use crate::membership::{MemInput, MembershipWorker};
use crate::service::{daemon, ServiceEngine, ServiceOps, SgInput};

/// Channel halves the membership worker consumes once the first endpoint
/// fixes the address length.
struct PendingWorker {
    mem_rx: mpsc::UnboundedReceiver<MemInput>,
    gate_tx: watch::Sender<Gate>,
    left_tx: watch::Sender<Option<LeaveReason>>,
}

/// A running (or starting) cluster node.
pub struct ClusterNode {
    config: Arc<NodeConfig>,
    store: Arc<NodeStore>,
    endpoints: Arc<EndpointSet>,
    comms: Arc<Comms>,
    barriers: Arc<BarrierRegistry>,
    engine: Arc<ServiceEngine>,
    mem_tx: mpsc::UnboundedSender<MemInput>,
    sg_tx: mpsc::UnboundedSender<SgInput>,
    events_tx: broadcast::Sender<ClusterEvent>,
    left_rx: watch::Receiver<Option<LeaveReason>>,
    pending: Mutex<Option<PendingWorker>>,
}

impl ClusterNode {
    /// Builds a node. No traffic flows until sockets are passed in and
    /// [`Self::start`] is called. Must run inside a tokio runtime: the
    /// service daemon and hook pumps are spawned here.
    #[must_use]
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let store = Arc::new(NodeStore::new(config.two_node));
        let endpoints = Arc::new(EndpointSet::new());
        let ports = Arc::new(PortTable::new());
        let temp_ids = Arc::new(TempNodeIds::new());
        let barriers = Arc::new(BarrierRegistry::new());
        let engine = Arc::new(ServiceEngine::new(Arc::clone(&store)));

        let (gate_tx, gate_rx) = watch::channel(Gate::default());
        let (events_tx, _) = broadcast::channel(64);
        let (mem_tx, mem_rx) = mpsc::unbounded_channel();
        let (sg_tx, sg_rx) = mpsc::unbounded_channel();
        let (left_tx, left_rx) = watch::channel(None);

        let (died_tx, mut died_rx) = mpsc::unbounded_channel();
        let (barrier_tx, mut barrier_rx) = mpsc::unbounded_channel();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

        let (comms, queue_rx) = Comms::new(
            Arc::clone(&endpoints),
            Arc::clone(&ports),
            Arc::clone(&temp_ids),
            Arc::clone(&store),
            cluster_id_hash(&config.cluster_name),
            gate_rx,
            CommsHooks {
                node_died: died_tx,
                barrier: barrier_tx,
                fatal: fatal_tx,
            },
            Duration::from_secs(1),
        );

        // Reserved ports feed the protocol engines directly.
        {
            let mem_tx = mem_tx.clone();
            ports
                .bind_callback(PORT_MEMBERSHIP, move |src, payload| {
                    let _ = mem_tx.send(MemInput::Message {
                        src,
                        raw: payload.clone(),
                    });
                })
                .expect("membership port free at construction");
        }
        {
            let sg_tx = sg_tx.clone();
            ports
                .bind_callback(PORT_SERVICES, move |src, payload| {
                    let mut cursor = &payload[..];
                    match SgMessage::decode(&mut cursor) {
                        Ok(msg) => {
                            let _ = sg_tx.send(SgInput::Message { src, msg });
                        }
                        Err(err) => warn!(?err, src, "undecodable service message"),
                    }
                })
                .expect("services port free at construction");
        }

        // Service daemon, queued-send drain, and the hook pumps.
        tokio::spawn(daemon::run(
            Arc::clone(&engine),
            Arc::clone(&comms),
            Arc::clone(&barriers),
            sg_tx.clone(),
            sg_rx,
        ));
        tokio::spawn(Arc::clone(&comms).run_send_queue(queue_rx));
        {
            let mem_tx = mem_tx.clone();
            tokio::spawn(async move {
                while let Some(node_id) = died_rx.recv().await {
                    let _ = mem_tx.send(MemInput::NodeDied(node_id));
                }
            });
        }
        {
            let barriers = Arc::clone(&barriers);
            let comms = Arc::clone(&comms);
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                while let Some((_src, msg)) = barrier_rx.recv().await {
                    let effects = barriers.on_control(&msg, store.member_count());
                    barrier::run_effects(&barriers, &comms, effects).await;
                }
            });
        }
        {
            let mem_tx = mem_tx.clone();
            tokio::spawn(async move {
                if fatal_rx.recv().await.is_some() {
                    warn!("fatal condition reported, panic-leaving the cluster");
                    let _ = mem_tx.send(MemInput::Leave(LeaveReason::PANIC | LeaveReason::FORCE));
                }
            });
        }

        Arc::new(Self {
            config,
            store,
            endpoints,
            comms,
            barriers,
            engine,
            mem_tx,
            sg_tx,
            events_tx,
            left_rx,
            pending: Mutex::new(Some(PendingWorker {
                mem_rx,
                gate_tx,
                left_tx,
            })),
        })
    }

    /// Hands a bound datagram socket to the endpoint set and starts reading
    /// from it. `mcast_target` is where cluster-wide sends go for a `Send`
    /// endpoint (a multicast group, a broadcast address, or a peer).
    pub fn pass_socket(
        &self,
        role: EndpointRole,
        number: u32,
        socket: Arc<UdpSocket>,
        mcast_target: Option<SocketAddr>,
    ) -> Result<(), ClusterError> {
        self.endpoints
            .add_endpoint(role, number, Arc::clone(&socket), mcast_target)?;
        tokio::spawn(Arc::clone(&self.comms).run_reader(socket));
        Ok(())
    }

    /// Begins the join-or-form ladder. Requires at least one endpoint.
    pub fn start(&self) -> Result<(), ClusterError> {
        let Some(address_length) = self.endpoints.address_length() else {
            return Err(ClusterError::NotConnected);
        };
        let Some(pending) = self.pending.lock().take() else {
            return Ok(()); // already started
        };
        self.store.ensure_us(
            &self.config.node_name,
            self.endpoints.local_addresses(),
            self.config.votes,
            self.config.expected_votes,
        );
        let worker = MembershipWorker {
            config: Arc::clone(&self.config),
            comms: Arc::clone(&self.comms),
            barriers: Arc::clone(&self.barriers),
            gate_tx: pending.gate_tx,
            events_tx: self.events_tx.clone(),
            sg_tx: self.sg_tx.clone(),
            self_tx: self.mem_tx.clone(),
            left_tx: pending.left_tx,
            address_length,
        };
        tokio::spawn(worker.run(pending.mem_rx));
        self.mem_tx
            .send(MemInput::Start)
            .map_err(|_| ClusterError::NotConnected)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Membership surface
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn is_quorate(&self) -> bool {
        self.store.quorate()
    }

    /// Whether this node currently is a full cluster member.
    #[must_use]
    pub fn is_member(&self) -> bool {
        self.store
            .us()
            .is_some_and(|n| n.state == conclave_core::types::NodeState::Member)
    }

    /// The latest committed cluster view.
    #[must_use]
    pub fn view(&self) -> Arc<ClusterView> {
        self.store.view()
    }

    /// Every node record, including dead ones.
    #[must_use]
    pub fn all_nodes(&self) -> Vec<Node> {
        self.store.all()
    }

    #[must_use]
    pub fn node_by_id(&self, node_id: i32) -> Option<Node> {
        self.store.by_id(node_id)
    }

    #[must_use]
    pub fn node_by_name(&self, name: &str) -> Option<Node> {
        self.store.by_name(name)
    }

    /// The protocol version triple.
    #[must_use]
    pub fn version(&self) -> (u32, u32, u32) {
        (
            conclave_core::PROTOCOL_MAJOR_VERSION,
            conclave_core::PROTOCOL_MINOR_VERSION,
            conclave_core::PROTOCOL_PATCH_VERSION,
        )
    }

    /// Leaves the cluster and resolves when the departure is final.
    pub async fn leave_cluster(&self, reason: LeaveReason) -> Result<(), ClusterError> {
        self.mem_tx
            .send(MemInput::Leave(reason))
            .map_err(|_| ClusterError::NotConnected)?;
        let mut left_rx = self.left_rx.clone();
        loop {
            if left_rx.borrow_and_update().is_some() {
                return Ok(());
            }
            if left_rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Forces another node out of the cluster.
    pub fn kill_node(&self, node_id: i32) -> Result<(), ClusterError> {
        self.mem_tx
            .send(MemInput::Kill(node_id))
            .map_err(|_| ClusterError::NotConnected)
    }

    /// Changes this node's votes cluster-wide.
    pub fn set_votes(&self, votes: u32) -> Result<(), ClusterError> {
        self.mem_tx
            .send(MemInput::Reconfigure(ReconfigParam::NodeVotes, votes))
            .map_err(|_| ClusterError::NotConnected)
    }

    /// Changes the expected-votes parameter cluster-wide.
    pub fn set_expected_votes(&self, expected: u32) -> Result<(), ClusterError> {
        self.mem_tx
            .send(MemInput::Reconfigure(ReconfigParam::ExpectedVotes, expected))
            .map_err(|_| ClusterError::NotConnected)
    }

    /// Subscribes to cluster events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Datagram surface
    // -----------------------------------------------------------------------

    /// Binds a user port, returning its delivery queue.
    pub fn bind(&self, port: u8, capacity: usize) -> Result<mpsc::Receiver<Delivery>, ClusterError> {
        self.comms.ports.bind_queue(port, capacity)
    }

    /// Closes a local port, waking remote waiters via PORTCLOSED.
    pub async fn close_port(&self, port: u8) {
        self.comms.close_port(port).await;
    }

    /// Sends a datagram to `target` (0 = multicast) from `port`. With
    /// `QUEUE` the message is appended to the comms worker's FIFO and sent
    /// when the ACK window is free.
    pub async fn send(
        &self,
        target: i32,
        port: u8,
        flags: MsgFlags,
        payload: &[u8],
    ) -> Result<(), ClusterError> {
        if flags.contains(MsgFlags::QUEUE) {
            self.comms.send_or_queue(QueuedMessage {
                target,
                port,
                flags: flags & !MsgFlags::QUEUE,
                payload: payload.to_vec(),
            });
            return Ok(());
        }
        self.comms.send_message(target, port, flags, payload).await
    }

    /// Asks a peer whether anything listens on `port` there.
    pub async fn is_listening(&self, node_id: i32, port: u8) -> Result<bool, ClusterError> {
        self.comms
            .is_listening(node_id, port, Duration::from_secs(5))
            .await
    }

    // -----------------------------------------------------------------------
    // Barrier surface
    // -----------------------------------------------------------------------

    pub fn barrier_register(
        &self,
        name: &str,
        flags: BarrierFlags,
        nodes: u32,
    ) -> Result<(), ClusterError> {
        self.barriers.register(name, flags, nodes)
    }

    pub fn barrier_setattr(&self, name: &str, attr: BarrierAttr) -> Result<(), ClusterError> {
        let effects = self
            .barriers
            .setattr(name, attr, self.store.member_count())?;
        let barriers = Arc::clone(&self.barriers);
        let comms = Arc::clone(&self.comms);
        tokio::spawn(async move {
            barrier::run_effects(&barriers, &comms, effects).await;
        });
        Ok(())
    }

    /// Enables the barrier and blocks until it resolves.
    pub async fn barrier_wait(&self, name: &str) -> Result<WaitOutcome, ClusterError> {
        let (effects, result_rx) = self
            .barriers
            .wait_begin(name, self.store.member_count())?;
        barrier::run_effects(&self.barriers, &self.comms, effects).await;
        Ok(barrier::wait_result(result_rx).await)
    }

    pub fn barrier_delete(&self, name: &str) -> Result<(), ClusterError> {
        self.barriers.cancel(name)
    }

    // -----------------------------------------------------------------------
    // Service-group surface
    // -----------------------------------------------------------------------

    pub fn service_register(
        &self,
        name: &str,
        level: u8,
        unique: bool,
        ops: Arc<dyn ServiceOps>,
    ) -> Result<u32, ClusterError> {
        self.engine.register(name, level, unique, ops)
    }

    pub fn service_unregister(&self, local_id: u32) -> Result<(), ClusterError> {
        self.engine.unregister(local_id)
    }

    /// Joins a registered service group; resolves when the join has
    /// committed cluster-wide.
    pub async fn service_join(&self, local_id: u32) -> Result<(), ClusterError> {
        let (rx, effects) = self.engine.begin_join(local_id)?;
        self.sg_tx
            .send(SgInput::Effects(effects))
            .map_err(|_| ClusterError::NotConnected)?;
        rx.await.map_err(|_| ClusterError::Interrupted)?
    }

    /// Leaves a service group; resolves when the group has let go of us.
    pub async fn service_leave(&self, local_id: u32) -> Result<(), ClusterError> {
        let (rx, effects) = self.engine.begin_leave(local_id)?;
        self.sg_tx
            .send(SgInput::Effects(effects))
            .map_err(|_| ClusterError::NotConnected)?;
        rx.await.map_err(|_| ClusterError::Interrupted)?
    }

    /// The service's asynchronous confirmation that a start completed.
    pub fn service_start_done(&self, local_id: u32, _event_id: u32) -> Result<(), ClusterError> {
        self.sg_tx
            .send(SgInput::StartDone { local_id })
            .map_err(|_| ClusterError::NotConnected)
    }

    pub fn service_members(&self, local_id: u32) -> Result<Vec<u32>, ClusterError> {
        self.engine.members_of(local_id)
    }

    pub fn service_global_id(&self, local_id: u32) -> Result<u32, ClusterError> {
        self.engine.global_id_of(local_id)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stops the workers without a cluster-visible leave. Use
    /// [`Self::leave_cluster`] first for a graceful departure.
    pub fn shutdown(&self) {
        let _ = self.mem_tx.send(MemInput::Shutdown);
        let _ = self.sg_tx.send(SgInput::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::StartReason;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config(name: &str) -> NodeConfig {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        NodeConfig {
            cluster_name: "testcl".to_string(),
            node_name: name.to_string(),
            joinwait_timeout_secs: 1,
            joinconf_timeout_secs: 2,
            join_timeout_secs: 5,
            hello_interval_secs: 1,
            deadnode_timeout_secs: 30,
            transition_timeout_secs: 5,
            newcluster_timeout_secs: 1,
            ..NodeConfig::default()
        }
    }

    async fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn bound(addr: &str) -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind(addr).await.unwrap())
    }

    #[tokio::test]
    async fn solo_node_forms_a_cluster() {
        let node = ClusterNode::new(test_config("a"));
        let socket = bound("127.0.0.1:0").await;
        node.pass_socket(EndpointRole::Send, 0, socket, None).unwrap();
        node.start().unwrap();

        wait_until("formation", Duration::from_secs(10), || node.is_member()).await;
        let view = node.view();
        assert_eq!(view.generation, 1);
        assert_eq!(view.members.len(), 1);
        assert_eq!(view.members[0].node_id, 1);
        assert_eq!(view.quorum, 1);
        assert!(node.is_quorate());
        node.shutdown();
    }

    /// Two real nodes over localhost UDP: the first forms, the second joins
    /// through the full HELLO -> JOINREQ -> JOINCONF -> ENDTRANS ladder.
    #[tokio::test]
    async fn two_nodes_join_over_udp() {
        let sock_a = bound("127.0.0.1:0").await;
        let sock_b = bound("127.0.0.1:0").await;
        let addr_a = sock_a.local_addr().unwrap();
        let addr_b = sock_b.local_addr().unwrap();

        let a = ClusterNode::new(test_config("a"));
        a.pass_socket(EndpointRole::Send, 0, sock_a, Some(addr_b))
            .unwrap();
        a.start().unwrap();
        wait_until("a forms", Duration::from_secs(10), || a.is_member()).await;

        let b = ClusterNode::new(test_config("b"));
        b.pass_socket(EndpointRole::Send, 0, sock_b, Some(addr_a))
            .unwrap();
        b.start().unwrap();

        wait_until("b joins", Duration::from_secs(20), || {
            b.is_member() && b.view().generation == 2
        })
        .await;
        wait_until("views agree", Duration::from_secs(10), || {
            let va = a.view();
            let vb = b.view();
            va.generation == 2 && va.members.len() == 2 && vb.members.len() == 2
        })
        .await;

        // quorum = (2 + 2) / 2 = 2, and both votes are present.
        assert_eq!(a.view().quorum, 2);
        assert!(a.is_quorate());
        assert!(b.is_quorate());
        let mut ids: Vec<i32> = a.view().members.iter().map(|m| m.node_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn user_barrier_across_two_nodes() {
        let sock_a = bound("127.0.0.1:0").await;
        let sock_b = bound("127.0.0.1:0").await;
        let addr_a = sock_a.local_addr().unwrap();
        let addr_b = sock_b.local_addr().unwrap();

        let a = ClusterNode::new(test_config("a"));
        a.pass_socket(EndpointRole::Send, 0, sock_a, Some(addr_b))
            .unwrap();
        a.start().unwrap();
        wait_until("a forms", Duration::from_secs(10), || a.is_member()).await;

        let b = ClusterNode::new(test_config("b"));
        b.pass_socket(EndpointRole::Send, 0, sock_b, Some(addr_a))
            .unwrap();
        b.start().unwrap();
        wait_until("b joins", Duration::from_secs(20), || b.is_member()).await;

        a.barrier_register("sync", BarrierFlags::AUTODELETE, 2).unwrap();
        b.barrier_register("sync", BarrierFlags::AUTODELETE, 2).unwrap();

        let a2 = Arc::clone(&a);
        let wait_a = tokio::spawn(async move { a2.barrier_wait("sync").await });
        let outcome_b = b.barrier_wait("sync").await.unwrap();
        let outcome_a = wait_a.await.unwrap().unwrap();
        assert_eq!(outcome_a, WaitOutcome::Completed);
        assert_eq!(outcome_b, WaitOutcome::Completed);

        a.shutdown();
        b.shutdown();
    }

    struct CountingOps {
        starts: AtomicU32,
        node: Mutex<Option<Arc<ClusterNode>>>,
        local_id: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ServiceOps for CountingOps {
        async fn stop(&self) {}
        async fn start(
            &self,
            event_id: u32,
            _members: &[u32],
            _reason: StartReason,
        ) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            // Confirm asynchronously, the way a real service would.
            if let Some(node) = self.node.lock().clone() {
                let local_id = self.local_id.load(Ordering::SeqCst);
                let _ = node.service_start_done(local_id, event_id);
            }
            Ok(())
        }
        async fn finish(&self, _event_id: u32) {}
    }

    #[tokio::test]
    async fn service_group_join_across_two_nodes() {
        let sock_a = bound("127.0.0.1:0").await;
        let sock_b = bound("127.0.0.1:0").await;
        let addr_a = sock_a.local_addr().unwrap();
        let addr_b = sock_b.local_addr().unwrap();

        let a = ClusterNode::new(test_config("a"));
        a.pass_socket(EndpointRole::Send, 0, sock_a, Some(addr_b))
            .unwrap();
        a.start().unwrap();
        wait_until("a forms", Duration::from_secs(10), || a.is_member()).await;

        let b = ClusterNode::new(test_config("b"));
        b.pass_socket(EndpointRole::Send, 0, sock_b, Some(addr_a))
            .unwrap();
        b.start().unwrap();
        wait_until("b joins", Duration::from_secs(20), || {
            a.is_quorate() && b.is_member() && b.is_quorate()
        })
        .await;

        let ops_a = Arc::new(CountingOps {
            starts: AtomicU32::new(0),
            node: Mutex::new(None),
            local_id: AtomicU32::new(0),
        });
        let sg_a = a
            .service_register("lockspace", 1, false, Arc::clone(&ops_a) as _)
            .unwrap();
        *ops_a.node.lock() = Some(Arc::clone(&a));
        ops_a.local_id.store(sg_a, Ordering::SeqCst);
        a.service_join(sg_a).await.unwrap();
        assert_eq!(a.service_members(sg_a).unwrap(), vec![1]);
        let gid = a.service_global_id(sg_a).unwrap();
        assert_eq!(gid >> 24, 1, "level rides in the top byte");

        let ops_b = Arc::new(CountingOps {
            starts: AtomicU32::new(0),
            node: Mutex::new(None),
            local_id: AtomicU32::new(0),
        });
        let sg_b = b
            .service_register("lockspace", 1, false, Arc::clone(&ops_b) as _)
            .unwrap();
        *ops_b.node.lock() = Some(Arc::clone(&b));
        ops_b.local_id.store(sg_b, Ordering::SeqCst);
        b.service_join(sg_b).await.unwrap();

        assert_eq!(a.service_members(sg_a).unwrap(), vec![1, 2]);
        assert_eq!(b.service_members(sg_b).unwrap(), vec![1, 2]);
        assert_eq!(b.service_global_id(sg_b).unwrap(), gid);
        assert!(ops_b.starts.load(Ordering::SeqCst) >= 1);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn start_without_endpoint_fails() {
        let node = ClusterNode::new(test_config("a"));
        assert!(matches!(node.start(), Err(ClusterError::NotConnected)));
    }
}
