//! The framing and sequencing layer.
//!
//! Owns the send lock, the per-cluster sequence counter, the saved-message
//! retransmit buffer, and the receive pipeline (cluster-id check, duplicate
//! suppression, ACK bookkeeping, temp-id minting, port dispatch). At most
//! one ACK-bearing message is in flight at a time; the ACK timer rotates
//! interfaces on retry and declares unacked peers dead when retries run
//! out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use metrics::counter;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, trace, warn};

use conclave_core::messages::control::{BarrierControl, ControlMessage};
use conclave_core::types::{AckStatus, NodeState};
use conclave_core::wire::{Header, MsgFlags};
use conclave_core::{HEADER_LEN, MAX_CLUSTER_MESSAGE, MAX_RETRIES, PORT_MEMBERSHIP};

use super::endpoint::{decode_sockaddr, encode_sockaddr, Endpoint, EndpointSet};
use super::ports::{DeliverStatus, PortTable};
use super::temp_nodes::TempNodeIds;
use crate::error::ClusterError;
use crate::membership::node_table::NodeStore;

// ---------------------------------------------------------------------------
// Gate and hooks
// ---------------------------------------------------------------------------

/// Send-gate state: user-port sends block until the cluster is quorate and
/// no transition is in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gate {
    pub quorate: bool,
    pub in_transition: bool,
}

impl Gate {
    #[must_use]
    pub fn open(self) -> bool {
        self.quorate && !self.in_transition
    }
}

/// Whether a user-port send may proceed right now.
#[must_use]
pub fn user_port(port: u8) -> bool {
    port > conclave_core::HIGH_PROTECTED_PORT
}

/// Channels out of the comms layer into the protocol engines.
pub struct CommsHooks {
    /// A peer exhausted its retries: the membership engine must declare it
    /// dead.
    pub node_died: mpsc::UnboundedSender<i32>,
    /// A barrier control message arrived.
    pub barrier: mpsc::UnboundedSender<(i32, BarrierControl)>,
    /// The node can no longer function (membership queue jammed, critical
    /// allocation failed): panic-leave.
    pub fatal: mpsc::UnboundedSender<()>,
}

// ---------------------------------------------------------------------------
// Send state
// ---------------------------------------------------------------------------

struct SavedMsg {
    bytes: Vec<u8>,
    target: i32,
}

struct SendState {
    cur_seq: u16,
    acks_expected: u32,
    ack_count: u32,
    saved: Option<SavedMsg>,
    retry_count: u32,
    /// Invalidates stale ACK-timer tasks.
    timer_generation: u64,
}

/// A message deferred to the comms worker (in-interrupt analogue: callers
/// that must not block).
pub struct QueuedMessage {
    pub target: i32,
    pub port: u8,
    pub flags: MsgFlags,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Comms
// ---------------------------------------------------------------------------

/// The framing/sequencing service shared by every sender and the receive
/// path.
pub struct Comms {
    pub endpoints: Arc<EndpointSet>,
    pub ports: Arc<PortTable>,
    pub temp_ids: Arc<TempNodeIds>,
    pub store: Arc<NodeStore>,
    cluster_id: u16,
    send: Mutex<SendState>,
    /// Bumped whenever the ACK window frees; senders wait on it.
    window_tx: watch::Sender<u64>,
    gate_rx: watch::Receiver<Gate>,
    hooks: CommsHooks,
    /// Outstanding ISLISTENING probes by tag.
    listen_waiters: DashMap<u16, oneshot::Sender<bool>>,
    listen_tag: AtomicU16,
    queue_tx: mpsc::UnboundedSender<QueuedMessage>,
    ack_timeout: Duration,
    /// Handle to ourselves for the detached ACK-timer tasks.
    weak_self: std::sync::Weak<Comms>,
}

impl Comms {
    /// Builds the comms service. Returns the service and the receiver end
    /// of the deferred-send queue (drained by [`Comms::run_send_queue`]).
    pub fn new(
        endpoints: Arc<EndpointSet>,
        ports: Arc<PortTable>,
        temp_ids: Arc<TempNodeIds>,
        store: Arc<NodeStore>,
        cluster_id: u16,
        gate_rx: watch::Receiver<Gate>,
        hooks: CommsHooks,
        ack_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<QueuedMessage>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (window_tx, _) = watch::channel(0);
        let comms = Arc::new_cyclic(|weak| Self {
            endpoints,
            ports,
            temp_ids,
            store,
            cluster_id,
            send: Mutex::new(SendState {
                cur_seq: 0,
                acks_expected: 0,
                ack_count: 0,
                saved: None,
                retry_count: 0,
                timer_generation: 0,
            }),
            window_tx,
            gate_rx,
            hooks,
            listen_waiters: DashMap::new(),
            listen_tag: AtomicU16::new(1),
            queue_tx,
            ack_timeout,
            weak_self: weak.clone(),
        });
        (comms, queue_rx)
    }

    #[must_use]
    pub fn cluster_id(&self) -> u16 {
        self.cluster_id
    }

    // -----------------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------------

    /// Sends `payload` to `target` (a node id, a negative temp id, or 0 for
    /// multicast) from `port`.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when `DONTWAIT` is set and the call would suspend,
    /// `MessageTooLong` for oversized payloads, `NotConnected` when the
    /// node is shutting down.
    pub async fn send_message(
        &self,
        target: i32,
        port: u8,
        mut flags: MsgFlags,
        payload: &[u8],
    ) -> Result<(), ClusterError> {
        if payload.len() + HEADER_LEN > MAX_CLUSTER_MESSAGE {
            return Err(ClusterError::MessageTooLong(payload.len()));
        }

        // User ports are gated on a quorate, settled cluster.
        if user_port(port) {
            let mut gate_rx = self.gate_rx.clone();
            loop {
                if gate_rx.borrow_and_update().open() {
                    break;
                }
                if flags.contains(MsgFlags::DONTWAIT) {
                    return Err(ClusterError::WouldBlock);
                }
                if gate_rx.changed().await.is_err() {
                    return Err(ClusterError::NotConnected);
                }
            }
        }

        let our_id = self.store.our_id();
        if target != 0 && target == our_id {
            // Loopback shortcut: never acked, never serialised on the wire
            // beyond the local dispatch.
            flags |= MsgFlags::NOACK;
        }

        // The send lock: at most one ACK-bearing message in flight.
        let noack = flags.contains(MsgFlags::NOACK);
        let mut st = loop {
            let st = self.send.lock().await;
            if st.acks_expected == 0 || noack {
                break st;
            }
            if flags.contains(MsgFlags::DONTWAIT) {
                return Err(ClusterError::WouldBlock);
            }
            let mut window_rx = self.window_tx.subscribe();
            drop(st);
            if window_rx.changed().await.is_err() {
                return Err(ClusterError::NotConnected);
            }
        };

        let mut seq = st.cur_seq.wrapping_add(1);
        if seq == 0 {
            seq = 1;
        }
        st.cur_seq = seq;

        let piggyback = if target > 0 {
            self.store.seq_window(target).map_or(0, |w| w.last_recv)
        } else {
            0
        };

        let acks_expected = if noack {
            0
        } else if target != 0 {
            1
        } else {
            self.store.member_count().saturating_sub(1)
        };
        if acks_expected == 0 {
            flags |= MsgFlags::NOACK;
        }
        if target == 0 {
            flags |= MsgFlags::MULTICAST;
        }

        let header = Header {
            port,
            flags,
            cluster: self.cluster_id,
            seq,
            ack: piggyback,
            srcid: our_id,
            tgtid: target,
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        header.encode(&mut buf);
        buf.extend_from_slice(payload);
        let bytes = buf.freeze().to_vec();

        if target != 0 && target == our_id {
            drop(st);
            self.deliver_local(&header, Bytes::copy_from_slice(payload));
            return Ok(());
        }

        self.transmit(&bytes, target, flags).await;

        if target == 0 && flags.contains(MsgFlags::BCASTSELF) {
            self.deliver_local(&header, Bytes::copy_from_slice(payload));
        }

        // Track the sequence against each peer the message went to.
        if target > 0 {
            self.store.record_sent_seq(target, seq);
        } else if target == 0 {
            for node in self.store.members() {
                if !node.us {
                    self.store.record_sent_seq(node.node_id, seq);
                }
            }
        }

        if acks_expected > 0 {
            let mut saved = bytes;
            // The saved copy must request a real ACK on resend.
            saved[1] &= !MsgFlags::REPLYEXP.bits();
            st.acks_expected = acks_expected;
            st.ack_count = 0;
            st.retry_count = 0;
            st.saved = Some(SavedMsg {
                bytes: saved,
                target,
            });
            st.timer_generation += 1;
            let generation = st.timer_generation;
            drop(st);
            self.arm_ack_timer(generation);
        }
        Ok(())
    }

    /// Defers a send to the comms worker; used by callers that must not
    /// suspend (timer context, protocol handlers holding locks).
    pub fn send_or_queue(&self, msg: QueuedMessage) {
        if self.queue_tx.send(msg).is_err() {
            warn!("send queue closed, message dropped");
        }
    }

    /// Drains the deferred-send queue, one message at a time, each waiting
    /// its turn at the ACK window.
    pub async fn run_send_queue(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<QueuedMessage>) {
        while let Some(msg) = rx.recv().await {
            if let Err(err) = self
                .send_message(msg.target, msg.port, msg.flags, &msg.payload)
                .await
            {
                warn!(?err, "queued send failed");
            }
        }
    }

    async fn transmit(&self, bytes: &[u8], target: i32, flags: MsgFlags) {
        if target < 0 {
            // Temp-id peers: their interface is unknown, so try them all.
            if let Some(addr) = self
                .temp_ids
                .address_of(target)
                .as_deref()
                .and_then(decode_sockaddr)
            {
                for endpoint in self.endpoints.send_capable() {
                    self.send_on(&endpoint, bytes, addr).await;
                }
            } else {
                warn!(target, "no address for temp node id");
            }
        } else if target > 0 {
            let Some(node) = self.store.by_id(target) else {
                warn!(target, "send to unknown node id");
                return;
            };
            let Some(addr) = node.addresses.first().and_then(|a| decode_sockaddr(a)) else {
                warn!(target, "node has no decodable address");
                return;
            };
            if flags.contains(MsgFlags::ALLINT) {
                for endpoint in self.endpoints.send_capable() {
                    self.send_on(&endpoint, bytes, addr).await;
                }
            } else if let Some(endpoint) = self.endpoints.current() {
                self.send_on(&endpoint, bytes, addr).await;
            }
        } else {
            // Multicast: through the broadcast target when the endpoint has
            // one, else fanned out as unicasts.
            let endpoints = if flags.contains(MsgFlags::ALLINT) {
                self.endpoints.send_capable()
            } else {
                self.endpoints.current().into_iter().collect()
            };
            for endpoint in endpoints {
                if let Some(mcast) = endpoint.mcast_target {
                    self.send_on(&endpoint, bytes, mcast).await;
                } else {
                    for node in self.store.all() {
                        if node.us || node.state == NodeState::Dead {
                            continue;
                        }
                        if let Some(addr) = node.addresses.first().and_then(|a| decode_sockaddr(a))
                        {
                            self.send_on(&endpoint, bytes, addr).await;
                        }
                    }
                }
            }
        }
    }

    async fn send_on(&self, endpoint: &Endpoint, bytes: &[u8], addr: SocketAddr) {
        if let Err(err) = endpoint.socket.send_to(bytes, addr).await {
            warn!(?err, iface = endpoint.number, "endpoint send failed");
            counter!("conclave_send_errors_total").increment(1);
        }
    }

    // -----------------------------------------------------------------------
    // ACK timer
    // -----------------------------------------------------------------------

    fn arm_ack_timer(&self, generation: u64) {
        let Some(comms) = self.weak_self.upgrade() else {
            return;
        };
        let delay = self.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            comms.on_ack_timer(generation).await;
        });
    }

    async fn on_ack_timer(&self, generation: u64) {
        let mut st = self.send.lock().await;
        if st.timer_generation != generation || st.acks_expected == 0 {
            return;
        }
        if st.retry_count < MAX_RETRIES {
            st.retry_count += 1;
            counter!("conclave_retransmits_total").increment(1);
            let bytes = st.saved.as_ref().map(|s| (s.bytes.clone(), s.target));
            st.timer_generation += 1;
            let next_generation = st.timer_generation;
            let retry = st.retry_count;
            drop(st);
            if let Some((bytes, target)) = bytes {
                // Rotate away from the interface that may have failed.
                let _ = self.endpoints.next_interface();
                debug!(retry, target, "retransmitting unacked message");
                self.transmit(&bytes, target, MsgFlags::from_bits_truncate(bytes[1]))
                    .await;
            }
            self.arm_ack_timer(next_generation);
        } else {
            // Retries exhausted: whoever still owes an ACK is dead.
            counter!("conclave_peers_timed_out_total").increment(1);
            st.acks_expected = 0;
            st.ack_count = 0;
            st.saved = None;
            st.timer_generation += 1;
            drop(st);
            self.window_tx.send_modify(|v| *v += 1);
            for node_id in self.store.unacked_members() {
                warn!(node_id, "no ACK after {MAX_RETRIES} retries");
                let _ = self.hooks.node_died.send(node_id);
            }
        }
    }

    /// Applies an ACK (explicit or piggybacked) from `from`.
    async fn ack_received(&self, from: i32, ack_seq: u16) {
        if !self.store.record_acked_seq(from, ack_seq) {
            return;
        }
        let mut st = self.send.lock().await;
        if st.acks_expected == 0 {
            return;
        }
        st.ack_count += 1;
        trace!(from, ack_seq, have = st.ack_count, want = st.acks_expected, "ack");
        if st.ack_count >= st.acks_expected {
            st.acks_expected = 0;
            st.ack_count = 0;
            st.saved = None;
            st.retry_count = 0;
            st.timer_generation += 1;
            drop(st);
            self.window_tx.send_modify(|v| *v += 1);
        }
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Processes one inbound datagram. Called from an endpoint reader task.
    pub async fn handle_datagram(&self, from: SocketAddr, data: &[u8]) {
        let mut cursor = data;
        let Ok(header) = Header::decode(&mut cursor) else {
            trace!("runt datagram dropped");
            return;
        };
        if header.cluster != self.cluster_id {
            trace!("foreign cluster id dropped");
            return;
        }
        let payload = Bytes::copy_from_slice(cursor);
        let from_bytes = encode_sockaddr(&from);

        // Resolve the source to a live node record.
        let src_node = match self.store.by_id(header.srcid) {
            Some(node) if node.state != NodeState::Dead => Some(node),
            // A dead node's traffic is a stranger's until it rejoins.
            _ => match self.store.by_addr(&from_bytes) {
                Some(node) if node.state != NodeState::Dead && node.node_id > 0 => Some(node),
                _ => None,
            },
        };

        // Addressed to some other specific node?
        let our_id = self.store.our_id();
        if header.tgtid > 0 && our_id != 0 && header.tgtid != our_id {
            return;
        }

        let noack = header.flags.contains(MsgFlags::NOACK);
        let src = match &src_node {
            Some(node) => {
                // Duplicate suppression.
                if !noack {
                    if let Some(window) = self.store.seq_window(node.node_id) {
                        if window.last_recv == header.seq {
                            trace!(src = node.node_id, seq = header.seq, "duplicate, re-acking");
                            self.send_explicit_ack(from, &header, AckStatus::Ok).await;
                            return;
                        }
                    }
                }
                if header.ack != 0 {
                    self.ack_received(node.node_id, header.ack).await;
                }
                if !noack {
                    self.store.record_recv_seq(node.node_id, header.seq);
                }
                node.node_id
            }
            None => {
                // Strangers must not be ACKed by a node that is not itself
                // a member: we must not pretend the cluster heard them.
                let we_are_member = self
                    .store
                    .us()
                    .is_some_and(|n| n.state == NodeState::Member);
                if header.flags.contains(MsgFlags::MULTICAST) && !noack && !we_are_member {
                    return;
                }
                self.temp_ids.get_or_create(&from_bytes)
            }
        };

        if header.port == 0 {
            self.handle_control(src, from, &header, &payload).await;
        } else {
            let status = self.ports.deliver(header.port, src, payload);
            match status {
                DeliverStatus::QueueFull if header.port == PORT_MEMBERSHIP => {
                    // The membership engine is wedged; this node cannot be
                    // trusted to follow the protocol any more.
                    warn!("membership delivery queue full, panic-leaving");
                    let _ = self.hooks.fatal.send(());
                    return;
                }
                _ => {}
            }
            if !noack && !header.flags.contains(MsgFlags::REPLYEXP) {
                let ack_status = match status {
                    DeliverStatus::Delivered => AckStatus::Ok,
                    DeliverStatus::NoListener | DeliverStatus::QueueFull => AckStatus::NoListener,
                };
                self.send_explicit_ack(from, &header, ack_status).await;
            }
        }
    }

    /// Local loopback dispatch (self-sends and BCASTSELF).
    fn deliver_local(&self, header: &Header, payload: Bytes) {
        if header.port == 0 {
            return;
        }
        let _ = self.ports.deliver(header.port, header.srcid, payload);
    }

    async fn send_explicit_ack(&self, to: SocketAddr, acked: &Header, status: AckStatus) {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 4);
        Header {
            port: 0,
            flags: MsgFlags::NOACK,
            cluster: self.cluster_id,
            seq: 0,
            ack: acked.seq,
            srcid: self.store.our_id(),
            tgtid: acked.srcid,
        }
        .encode(&mut buf);
        ControlMessage::Ack {
            remote_port: acked.port,
            status,
        }
        .encode(&mut buf);
        if let Some(endpoint) = self.endpoints.current() {
            self.send_on(&endpoint, &buf, to).await;
        }
    }

    async fn handle_control(
        &self,
        src: i32,
        from: SocketAddr,
        header: &Header,
        payload: &[u8],
    ) {
        let mut cursor = payload;
        let msg = match ControlMessage::decode(&mut cursor) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(?err, "bad control message");
                return;
            }
        };
        match msg {
            ControlMessage::Ack {
                remote_port,
                status,
            } => {
                if status == AckStatus::NoListener {
                    warn!(src, remote_port, "peer has no listener on port");
                    counter!("conclave_no_listener_acks_total").increment(1);
                }
                self.ack_received(src, header.ack).await;
            }
            ControlMessage::ListenReq { target_port, tag } => {
                // The response doubles as the ACK of the REPLYEXP request.
                let mut buf = BytesMut::with_capacity(HEADER_LEN + 8);
                Header {
                    port: 0,
                    flags: MsgFlags::NOACK,
                    cluster: self.cluster_id,
                    seq: 0,
                    ack: header.seq,
                    srcid: self.store.our_id(),
                    tgtid: src,
                }
                .encode(&mut buf);
                ControlMessage::ListenResp {
                    listening: self.ports.is_bound(target_port),
                    tag,
                }
                .encode(&mut buf);
                if let Some(endpoint) = self.endpoints.current() {
                    self.send_on(&endpoint, &buf, from).await;
                }
            }
            ControlMessage::ListenResp { listening, tag } => {
                if let Some((_, waiter)) = self.listen_waiters.remove(&tag) {
                    let _ = waiter.send(listening);
                }
            }
            ControlMessage::PortClosed { port } => {
                self.ports
                    .post_oob(port, crate::events::OobNotice::PortClosed { node_id: src });
            }
            ControlMessage::Barrier(barrier) => {
                let _ = self.hooks.barrier.send((src, barrier));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Probes and port closure
    // -----------------------------------------------------------------------

    /// Asks `node_id` whether anything listens on `port` over there.
    ///
    /// # Errors
    ///
    /// `TimedOut` when no reply arrives within `timeout`.
    pub async fn is_listening(
        &self,
        node_id: i32,
        port: u8,
        timeout: Duration,
    ) -> Result<bool, ClusterError> {
        let tag = self.listen_tag.fetch_add(1, Ordering::Relaxed).max(1);
        let (tx, rx) = oneshot::channel();
        self.listen_waiters.insert(tag, tx);

        let mut buf = BytesMut::new();
        ControlMessage::ListenReq {
            target_port: port,
            tag,
        }
        .encode(&mut buf);
        self.send_message(node_id, 0, MsgFlags::REPLYEXP, &buf)
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(listening)) => Ok(listening),
            Ok(Err(_)) => Err(ClusterError::Interrupted),
            Err(_) => {
                self.listen_waiters.remove(&tag);
                Err(ClusterError::TimedOut)
            }
        }
    }

    /// Unbinds a local port and tells the cluster so remote waiters wake.
    pub async fn close_port(&self, port: u8) {
        if !self.ports.unbind(port) {
            return;
        }
        let mut buf = BytesMut::new();
        ControlMessage::PortClosed { port }.encode(&mut buf);
        let _ = self
            .send_message(0, 0, MsgFlags::NOACK, &buf)
            .await;
    }

    /// Reads datagrams off one endpoint socket into the receive pipeline.
    pub async fn run_reader(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_CLUSTER_MESSAGE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    self.handle_datagram(from, &buf[..len]).await;
                }
                Err(err) => {
                    warn!(?err, "endpoint receive failed");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::endpoint::EndpointRole;
    use conclave_core::hash::cluster_id_hash;

    struct Harness {
        comms: Arc<Comms>,
        _gate_tx: watch::Sender<Gate>,
        died_rx: mpsc::UnboundedReceiver<i32>,
        name: &'static str,
    }

    async fn harness(name: &'static str, ack_timeout_ms: u64) -> Harness {
        let endpoints = Arc::new(EndpointSet::new());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        endpoints
            .add_endpoint(EndpointRole::Send, 0, Arc::clone(&socket), None)
            .unwrap();

        let store = Arc::new(NodeStore::new(false));
        let addr = socket.local_addr().unwrap();
        store.ensure_us(name, vec![encode_sockaddr(&addr)], 1, 1);

        let (gate_tx, gate_rx) = watch::channel(Gate {
            quorate: true,
            in_transition: false,
        });
        let (died_tx, died_rx) = mpsc::unbounded_channel();
        let (barrier_tx, _barrier_rx) = mpsc::unbounded_channel();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let (comms, _queue_rx) = Comms::new(
            endpoints,
            Arc::new(PortTable::new()),
            Arc::new(TempNodeIds::new()),
            store,
            cluster_id_hash("testcl"),
            gate_rx,
            CommsHooks {
                node_died: died_tx,
                barrier: barrier_tx,
                fatal: fatal_tx,
            },
            Duration::from_millis(ack_timeout_ms),
        );
        tokio::spawn(Arc::clone(&comms).run_reader(Arc::clone(&socket)));
        Harness {
            comms,
            _gate_tx: gate_tx,
            died_rx,
            name,
        }
    }

    /// Introduces `peer` to `host`'s node table as a member with its real
    /// socket address, then marks both hosts members.
    fn introduce(host: &Harness, peer: &Harness, peer_id: i32) {
        let peer_addr = peer.comms.store.us().unwrap().addresses[0].clone();
        host.comms
            .store
            .add_node(peer.name, vec![peer_addr], 1, 1, NodeState::Member);
        host.comms.store.set_node_id(peer.name, peer_id);
    }

    fn become_member(h: &Harness, id: i32) {
        h.comms
            .store
            .with_named_mut(h.name, |n| n.state = NodeState::Member);
        h.comms.store.set_node_id(h.name, id);
    }

    #[tokio::test]
    async fn loopback_send_delivers_locally() {
        let h = harness("a", 1000).await;
        become_member(&h, 1);
        let mut rx = h.comms.ports.bind_queue(31, 4).unwrap();

        h.comms
            .send_message(1, 31, MsgFlags::empty(), b"ping")
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        match delivery {
            crate::comms::ports::Delivery::Data { payload, .. } => {
                assert_eq!(&payload[..], b"ping");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unicast_is_delivered_and_acked() {
        let a = harness("a", 1000).await;
        let b = harness("b", 1000).await;
        become_member(&a, 1);
        become_member(&b, 2);
        introduce(&a, &b, 2);
        introduce(&b, &a, 1);

        let mut rx = b.comms.ports.bind_queue(31, 4).unwrap();
        a.comms
            .send_message(2, 31, MsgFlags::empty(), b"hello")
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match delivery {
            crate::comms::ports::Delivery::Data {
                src_node, payload, ..
            } => {
                assert_eq!(src_node, 1);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }

        // The explicit ACK frees a's window: a second ack-bearing send must
        // not block.
        tokio::time::timeout(
            Duration::from_secs(2),
            a.comms.send_message(2, 31, MsgFlags::empty(), b"again"),
        )
        .await
        .expect("window freed by ack")
        .unwrap();
    }

    #[tokio::test]
    async fn duplicate_datagram_is_delivered_once() {
        let a = harness("a", 1000).await;
        let b = harness("b", 1000).await;
        become_member(&a, 1);
        become_member(&b, 2);
        introduce(&a, &b, 2);
        introduce(&b, &a, 1);

        let mut rx = b.comms.ports.bind_queue(31, 4).unwrap();

        // Hand-craft one datagram and feed it to b twice.
        let mut buf = BytesMut::new();
        Header {
            port: 31,
            flags: MsgFlags::empty(),
            cluster: a.comms.cluster_id(),
            seq: 7,
            ack: 0,
            srcid: 1,
            tgtid: 2,
        }
        .encode(&mut buf);
        buf.extend_from_slice(b"only-once");
        let a_addr = decode_sockaddr(&a.comms.store.us().unwrap().addresses[0]).unwrap();

        b.comms.handle_datagram(a_addr, &buf).await;
        b.comms.handle_datagram(a_addr, &buf).await;

        let first = rx.try_recv();
        assert!(first.is_ok());
        assert!(rx.try_recv().is_err(), "duplicate must be suppressed");
    }

    /// Registers `name` in `host`'s table at an address nobody listens on.
    async fn introduce_dead(host: &Harness, name: &str, id: i32) {
        let graveyard = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = graveyard.local_addr().unwrap();
        drop(graveyard);
        host.comms
            .store
            .add_node(name, vec![encode_sockaddr(&addr)], 1, 1, NodeState::Member);
        host.comms.store.set_node_id(name, id);
    }

    #[tokio::test]
    async fn dontwait_with_outstanding_ack_returns_wouldblock() {
        let a = harness("a", 60_000).await;
        become_member(&a, 1);
        introduce_dead(&a, "b", 2).await;

        a.comms
            .send_message(2, 31, MsgFlags::empty(), b"no ack coming")
            .await
            .unwrap();

        let err = a
            .comms
            .send_message(2, 31, MsgFlags::DONTWAIT, b"blocked")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::WouldBlock));
    }

    #[tokio::test]
    async fn user_port_send_blocks_until_quorate() {
        let h = harness("a", 1000).await;
        become_member(&h, 1);
        h._gate_tx
            .send(Gate {
                quorate: false,
                in_transition: false,
            })
            .unwrap();

        let err = h
            .comms
            .send_message(0, 20, MsgFlags::DONTWAIT | MsgFlags::NOACK, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::WouldBlock));

        // Reserved ports stay open while inquorate.
        h.comms
            .send_message(0, PORT_MEMBERSHIP, MsgFlags::NOACK, b"x")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retries_exhausted_reports_dead_peer() {
        let mut a = harness("a", 50).await;
        become_member(&a, 1);
        introduce_dead(&a, "b", 2).await;

        a.comms
            .send_message(2, 31, MsgFlags::empty(), b"into the void")
            .await
            .unwrap();

        let dead = tokio::time::timeout(Duration::from_secs(5), a.died_rx.recv())
            .await
            .expect("death reported")
            .unwrap();
        assert_eq!(dead, 2);
    }

    #[tokio::test]
    async fn foreign_cluster_id_is_dropped() {
        let b = harness("b", 1000).await;
        become_member(&b, 2);
        let mut rx = b.comms.ports.bind_queue(31, 4).unwrap();

        let mut buf = BytesMut::new();
        Header {
            port: 31,
            flags: MsgFlags::NOACK,
            cluster: cluster_id_hash("some-other-cluster"),
            seq: 1,
            ack: 0,
            srcid: 1,
            tgtid: 0,
        }
        .encode(&mut buf);
        buf.extend_from_slice(b"alien");
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        b.comms.handle_datagram(from, &buf).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stranger_multicast_needing_ack_is_ignored_by_non_member() {
        let b = harness("b", 1000).await;
        // b is not a member yet.
        let mut rx = b.comms.ports.bind_queue(31, 4).unwrap();

        let mut buf = BytesMut::new();
        Header {
            port: 31,
            flags: MsgFlags::MULTICAST,
            cluster: b.comms.cluster_id(),
            seq: 1,
            ack: 0,
            srcid: 5,
            tgtid: 0,
        }
        .encode(&mut buf);
        buf.extend_from_slice(b"who are you");
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        b.comms.handle_datagram(from, &buf).await;
        assert!(rx.try_recv().is_err());
        assert!(b.comms.temp_ids.is_empty(), "no temp id for ignored traffic");
    }

    #[tokio::test]
    async fn unknown_sender_gets_a_temp_id() {
        let b = harness("b", 1000).await;
        become_member(&b, 2);
        let mut rx = b.comms.ports.bind_queue(31, 4).unwrap();

        let mut buf = BytesMut::new();
        Header {
            port: 31,
            flags: MsgFlags::NOACK,
            cluster: b.comms.cluster_id(),
            seq: 1,
            ack: 0,
            srcid: 0,
            tgtid: 0,
        }
        .encode(&mut buf);
        buf.extend_from_slice(b"joining soon");
        let from: SocketAddr = "127.0.0.1:45000".parse().unwrap();
        b.comms.handle_datagram(from, &buf).await;

        match rx.try_recv().unwrap() {
            crate::comms::ports::Delivery::Data { src_node, .. } => {
                assert!(src_node < 0, "stranger must appear under a temp id");
                assert!(b.comms.temp_ids.is_valid(src_node));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn is_listening_round_trip() {
        let a = harness("a", 1000).await;
        let b = harness("b", 1000).await;
        become_member(&a, 1);
        become_member(&b, 2);
        introduce(&a, &b, 2);
        introduce(&b, &a, 1);
        let _rx = b.comms.ports.bind_queue(31, 4).unwrap();

        let listening = a
            .comms
            .is_listening(2, 31, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(listening);

        let silent = a
            .comms
            .is_listening(2, 99, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!silent);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let h = harness("a", 1000).await;
        become_member(&h, 1);
        let big = vec![0u8; MAX_CLUSTER_MESSAGE];
        let err = h
            .comms
            .send_message(0, 31, MsgFlags::NOACK, &big)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::MessageTooLong(_)));
    }
}
