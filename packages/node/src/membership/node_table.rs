//! The node table: every node this cluster has ever seen, plus the quorum
//! calculator.
//!
//! Node records are never freed while the cluster runs; a returning node is
//! recognised by address and its incarnation is bumped. One mutex (the
//! cluster-members lock) guards the table; the public API reads a lock-free
//! `ArcSwap` snapshot published after every change of consequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use conclave_core::types::{LeaveReason, NodeState};

use crate::comms::endpoint::addr_equal;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Wrap-aware per-peer sequence windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqWindow {
    pub last_recv: u16,
    pub last_acked: u16,
    pub last_sent: u16,
}

/// One node record.
#[derive(Debug, Clone)]
pub struct Node {
    /// Cluster-unique id; 0 until assigned by the master.
    pub node_id: i32,
    pub name: String,
    pub addresses: Vec<Vec<u8>>,
    pub state: NodeState,
    pub votes: u8,
    pub expected_votes: u32,
    pub leave_reason: LeaveReason,
    /// Incremented each time the node (re-)joins.
    pub incarnation: u32,
    pub last_hello: Option<Instant>,
    /// This record is the local node.
    pub us: bool,
    pub seq: SeqWindow,
}

impl Node {
    fn new(name: String, addresses: Vec<Vec<u8>>, votes: u8, expected_votes: u32) -> Self {
        Self {
            node_id: 0,
            name,
            addresses,
            state: NodeState::Joining,
            votes,
            expected_votes,
            leave_reason: LeaveReason::empty(),
            incarnation: 0,
            last_hello: None,
            us: false,
            seq: SeqWindow::default(),
        }
    }
}

/// A member as exposed in the public cluster view snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub node_id: i32,
    pub name: String,
    pub state: NodeState,
    pub votes: u8,
    pub incarnation: u32,
}

/// Lock-free snapshot of the cluster as the last transition left it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub generation: u32,
    pub members: Vec<MemberInfo>,
    pub quorum: u32,
    pub total_votes: u32,
    pub quorate: bool,
}

/// Committed quorum state after a recalculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumState {
    pub quorum: u32,
    pub total_votes: u32,
    pub quorate: bool,
    /// The quorate flag flipped in this recalculation.
    pub changed: bool,
}

struct QuorumDevice {
    name: String,
    votes: u32,
    last_heard: Instant,
    dead: bool,
}

struct Inner {
    nodes: Vec<Node>,
    by_id: HashMap<i32, usize>,
    quorum: u32,
    quorate: bool,
    two_node: bool,
    device: Option<QuorumDevice>,
}

/// The node table.
pub struct NodeStore {
    inner: Mutex<Inner>,
    view: ArcSwap<ClusterView>,
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new(false)
    }
}

impl NodeStore {
    #[must_use]
    pub fn new(two_node: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: Vec::new(),
                by_id: HashMap::new(),
                quorum: 0,
                quorate: false,
                two_node,
                device: None,
            }),
            view: ArcSwap::from_pointee(ClusterView::default()),
        }
    }

    // -- record creation ----------------------------------------------------

    /// Creates (or refreshes) the local node's record and returns a clone.
    pub fn ensure_us(
        &self,
        name: &str,
        addresses: Vec<Vec<u8>>,
        votes: u8,
        expected_votes: u32,
    ) -> Node {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.iter_mut().find(|n| n.us) {
            node.name = name.to_string();
            node.addresses = addresses;
            node.votes = votes;
            node.expected_votes = expected_votes;
            return node.clone();
        }
        let mut node = Node::new(name.to_string(), addresses, votes, expected_votes);
        node.us = true;
        inner.nodes.push(node.clone());
        node
    }

    /// Adds a node first seen through a join or a packed view. If a record
    /// with a matching address already exists (a returning node), it is
    /// revived in place and its incarnation bumped.
    pub fn add_node(
        &self,
        name: &str,
        addresses: Vec<Vec<u8>>,
        votes: u8,
        expected_votes: u32,
        state: NodeState,
    ) -> Node {
        let mut inner = self.inner.lock();
        let existing = inner.nodes.iter_mut().find(|n| {
            n.addresses
                .iter()
                .any(|a| addresses.iter().any(|b| addr_equal(a, b)))
        });
        if let Some(node) = existing {
            node.name = name.to_string();
            node.state = state;
            node.votes = votes;
            node.expected_votes = expected_votes;
            node.leave_reason = LeaveReason::empty();
            node.incarnation += 1;
            node.seq = SeqWindow::default();
            return node.clone();
        }
        let mut node = Node::new(name.to_string(), addresses, votes, expected_votes);
        node.state = state;
        inner.nodes.push(node.clone());
        node
    }

    /// Binds a node id to the record named `name`, updating the id index.
    /// A node id is never reassigned while the record is active.
    pub fn set_node_id(&self, name: &str, node_id: i32) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.nodes.iter().position(|n| n.name == name) {
            inner.nodes[idx].node_id = node_id;
            inner.by_id.insert(node_id, idx);
        }
    }

    // -- lookups ------------------------------------------------------------

    #[must_use]
    pub fn by_id(&self, node_id: i32) -> Option<Node> {
        let inner = self.inner.lock();
        inner
            .by_id
            .get(&node_id)
            .map(|&idx| inner.nodes[idx].clone())
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Node> {
        let inner = self.inner.lock();
        inner.nodes.iter().find(|n| n.name == name).cloned()
    }

    /// Finds a node owning `addr`. Address comparison skips the 2-byte
    /// family field.
    #[must_use]
    pub fn by_addr(&self, addr: &[u8]) -> Option<Node> {
        let inner = self.inner.lock();
        inner
            .nodes
            .iter()
            .find(|n| n.addresses.iter().any(|a| addr_equal(a, addr)))
            .cloned()
    }

    #[must_use]
    pub fn us(&self) -> Option<Node> {
        self.inner.lock().nodes.iter().find(|n| n.us).cloned()
    }

    /// The local node id, or 0 before assignment.
    #[must_use]
    pub fn our_id(&self) -> i32 {
        self.inner
            .lock()
            .nodes
            .iter()
            .find(|n| n.us)
            .map_or(0, |n| n.node_id)
    }

    /// All records in `Member` state.
    #[must_use]
    pub fn members(&self) -> Vec<Node> {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Member)
            .cloned()
            .collect()
    }

    /// Every record, whatever its state.
    #[must_use]
    pub fn all(&self) -> Vec<Node> {
        self.inner.lock().nodes.clone()
    }

    #[must_use]
    pub fn member_count(&self) -> u32 {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Member)
            .count() as u32
    }

    #[must_use]
    pub fn highest_node_id(&self) -> u32 {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| n.node_id > 0)
            .map(|n| n.node_id as u32)
            .max()
            .unwrap_or(0)
    }

    /// The lowest member id: the election winner when a master dies.
    #[must_use]
    pub fn lowest_member_id(&self) -> Option<i32> {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Member && n.node_id > 0)
            .map(|n| n.node_id)
            .min()
    }

    /// Binary addresses of all current members (for the temp-id purge).
    #[must_use]
    pub fn member_addresses(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Member)
            .flat_map(|n| n.addresses.iter().cloned())
            .collect()
    }

    // -- mutation -----------------------------------------------------------

    /// Runs `f` on the record with `node_id` under the table lock.
    pub fn with_node_mut<R>(&self, node_id: i32, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        let idx = *inner.by_id.get(&node_id)?;
        Some(f(&mut inner.nodes[idx]))
    }

    /// Runs `f` on the record named `name` under the table lock.
    pub fn with_named_mut<R>(&self, name: &str, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        let node = inner.nodes.iter_mut().find(|n| n.name == name)?;
        Some(f(node))
    }

    pub fn set_state(&self, node_id: i32, state: NodeState) {
        self.with_node_mut(node_id, |n| n.state = state);
    }

    /// Marks a node dead and remembers why.
    pub fn mark_dead(&self, node_id: i32, reason: LeaveReason) {
        self.with_node_mut(node_id, |n| {
            n.state = NodeState::Dead;
            n.leave_reason = reason;
        });
    }

    /// Records a HELLO arrival time.
    pub fn record_hello(&self, node_id: i32, now: Instant) {
        self.with_node_mut(node_id, |n| n.last_hello = Some(now));
    }

    /// Members whose last HELLO is older than `timeout` at `now`.
    #[must_use]
    pub fn stale_members(&self, now: Instant, timeout: Duration) -> Vec<i32> {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| {
                n.state == NodeState::Member
                    && !n.us
                    && n.last_hello
                        .is_some_and(|t| now.duration_since(t) > timeout)
            })
            .map(|n| n.node_id)
            .collect()
    }

    // -- sequence windows ---------------------------------------------------

    #[must_use]
    pub fn seq_window(&self, node_id: i32) -> Option<SeqWindow> {
        let inner = self.inner.lock();
        inner.by_id.get(&node_id).map(|&idx| inner.nodes[idx].seq)
    }

    pub fn record_recv_seq(&self, node_id: i32, seq: u16) {
        self.with_node_mut(node_id, |n| n.seq.last_recv = seq);
    }

    pub fn record_sent_seq(&self, node_id: i32, seq: u16) {
        self.with_node_mut(node_id, |n| n.seq.last_sent = seq);
    }

    /// Applies an incoming ACK; returns `true` if it advanced the window.
    pub fn record_acked_seq(&self, node_id: i32, ack: u16) -> bool {
        self.with_node_mut(node_id, |n| {
            if n.seq.last_acked == ack {
                false
            } else {
                n.seq.last_acked = ack;
                true
            }
        })
        .unwrap_or(false)
    }

    /// Member ids (excluding us) whose last send was never acknowledged.
    /// These are the peers the retransmit path gives up on.
    #[must_use]
    pub fn unacked_members(&self) -> Vec<i32> {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Member && !n.us && n.seq.last_acked != n.seq.last_sent)
            .map(|n| n.node_id)
            .collect()
    }

    // -- quorum -------------------------------------------------------------

    fn votes_of(inner: &Inner) -> (u32, u32) {
        let mut total: u32 = 0;
        let mut highest_expected: u32 = 0;
        for node in inner.nodes.iter().filter(|n| n.state == NodeState::Member) {
            total += u32::from(node.votes);
            highest_expected = highest_expected.max(node.expected_votes);
        }
        if let Some(device) = &inner.device {
            if !device.dead {
                total += device.votes;
            }
        }
        (total, highest_expected)
    }

    /// Computes a quorum value without committing it.
    ///
    /// `override_expected` substitutes for the highest expected-votes seen
    /// (used when an administrator lowers expected votes).
    #[must_use]
    pub fn calculate_quorum(&self, allow_decrease: bool, override_expected: Option<u32>) -> u32 {
        let inner = self.inner.lock();
        if inner.two_node {
            return 1;
        }
        let (total_votes, highest_expected) = Self::votes_of(&inner);
        let expected = override_expected.unwrap_or(highest_expected);
        let q1 = (expected + 2) / 2;
        let q2 = (total_votes + 2) / 2;
        let mut new_quorum = q1.max(q2);
        if !allow_decrease {
            new_quorum = new_quorum.max(inner.quorum);
        }
        new_quorum
    }

    /// Commits a quorum recalculation and updates the quorate flag.
    pub fn recalculate_quorum(&self, allow_decrease: bool) -> QuorumState {
        let new_quorum = self.calculate_quorum(allow_decrease, None);
        let mut inner = self.inner.lock();
        let (total_votes, _) = Self::votes_of(&inner);
        let quorate = total_votes >= new_quorum && new_quorum > 0;
        let changed = quorate != inner.quorate;
        inner.quorum = new_quorum;
        inner.quorate = quorate;
        if changed {
            info!(quorate, quorum = new_quorum, total_votes, "quorum edge");
        }
        QuorumState {
            quorum: new_quorum,
            total_votes,
            quorate,
            changed,
        }
    }

    #[must_use]
    pub fn quorate(&self) -> bool {
        self.inner.lock().quorate
    }

    #[must_use]
    pub fn quorum(&self) -> u32 {
        self.inner.lock().quorum
    }

    /// Registers (or replaces) the pseudo quorum device.
    pub fn register_quorum_device(&self, name: &str, votes: u32) {
        self.inner.lock().device = Some(QuorumDevice {
            name: name.to_string(),
            votes,
            last_heard: Instant::now(),
            dead: false,
        });
    }

    pub fn unregister_quorum_device(&self) {
        self.inner.lock().device = None;
    }

    /// Records a heartbeat from the quorum device.
    pub fn quorum_device_heartbeat(&self, now: Instant) {
        if let Some(device) = &mut self.inner.lock().device {
            device.last_heard = now;
            device.dead = false;
        }
    }

    /// Declares the device dead when its heartbeat has gone stale.
    /// Returns `true` if the device just died.
    pub fn poll_quorum_device(&self, now: Instant, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if let Some(device) = &mut inner.device {
            if !device.dead && now.duration_since(device.last_heard) > timeout {
                device.dead = true;
                info!(device = %device.name, "quorum device timed out");
                return true;
            }
        }
        false
    }

    // -- view snapshot ------------------------------------------------------

    /// Publishes a fresh lock-free view snapshot at `generation`.
    pub fn publish_view(&self, generation: u32) {
        let inner = self.inner.lock();
        let members = inner
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Member)
            .map(|n| MemberInfo {
                node_id: n.node_id,
                name: n.name.clone(),
                state: n.state,
                votes: n.votes,
                incarnation: n.incarnation,
            })
            .collect();
        let (total_votes, _) = Self::votes_of(&inner);
        self.view.store(Arc::new(ClusterView {
            generation,
            members,
            quorum: inner.quorum,
            total_votes,
            quorate: inner.quorate,
        }));
    }

    /// The current published view.
    #[must_use]
    pub fn view(&self) -> Arc<ClusterView> {
        self.view.load_full()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tail: u8) -> Vec<u8> {
        vec![2, 0, 0x1A, 0x99, 10, 0, 0, tail]
    }

    fn member(store: &NodeStore, name: &str, id: i32, votes: u8, expected: u32) {
        store.add_node(name, vec![addr(id as u8)], votes, expected, NodeState::Member);
        store.set_node_id(name, id);
    }

    #[test]
    fn ensure_us_is_idempotent() {
        let store = NodeStore::new(false);
        store.ensure_us("a", vec![addr(1)], 1, 3);
        store.ensure_us("a", vec![addr(1)], 1, 3);
        assert_eq!(store.all().len(), 1);
        assert!(store.us().unwrap().us);
    }

    #[test]
    fn lookup_by_id_name_and_addr() {
        let store = NodeStore::new(false);
        member(&store, "b", 2, 1, 3);

        assert_eq!(store.by_id(2).unwrap().name, "b");
        assert_eq!(store.by_name("b").unwrap().node_id, 2);
        let mut foreign = addr(2);
        foreign[0] = 0xAA; // different family encoding still matches
        assert_eq!(store.by_addr(&foreign).unwrap().name, "b");
        assert!(store.by_id(9).is_none());
    }

    #[test]
    fn returning_node_bumps_incarnation() {
        let store = NodeStore::new(false);
        let first = store.add_node("b", vec![addr(2)], 1, 3, NodeState::Member);
        assert_eq!(first.incarnation, 0);
        store.mark_dead(0, LeaveReason::DEAD);

        let revived = store.add_node("b", vec![addr(2)], 1, 3, NodeState::Joining);
        assert_eq!(revived.incarnation, 1);
        assert_eq!(store.all().len(), 1, "records are reused, not duplicated");
    }

    #[test]
    fn quorum_formula_matches_openvms() {
        let store = NodeStore::new(false);
        member(&store, "a", 1, 1, 3);
        member(&store, "b", 2, 1, 3);
        member(&store, "c", 3, 1, 3);

        // q1 = (3+2)/2 = 2, q2 = (3+2)/2 = 2
        assert_eq!(store.calculate_quorum(true, None), 2);
        let state = store.recalculate_quorum(true);
        assert_eq!(state.quorum, 2);
        assert!(state.quorate);
    }

    #[test]
    fn quorum_never_decreases_without_permission() {
        let store = NodeStore::new(false);
        member(&store, "a", 1, 1, 5);
        member(&store, "b", 2, 1, 5);
        member(&store, "c", 3, 1, 5);
        // q1 = (5+2)/2 = 3
        assert_eq!(store.recalculate_quorum(true).quorum, 3);

        store.mark_dead(3, LeaveReason::DEAD);
        // With the floor in place the old quorum wins.
        assert_eq!(store.calculate_quorum(false, None), 3);
        // Allowing decrease recomputes from live votes.
        assert_eq!(store.calculate_quorum(true, None), 3);
    }

    #[test]
    fn two_node_mode_pins_quorum_to_one() {
        let store = NodeStore::new(true);
        member(&store, "a", 1, 1, 2);
        member(&store, "b", 2, 1, 2);
        assert_eq!(store.calculate_quorum(true, None), 1);
        assert!(store.recalculate_quorum(true).quorate);
    }

    #[test]
    fn losing_quorum_flips_the_edge() {
        let store = NodeStore::new(false);
        member(&store, "a", 1, 1, 3);
        member(&store, "b", 2, 1, 3);
        member(&store, "c", 3, 1, 3);
        assert!(store.recalculate_quorum(true).quorate);

        store.mark_dead(2, LeaveReason::DEAD);
        store.mark_dead(3, LeaveReason::DEAD);
        let state = store.recalculate_quorum(false);
        assert!(!state.quorate);
        assert!(state.changed);
    }

    #[test]
    fn quorum_device_contributes_while_alive() {
        let store = NodeStore::new(false);
        member(&store, "a", 1, 1, 4);
        member(&store, "b", 2, 1, 4);
        // q1 = 3; two live votes are not enough.
        assert!(!store.recalculate_quorum(true).quorate);

        store.register_quorum_device("qdisk", 1);
        assert!(store.recalculate_quorum(true).quorate);

        let later = Instant::now() + Duration::from_secs(30);
        assert!(store.poll_quorum_device(later, Duration::from_secs(21)));
        assert!(!store.recalculate_quorum(true).quorate);
    }

    #[test]
    fn seq_windows_track_per_peer() {
        let store = NodeStore::new(false);
        member(&store, "b", 2, 1, 2);

        store.record_sent_seq(2, 5);
        assert!(store.record_acked_seq(2, 5));
        assert!(!store.record_acked_seq(2, 5), "duplicate ack is a no-op");
        store.record_recv_seq(2, 9);

        let w = store.seq_window(2).unwrap();
        assert_eq!(w, SeqWindow {
            last_recv: 9,
            last_acked: 5,
            last_sent: 5
        });
        assert!(store.unacked_members().is_empty());

        store.record_sent_seq(2, 6);
        assert_eq!(store.unacked_members(), vec![2]);
    }

    #[test]
    fn stale_member_scan_spares_us_and_fresh_nodes() {
        let store = NodeStore::new(false);
        store.ensure_us("a", vec![addr(1)], 1, 2);
        store.with_named_mut("a", |n| n.state = NodeState::Member);
        store.set_node_id("a", 1);
        member(&store, "b", 2, 1, 2);

        let t0 = Instant::now();
        store.record_hello(2, t0);
        let scan = store.stale_members(t0 + Duration::from_secs(30), Duration::from_secs(21));
        assert_eq!(scan, vec![2]);

        let fresh = store.stale_members(t0 + Duration::from_secs(5), Duration::from_secs(21));
        assert!(fresh.is_empty());
    }

    #[test]
    fn view_snapshot_reflects_members() {
        let store = NodeStore::new(false);
        member(&store, "a", 1, 1, 2);
        member(&store, "b", 2, 1, 2);
        store.recalculate_quorum(true);
        store.publish_view(4);

        let view = store.view();
        assert_eq!(view.generation, 4);
        assert_eq!(view.members.len(), 2);
        assert_eq!(view.quorum, 2);
        assert!(view.quorate);
    }
}
