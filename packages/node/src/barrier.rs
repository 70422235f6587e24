//! The cluster-wide two-phase barrier.
//!
//! Phase 1: every participant broadcasts BARRIER{WAIT}. The node that
//! observes the full WAIT count broadcasts BARRIER{COMPLETE} and advances
//! to phase 2. Phase 2: COMPLETE arrivals are tallied; at the expected
//! count the barrier resolves, waiters wake, the callback fires, and
//! auto-delete barriers vanish. Completion is idempotent, and a timeout or
//! a cluster departure resolves the barrier with the matching end reason.
//!
//! Registration is local-only; REGISTER/CHANGE wire subcommands are
//! accepted and ignored for compatibility.

use std::collections::HashMap;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use conclave_core::messages::control::{BarrierControl, BarrierSubCmd};
use conclave_core::types::BarrierEndReason;

use crate::error::ClusterError;
use crate::error::WaitOutcome;

bitflags! {
    /// Barrier attribute flags (also carried on the wire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BarrierFlags: u32 {
        /// Delete the barrier record once it completes or is cancelled.
        const AUTODELETE = 0x01;
        /// Reserved; multi-step barriers are not supported.
        const MULTISTEP  = 0x02;
    }
}

/// Attributes settable on a registered barrier.
pub enum BarrierAttr {
    Autodelete(bool),
    /// Zero clears the timeout.
    Timeout(Duration),
    /// Replace the expected node count (only while inactive).
    Nodes(u32),
    Callback(Box<dyn Fn(&str, BarrierEndReason) + Send + Sync>),
    /// Arm the barrier: send WAIT and start counting.
    Enabled,
    /// Present for completeness; always rejected.
    MultiStep,
}

/// Lifecycle state of a barrier record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Inactive,
    Waiting,
    Complete,
}

/// Effects the owning shell must carry out after a registry call.
#[derive(Debug, PartialEq, Eq)]
pub enum BarrierEffect {
    /// Multicast this control message to the cluster.
    Broadcast(BarrierControl),
    /// Arm (or re-arm) the timeout timer for this barrier.
    ArmTimer {
        name: String,
        generation: u64,
        after: Duration,
    },
}

type BarrierCallback = Box<dyn Fn(&str, BarrierEndReason) + Send + Sync>;

struct Barrier {
    flags: BarrierFlags,
    expected: u32,
    /// Local registrations sharing this record.
    registered: u32,
    got_nodes: u32,
    completed_nodes: u32,
    state: BarrierState,
    phase: u8,
    timeout: Option<Duration>,
    endreason: Option<BarrierEndReason>,
    callback: Option<BarrierCallback>,
    waitsent: bool,
    complete_sent: bool,
    /// Invalidates in-flight timer tasks when the barrier restarts.
    timer_generation: u64,
    result_tx: watch::Sender<Option<BarrierEndReason>>,
}

impl Barrier {
    fn effective_expected(&self, cluster_members: u32) -> u32 {
        if self.expected == 0 {
            cluster_members
        } else {
            self.expected
        }
    }
}

/// The barrier registry: one record per name.
#[derive(Default)]
pub struct BarrierRegistry {
    barriers: Mutex<HashMap<String, Barrier>>,
}

impl BarrierRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or joins a named barrier.
    ///
    /// # Errors
    ///
    /// An existing record must carry the same expected count.
    pub fn register(
        &self,
        name: &str,
        flags: BarrierFlags,
        expected: u32,
    ) -> Result<(), ClusterError> {
        let mut barriers = self.barriers.lock();
        if let Some(existing) = barriers.get_mut(name) {
            if existing.registered == 0 {
                // A passive record created by an early peer WAIT; adopt it.
                existing.expected = expected;
                existing.flags = flags;
                existing.registered = 1;
                return Ok(());
            }
            if existing.expected != expected {
                return Err(ClusterError::BarrierMismatch(name.to_string()));
            }
            existing.registered += 1;
            return Ok(());
        }
        let (result_tx, _) = watch::channel(None);
        barriers.insert(
            name.to_string(),
            Barrier {
                flags,
                expected,
                registered: 1,
                got_nodes: 0,
                completed_nodes: 0,
                state: BarrierState::Inactive,
                phase: 0,
                timeout: None,
                endreason: None,
                callback: None,
                waitsent: false,
                complete_sent: false,
                timer_generation: 0,
                result_tx,
            },
        );
        Ok(())
    }

    /// Sets an attribute; `Enabled` arms the barrier and may produce
    /// effects to execute.
    pub fn setattr(
        &self,
        name: &str,
        attr: BarrierAttr,
        cluster_members: u32,
    ) -> Result<Vec<BarrierEffect>, ClusterError> {
        match attr {
            BarrierAttr::MultiStep => return Err(ClusterError::UnsupportedAttribute),
            BarrierAttr::Enabled => return self.enable(name, cluster_members),
            _ => {}
        }
        let mut barriers = self.barriers.lock();
        let barrier = barriers
            .get_mut(name)
            .ok_or_else(|| ClusterError::NoSuchBarrier(name.to_string()))?;
        match attr {
            BarrierAttr::Autodelete(on) => {
                barrier.flags.set(BarrierFlags::AUTODELETE, on);
            }
            BarrierAttr::Timeout(t) => {
                barrier.timeout = if t.is_zero() { None } else { Some(t) };
            }
            BarrierAttr::Nodes(n) => {
                if barrier.state == BarrierState::Inactive {
                    barrier.expected = n;
                }
            }
            BarrierAttr::Callback(cb) => barrier.callback = Some(cb),
            BarrierAttr::Enabled | BarrierAttr::MultiStep => unreachable!(),
        }
        Ok(Vec::new())
    }

    /// Arms the barrier: counts ourselves, broadcasts WAIT, starts the
    /// timer. Idempotent once armed.
    pub fn enable(
        &self,
        name: &str,
        cluster_members: u32,
    ) -> Result<Vec<BarrierEffect>, ClusterError> {
        let mut barriers = self.barriers.lock();
        let barrier = barriers
            .get_mut(name)
            .ok_or_else(|| ClusterError::NoSuchBarrier(name.to_string()))?;
        if barrier.waitsent || barrier.state == BarrierState::Complete {
            return Ok(Vec::new());
        }
        barrier.waitsent = true;
        barrier.state = BarrierState::Waiting;
        barrier.phase = 1;
        barrier.got_nodes += 1;
        debug!(name, got = barrier.got_nodes, "barrier enabled");

        let mut effects = vec![BarrierEffect::Broadcast(BarrierControl {
            subcmd: BarrierSubCmd::Wait,
            flags: barrier.flags.bits(),
            nodes: barrier.expected,
            name: name.to_string(),
        })];
        if let Some(timeout) = barrier.timeout {
            barrier.timer_generation += 1;
            effects.push(BarrierEffect::ArmTimer {
                name: name.to_string(),
                generation: barrier.timer_generation,
                after: timeout,
            });
        }
        effects.extend(Self::check_got(name, barrier, cluster_members));
        drop(barriers);
        self.run_completions();
        Ok(effects)
    }

    /// Phase-1 check: have all WAITs arrived?
    fn check_got(name: &str, barrier: &mut Barrier, cluster_members: u32) -> Vec<BarrierEffect> {
        if barrier.phase != 1 || barrier.complete_sent {
            return Vec::new();
        }
        if barrier.got_nodes < barrier.effective_expected(cluster_members) {
            return Vec::new();
        }
        // We saw the full WAIT set: announce completion.
        barrier.phase = 2;
        barrier.complete_sent = true;
        barrier.completed_nodes += 1;
        let effect = BarrierEffect::Broadcast(BarrierControl {
            subcmd: BarrierSubCmd::Complete,
            flags: barrier.flags.bits(),
            nodes: barrier.expected,
            name: name.to_string(),
        });
        if barrier.completed_nodes >= barrier.effective_expected(cluster_members) {
            Self::resolve(barrier, BarrierEndReason::Done);
        }
        vec![effect]
    }

    /// Handles a barrier control message from a peer.
    pub fn on_control(&self, msg: &BarrierControl, cluster_members: u32) -> Vec<BarrierEffect> {
        let mut barriers = self.barriers.lock();
        if !barriers.contains_key(&msg.name)
            && matches!(msg.subcmd, BarrierSubCmd::Wait | BarrierSubCmd::Complete)
        {
            // A peer is ahead of our own registration; park a passive
            // record so its count is not lost.
            let (result_tx, _) = watch::channel(None);
            barriers.insert(
                msg.name.clone(),
                Barrier {
                    flags: BarrierFlags::from_bits_truncate(msg.flags),
                    expected: msg.nodes,
                    registered: 0,
                    got_nodes: 0,
                    completed_nodes: 0,
                    state: BarrierState::Inactive,
                    phase: 0,
                    timeout: None,
                    endreason: None,
                    callback: None,
                    waitsent: false,
                    complete_sent: false,
                    timer_generation: 0,
                    result_tx,
                },
            );
        }
        let Some(barrier) = barriers.get_mut(&msg.name) else {
            // Not registered here; nothing to coordinate.
            return Vec::new();
        };
        let effects = match msg.subcmd {
            BarrierSubCmd::Register | BarrierSubCmd::Change => Vec::new(),
            BarrierSubCmd::Wait => {
                if barrier.state == BarrierState::Complete {
                    return Vec::new();
                }
                // WAITs also count before we have locally enabled; the
                // phase check inside keeps us from completing early.
                barrier.got_nodes += 1;
                Self::check_got(&msg.name, barrier, cluster_members)
            }
            BarrierSubCmd::Complete => {
                if barrier.state == BarrierState::Complete {
                    // Idempotent: late or duplicate COMPLETEs are no-ops.
                    return Vec::new();
                }
                barrier.completed_nodes += 1;
                if barrier.completed_nodes >= barrier.effective_expected(cluster_members) {
                    Self::resolve(barrier, BarrierEndReason::Done);
                }
                Vec::new()
            }
        };
        drop(barriers);
        self.run_completions();
        effects
    }

    /// The timeout timer fired.
    pub fn on_timeout(&self, name: &str, generation: u64) {
        {
            let mut barriers = self.barriers.lock();
            let Some(barrier) = barriers.get_mut(name) else {
                return;
            };
            if barrier.timer_generation != generation
                || barrier.state != BarrierState::Waiting
            {
                return;
            }
            info!(name, "barrier timed out");
            Self::resolve(barrier, BarrierEndReason::Timeout);
        }
        self.run_completions();
    }

    /// Cancels one barrier (explicit delete).
    pub fn cancel(&self, name: &str) -> Result<(), ClusterError> {
        {
            let mut barriers = self.barriers.lock();
            let barrier = barriers
                .get_mut(name)
                .ok_or_else(|| ClusterError::NoSuchBarrier(name.to_string()))?;
            barrier.registered = barrier.registered.saturating_sub(1);
            if barrier.registered > 0 {
                return Ok(());
            }
            if barrier.state == BarrierState::Waiting {
                Self::resolve(barrier, BarrierEndReason::Cancelled);
            } else {
                barrier.endreason.get_or_insert(BarrierEndReason::Cancelled);
                barrier.state = BarrierState::Complete;
                let _ = barrier.result_tx.send(barrier.endreason);
            }
            barrier.flags |= BarrierFlags::AUTODELETE;
        }
        self.run_completions();
        Ok(())
    }

    /// Resolves every waiting barrier with `NotConnected`; called when the
    /// node falls out of the cluster.
    pub fn cancel_all(&self) {
        {
            let mut barriers = self.barriers.lock();
            for barrier in barriers.values_mut() {
                if barrier.state == BarrierState::Waiting {
                    Self::resolve(barrier, BarrierEndReason::NotConnected);
                }
            }
        }
        self.run_completions();
    }

    fn resolve(barrier: &mut Barrier, reason: BarrierEndReason) {
        if barrier.state == BarrierState::Complete {
            return;
        }
        barrier.state = BarrierState::Complete;
        barrier.endreason = Some(reason);
        let _ = barrier.result_tx.send(Some(reason));
    }

    /// Fires callbacks for newly completed barriers and drops auto-delete
    /// records. Runs outside the table lock so callbacks may re-enter.
    fn run_completions(&self) {
        let mut fired: Vec<(String, BarrierEndReason, Option<BarrierCallback>)> = Vec::new();
        {
            let mut barriers = self.barriers.lock();
            let done: Vec<String> = barriers
                .iter()
                .filter(|(_, b)| b.state == BarrierState::Complete && b.endreason.is_some())
                .map(|(name, _)| name.clone())
                .collect();
            for name in done {
                let Some(barrier) = barriers.get_mut(&name) else {
                    continue;
                };
                let reason = barrier.endreason.expect("checked above");
                let callback = barrier.callback.take();
                if barrier.flags.contains(BarrierFlags::AUTODELETE) {
                    barriers.remove(&name);
                }
                fired.push((name, reason, callback));
            }
        }
        for (name, reason, callback) in fired {
            if let Some(cb) = callback {
                cb(&name, reason);
            }
        }
    }

    /// Subscribes to a barrier's resolution. The caller should `enable`
    /// first (or use [`Self::wait_begin`]).
    pub fn subscribe(
        &self,
        name: &str,
    ) -> Result<watch::Receiver<Option<BarrierEndReason>>, ClusterError> {
        let barriers = self.barriers.lock();
        let barrier = barriers
            .get(name)
            .ok_or_else(|| ClusterError::NoSuchBarrier(name.to_string()))?;
        Ok(barrier.result_tx.subscribe())
    }

    /// Enables the barrier and returns the effects plus a receiver for the
    /// resolution; the wait itself is [`wait_result`].
    pub fn wait_begin(
        &self,
        name: &str,
        cluster_members: u32,
    ) -> Result<(Vec<BarrierEffect>, watch::Receiver<Option<BarrierEndReason>>), ClusterError>
    {
        let rx = self.subscribe(name)?;
        let effects = self.enable(name, cluster_members)?;
        Ok((effects, rx))
    }

    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<BarrierState> {
        self.barriers.lock().get(name).map(|b| b.state)
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.barriers.lock().contains_key(name)
    }
}

/// Executes barrier effects: broadcasts ride the control port, timers
/// become detached tasks that report back into the registry.
pub async fn run_effects(
    registry: &std::sync::Arc<BarrierRegistry>,
    comms: &std::sync::Arc<crate::comms::Comms>,
    effects: Vec<BarrierEffect>,
) {
    use bytes::BytesMut;
    use conclave_core::messages::control::ControlMessage;
    use conclave_core::wire::MsgFlags;

    for effect in effects {
        match effect {
            BarrierEffect::Broadcast(msg) => {
                let mut buf = BytesMut::new();
                ControlMessage::Barrier(msg).encode(&mut buf);
                if let Err(err) = comms.send_message(0, 0, MsgFlags::NOACK, &buf).await {
                    debug!(?err, "barrier broadcast failed");
                }
            }
            BarrierEffect::ArmTimer {
                name,
                generation,
                after,
            } => {
                let registry = std::sync::Arc::clone(registry);
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    registry.on_timeout(&name, generation);
                });
            }
        }
    }
}

/// Awaits a barrier resolution subscribed via [`BarrierRegistry::wait_begin`].
pub async fn wait_result(
    mut rx: watch::Receiver<Option<BarrierEndReason>>,
) -> WaitOutcome {
    loop {
        if let Some(reason) = *rx.borrow_and_update() {
            return match reason {
                BarrierEndReason::Done => WaitOutcome::Completed,
                BarrierEndReason::Timeout => WaitOutcome::TimedOut,
                BarrierEndReason::NotConnected => WaitOutcome::Disconnected,
                BarrierEndReason::Cancelled => WaitOutcome::Cancelled,
            };
        }
        if rx.changed().await.is_err() {
            return WaitOutcome::Cancelled;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Delivers every broadcast from `effects` to all other registries,
    /// collecting follow-on broadcasts until the network is quiet.
    fn shuttle(registries: &[&BarrierRegistry], from: usize, effects: Vec<BarrierEffect>, members: u32) {
        let mut queue: Vec<(usize, BarrierControl)> = effects
            .into_iter()
            .filter_map(|e| match e {
                BarrierEffect::Broadcast(msg) => Some((from, msg)),
                BarrierEffect::ArmTimer { .. } => None,
            })
            .collect();
        while let Some((sender, msg)) = queue.pop() {
            for (i, registry) in registries.iter().enumerate() {
                if i == sender {
                    continue;
                }
                let follow = registry.on_control(&msg, members);
                queue.extend(follow.into_iter().filter_map(|e| match e {
                    BarrierEffect::Broadcast(m) => Some((i, m)),
                    BarrierEffect::ArmTimer { .. } => None,
                }));
            }
        }
    }

    #[test]
    fn register_mismatched_expected_fails() {
        let reg = BarrierRegistry::new();
        reg.register("b", BarrierFlags::empty(), 3).unwrap();
        assert!(matches!(
            reg.register("b", BarrierFlags::empty(), 4),
            Err(ClusterError::BarrierMismatch(_))
        ));
        // Same count refcounts.
        reg.register("b", BarrierFlags::empty(), 3).unwrap();
    }

    #[test]
    fn multistep_attribute_is_unsupported() {
        let reg = BarrierRegistry::new();
        reg.register("b", BarrierFlags::empty(), 2).unwrap();
        assert!(matches!(
            reg.setattr("b", BarrierAttr::MultiStep, 2),
            Err(ClusterError::UnsupportedAttribute)
        ));
    }

    #[test]
    fn three_node_barrier_completes_everywhere() {
        let r1 = BarrierRegistry::new();
        let r2 = BarrierRegistry::new();
        let r3 = BarrierRegistry::new();
        let all = [&r1, &r2, &r3];
        for r in &all {
            r.register("sync", BarrierFlags::AUTODELETE, 3).unwrap();
        }

        let e1 = r1.enable("sync", 3).unwrap();
        shuttle(&all, 0, e1, 3);
        let e2 = r2.enable("sync", 3).unwrap();
        shuttle(&all, 1, e2, 3);
        assert_eq!(r1.state_of("sync"), Some(BarrierState::Waiting));

        let e3 = r3.enable("sync", 3).unwrap();
        shuttle(&all, 2, e3, 3);

        // Everyone completed and auto-deleted.
        for r in &all {
            assert!(!r.exists("sync"));
        }
    }

    #[test]
    fn expected_zero_uses_cluster_member_count() {
        let r1 = BarrierRegistry::new();
        let r2 = BarrierRegistry::new();
        let all = [&r1, &r2];
        for r in &all {
            r.register("sync", BarrierFlags::empty(), 0).unwrap();
        }
        let e1 = r1.enable("sync", 2).unwrap();
        shuttle(&all, 0, e1, 2);
        let e2 = r2.enable("sync", 2).unwrap();
        shuttle(&all, 1, e2, 2);
        assert_eq!(r1.state_of("sync"), Some(BarrierState::Complete));
        assert_eq!(r2.state_of("sync"), Some(BarrierState::Complete));
    }

    #[test]
    fn duplicate_complete_is_idempotent() {
        let reg = BarrierRegistry::new();
        reg.register("b", BarrierFlags::empty(), 2).unwrap();
        let _ = reg.enable("b", 2).unwrap();
        let complete = BarrierControl {
            subcmd: BarrierSubCmd::Complete,
            flags: 0,
            nodes: 2,
            name: "b".to_string(),
        };
        let _ = reg.on_control(&complete, 2);
        // got_nodes was 1 (ours); one COMPLETE makes completed_nodes 1 < 2.
        assert_eq!(reg.state_of("b"), Some(BarrierState::Waiting));
        let _ = reg.on_control(&complete, 2);
        assert_eq!(reg.state_of("b"), Some(BarrierState::Complete));
        // A third is a no-op.
        let _ = reg.on_control(&complete, 2);
        assert_eq!(reg.state_of("b"), Some(BarrierState::Complete));
    }

    #[test]
    fn timeout_resolves_waiters_and_allows_reregistration() {
        let reg = BarrierRegistry::new();
        reg.register("b", BarrierFlags::AUTODELETE, 3).unwrap();
        reg.setattr("b", BarrierAttr::Timeout(Duration::from_secs(2)), 3)
            .unwrap();
        let effects = reg.enable("b", 3).unwrap();
        let generation = effects
            .iter()
            .find_map(|e| match e {
                BarrierEffect::ArmTimer { generation, .. } => Some(*generation),
                BarrierEffect::Broadcast(_) => None,
            })
            .expect("timer armed");

        let rx = reg.subscribe("b").unwrap();
        reg.on_timeout("b", generation);
        assert_eq!(*rx.borrow(), Some(BarrierEndReason::Timeout));
        // Auto-deleted after the timeout; a fresh register succeeds.
        assert!(!reg.exists("b"));
        reg.register("b", BarrierFlags::empty(), 3).unwrap();
    }

    #[test]
    fn stale_timer_generation_is_ignored() {
        let reg = BarrierRegistry::new();
        reg.register("b", BarrierFlags::empty(), 2).unwrap();
        reg.setattr("b", BarrierAttr::Timeout(Duration::from_secs(1)), 2)
            .unwrap();
        let _ = reg.enable("b", 2).unwrap();
        reg.on_timeout("b", 999);
        assert_eq!(reg.state_of("b"), Some(BarrierState::Waiting));
    }

    #[test]
    fn callback_fires_once_on_completion() {
        let reg = BarrierRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        reg.register("b", BarrierFlags::empty(), 1).unwrap();
        reg.setattr(
            "b",
            BarrierAttr::Callback(Box::new(move |name, reason| {
                assert_eq!(name, "b");
                assert_eq!(reason, BarrierEndReason::Done);
                hits2.fetch_add(1, Ordering::Relaxed);
            })),
            1,
        )
        .unwrap();

        // Expected 1: enabling completes immediately (we broadcast COMPLETE
        // and count ourselves).
        let effects = reg.enable("b", 1).unwrap();
        assert!(effects.iter().any(|e| matches!(
            e,
            BarrierEffect::Broadcast(BarrierControl {
                subcmd: BarrierSubCmd::Complete,
                ..
            })
        )));
        assert_eq!(reg.state_of("b"), Some(BarrierState::Complete));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cancel_all_disconnects_waiters() {
        let reg = BarrierRegistry::new();
        reg.register("b", BarrierFlags::empty(), 3).unwrap();
        let _ = reg.enable("b", 3).unwrap();
        let rx = reg.subscribe("b").unwrap();
        reg.cancel_all();
        assert_eq!(*rx.borrow(), Some(BarrierEndReason::NotConnected));
    }

    #[tokio::test]
    async fn wait_result_maps_end_reasons() {
        let reg = BarrierRegistry::new();
        reg.register("b", BarrierFlags::empty(), 2).unwrap();
        let (_, rx) = reg.wait_begin("b", 2).unwrap();

        let waiter = tokio::spawn(wait_result(rx));
        let complete = BarrierControl {
            subcmd: BarrierSubCmd::Complete,
            flags: 0,
            nodes: 2,
            name: "b".to_string(),
        };
        let _ = reg.on_control(&complete, 2);
        let _ = reg.on_control(&complete, 2);
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Completed);
    }

    #[test]
    fn early_wait_before_registration_is_counted() {
        let reg = BarrierRegistry::new();
        let wait = BarrierControl {
            subcmd: BarrierSubCmd::Wait,
            flags: 0,
            nodes: 2,
            name: "b".to_string(),
        };
        // A peer's WAIT lands before we register: parked, not lost.
        let _ = reg.on_control(&wait, 2);

        reg.register("b", BarrierFlags::empty(), 2).unwrap();
        let effects = reg.enable("b", 2).unwrap();
        // Our own enable is the second WAIT: the full set is visible and we
        // broadcast COMPLETE.
        assert!(effects.iter().any(|e| matches!(
            e,
            BarrierEffect::Broadcast(BarrierControl {
                subcmd: BarrierSubCmd::Complete,
                ..
            })
        )));
    }

    #[test]
    fn wait_complete_separated_by_one_round_trip() {
        // A node that has not seen every WAIT must not have broadcast
        // COMPLETE: two registries, only one enabled.
        let reg = BarrierRegistry::new();
        reg.register("b", BarrierFlags::empty(), 2).unwrap();
        let effects = reg.enable("b", 2).unwrap();
        assert!(effects.iter().all(|e| !matches!(
            e,
            BarrierEffect::Broadcast(BarrierControl {
                subcmd: BarrierSubCmd::Complete,
                ..
            })
        )));
    }
}
