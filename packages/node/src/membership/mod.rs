//! Cluster membership: the node table, the protocol state machine, and the
//! worker that wires the machine to the comms layer.

pub mod fsm;
pub mod node_table;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use conclave_core::messages::membership::MembershipMessage;
use conclave_core::types::{LeaveReason, ReconfigParam};
use conclave_core::PORT_MEMBERSHIP;

use crate::barrier::{self, BarrierAttr, BarrierFlags, BarrierRegistry};
use crate::comms::{Comms, Gate};
use crate::config::NodeConfig;
use crate::error::WaitOutcome;
use crate::events::{ClusterEvent, OobNotice};
use crate::service::SgInput;

pub use fsm::{Action, MemberState, MembershipFsm, SendTarget, Timer};
pub use node_table::{ClusterView, MemberInfo, Node, NodeStore, QuorumState, SeqWindow};

/// Inputs to the membership worker.
pub enum MemInput {
    /// Begin discovery (join or form).
    Start,
    /// A raw datagram arrived on the membership port.
    Message { src: i32, raw: Bytes },
    /// A protocol timer fired (stale generations are ignored).
    TimerFired { timer: Timer, generation: u64 },
    /// The comms layer gave up on a peer.
    NodeDied(i32),
    /// The transition-completion barrier resolved.
    BarrierDone { generation: u32, ok: bool },
    /// API: leave the cluster.
    Leave(LeaveReason),
    /// API: kill another node.
    Kill(i32),
    /// API: reconfigure votes or config version.
    Reconfigure(ReconfigParam, u32),
    Shutdown,
}

/// The membership worker: drives [`MembershipFsm`] and executes its
/// actions against the comms layer, the barrier registry, and the service
/// daemon.
pub struct MembershipWorker {
    pub config: Arc<NodeConfig>,
    pub comms: Arc<Comms>,
    pub barriers: Arc<BarrierRegistry>,
    pub gate_tx: watch::Sender<Gate>,
    pub events_tx: broadcast::Sender<ClusterEvent>,
    pub sg_tx: mpsc::UnboundedSender<SgInput>,
    pub self_tx: mpsc::UnboundedSender<MemInput>,
    /// Signals the embedding node that we left the cluster.
    pub left_tx: watch::Sender<Option<LeaveReason>>,
    pub address_length: usize,
}

impl MembershipWorker {
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<MemInput>) {
        let mut fsm = MembershipFsm::new(Arc::clone(&self.config), Arc::clone(&self.comms.store));
        let mut timers: HashMap<Timer, u64> = HashMap::new();

        while let Some(input) = rx.recv().await {
            let now = Instant::now();
            let actions = match input {
                MemInput::Start => fsm.start(),
                MemInput::Message { src, raw } => {
                    let mut cursor = &raw[..];
                    match MembershipMessage::decode(&mut cursor, self.address_length) {
                        Ok(msg) => fsm.handle_message(src, msg, now),
                        Err(err) => {
                            debug!(?err, src, "undecodable membership message");
                            Vec::new()
                        }
                    }
                }
                MemInput::TimerFired { timer, generation } => {
                    if timers.get(&timer) == Some(&generation) {
                        fsm.timer_fired(timer, now)
                    } else {
                        Vec::new()
                    }
                }
                MemInput::NodeDied(id) => fsm.node_died(id, LeaveReason::DEAD),
                MemInput::BarrierDone { generation, ok } => fsm.barrier_done(generation, ok),
                MemInput::Leave(reason) => fsm.request_leave(reason),
                MemInput::Kill(id) => fsm.request_kill(id),
                MemInput::Reconfigure(param, value) => fsm.request_reconfigure(param, value),
                MemInput::Shutdown => break,
            };
            if self.execute(&mut timers, actions).await {
                break;
            }
        }
        debug!("membership worker stopped");
    }

    /// Executes one batch of actions; returns `true` when the node exited
    /// the cluster.
    async fn execute(&self, timers: &mut HashMap<Timer, u64>, actions: Vec<Action>) -> bool {
        for action in actions {
            match action {
                Action::Send { target, flags, msg } => {
                    let mut buf = BytesMut::new();
                    msg.encode(&mut buf, self.address_length);
                    let target_id = match target {
                        SendTarget::Node(id) => id,
                        SendTarget::Multicast => 0,
                    };
                    if let Err(err) = self
                        .comms
                        .send_message(target_id, PORT_MEMBERSHIP, flags, &buf)
                        .await
                    {
                        warn!(?err, "membership send failed");
                    }
                }
                Action::SetTimer(timer, after) => {
                    let generation = timers.entry(timer).or_insert(0);
                    *generation += 1;
                    let generation = *generation;
                    let tx = self.self_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(MemInput::TimerFired { timer, generation });
                    });
                }
                Action::CancelTimer(timer) => {
                    *timers.entry(timer).or_insert(0) += 1;
                }
                Action::EnterBarrier {
                    generation,
                    expected,
                } => {
                    self.enter_transition_barrier(generation, expected).await;
                }
                Action::Event(event) => {
                    let _ = self.events_tx.send(event);
                    self.comms.ports.post_oob_all(OobNotice::StateChange);
                }
                Action::TransitionStarted => {
                    // Hold new service work while the membership settles.
                    let _ = self.sg_tx.send(SgInput::SetQuorate(false));
                }
                Action::MembershipChanged {
                    generation: _,
                    departed,
                } => {
                    let _ = self.sg_tx.send(SgInput::MembershipChanged { departed });
                }
                Action::SetGate {
                    quorate,
                    in_transition,
                } => {
                    let _ = self.gate_tx.send(Gate {
                        quorate,
                        in_transition,
                    });
                    let _ = self
                        .sg_tx
                        .send(SgInput::SetQuorate(quorate && !in_transition));
                }
                Action::PurgeTempIds => {
                    self.comms
                        .temp_ids
                        .purge(&self.comms.store.member_addresses());
                }
                Action::Exit { reason } => {
                    warn!(?reason, "leaving the cluster");
                    self.barriers.cancel_all();
                    let _ = self.gate_tx.send(Gate {
                        quorate: false,
                        in_transition: false,
                    });
                    let _ = self.sg_tx.send(SgInput::SetQuorate(false));
                    let _ = self.left_tx.send(Some(reason));
                    return true;
                }
            }
        }
        false
    }

    /// Joins the `TRANSITION.<generation>` completion barrier; its timeout
    /// (the transition timeout) restarts the transition on failure.
    async fn enter_transition_barrier(&self, generation: u32, expected: u32) {
        let name = format!("TRANSITION.{generation}");
        if let Err(err) = self
            .barriers
            .register(&name, BarrierFlags::AUTODELETE, expected)
        {
            debug!(?err, name, "re-registering transition barrier");
            let _ = self.barriers.cancel(&name);
            if self
                .barriers
                .register(&name, BarrierFlags::AUTODELETE, expected)
                .is_err()
            {
                return;
            }
        }
        let members = self.comms.store.member_count();
        let _ = self.barriers.setattr(
            &name,
            BarrierAttr::Timeout(Duration::from_secs(self.config.transition_timeout_secs)),
            members,
        );
        match self.barriers.wait_begin(&name, members) {
            Ok((effects, result_rx)) => {
                barrier::run_effects(&self.barriers, &self.comms, effects).await;
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    let outcome = barrier::wait_result(result_rx).await;
                    let _ = tx.send(MemInput::BarrierDone {
                        generation,
                        ok: outcome == WaitOutcome::Completed,
                    });
                });
            }
            Err(err) => warn!(?err, name, "transition barrier entry failed"),
        }
    }
}
