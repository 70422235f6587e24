//! The service daemon: the worker that executes service-group effects.
//!
//! Consumes one input queue (messages, barrier resolutions, start_done
//! confirmations, retries, membership changes) and carries out the
//! [`SgEffect`]s the engine returns. All service callbacks run here, off
//! the comms and membership workers.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use bytes::BytesMut;
use conclave_core::messages::service::SgMessage;
use conclave_core::wire::MsgFlags;
use conclave_core::PORT_SERVICES;

use crate::barrier::{self, BarrierFlags, BarrierRegistry};
use crate::comms::Comms;
use crate::error::WaitOutcome;

use super::engine::{ServiceEngine, SgEffect, SgTarget, RETRY_DELAY_SECS};

/// Inputs to the service daemon.
pub enum SgInput {
    /// An SG protocol message arrived.
    Message { src: i32, msg: SgMessage },
    /// A local service confirmed a start.
    StartDone { local_id: u32 },
    /// A barrier the engine entered resolved.
    BarrierDone { name: String, ok: bool },
    /// A delayed sevent wants another try.
    Retry { local_id: u32 },
    /// The quorum gate flipped.
    SetQuorate(bool),
    /// The cluster member set changed; `departed` nodes are gone.
    MembershipChanged { departed: Vec<u32> },
    /// Effects produced outside the daemon (join/leave entry points).
    Effects(Vec<SgEffect>),
    Shutdown,
}

/// Runs the service daemon until shutdown.
pub async fn run(
    engine: Arc<ServiceEngine>,
    comms: Arc<Comms>,
    barriers: Arc<BarrierRegistry>,
    tx: mpsc::UnboundedSender<SgInput>,
    mut rx: mpsc::UnboundedReceiver<SgInput>,
) {
    while let Some(input) = rx.recv().await {
        let effects = match input {
            SgInput::Message { src, msg } => engine.handle_message(src, &msg),
            SgInput::StartDone { local_id } => engine.start_done(local_id),
            SgInput::BarrierDone { ref name, ok } => engine.barrier_done(name, ok),
            SgInput::Retry { local_id } => engine.restart_sevent(local_id),
            SgInput::SetQuorate(quorate) => engine.set_quorate(quorate),
            SgInput::MembershipChanged { ref departed } => engine.membership_update(departed),
            SgInput::Effects(effects) => effects,
            SgInput::Shutdown => break,
        };
        execute(&engine, &comms, &barriers, &tx, effects).await;
    }
    debug!("service daemon stopped");
}

/// Carries out one batch of effects, in order.
pub async fn execute(
    engine: &Arc<ServiceEngine>,
    comms: &Arc<Comms>,
    barriers: &Arc<BarrierRegistry>,
    tx: &mpsc::UnboundedSender<SgInput>,
    effects: Vec<SgEffect>,
) {
    for effect in effects {
        match effect {
            SgEffect::Send { target, msg } => {
                let mut buf = BytesMut::new();
                msg.encode(&mut buf);
                let result = match target {
                    SgTarget::Multicast => {
                        comms.send_message(0, PORT_SERVICES, MsgFlags::empty(), &buf).await
                    }
                    SgTarget::Nodes(ids) => {
                        let mut result = Ok(());
                        for id in ids {
                            if let Err(err) =
                                comms.send_message(id, PORT_SERVICES, MsgFlags::empty(), &buf).await
                            {
                                result = Err(err);
                            }
                        }
                        result
                    }
                };
                if let Err(err) = result {
                    warn!(?err, "service message send failed");
                }
            }
            SgEffect::Stop { local_id } => {
                if let Some(ops) = engine.ops_of(local_id) {
                    ops.stop().await;
                }
            }
            SgEffect::Start {
                local_id,
                event_id,
                members,
                reason,
            } => {
                if let Some(ops) = engine.ops_of(local_id) {
                    if let Err(err) = ops.start(event_id, &members, reason).await {
                        warn!(sg = local_id, ?err, "service start callback failed");
                        let follow = engine.start_failed(local_id);
                        Box::pin(execute(engine, comms, barriers, tx, follow)).await;
                    }
                }
            }
            SgEffect::Finish { local_id, event_id } => {
                if let Some(ops) = engine.ops_of(local_id) {
                    ops.finish(event_id).await;
                }
            }
            SgEffect::RegisterBarrier { name, expected } => {
                if let Err(err) = barriers.register(&name, BarrierFlags::AUTODELETE, expected) {
                    // A stale record with another count: replace it.
                    debug!(name, ?err, "re-registering stale barrier");
                    let _ = barriers.cancel(&name);
                    let _ = barriers.register(&name, BarrierFlags::AUTODELETE, expected);
                }
            }
            SgEffect::EnterBarrier { name, expected } => {
                // Idempotent register, then arm and watch for resolution.
                let _ = barriers.register(&name, BarrierFlags::AUTODELETE, expected);
                match barriers.wait_begin(&name, comms.store.member_count()) {
                    Ok((barrier_effects, result_rx)) => {
                        barrier::run_effects(barriers, comms, barrier_effects).await;
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let outcome = barrier::wait_result(result_rx).await;
                            let _ = tx.send(SgInput::BarrierDone {
                                name,
                                ok: outcome == WaitOutcome::Completed,
                            });
                        });
                    }
                    Err(err) => warn!(name, ?err, "barrier entry failed"),
                }
            }
            SgEffect::CancelBarrier { name } => {
                let _ = barriers.cancel(&name);
            }
            SgEffect::RetryLater { local_id } => {
                // Jitter keeps two backed-off joiners from colliding again.
                let jitter = rand::rng().random_range(0..500);
                let delay = Duration::from_millis(RETRY_DELAY_SECS * 1000 + jitter);
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(SgInput::Retry { local_id });
                });
            }
        }
    }
}
