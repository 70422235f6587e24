//! The port demultiplexer: a 256-slot table mapping port numbers to bound
//! listeners.
//!
//! Port 0 is reserved for control messages and can never be bound. A slot
//! holds either an in-process callback (the membership and service engines)
//! or a bounded delivery queue (ordinary clients). Queue overflow is
//! reported to the caller so the comms layer can decide between dropping
//! and panic-leaving (a full membership queue is fatal).

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::ClusterError;
use crate::events::OobNotice;

/// Number of port slots, including the reserved control port.
pub const NUM_PORTS: usize = 256;

/// A payload handed to a bound listener.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// An ordinary datagram, header already stripped.
    Data {
        src_node: i32,
        port: u8,
        payload: Bytes,
    },
    /// An out-of-band notice.
    Oob(OobNotice),
}

/// Outcome of delivering to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverStatus {
    Delivered,
    NoListener,
    QueueFull,
}

type PortCallback = Box<dyn Fn(i32, &Bytes) + Send + Sync>;

enum Slot {
    Callback(PortCallback),
    Queue(mpsc::Sender<Delivery>),
}

/// The 256-slot listener table.
pub struct PortTable {
    slots: RwLock<Vec<Option<Slot>>>,
}

impl Default for PortTable {
    fn default() -> Self {
        let mut slots = Vec::with_capacity(NUM_PORTS);
        slots.resize_with(NUM_PORTS, || None);
        Self {
            slots: RwLock::new(slots),
        }
    }
}

impl PortTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, port: u8, slot: Slot) -> Result<(), ClusterError> {
        if port == 0 {
            return Err(ClusterError::InvalidPort(0));
        }
        let mut slots = self.slots.write();
        let entry = &mut slots[port as usize];
        if entry.is_some() {
            return Err(ClusterError::AddressInUse(port));
        }
        *entry = Some(slot);
        Ok(())
    }

    /// Binds a delivery queue to `port`.
    ///
    /// # Errors
    ///
    /// `InvalidPort` for port 0, `AddressInUse` if the slot is taken.
    pub fn bind_queue(
        &self,
        port: u8,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Delivery>, ClusterError> {
        let (tx, rx) = mpsc::channel(capacity);
        self.claim(port, Slot::Queue(tx))?;
        Ok(rx)
    }

    /// Binds an in-process callback to `port`. The callback runs on the
    /// comms worker; it must not block.
    pub fn bind_callback(
        &self,
        port: u8,
        callback: impl Fn(i32, &Bytes) + Send + Sync + 'static,
    ) -> Result<(), ClusterError> {
        self.claim(port, Slot::Callback(Box::new(callback)))
    }

    /// Clears a slot. Returns `true` if a listener was bound.
    pub fn unbind(&self, port: u8) -> bool {
        if port == 0 {
            return false;
        }
        self.slots.write()[port as usize].take().is_some()
    }

    #[must_use]
    pub fn is_bound(&self, port: u8) -> bool {
        port != 0 && self.slots.read()[port as usize].is_some()
    }

    /// Hands a received payload to the listener on `port`.
    #[must_use]
    pub fn deliver(&self, port: u8, src_node: i32, payload: Bytes) -> DeliverStatus {
        let slots = self.slots.read();
        match &slots[port as usize] {
            None => DeliverStatus::NoListener,
            Some(Slot::Callback(cb)) => {
                cb(src_node, &payload);
                DeliverStatus::Delivered
            }
            Some(Slot::Queue(tx)) => match tx.try_send(Delivery::Data {
                src_node,
                port,
                payload,
            }) {
                Ok(()) => DeliverStatus::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => DeliverStatus::QueueFull,
                Err(mpsc::error::TrySendError::Closed(_)) => DeliverStatus::NoListener,
            },
        }
    }

    /// Posts an out-of-band notice to the queue bound on `port`, if any.
    /// Full queues are skipped: OOB notices are hints, not data.
    pub fn post_oob(&self, port: u8, notice: OobNotice) {
        let slots = self.slots.read();
        if let Some(Slot::Queue(tx)) = &slots[port as usize] {
            let _ = tx.try_send(Delivery::Oob(notice));
        }
    }

    /// Posts an out-of-band notice to every queue-bound port.
    pub fn post_oob_all(&self, notice: OobNotice) {
        let slots = self.slots.read();
        for slot in slots.iter() {
            if let Some(Slot::Queue(tx)) = slot {
                let _ = tx.try_send(Delivery::Oob(notice));
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn bind_port_zero_is_invalid() {
        let table = PortTable::new();
        assert!(matches!(
            table.bind_queue(0, 4),
            Err(ClusterError::InvalidPort(0))
        ));
    }

    #[test]
    fn rebinding_a_live_port_is_address_in_use() {
        let table = PortTable::new();
        let _rx = table.bind_queue(31, 4).unwrap();
        assert!(matches!(
            table.bind_queue(31, 4),
            Err(ClusterError::AddressInUse(31))
        ));

        table.unbind(31);
        assert!(table.bind_queue(31, 4).is_ok());
    }

    #[test]
    fn deliver_to_queue() {
        let table = PortTable::new();
        let mut rx = table.bind_queue(31, 4).unwrap();

        let status = table.deliver(31, 2, Bytes::from_static(b"hi"));
        assert_eq!(status, DeliverStatus::Delivered);

        match rx.try_recv().unwrap() {
            Delivery::Data {
                src_node,
                port,
                payload,
            } => {
                assert_eq!(src_node, 2);
                assert_eq!(port, 31);
                assert_eq!(&payload[..], b"hi");
            }
            Delivery::Oob(_) => panic!("expected data"),
        }
    }

    #[test]
    fn deliver_to_callback() {
        let table = PortTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        table
            .bind_callback(32, move |src, payload| {
                assert_eq!(src, 4);
                assert_eq!(&payload[..], b"x");
                hits2.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        assert_eq!(
            table.deliver(32, 4, Bytes::from_static(b"x")),
            DeliverStatus::Delivered
        );
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn deliver_without_listener() {
        let table = PortTable::new();
        assert_eq!(
            table.deliver(33, 1, Bytes::new()),
            DeliverStatus::NoListener
        );
    }

    #[test]
    fn full_queue_is_reported() {
        let table = PortTable::new();
        let _rx = table.bind_queue(34, 1).unwrap();
        assert_eq!(
            table.deliver(34, 1, Bytes::from_static(b"a")),
            DeliverStatus::Delivered
        );
        assert_eq!(
            table.deliver(34, 1, Bytes::from_static(b"b")),
            DeliverStatus::QueueFull
        );
    }

    #[test]
    fn oob_notices_reach_queues_only() {
        let table = PortTable::new();
        let mut rx = table.bind_queue(35, 4).unwrap();
        table
            .bind_callback(36, |_, _| panic!("callbacks never get OOB"))
            .unwrap();

        table.post_oob_all(OobNotice::StateChange);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Delivery::Oob(OobNotice::StateChange)
        ));
    }

    #[test]
    fn dropped_receiver_counts_as_no_listener() {
        let table = PortTable::new();
        let rx = table.bind_queue(37, 4).unwrap();
        drop(rx);
        assert_eq!(
            table.deliver(37, 1, Bytes::from_static(b"z")),
            DeliverStatus::NoListener
        );
    }
}
