//! Temporary node ids for peers whose real id is not yet known.
//!
//! During a join the applicant has no node id, so the first contact from an
//! unknown address mints a negative id that downstream code can use as a
//! handle. Once the peer is admitted with a real id, its temp entries are
//! purged at end-of-transition.

use parking_lot::Mutex;

use super::endpoint::addr_equal;

struct TempEntry {
    id: i32,
    address: Vec<u8>,
}

/// Allocator and registry of temporary (negative) node ids.
#[derive(Default)]
pub struct TempNodeIds {
    inner: Mutex<Vec<TempEntry>>,
}

impl TempNodeIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the temp id for `address`, minting the next more-negative id
    /// on first contact.
    pub fn get_or_create(&self, address: &[u8]) -> i32 {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.iter().find(|e| addr_equal(&e.address, address)) {
            return entry.id;
        }
        let id = inner.iter().map(|e| e.id).min().unwrap_or(0) - 1;
        inner.push(TempEntry {
            id,
            address: address.to_vec(),
        });
        id
    }

    /// Whether `id` names a live temp entry.
    #[must_use]
    pub fn is_valid(&self, id: i32) -> bool {
        id < 0 && self.inner.lock().iter().any(|e| e.id == id)
    }

    /// The address behind a temp id.
    #[must_use]
    pub fn address_of(&self, id: i32) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.address.clone())
    }

    /// Drops every entry whose address appears in `member_addresses`.
    /// Run at end-of-transition, once the peers own real node ids.
    pub fn purge(&self, member_addresses: &[Vec<u8>]) {
        self.inner.lock().retain(|e| {
            !member_addresses
                .iter()
                .any(|addr| addr_equal(addr, &e.address))
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
