//! Cluster-name and hostname hashes.

/// Folds a cluster name into the 16-bit cluster id carried in every header.
///
/// Shift-and-add over the name bytes, truncated to 16 bits. The hash is not
/// collision-free; true uniqueness comes from the cluster-name string match
/// during join validation.
#[must_use]
pub fn cluster_id_hash(name: &str) -> u16 {
    let mut value: u32 = 0;
    for b in name.bytes() {
        value <<= 1;
        value = value.wrapping_add(u32::from(b));
    }
    (value & 0xFFFF) as u16
}

/// Per-hostname backoff, in seconds (1..=16).
///
/// Used as a secondary tie-break when a STARTING node observes a NEWCLUSTER
/// announcement: nodes with different names retry on different schedules.
#[must_use]
pub fn node_backoff_hash(nodename: &str) -> u64 {
    let sum: u32 = nodename.bytes().map(u32::from).sum();
    u64::from(sum & 0xF) + 1
}
