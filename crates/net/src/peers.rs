//! In-memory registry of known peers with liveness tracking.
//!
//! The table is the single source of truth for "who can I ask for blocks".
//! The control server's peer list is merged in via [`PeerTable::replace`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

use ctp_core::id::PeerId;

/// Consecutive timed-out requests before a peer turns SUSPECT.
pub const SUSPECT_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Alive,
    Suspect,
    Gone,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub last_seen_at: Instant,
    pub state: PeerState,
    pub consecutive_failures: u32,
}

impl PeerRecord {
    fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self {
            peer_id,
            addr,
            last_seen_at: Instant::now(),
            state: PeerState::Alive,
            consecutive_failures: 0,
        }
    }
}

/// Thread-safe `peer_id -> record` map. At most one record per peer id;
/// critical sections are O(1) or a single pass.
#[derive(Default)]
pub struct PeerTable {
    inner: Mutex<HashMap<PeerId, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly learned peer, or refresh the address of a known one.
    pub fn upsert(&self, peer_id: PeerId, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(peer_id)
            .and_modify(|r| r.addr = addr)
            .or_insert_with(|| {
                debug!(peer = ?peer_id, %addr, "learned peer");
                PeerRecord::new(peer_id, addr)
            });
    }

    /// Any successful response makes a peer ALIVE again.
    pub fn mark_success(&self, peer_id: &PeerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.get_mut(peer_id) {
            r.consecutive_failures = 0;
            r.state = PeerState::Alive;
            r.last_seen_at = Instant::now();
        }
    }

    /// Record a timed-out request. Returns the peer's state afterwards;
    /// `Some(Suspect)` exactly when this failure crossed the threshold.
    pub fn mark_failure(&self, peer_id: &PeerId) -> Option<PeerState> {
        let mut inner = self.inner.lock().unwrap();
        let r = inner.get_mut(peer_id)?;
        r.consecutive_failures += 1;
        if r.state == PeerState::Alive && r.consecutive_failures >= SUSPECT_AFTER {
            r.state = PeerState::Suspect;
            debug!(peer = ?peer_id, failures = r.consecutive_failures, "peer suspect");
        }
        Some(r.state)
    }

    /// SUSPECT becomes GONE once reported to the control server.
    pub fn mark_gone(&self, peer_id: &PeerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.get_mut(peer_id) {
            r.state = PeerState::Gone;
        }
    }

    pub fn remove(&self, peer_id: &PeerId) {
        self.inner.lock().unwrap().remove(peer_id);
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.inner.lock().unwrap().contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Point-in-time copy, safe to iterate outside the lock.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Atomically swap in a fresh peer list. Records that persist keep their
    /// `last_seen_at` and liveness; GONE records are evicted outright, so a
    /// re-listed peer starts over as ALIVE.
    pub fn replace(&self, peers: &[(PeerId, SocketAddr)]) {
        let mut inner = self.inner.lock().unwrap();
        let mut next = HashMap::with_capacity(peers.len());
        for (peer_id, addr) in peers {
            let record = match inner.remove(peer_id) {
                Some(old) if old.state != PeerState::Gone => PeerRecord {
                    addr: *addr,
                    ..old
                },
                _ => PeerRecord::new(*peer_id, *addr),
            };
            next.insert(*peer_id, record);
        }
        *inner = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(x: u8) -> PeerId {
        PeerId([x; 32])
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn failure_threshold_turns_suspect() {
        let table = PeerTable::new();
        table.upsert(pid(1), addr(7001));
        assert_eq!(table.mark_failure(&pid(1)), Some(PeerState::Alive));
        assert_eq!(table.mark_failure(&pid(1)), Some(PeerState::Alive));
        assert_eq!(table.mark_failure(&pid(1)), Some(PeerState::Suspect));
        // staying suspect, not flapping
        assert_eq!(table.mark_failure(&pid(1)), Some(PeerState::Suspect));
    }

    #[test]
    fn success_resets_failures() {
        let table = PeerTable::new();
        table.upsert(pid(1), addr(7001));
        table.mark_failure(&pid(1));
        table.mark_failure(&pid(1));
        table.mark_success(&pid(1));
        assert_eq!(table.mark_failure(&pid(1)), Some(PeerState::Alive));
    }

    #[test]
    fn suspect_recovers_on_success() {
        let table = PeerTable::new();
        table.upsert(pid(1), addr(7001));
        for _ in 0..3 {
            table.mark_failure(&pid(1));
        }
        table.mark_success(&pid(1));
        let snap = table.snapshot();
        assert_eq!(snap[0].state, PeerState::Alive);
        assert_eq!(snap[0].consecutive_failures, 0);
    }

    #[test]
    fn replace_preserves_surviving_records() {
        let table = PeerTable::new();
        table.upsert(pid(1), addr(7001));
        table.upsert(pid(2), addr(7002));
        table.mark_failure(&pid(1));
        let seen_before = table.snapshot()[0].last_seen_at;

        table.replace(&[(pid(1), addr(9001)), (pid(3), addr(7003))]);

        let snap = table.snapshot();
        assert_eq!(snap.len(), 2);
        let p1 = snap.iter().find(|r| r.peer_id == pid(1)).unwrap();
        assert_eq!(p1.addr, addr(9001));
        assert_eq!(p1.consecutive_failures, 1);
        assert_eq!(p1.last_seen_at, seen_before);
        assert!(!table.contains(&pid(2)));
        assert!(table.contains(&pid(3)));
    }

    #[test]
    fn gone_records_evicted_on_replace() {
        let table = PeerTable::new();
        table.upsert(pid(1), addr(7001));
        table.mark_gone(&pid(1));
        table.replace(&[(pid(1), addr(7001))]);
        let snap = table.snapshot();
        assert_eq!(snap[0].state, PeerState::Alive);
        assert_eq!(snap[0].consecutive_failures, 0);
    }

    #[test]
    fn one_record_per_peer_id() {
        let table = PeerTable::new();
        table.upsert(pid(1), addr(7001));
        table.upsert(pid(1), addr(7002));
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot()[0].addr, addr(7002));
    }
}
