//! # Reassembly
//!
//! Index-keyed collection of text pieces until a set is complete. One
//! generic [`ReassemblyTable`] backs both tiers:
//!
//! - [`FragmentReassembler`] undoes the firmware's radio-level splitting
//!   (`FRAG` lines), keyed by [`FragmentKey`] = (source, sequence).
//! - [`MeshReassembler`] undoes `FRAG:<idx>:<total>:<chunk>` splitting done
//!   by a sending host on the command path, keyed by [`MeshFragmentKey`].
//! - [`crate::assembler::ChunkAssembler`] undoes application-level
//!   `FILECHUNK` splitting, keyed by transmission filename.
//!
//! ```text
//!   (absent) ──first piece──▶ collecting ──|pieces| == total──▶ emitted + removed
//!                                 │
//!                          idle > stale_after
//!                                 ▼
//!                              evicted
//! ```
//!
//! The first-seen `total` is authoritative. Pieces that disagree with it,
//! or whose index falls outside `[0, total)`, are rejected and leave the
//! pending set untouched.
//!
//! Not thread-safe; the transport's reader thread is the only writer.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use quanta::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Default idle time before an incomplete set is evicted.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Why a piece was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error("total piece count is zero")]
    ZeroTotal,

    #[error("index {index} out of range for total {total}")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("total mismatch: pending set expects {expected}, piece claims {actual}")]
    TotalMismatch { expected: u32, actual: u32 },
}

// ─── Pending Set ────────────────────────────────────────────────────────────

/// Pieces collected so far for one key.
#[derive(Debug)]
struct PendingSet {
    total: u32,
    pieces: BTreeMap<u32, String>,
    first_seen: Instant,
    last_update: Instant,
}

impl PendingSet {
    fn new(total: u32, now: Instant) -> Self {
        Self {
            total,
            pieces: BTreeMap::new(),
            first_seen: now,
            last_update: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.pieces.len() == self.total as usize
    }

    /// Concatenate in index order. Only called once complete, when the
    /// keys are exactly `0..total`.
    fn concat(self) -> String {
        let len = self.pieces.values().map(String::len).sum();
        let mut out = String::with_capacity(len);
        for piece in self.pieces.into_values() {
            out.push_str(&piece);
        }
        out
    }
}

/// Outcome of inserting one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Still collecting.
    Pending { received: usize, total: u32 },
    /// The set completed; it has been removed from the table.
    Complete(String),
}

/// An incomplete set dropped by [`ReassemblyTable::evict_stale`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted<K> {
    pub key: K,
    pub received: usize,
    pub total: u32,
    pub age: Duration,
}

// ─── Table ──────────────────────────────────────────────────────────────────

/// Pending sets indexed by key.
#[derive(Debug)]
pub struct ReassemblyTable<K> {
    pending: HashMap<K, PendingSet>,
    stale_after: Duration,
}

impl<K: Eq + Hash + Clone + Debug> ReassemblyTable<K> {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            stale_after,
        }
    }

    pub fn insert(
        &mut self,
        key: K,
        index: u32,
        total: u32,
        piece: String,
    ) -> Result<Progress, ReassemblyError> {
        self.insert_at(key, index, total, piece, Instant::now())
    }

    /// Insert a piece, overwriting any earlier piece with the same index.
    pub fn insert_at(
        &mut self,
        key: K,
        index: u32,
        total: u32,
        piece: String,
        now: Instant,
    ) -> Result<Progress, ReassemblyError> {
        if total == 0 {
            return Err(ReassemblyError::ZeroTotal);
        }

        match self.pending.entry(key) {
            Entry::Occupied(mut occupied) => {
                let set = occupied.get_mut();
                if set.total != total {
                    return Err(ReassemblyError::TotalMismatch {
                        expected: set.total,
                        actual: total,
                    });
                }
                if index >= total {
                    return Err(ReassemblyError::IndexOutOfRange { index, total });
                }
                set.pieces.insert(index, piece);
                set.last_update = now;
                if set.is_complete() {
                    Ok(Progress::Complete(occupied.remove().concat()))
                } else {
                    Ok(Progress::Pending {
                        received: set.pieces.len(),
                        total,
                    })
                }
            }
            Entry::Vacant(vacant) => {
                if index >= total {
                    return Err(ReassemblyError::IndexOutOfRange { index, total });
                }
                let mut set = PendingSet::new(total, now);
                set.pieces.insert(index, piece);
                if set.is_complete() {
                    return Ok(Progress::Complete(set.concat()));
                }
                vacant.insert(set);
                Ok(Progress::Pending { received: 1, total })
            }
        }
    }

    /// Drop every set whose last update is older than `stale_after`.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<Evicted<K>> {
        let stale_after = self.stale_after;
        let mut evicted = Vec::new();
        self.pending.retain(|key, set| {
            let idle = now.saturating_duration_since(set.last_update);
            if idle <= stale_after {
                return true;
            }
            evicted.push(Evicted {
                key: key.clone(),
                received: set.pieces.len(),
                total: set.total,
                age: now.saturating_duration_since(set.first_seen),
            });
            false
        });
        evicted
    }

    /// Pieces received so far for `key`, with the expected total.
    pub fn progress(&self, key: &K) -> Option<(usize, u32)> {
        self.pending
            .get(key)
            .map(|set| (set.pieces.len(), set.total))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

// ─── Radio Fragments ────────────────────────────────────────────────────────

/// Identity of one radio-fragmented payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub source: String,
    pub sequence: u32,
}

impl FragmentKey {
    pub fn new(source: impl Into<String>, sequence: u32) -> Self {
        Self {
            source: source.into(),
            sequence,
        }
    }
}

/// Undoes firmware-level `FRAG` splitting.
#[derive(Debug)]
pub struct FragmentReassembler {
    table: ReassemblyTable<FragmentKey>,
}

impl FragmentReassembler {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            table: ReassemblyTable::new(stale_after),
        }
    }

    /// Add one fragment; returns the full payload when the set completes.
    pub fn add_fragment(
        &mut self,
        source: &str,
        sequence: u32,
        index: u32,
        total: u32,
        chunk: String,
    ) -> Result<Option<String>, ReassemblyError> {
        self.add_fragment_at(source, sequence, index, total, chunk, Instant::now())
    }

    pub fn add_fragment_at(
        &mut self,
        source: &str,
        sequence: u32,
        index: u32,
        total: u32,
        chunk: String,
        now: Instant,
    ) -> Result<Option<String>, ReassemblyError> {
        let key = FragmentKey::new(source, sequence);
        match self.table.insert_at(key, index, total, chunk, now)? {
            Progress::Pending { received, total } => {
                debug!(%source, sequence, index, received, total, "fragment buffered");
                Ok(None)
            }
            Progress::Complete(payload) => {
                debug!(%source, sequence, len = payload.len(), "fragment set complete");
                Ok(Some(payload))
            }
        }
    }

    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let evicted = self.table.evict_stale(now);
        for e in &evicted {
            warn!(
                source = %e.key.source,
                sequence = e.key.sequence,
                received = e.received,
                total = e.total,
                age_s = e.age.as_secs(),
                "evicting stale fragment set"
            );
        }
        evicted.len()
    }

    pub fn progress(&self, source: &str, sequence: u32) -> Option<(usize, u32)> {
        self.table.progress(&FragmentKey::new(source, sequence))
    }

    pub fn pending(&self) -> usize {
        self.table.len()
    }
}

impl Default for FragmentReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

// ─── Command-Path Fragments ─────────────────────────────────────────────────

/// Identity of one command-path payload.
///
/// `FRAG:` pieces carry no transfer id and each arrives in its own routed
/// packet with a fresh packet sequence, so pieces are grouped by sender and
/// piece count. Two interleaved transfers from one node with the same piece
/// count are indistinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshFragmentKey {
    pub source: String,
    pub total: u32,
}

/// Undoes host-level `FRAG:` splitting of payloads received over the mesh.
#[derive(Debug)]
pub struct MeshReassembler {
    table: ReassemblyTable<MeshFragmentKey>,
}

impl MeshReassembler {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            table: ReassemblyTable::new(stale_after),
        }
    }

    pub fn add_piece(
        &mut self,
        source: &str,
        index: u32,
        total: u32,
        chunk: String,
    ) -> Result<Option<String>, ReassemblyError> {
        self.add_piece_at(source, index, total, chunk, Instant::now())
    }

    pub fn add_piece_at(
        &mut self,
        source: &str,
        index: u32,
        total: u32,
        chunk: String,
        now: Instant,
    ) -> Result<Option<String>, ReassemblyError> {
        let key = MeshFragmentKey {
            source: source.to_string(),
            total,
        };
        match self.table.insert_at(key, index, total, chunk, now)? {
            Progress::Pending { received, total } => {
                debug!(%source, index, received, total, "mesh piece buffered");
                Ok(None)
            }
            Progress::Complete(payload) => {
                debug!(%source, total, len = payload.len(), "mesh payload complete");
                Ok(Some(payload))
            }
        }
    }

    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let evicted = self.table.evict_stale(now);
        for e in &evicted {
            warn!(
                source = %e.key.source,
                received = e.received,
                total = e.total,
                age_s = e.age.as_secs(),
                "evicting stale mesh payload"
            );
        }
        evicted.len()
    }

    pub fn pending(&self) -> usize {
        self.table.len()
    }
}

impl Default for MeshReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pieces_of(payload: &str, size: usize) -> Vec<String> {
        payload
            .as_bytes()
            .chunks(size)
            .map(|c| String::from_utf8(c.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn in_order_completion_emits_and_removes() {
        let mut r = FragmentReassembler::default();
        assert_eq!(r.add_fragment("n1", 9, 0, 3, "ab".into()).unwrap(), None);
        assert_eq!(r.add_fragment("n1", 9, 1, 3, "cd".into()).unwrap(), None);
        assert_eq!(r.progress("n1", 9), Some((2, 3)));
        assert_eq!(
            r.add_fragment("n1", 9, 2, 3, "ef".into()).unwrap(),
            Some("abcdef".into())
        );
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn keys_are_independent() {
        let mut r = FragmentReassembler::default();
        r.add_fragment("a", 1, 0, 2, "x".into()).unwrap();
        r.add_fragment("b", 1, 0, 2, "y".into()).unwrap();
        r.add_fragment("a", 2, 0, 2, "z".into()).unwrap();
        assert_eq!(r.pending(), 3);
        assert_eq!(
            r.add_fragment("b", 1, 1, 2, "Y".into()).unwrap(),
            Some("yY".into())
        );
        assert_eq!(r.pending(), 2);
    }

    #[test]
    fn single_fragment_set_completes_immediately() {
        let mut r = FragmentReassembler::default();
        assert_eq!(
            r.add_fragment("a", 0, 0, 1, "whole".into()).unwrap(),
            Some("whole".into())
        );
    }

    #[test]
    fn duplicate_overwrites_without_counting() {
        let mut r = FragmentReassembler::default();
        r.add_fragment("a", 1, 0, 2, "old".into()).unwrap();
        r.add_fragment("a", 1, 0, 2, "new".into()).unwrap();
        assert_eq!(r.progress("a", 1), Some((1, 2)));
        assert_eq!(
            r.add_fragment("a", 1, 1, 2, "!".into()).unwrap(),
            Some("new!".into())
        );
    }

    #[test]
    fn mismatched_total_is_rejected_and_first_seen_kept() {
        let mut r = FragmentReassembler::default();
        r.add_fragment("a", 1, 0, 3, "p0".into()).unwrap();
        let err = r.add_fragment("a", 1, 1, 2, "p1".into()).unwrap_err();
        assert_eq!(
            err,
            ReassemblyError::TotalMismatch {
                expected: 3,
                actual: 2
            }
        );
        assert_eq!(r.progress("a", 1), Some((1, 3)));
    }

    #[test]
    fn out_of_range_and_zero_total_are_rejected() {
        let mut r = FragmentReassembler::default();
        assert_eq!(
            r.add_fragment("a", 1, 0, 0, "x".into()).unwrap_err(),
            ReassemblyError::ZeroTotal
        );
        assert_eq!(
            r.add_fragment("a", 1, 5, 2, "x".into()).unwrap_err(),
            ReassemblyError::IndexOutOfRange { index: 5, total: 2 }
        );
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn stale_sets_are_evicted() {
        let mut r = FragmentReassembler::new(Duration::from_secs(10));
        let t0 = Instant::now();
        r.add_fragment_at("a", 1, 0, 2, "x".into(), t0).unwrap();
        r.add_fragment_at("b", 1, 0, 2, "y".into(), t0 + Duration::from_secs(8))
            .unwrap();

        assert_eq!(r.evict_stale(t0 + Duration::from_secs(5)), 0);
        assert_eq!(r.evict_stale(t0 + Duration::from_secs(11)), 1);
        assert_eq!(r.progress("a", 1), None);
        assert_eq!(r.progress("b", 1), Some((1, 2)));
    }

    #[test]
    fn late_piece_refreshes_idle_timer() {
        let mut table = ReassemblyTable::new(Duration::from_secs(10));
        let t0 = Instant::now();
        table.insert_at("f", 0, 3, "a".into(), t0).unwrap();
        table
            .insert_at("f", 1, 3, "b".into(), t0 + Duration::from_secs(9))
            .unwrap();
        assert!(table.evict_stale(t0 + Duration::from_secs(15)).is_empty());
        let evicted = table.evict_stale(t0 + Duration::from_secs(20));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].received, 2);
        assert_eq!(evicted[0].total, 3);
    }

    #[test]
    fn mesh_pieces_group_by_source_and_count() {
        let mut r = MeshReassembler::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert_eq!(r.add_piece_at("Node_1", 1, 2, "lo".into(), t0).unwrap(), None);
        assert_eq!(r.add_piece_at("Node_5", 0, 2, "xx".into(), t0).unwrap(), None);
        assert_eq!(r.add_piece_at("Node_1", 0, 3, "a".into(), t0).unwrap(), None);
        assert_eq!(r.pending(), 3);
        assert_eq!(
            r.add_piece_at("Node_1", 0, 2, "hel".into(), t0).unwrap(),
            Some("hello".into())
        );
        assert_eq!(r.evict_stale(t0 + Duration::from_secs(11)), 2);
        assert_eq!(r.pending(), 0);
    }

    fn payload_and_order() -> impl Strategy<Value = (String, usize, Vec<usize>)> {
        ("[ -~]{1,200}", 1usize..16).prop_flat_map(|(payload, size)| {
            let count = payload.len().div_ceil(size);
            let order = Just((0..count).collect::<Vec<_>>()).prop_shuffle();
            (Just(payload), Just(size), order)
        })
    }

    proptest! {
        #[test]
        fn any_delivery_order_reassembles(
            (payload, size, order) in payload_and_order()
        ) {
            let pieces = pieces_of(&payload, size);
            let total = pieces.len() as u32;
            let mut r = FragmentReassembler::default();
            let mut out = None;
            for (n, &idx) in order.iter().enumerate() {
                let res = r.add_fragment("src", 1, idx as u32, total, pieces[idx].clone()).unwrap();
                if n + 1 < order.len() {
                    prop_assert!(res.is_none());
                } else {
                    out = res;
                }
            }
            prop_assert_eq!(out, Some(payload));
            prop_assert_eq!(r.pending(), 0);
        }

        #[test]
        fn redelivery_never_changes_threshold(
            (payload, size, order) in payload_and_order(),
            dup_seed in any::<usize>()
        ) {
            let pieces = pieces_of(&payload, size);
            let total = pieces.len() as u32;
            prop_assume!(total >= 2);
            let mut r = FragmentReassembler::default();
            let (head, last) = order.split_at(order.len() - 1);
            for &idx in head {
                r.add_fragment("s", 2, idx as u32, total, pieces[idx].clone()).unwrap();
            }
            let dup = head[dup_seed % head.len()];
            prop_assert!(r.add_fragment("s", 2, dup as u32, total, pieces[dup].clone()).unwrap().is_none());
            prop_assert_eq!(r.progress("s", 2), Some((head.len(), total)));
            let done = r.add_fragment("s", 2, last[0] as u32, total, pieces[last[0]].clone()).unwrap();
            prop_assert_eq!(done, Some(payload));
        }
    }
}
