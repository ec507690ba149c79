//! Victim selection for the frame table.
//!
//! Policies see the evictable (unpinned) frames lazily, in frame table order,
//! each with its activity score already sampled from the owner's hardware
//! mapping. Sampling takes the owner's mapper lock but not its page table
//! lock, so a score may be stale by the time the victim is evicted. That is
//! tolerated on a single core; a multi-core port needs to stop the owners or
//! accept the relaxed ordering.

use arbitrary_int::u2;
use kidneyos_vm_shared::mem::PhysAddr;

/// An evictable frame and its activity score, `accessed << 1 | dirty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub frame: PhysAddr,
    pub score: u2,
}

impl Candidate {
    pub fn score_of(accessed: bool, dirty: bool) -> u2 {
        u2::new((u8::from(accessed) << 1) | u8::from(dirty))
    }
}

pub trait PageReplacementPolicy: Send + Sync {
    /// Picks the frame to evict, or `None` if there are no candidates.
    fn select_victim(&self, candidates: &mut dyn Iterator<Item = Candidate>) -> Option<PhysAddr>;
}

/// Not-recently-used: the first idle frame, otherwise the least active one.
///
/// A score of zero (neither accessed nor dirty) ends the scan at once. Ties
/// on the minimum go to the frame seen first.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotRecentlyUsed;

impl PageReplacementPolicy for NotRecentlyUsed {
    fn select_victim(&self, candidates: &mut dyn Iterator<Item = Candidate>) -> Option<PhysAddr> {
        let mut best: Option<Candidate> = None;
        for candidate in candidates {
            if candidate.score == u2::new(0) {
                return Some(candidate.frame);
            }
            if best.map_or(true, |b| candidate.score < b.score) {
                best = Some(candidate);
            }
        }
        best.map(|b| b.frame)
    }
}

/// Evicts the lowest-addressed unpinned frame regardless of activity.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstUnpinned;

impl PageReplacementPolicy for FirstUnpinned {
    fn select_victim(&self, candidates: &mut dyn Iterator<Item = Candidate>) -> Option<PhysAddr> {
        candidates.next().map(|c| c.frame)
    }
}
