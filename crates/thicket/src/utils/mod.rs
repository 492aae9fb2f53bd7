//! Small shared helpers: total-order wrappers, the branch queue of the tree
//! searches, and a visited-row bitset.

mod branch_queue;
mod ord_items;

pub(crate) use branch_queue::BranchQueue;
pub use ord_items::{MaxItem, MinItem};

/// Tracks which rows a query has already evaluated, so that points reachable
/// through several trees or buckets are scored once.
pub(crate) struct VisitSet {
    /// One bit per logical row index.
    bits: Vec<u64>,
}

impl VisitSet {
    /// Creates a set covering `len` rows, all unvisited.
    pub(crate) fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(64)],
        }
    }

    /// Marks `i` as visited. Returns true if it was not visited before.
    pub(crate) fn insert(&mut self, i: usize) -> bool {
        let (word, bit) = (i / 64, 1_u64 << (i % 64));
        let fresh = self.bits[word] & bit == 0;
        self.bits[word] |= bit;
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visit_set_reports_first_visit_only() {
        let mut seen = VisitSet::new(130);
        assert!(seen.insert(0));
        assert!(seen.insert(129));
        assert!(!seen.insert(0));
        assert!(!seen.insert(129));
        assert!(seen.insert(64));
    }
}
