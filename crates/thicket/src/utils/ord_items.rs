//! Total-order wrappers over partially ordered values.
//!
//! Distance values are only `PartialOrd` (floats), but heaps and `min_by_key`
//! want `Ord`. These wrappers order by their second field and push incomparable
//! values (NaN) to the losing end: largest for [`MinItem`], smallest for
//! [`MaxItem`], so a NaN distance never wins a selection.

use core::cmp::Ordering;

/// Orders by the second field, for tracking minima. The first field is
/// payload and is ignored by the ordering.
#[derive(Clone, Copy, Debug)]
pub struct MinItem<A, T>(pub A, pub T);

impl<A, T: PartialOrd> PartialEq for MinItem<A, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<A, T: PartialOrd> Eq for MinItem<A, T> {}

impl<A, T: PartialOrd> PartialOrd for MinItem<A, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A, T: PartialOrd> Ord for MinItem<A, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.1.partial_cmp(&other.1).unwrap_or(Ordering::Greater)
    }
}

/// Orders by the second field, for tracking maxima. The first field is
/// payload and is ignored by the ordering.
#[derive(Clone, Copy, Debug)]
pub struct MaxItem<A, T>(pub A, pub T);

impl<A, T: PartialOrd> PartialEq for MaxItem<A, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<A, T: PartialOrd> Eq for MaxItem<A, T> {}

impl<A, T: PartialOrd> PartialOrd for MaxItem<A, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A, T: PartialOrd> Ord for MaxItem<A, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.1.partial_cmp(&other.1).unwrap_or(Ordering::Less)
    }
}
