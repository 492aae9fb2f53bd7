//! Result sets for k-NN and radius queries.
//!
//! Every search algorithm feeds candidates into a result set and reads back
//! `worst_dist` as the cutoff for further distance computations. The k-NN
//! variant saturates at `k` and then only accepts improvements; the radius
//! variant accepts everything within the radius.

use core::cmp::Ordering;
use std::collections::BinaryHeap;

use proximity::Number;

/// The protocol between a search and its output.
pub trait ResultSet<D: Number> {
    /// Offers a candidate row at the given distance.
    fn add(&mut self, index: usize, dist: D);

    /// The current cutoff: a candidate at or beyond this distance cannot
    /// improve the result.
    fn worst_dist(&self) -> D;

    /// Whether the result has saturated. Radius results never saturate.
    fn is_full(&self) -> bool;
}

/// One kept candidate.
///
/// Ordered by distance, then row, so the heap root is always the candidate
/// to displace first and equal distances keep the earlier row. A NaN
/// distance sorts worst and so never survives a displacement.
#[derive(Clone, Copy, Debug)]
struct Hit<D> {
    /// The distance from the query.
    dist: D,
    /// The dataset row.
    row: usize,
}

impl<D: Number> PartialEq for Hit<D> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<D: Number> Eq for Hit<D> {}

impl<D: Number> PartialOrd for Hit<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<D: Number> Ord for Hit<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(Ordering::Greater)
            .then(self.row.cmp(&other.row))
    }
}

/// Offers `hit` to a heap keeping at most `k` of the smallest hits.
fn displace_worst<D: Number>(heap: &mut BinaryHeap<Hit<D>>, k: usize, hit: Hit<D>) {
    if heap.len() < k {
        heap.push(hit);
    } else if let Some(&worst) = heap.peek() {
        if hit < worst {
            heap.pop();
            heap.push(hit);
        }
    }
}

/// Collects the `k` nearest rows seen so far.
///
/// Equal distances keep the earlier row index.
pub struct KnnResultSet<D: Number> {
    /// The kept candidates, worst on top.
    hits: BinaryHeap<Hit<D>>,
    /// How many rows to keep.
    k: usize,
}

impl<D: Number> KnnResultSet<D> {
    /// Creates a result set that keeps the best `k` rows.
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            hits: BinaryHeap::with_capacity(k),
            k,
        }
    }

    /// How many rows have been kept so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Whether no rows have been kept yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Consumes the set and returns `(index, distance)` pairs in
    /// non-descending distance order, ties by index.
    #[must_use]
    pub fn into_sorted_vec(self) -> Vec<(usize, D)> {
        self.hits.into_sorted_vec().into_iter().map(|h| (h.row, h.dist)).collect()
    }
}

impl<D: Number> ResultSet<D> for KnnResultSet<D> {
    fn add(&mut self, index: usize, dist: D) {
        displace_worst(&mut self.hits, self.k, Hit { dist, row: index });
    }

    fn worst_dist(&self) -> D {
        if self.hits.len() >= self.k {
            self.hits.peek().map_or_else(D::max_value, |h| h.dist)
        } else {
            D::max_value()
        }
    }

    fn is_full(&self) -> bool {
        self.hits.len() >= self.k
    }
}

/// Collects every row within a fixed radius, optionally capped.
///
/// With a cap, the closest `max_neighbors` rows within the radius are kept.
pub struct RadiusResultSet<D: Number> {
    /// The query radius; doubles as the distance cutoff.
    radius: D,
    /// The cap on kept rows.
    cap: usize,
    /// The kept candidates.
    hits: BinaryHeap<Hit<D>>,
}

impl<D: Number> RadiusResultSet<D> {
    /// Creates a result set for the given radius, keeping at most
    /// `max_neighbors` rows when given.
    #[must_use]
    pub fn new(radius: D, max_neighbors: Option<usize>) -> Self {
        Self {
            radius,
            cap: max_neighbors.unwrap_or(usize::MAX),
            hits: BinaryHeap::new(),
        }
    }

    /// How many rows have been collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Whether no rows have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Consumes the set and returns `(index, distance)` pairs, sorted by
    /// distance (ties by index) when `sorted` is set.
    #[must_use]
    pub fn into_vec(self, sorted: bool) -> Vec<(usize, D)> {
        let hits = if sorted {
            self.hits.into_sorted_vec()
        } else {
            self.hits.into_vec()
        };
        hits.into_iter().map(|h| (h.row, h.dist)).collect()
    }
}

impl<D: Number> ResultSet<D> for RadiusResultSet<D> {
    fn add(&mut self, index: usize, dist: D) {
        if dist <= self.radius {
            displace_worst(&mut self.hits, self.cap, Hit { dist, row: index });
        }
    }

    fn worst_dist(&self) -> D {
        self.radius
    }

    fn is_full(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knn_keeps_the_k_best() {
        let mut result = KnnResultSet::new(3);
        for (i, d) in [9.0, 2.0, 7.0, 1.0, 5.0].into_iter().enumerate() {
            result.add(i, d);
        }
        assert!(result.is_full());
        assert_eq!(result.into_sorted_vec(), vec![(3, 1.0), (1, 2.0), (4, 5.0)]);
    }

    #[test]
    fn knn_ties_keep_the_earlier_index() {
        let mut result = KnnResultSet::new(2);
        result.add(5, 1.0);
        result.add(2, 1.0);
        result.add(0, 1.0);
        assert_eq!(result.into_sorted_vec(), vec![(0, 1.0), (2, 1.0)]);
    }

    #[test]
    fn knn_worst_dist_is_infinite_until_full() {
        let mut result: KnnResultSet<f32> = KnnResultSet::new(2);
        result.add(0, 3.0);
        assert_eq!(result.worst_dist(), f32::MAX);
        result.add(1, 4.0);
        assert!((result.worst_dist() - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn nan_distances_never_displace_real_hits() {
        let mut result = KnnResultSet::new(2);
        result.add(0, 2.0);
        result.add(1, 3.0);
        result.add(2, f64::NAN);
        assert_eq!(result.into_sorted_vec(), vec![(0, 2.0), (1, 3.0)]);
    }

    #[test]
    fn radius_rejects_beyond_radius_and_caps() {
        let mut result = RadiusResultSet::new(5.0, Some(2));
        result.add(0, 6.0);
        result.add(1, 4.0);
        result.add(2, 1.0);
        result.add(3, 3.0);
        assert!(!result.is_full());
        assert_eq!(result.into_vec(true), vec![(2, 1.0), (3, 3.0)]);
    }
}
