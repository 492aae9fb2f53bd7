//! A forest of randomized kd-trees searched jointly.
//!
//! Each tree splits on a dimension drawn from the few highest-variance
//! dimensions of a small sample, at the mean value of that dimension, down to
//! single-point leaves. A query descends all trees through one shared
//! min-heap of pruned branches, so the budget of leaf checks is spent where
//! the lower bounds look best across the whole forest.

use core::cmp::Reverse;
use core::ops::Range;

use proximity::{Element, Metric, Number};
use rand::{rngs::StdRng, seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    results::ResultSet,
    store::PointStore,
    utils::{BranchQueue, MaxItem, VisitSet},
};

/// Points sampled per node when estimating coordinate variances.
const VARIANCE_SAMPLE: usize = 100;

/// The split dimension is drawn uniformly among this many top-variance
/// dimensions.
const TOP_VARIANCE_DIMS: usize = 5;

/// The built forest: node arenas only, no row data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct KdForest {
    /// The trees, searched jointly.
    trees: Vec<KdTree>,
}

/// One randomized kd-tree as an arena of nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct KdTree {
    /// The node arena; children refer to it by index.
    nodes: Vec<KdNode>,
    /// The arena index of the root.
    root: u32,
}

/// A node of a randomized kd-tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum KdNode {
    /// A single dataset row.
    Leaf {
        /// The row index.
        point: u32,
    },
    /// An internal split.
    Split {
        /// The dimension compared against.
        dim: u32,
        /// The split threshold; rows with a smaller coordinate go low.
        value: f64,
        /// Arena index of the low child.
        low: u32,
        /// Arena index of the high child.
        high: u32,
    },
}

impl KdForest {
    /// Bytes held by the node arenas.
    pub(crate) fn used_memory(&self) -> usize {
        self.trees
            .iter()
            .map(|t| t.nodes.len() * core::mem::size_of::<KdNode>())
            .sum()
    }
}

/// Builds `trees` randomized kd-trees over the live rows of `store`.
pub(crate) fn build<E: Element>(store: &PointStore<E>, trees: usize, rng: &mut StdRng) -> KdForest {
    let live = store.live_indices();
    ftlog::debug!("Building a kd-forest of {trees} trees over {} rows", live.len());

    let forest = (0..trees)
        .map(|_| {
            let mut indices = live.clone();
            indices.shuffle(rng);
            let mut nodes = Vec::with_capacity(2 * indices.len());
            let root = build_subtree(store, &mut nodes, &mut indices, rng);
            KdTree { nodes, root }
        })
        .collect();
    KdForest { trees: forest }
}

/// Recursively builds the subtree holding `points`, returning its arena index.
#[allow(clippy::cast_possible_truncation)]
fn build_subtree<E: Element>(store: &PointStore<E>, nodes: &mut Vec<KdNode>, points: &mut [u32], rng: &mut StdRng) -> u32 {
    if points.len() == 1 {
        nodes.push(KdNode::Leaf { point: points[0] });
        return (nodes.len() - 1) as u32;
    }

    let (dim, mut value) = choose_split(store, points, rng);
    let mut split_at = plane_split(store, points, dim, value);
    if split_at == 0 || split_at == points.len() {
        // Every coordinate on this dimension coincides (the mean of equal
        // values is the value). Split by position at the exact coordinate so
        // construction terminates and the per-dimension bound stays exact.
        value = store.row(points[0] as usize)[dim as usize].as_f64();
        split_at = points.len() / 2;
    }

    let (low_points, high_points) = points.split_at_mut(split_at);
    let low = build_subtree(store, nodes, low_points, rng);
    let high = build_subtree(store, nodes, high_points, rng);
    nodes.push(KdNode::Split { dim, value, low, high });
    (nodes.len() - 1) as u32
}

/// Picks a split dimension among the top-variance dimensions of a sample and
/// returns it with the mean coordinate of the full node on that dimension.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn choose_split<E: Element>(store: &PointStore<E>, points: &[u32], rng: &mut StdRng) -> (u32, f64) {
    let cols = store.cols();
    let sample = &points[..points.len().min(VARIANCE_SAMPLE)];

    let mut mean = vec![0.0_f64; cols];
    for &i in sample {
        for (m, &x) in mean.iter_mut().zip(store.row(i as usize)) {
            *m += x.as_f64();
        }
    }
    for m in &mut mean {
        *m /= sample.len() as f64;
    }

    let mut variance = vec![0.0_f64; cols];
    for &i in sample {
        for (v, (m, &x)) in variance.iter_mut().zip(mean.iter().zip(store.row(i as usize))) {
            let d = x.as_f64() - m;
            *v += d * d;
        }
    }

    let mut by_variance = (0..cols).collect::<Vec<_>>();
    by_variance.sort_by_key(|&d| Reverse(MaxItem((), variance[d])));
    let dim = by_variance[rng.random_range(0..cols.min(TOP_VARIANCE_DIMS))];

    let full_mean = points.iter().map(|&i| store.row(i as usize)[dim].as_f64()).sum::<f64>() / points.len() as f64;
    (dim as u32, full_mean)
}

/// Partitions `points` so rows with a coordinate below `value` come first.
/// Returns the size of the low side.
fn plane_split<E: Element>(store: &PointStore<E>, points: &mut [u32], dim: u32, value: f64) -> usize {
    let mut split_at = 0;
    for i in 0..points.len() {
        if store.row(points[i] as usize)[dim as usize].as_f64() < value {
            points.swap(i, split_at);
            split_at += 1;
        }
    }
    split_at
}

/// Inserts freshly appended rows into every tree of the forest.
///
/// Each row descends to its leaf, which is replaced by a split between the
/// old point and the new one on their most-different dimension.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn add_points<E: Element>(forest: &mut KdForest, store: &PointStore<E>, new_rows: Range<usize>) {
    for i in new_rows {
        for tree in &mut forest.trees {
            add_one(tree, store, i as u32);
        }
    }
}

/// Inserts one row into one tree.
#[allow(clippy::cast_possible_truncation)]
fn add_one<E: Element>(tree: &mut KdTree, store: &PointStore<E>, new_point: u32) {
    let query = store.row(new_point as usize);

    let mut at = tree.root;
    loop {
        match tree.nodes[at as usize] {
            KdNode::Split { dim, value, low, high } => {
                at = if query[dim as usize].as_f64() < value { low } else { high };
            }
            KdNode::Leaf { point: old_point } => {
                let old = store.row(old_point as usize);
                let (dim, spread) = old
                    .iter()
                    .zip(query)
                    .map(|(&a, &b)| (a.as_f64() - b.as_f64()).abs())
                    .enumerate()
                    .max_by_key(|&(_, s)| MaxItem((), s))
                    .unwrap_or((0, 0.0));

                let (value, low_point, high_point) = if spread > 0.0 {
                    let (a, b) = (old[dim].as_f64(), query[dim].as_f64());
                    let value = (a + b) / 2.0;
                    if a < b {
                        (value, old_point, new_point)
                    } else {
                        (value, new_point, old_point)
                    }
                } else {
                    // Identical rows: any dimension works at the shared
                    // coordinate; the old point keeps the low side.
                    (old[0].as_f64(), old_point, new_point)
                };

                let low = tree.nodes.len() as u32;
                tree.nodes.push(KdNode::Leaf { point: low_point });
                let high = tree.nodes.len() as u32;
                tree.nodes.push(KdNode::Leaf { point: high_point });
                tree.nodes[at as usize] = KdNode::Split {
                    dim: dim as u32,
                    value,
                    low,
                    high,
                };
                return;
            }
        }
    }
}

/// Per-query state for a joint search of the forest.
struct ForestSearch<'a, E: Element, D: Number, M, R> {
    /// The dataset rows.
    store: &'a PointStore<E>,
    /// The metric the forest was built for.
    metric: &'a M,
    /// The query row.
    query: &'a [E],
    /// The shared branch queue across all trees, keyed by lower bound.
    heap: BranchQueue<D, (usize, u32)>,
    /// Rows already scored, across trees.
    visited: VisitSet,
    /// Leaf checks spent so far.
    checks: usize,
    /// The leaf-check budget.
    max_checks: usize,
    /// `1 + eps`: how loose the pruning bound is allowed to be.
    eps_error: f64,
    /// Where accepted candidates go.
    result: &'a mut R,
}

/// Searches the forest with a budget of `max_checks` leaf visits.
pub(crate) fn search<E, D, M, R>(
    forest: &KdForest,
    store: &PointStore<E>,
    metric: &M,
    query: &[E],
    result: &mut R,
    max_checks: usize,
    eps: f32,
) where
    E: Element,
    D: Number,
    M: Metric<E, D>,
    R: ResultSet<D>,
{
    let mut state = ForestSearch {
        store,
        metric,
        query,
        heap: BranchQueue::new(),
        visited: VisitSet::new(store.rows()),
        checks: 0,
        max_checks,
        eps_error: 1.0 + f64::from(eps),
        result,
    };

    for (t, tree) in forest.trees.iter().enumerate() {
        state.descend(forest, t, tree.root, D::zero());
    }
    while let Some((mindist, (t, node))) = state.heap.pop() {
        if state.budget_spent() {
            break;
        }
        state.descend(forest, t, node, mindist);
    }
}

impl<E: Element, D: Number, M: Metric<E, D>, R: ResultSet<D>> ForestSearch<'_, E, D, M, R> {
    /// Whether the query may stop: the budget is gone and the result has
    /// saturated.
    fn budget_spent(&self) -> bool {
        self.checks >= self.max_checks && self.result.is_full()
    }

    /// Walks from `node` to a leaf along the near side, queueing far branches
    /// with their updated lower bounds.
    fn descend(&mut self, forest: &KdForest, t: usize, node: u32, mindist: D) {
        let tree = &forest.trees[t];
        let mut at = node;
        loop {
            match tree.nodes[at as usize] {
                KdNode::Leaf { point } => {
                    let i = point as usize;
                    if self.visited.insert(i) && !self.store.is_removed(i) {
                        if self.budget_spent() {
                            return;
                        }
                        self.checks += 1;
                        let d = self.metric.distance(self.query, self.store.row(i), Some(self.result.worst_dist()));
                        self.result.add(i, d);
                    }
                    return;
                }
                KdNode::Split { dim, value, low, high } => {
                    let q = self.query[dim as usize].as_f64();
                    let (near, far) = if q < value { (low, high) } else { (high, low) };
                    let far_dist = mindist + self.metric.partial(q, value);
                    // Approximation prunes only when the caller allows slack:
                    // the accumulated bound may overshoot when one dimension
                    // is crossed repeatedly, so at eps = 0 every far branch
                    // stays queued and an unlimited budget is exact.
                    let prune = self.eps_error > 1.0 && far_dist.as_f64() * self.eps_error > self.result.worst_dist().as_f64();
                    if !prune {
                        self.heap.push(far_dist, (t, far));
                    }
                    at = near;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proximity::Euclidean;
    use rand::SeedableRng;

    use super::*;
    use crate::results::KnnResultSet;

    fn grid_store() -> PointStore<f32> {
        let rows = (0..64).map(|i| vec![(i % 8) as f32, (i / 8) as f32]).collect::<Vec<_>>();
        PointStore::from_rows(rows).map_err(|e| e.to_string()).unwrap()
    }

    #[test]
    fn every_point_lands_in_exactly_one_leaf_per_tree() {
        let store = grid_store();
        let mut rng = StdRng::seed_from_u64(3);
        let forest = build(&store, 4, &mut rng);
        assert_eq!(forest.trees.len(), 4);

        for tree in &forest.trees {
            let mut seen = vec![0_usize; store.rows()];
            for node in &tree.nodes {
                if let KdNode::Leaf { point } = node {
                    seen[*point as usize] += 1;
                }
            }
            assert!(seen.iter().all(|&n| n == 1));
        }
    }

    #[test]
    fn unlimited_search_is_exact() {
        let store = grid_store();
        let mut rng = StdRng::seed_from_u64(5);
        let forest = build(&store, 4, &mut rng);

        let query = [3.2_f32, 4.9];
        let mut result: KnnResultSet<f32> = KnnResultSet::new(1);
        search(&forest, &store, &Euclidean, &query, &mut result, usize::MAX, 0.0);
        // (3, 5) is row 5 * 8 + 3 = 43.
        assert_eq!(result.into_sorted_vec()[0].0, 43);
    }

    #[test]
    fn identical_points_still_build_and_search() {
        let rows = vec![vec![2.0_f32, 2.0]; 17];
        let store = PointStore::from_rows(rows).map_err(|e| e.to_string()).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let forest = build(&store, 2, &mut rng);

        let mut result: KnnResultSet<f32> = KnnResultSet::new(5);
        search(&forest, &store, &Euclidean, &[2.0_f32, 2.0], &mut result, usize::MAX, 0.0);
        let hits = result.into_sorted_vec();
        assert_eq!(hits.len(), 5);
        assert_eq!(hits.iter().map(|&(i, _)| i).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn added_points_become_reachable() {
        let mut store = grid_store();
        let mut rng = StdRng::seed_from_u64(9);
        let mut forest = build(&store, 4, &mut rng);

        let range = store.append_flat(&[100.0, 100.0]).map_err(|e| e.to_string()).unwrap();
        add_points(&mut forest, &store, range);

        let mut result: KnnResultSet<f32> = KnnResultSet::new(1);
        search(&forest, &store, &Euclidean, &[99.0_f32, 99.0], &mut result, usize::MAX, 0.0);
        assert_eq!(result.into_sorted_vec()[0].0, 64);
    }
}
