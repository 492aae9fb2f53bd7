//! A hierarchical k-means tree.
//!
//! Internal nodes cluster their rows with a few rounds of Lloyd's algorithm
//! and recurse per cluster; every node keeps its centroid and spread
//! statistics so a query can descend toward the most promising clusters and
//! queue the alternatives for later.

use core::ops::Range;

use proximity::{Element, Metric, Number};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::{
    centers::{choose_centers, CentersInit},
    results::ResultSet,
    store::PointStore,
    utils::{BranchQueue, MinItem},
};

/// The built tree: node arena plus the build knobs searches need.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct KMeansTree<D> {
    /// The node arena; children refer to it by index.
    nodes: Vec<KmNode<D>>,
    /// The arena index of the root.
    root: u32,
    /// Trades pivot distance against cluster spread during descent.
    cb_index: f32,
}

/// One node of the tree. Leaves carry rows, internal nodes carry children;
/// both carry the cluster statistics used to order the descent.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct KmNode<D> {
    /// The centroid of the rows under this node.
    pivot: Vec<f64>,
    /// The distance from the pivot to the farthest row under this node.
    radius: D,
    /// The mean distance from the pivot to the rows under this node.
    mean_radius: D,
    /// The variance of the distances from the pivot.
    variance: D,
    /// How many rows live under this node.
    size: u32,
    /// Child arena indices; empty for leaves.
    children: Vec<u32>,
    /// The rows of a leaf; empty for internal nodes.
    points: Vec<u32>,
}

impl<D> KMeansTree<D> {
    /// Bytes held by the node arena, pivots, and leaf row lists.
    pub(crate) fn used_memory(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| {
                core::mem::size_of::<KmNode<D>>()
                    + n.pivot.len() * core::mem::size_of::<f64>()
                    + n.children.len() * core::mem::size_of::<u32>()
                    + n.points.len() * core::mem::size_of::<u32>()
            })
            .sum()
    }
}

/// Widens row `i` into the `f64` buffer used for pivot distances.
fn widen_row<E: Element>(store: &PointStore<E>, i: u32, buf: &mut Vec<f64>) {
    buf.clear();
    buf.extend(store.row(i as usize).iter().map(|&x| x.as_f64()));
}

/// Builds a hierarchical k-means tree over the live rows of `store`.
pub(crate) fn build<E, D, M>(
    store: &PointStore<E>,
    metric: &M,
    branching: usize,
    iterations: usize,
    centers_init: CentersInit,
    cb_index: f32,
    rng: &mut StdRng,
) -> KMeansTree<D>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let live = store.live_indices();
    ftlog::debug!("Building a k-means tree with branching {branching} over {} rows", live.len());

    let mut builder = Builder {
        store,
        metric,
        branching,
        iterations,
        centers_init,
        nodes: Vec::new(),
        row_buf: Vec::with_capacity(store.cols()),
    };
    let root = builder.build_node(live, rng);
    KMeansTree {
        nodes: builder.nodes,
        root,
        cb_index,
    }
}

/// Build-time state shared across the recursion.
struct Builder<'a, E: Element, D, M> {
    /// The dataset rows.
    store: &'a PointStore<E>,
    /// The metric distances are computed with.
    metric: &'a M,
    /// Clusters per internal node.
    branching: usize,
    /// The cap on Lloyd's refinement rounds.
    iterations: usize,
    /// How initial centers are picked.
    centers_init: CentersInit,
    /// The growing node arena.
    nodes: Vec<KmNode<D>>,
    /// Scratch for widening rows.
    row_buf: Vec<f64>,
}

impl<E: Element, D: Number, M: Metric<E, D>> Builder<'_, E, D, M> {
    /// Builds the subtree over `points`, returning its arena index.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn build_node(&mut self, points: Vec<u32>, rng: &mut StdRng) -> u32 {
        let stats = self.node_stats(&points);

        if points.len() > self.branching {
            let centers = choose_centers(self.centers_init, self.branching, &points, self.store, self.metric, rng);
            if centers.len() >= 2 {
                let clusters = self.cluster(&points, &centers, rng);
                // Lloyd's can collapse onto a single cluster; splitting again
                // on the same rows would not terminate.
                if clusters.len() >= 2 {
                    let children = clusters.into_iter().map(|cluster| self.build_node(cluster, rng)).collect::<Vec<_>>();
                    self.nodes.push(KmNode {
                        children,
                        points: Vec::new(),
                        ..stats
                    });
                    return (self.nodes.len() - 1) as u32;
                }
            }
        }

        self.nodes.push(KmNode { points, ..stats });
        (self.nodes.len() - 1) as u32
    }

    /// Computes the centroid and spread statistics of `points`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn node_stats(&mut self, points: &[u32]) -> KmNode<D> {
        let cols = self.store.cols();
        let mut pivot = vec![0.0_f64; cols];
        for &i in points {
            for (p, &x) in pivot.iter_mut().zip(self.store.row(i as usize)) {
                *p += x.as_f64();
            }
        }
        for p in &mut pivot {
            *p /= points.len() as f64;
        }

        let (mut max_d, mut sum_d, mut sum_sq) = (0.0_f64, 0.0_f64, 0.0_f64);
        for &i in points {
            widen_row(self.store, i, &mut self.row_buf);
            let d = self.metric.distance_f64(&self.row_buf, &pivot, None).as_f64();
            max_d = max_d.max(d);
            sum_d += d;
            sum_sq += d * d;
        }
        let mean = sum_d / points.len() as f64;
        let variance = (sum_sq / points.len() as f64 - mean * mean).max(0.0);

        KmNode {
            pivot,
            radius: D::cast(max_d),
            mean_radius: D::cast(mean),
            variance: D::cast(variance),
            size: points.len() as u32,
            children: Vec::new(),
            points: Vec::new(),
        }
    }

    /// Runs Lloyd's iterations from the chosen centers and returns the final
    /// clusters, all non-empty.
    #[allow(clippy::cast_precision_loss)]
    fn cluster(&mut self, points: &[u32], centers: &[u32], _rng: &mut StdRng) -> Vec<Vec<u32>> {
        let cols = self.store.cols();
        let k = centers.len();

        let mut centroids: Vec<Vec<f64>> = centers
            .iter()
            .map(|&c| self.store.row(c as usize).iter().map(|&x| x.as_f64()).collect())
            .collect();

        let mut assignment = self.assign(points, &centroids);
        for _ in 0..self.iterations {
            // Recompute centroids from the current assignment.
            let mut counts = vec![0_usize; k];
            for c in &mut centroids {
                c.iter_mut().for_each(|x| *x = 0.0);
            }
            for (&i, &a) in points.iter().zip(&assignment) {
                counts[a] += 1;
                for (p, &x) in centroids[a].iter_mut().zip(self.store.row(i as usize)) {
                    *p += x.as_f64();
                }
            }
            for (c, &n) in centroids.iter_mut().zip(&counts) {
                if n > 0 {
                    c.iter_mut().for_each(|x| *x /= n as f64);
                }
            }
            self.repair_empty_clusters(points, &mut assignment, &mut centroids, &mut counts);

            let next = self.assign(points, &centroids);
            if next == assignment {
                break;
            }
            assignment = next;
        }

        let mut clusters = vec![Vec::new(); k];
        for (&i, &a) in points.iter().zip(&assignment) {
            clusters[a].push(i);
        }
        clusters.retain(|c| !c.is_empty());
        clusters
    }

    /// Assigns each point to its nearest centroid.
    fn assign(&mut self, points: &[u32], centroids: &[Vec<f64>]) -> Vec<usize> {
        points
            .iter()
            .map(|&i| {
                widen_row(self.store, i, &mut self.row_buf);
                let row = &self.row_buf;
                centroids
                    .iter()
                    .map(|c| self.metric.distance_f64(row, c, None).as_f64())
                    .enumerate()
                    .min_by_key(|&(j, d)| MinItem(j, d))
                    .map_or(0, |(j, _)| j)
            })
            .collect()
    }

    /// Gives every empty cluster the row farthest from the centroid of the
    /// currently largest cluster.
    #[allow(clippy::cast_precision_loss)]
    fn repair_empty_clusters(&mut self, points: &[u32], assignment: &mut [usize], centroids: &mut [Vec<f64>], counts: &mut [usize]) {
        for empty in 0..counts.len() {
            if counts[empty] > 0 {
                continue;
            }
            let Some((donor, _)) = counts.iter().enumerate().max_by_key(|&(_, &n)| n) else {
                continue;
            };
            if counts[donor] < 2 {
                continue;
            }
            // The donor's farthest member moves to the empty cluster.
            let mut farthest: Option<(usize, f64)> = None;
            for (slot, (&i, &a)) in points.iter().zip(assignment.iter()).enumerate() {
                if a != donor {
                    continue;
                }
                widen_row(self.store, i, &mut self.row_buf);
                let d = self.metric.distance_f64(&self.row_buf, &centroids[donor], None).as_f64();
                if farthest.map_or(true, |(_, best)| d > best) {
                    farthest = Some((slot, d));
                }
            }
            if let Some((slot, _)) = farthest {
                assignment[slot] = empty;
                counts[donor] -= 1;
                counts[empty] += 1;
                widen_row(self.store, points[slot], &mut self.row_buf);
                centroids[empty].clear();
                centroids[empty].extend_from_slice(&self.row_buf);
            }
        }
    }
}

/// Inserts freshly appended rows, descending to the nearest leaf and widening
/// radii on the way down.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn add_points<E, D, M>(tree: &mut KMeansTree<D>, store: &PointStore<E>, metric: &M, new_rows: Range<usize>)
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let mut qf = Vec::with_capacity(store.cols());
    for i in new_rows {
        widen_row(store, i as u32, &mut qf);
        let mut at = tree.root;
        loop {
            let d = D::cast(metric.distance_f64(&qf, &tree.nodes[at as usize].pivot, None).as_f64());
            let node = &mut tree.nodes[at as usize];
            if node.radius < d {
                node.radius = d;
            }
            node.size += 1;
            if node.children.is_empty() {
                node.points.push(i as u32);
                break;
            }
            let children = node.children.clone();
            at = children
                .iter()
                .map(|&c| (c, metric.distance_f64(&qf, &tree.nodes[c as usize].pivot, None).as_f64()))
                .min_by_key(|&(c, d)| MinItem(c, d))
                .map_or(children[0], |(c, _)| c);
        }
    }
}

/// Searches the tree with a budget of `max_checks` visited leaves.
///
/// The approximation knob here is the budget itself; `eps` plays no part in
/// the descent order.
pub(crate) fn search<E, D, M, R>(tree: &KMeansTree<D>, store: &PointStore<E>, metric: &M, query: &[E], result: &mut R, max_checks: usize)
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
    R: ResultSet<D>,
{
    let qf: Vec<f64> = query.iter().map(|&x| x.as_f64()).collect();
    let mut heap: BranchQueue<f64, u32> = BranchQueue::new();
    let mut checks = 0_usize;

    explore(tree, store, metric, query, &qf, tree.root, result, &mut heap, &mut checks, max_checks);
    while let Some((_, node)) = heap.pop() {
        if checks >= max_checks && result.is_full() {
            break;
        }
        explore(tree, store, metric, query, &qf, node, result, &mut heap, &mut checks, max_checks);
    }
}

/// Descends from `node` to a leaf, ranking that leaf's rows and queueing the
/// sibling clusters along the way. Each leaf entered costs one unit of the
/// `max_checks` budget, however many rows it holds.
#[allow(clippy::too_many_arguments)]
fn explore<E, D, M, R>(
    tree: &KMeansTree<D>,
    store: &PointStore<E>,
    metric: &M,
    query: &[E],
    qf: &[f64],
    node: u32,
    result: &mut R,
    heap: &mut BranchQueue<f64, u32>,
    checks: &mut usize,
    max_checks: usize,
) where
    E: Element,
    D: Number,
    M: Metric<E, D>,
    R: ResultSet<D>,
{
    let cb_index = f64::from(tree.cb_index);
    let mut at = node;
    loop {
        let n = &tree.nodes[at as usize];
        if n.children.is_empty() {
            if *checks >= max_checks && result.is_full() {
                return;
            }
            *checks += 1;
            for &p in &n.points {
                let i = p as usize;
                if store.is_removed(i) {
                    continue;
                }
                let d = metric.distance(query, store.row(i), Some(result.worst_dist()));
                result.add(i, d);
            }
            return;
        }

        // Descend into the closest cluster; queue the rest with their
        // spread-adjusted bounds.
        let ranked = n
            .children
            .iter()
            .map(|&c| {
                let child = &tree.nodes[c as usize];
                (c, metric.distance_f64(qf, &child.pivot, None).as_f64())
            })
            .collect::<Vec<_>>();
        let (best, _) = ranked
            .iter()
            .copied()
            .min_by_key(|&(c, d)| MinItem(c, d))
            .unwrap_or((n.children[0], 0.0));
        for (c, d) in ranked {
            if c != best {
                let child = &tree.nodes[c as usize];
                heap.push(d - cb_index * child.variance.as_f64(), c);
            }
        }
        at = best;
    }
}
