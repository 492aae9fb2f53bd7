//! A forest of metric-agnostic clustering trees.
//!
//! Works with any metric, including Hamming over packed bitstrings: pivots
//! are dataset rows, never averaged centroids. Greedy recursive clustering is
//! sensitive to its random seeds, so several independent trees are built and
//! searched jointly through one shared queue ordered by how close each
//! cluster could possibly come to the query.

use core::ops::Range;

use proximity::{Element, Metric, Number};
use rand::{rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    centers::{choose_centers, CentersInit},
    results::ResultSet,
    store::PointStore,
    utils::{BranchQueue, MinItem, VisitSet},
};

/// The built forest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ClusterForest<D> {
    /// The trees, searched jointly.
    trees: Vec<ClusterTree<D>>,
    /// Children per internal node.
    branching: usize,
    /// Leaf capacity before a split.
    leaf_max_size: usize,
    /// How pivots are chosen, kept for leaf re-splits on insert.
    centers_init: CentersInit,
}

/// One clustering tree as an arena of nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ClusterTree<D> {
    /// The node arena; children refer to it by index.
    nodes: Vec<ClusterNode<D>>,
    /// The arena index of the root.
    root: u32,
}

/// A node of a clustering tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ClusterNode<D> {
    /// The dataset row acting as this cluster's pivot.
    pivot: u32,
    /// The distance from the pivot to the farthest row under this node.
    radius: D,
    /// Child arena indices; empty for leaves.
    children: Vec<u32>,
    /// The rows of a leaf (the pivot among them); empty for internal nodes.
    points: Vec<u32>,
}

impl<D> ClusterForest<D> {
    /// Bytes held by the node arenas and leaf row lists.
    pub(crate) fn used_memory(&self) -> usize {
        self.trees
            .iter()
            .flat_map(|t| t.nodes.iter())
            .map(|n| {
                core::mem::size_of::<ClusterNode<D>>()
                    + n.children.len() * core::mem::size_of::<u32>()
                    + n.points.len() * core::mem::size_of::<u32>()
            })
            .sum()
    }
}

/// The smallest distance any row under a cluster could have from the query,
/// given the query's distance `d` to the pivot. Used as an ordering heuristic
/// for the descent, never to discard work outright.
fn lower_bound<D: Number>(d: D, radius: D) -> f64 {
    if d < radius {
        0.0
    } else {
        (d - radius).as_f64()
    }
}

/// Builds `trees` independent clustering trees over the live rows of `store`.
pub(crate) fn build<E, D, M>(
    store: &PointStore<E>,
    metric: &M,
    branching: usize,
    trees: usize,
    centers_init: CentersInit,
    leaf_max_size: usize,
    rng: &mut StdRng,
) -> ClusterForest<D>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let live = store.live_indices();
    ftlog::debug!(
        "Building {trees} clustering trees with branching {branching} over {} rows",
        live.len()
    );

    let forest = (0..trees)
        .map(|_| {
            let mut nodes = Vec::new();
            let pivot = live[rng.random_range(0..live.len())];
            let root = build_node(
                store,
                metric,
                branching,
                leaf_max_size,
                centers_init,
                &mut nodes,
                live.clone(),
                pivot,
                rng,
            );
            ClusterTree { nodes, root }
        })
        .collect();

    ClusterForest {
        trees: forest,
        branching,
        leaf_max_size: leaf_max_size.max(1),
        centers_init,
    }
}

/// Builds the subtree over `points` pivoted at `pivot`, returning its arena
/// index.
#[allow(clippy::too_many_arguments, clippy::cast_possible_truncation)]
fn build_node<E, D, M>(
    store: &PointStore<E>,
    metric: &M,
    branching: usize,
    leaf_max_size: usize,
    centers_init: CentersInit,
    nodes: &mut Vec<ClusterNode<D>>,
    points: Vec<u32>,
    pivot: u32,
    rng: &mut StdRng,
) -> u32
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let radius = points
        .iter()
        .map(|&i| metric.distance(store.row(pivot as usize), store.row(i as usize), None))
        .fold(D::zero(), |r, d| if d > r { d } else { r });

    if points.len() > leaf_max_size.max(1) {
        let centers = choose_centers(centers_init, branching, &points, store, metric, rng);
        if centers.len() >= 2 {
            let clusters = assign_to_centers(store, metric, &points, &centers);
            let children = clusters
                .into_iter()
                .zip(centers)
                .filter(|(cluster, _)| !cluster.is_empty())
                .map(|(cluster, center)| {
                    build_node(
                        store,
                        metric,
                        branching,
                        leaf_max_size,
                        centers_init,
                        nodes,
                        cluster,
                        center,
                        rng,
                    )
                })
                .collect::<Vec<_>>();
            nodes.push(ClusterNode {
                pivot,
                radius,
                children,
                points: Vec::new(),
            });
            return (nodes.len() - 1) as u32;
        }
        // Everything coincides; an oversized leaf is the only option.
    }

    nodes.push(ClusterNode {
        pivot,
        radius,
        children: Vec::new(),
        points,
    });
    (nodes.len() - 1) as u32
}

/// Assigns each row to its nearest center, ties to the first.
fn assign_to_centers<E, D, M>(store: &PointStore<E>, metric: &M, points: &[u32], centers: &[u32]) -> Vec<Vec<u32>>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let mut clusters = vec![Vec::new(); centers.len()];
    for &i in points {
        let nearest = centers
            .iter()
            .map(|&c| metric.distance(store.row(c as usize), store.row(i as usize), None).as_f64())
            .enumerate()
            .min_by_key(|&(j, d)| MinItem(j, d))
            .map_or(0, |(j, _)| j);
        clusters[nearest].push(i);
    }
    clusters
}

/// Inserts freshly appended rows into every tree: descend to the nearest
/// leaf, widen radii on the way, and split any leaf that overflows.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn add_points<E, D, M>(forest: &mut ClusterForest<D>, store: &PointStore<E>, metric: &M, new_rows: Range<usize>, rng: &mut StdRng)
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let (branching, leaf_max_size, centers_init) = (forest.branching, forest.leaf_max_size, forest.centers_init);
    for i in new_rows.clone() {
        for tree in &mut forest.trees {
            add_one(tree, store, metric, branching, leaf_max_size, centers_init, i as u32, rng);
        }
    }
}

/// Inserts one row into one tree.
fn add_one<E, D, M>(
    tree: &mut ClusterTree<D>,
    store: &PointStore<E>,
    metric: &M,
    branching: usize,
    leaf_max_size: usize,
    centers_init: CentersInit,
    new_point: u32,
    rng: &mut StdRng,
) where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let row = store.row(new_point as usize);
    let mut at = tree.root;
    loop {
        let d = metric.distance(store.row(tree.nodes[at as usize].pivot as usize), row, None);
        let node = &mut tree.nodes[at as usize];
        if node.radius < d {
            node.radius = d;
        }
        if node.children.is_empty() {
            node.points.push(new_point);
            let needs_split = node.points.len() > leaf_max_size;
            if needs_split {
                split_leaf(tree, store, metric, branching, leaf_max_size, centers_init, at, rng);
            }
            return;
        }
        let children = node.children.clone();
        at = children
            .iter()
            .map(|&c| {
                let child_pivot = tree.nodes[c as usize].pivot;
                (c, metric.distance(store.row(child_pivot as usize), row, None).as_f64())
            })
            .min_by_key(|&(c, d)| MinItem(c, d))
            .map_or(children[0], |(c, _)| c);
    }
}

/// Re-clusters an overflowing leaf in place.
#[allow(clippy::cast_possible_truncation)]
fn split_leaf<E, D, M>(
    tree: &mut ClusterTree<D>,
    store: &PointStore<E>,
    metric: &M,
    branching: usize,
    leaf_max_size: usize,
    centers_init: CentersInit,
    at: u32,
    rng: &mut StdRng,
) where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let points = core::mem::take(&mut tree.nodes[at as usize].points);
    let centers = choose_centers(centers_init, branching, &points, store, metric, rng);
    if centers.len() < 2 {
        // All rows coincide; the leaf simply stays oversized.
        tree.nodes[at as usize].points = points;
        return;
    }

    let clusters = assign_to_centers(store, metric, &points, &centers);
    let mut children = Vec::new();
    for (cluster, center) in clusters.into_iter().zip(centers) {
        if cluster.is_empty() {
            continue;
        }
        let child = build_node(
            store,
            metric,
            branching,
            leaf_max_size,
            centers_init,
            &mut tree.nodes,
            cluster,
            center,
            rng,
        );
        children.push(child);
    }
    tree.nodes[at as usize].children = children;
}

/// Searches all trees jointly with a budget of `max_checks` visited leaves.
pub(crate) fn search<E, D, M, R>(forest: &ClusterForest<D>, store: &PointStore<E>, metric: &M, query: &[E], result: &mut R, max_checks: usize)
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
    R: ResultSet<D>,
{
    let mut heap: BranchQueue<f64, (usize, u32, D)> = BranchQueue::new();
    let mut visited = VisitSet::new(store.rows());
    let mut checks = 0_usize;

    for (t, tree) in forest.trees.iter().enumerate() {
        let root = &tree.nodes[tree.root as usize];
        let d = metric.distance(query, store.row(root.pivot as usize), None);
        heap.push(lower_bound(d, root.radius), (t, tree.root, d));
    }

    while let Some((_, (t, at, pivot_dist))) = heap.pop() {
        if checks >= max_checks && result.is_full() {
            break;
        }
        let node = &forest.trees[t].nodes[at as usize];

        // The pivot is itself a dataset row; score it the first time any
        // tree reaches it. Its distance is already paid for, so it does not
        // count against the leaf budget.
        let p = node.pivot as usize;
        if visited.insert(p) && !store.is_removed(p) {
            result.add(p, pivot_dist);
        }

        if node.children.is_empty() {
            checks += 1;
            for &point in &node.points {
                let i = point as usize;
                if !visited.insert(i) || store.is_removed(i) {
                    continue;
                }
                let d = metric.distance(query, store.row(i), Some(result.worst_dist()));
                result.add(i, d);
            }
        } else {
            for &c in &node.children {
                let child = &forest.trees[t].nodes[c as usize];
                let d = metric.distance(query, store.row(child.pivot as usize), None);
                heap.push(lower_bound(d, child.radius), (t, c, d));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proximity::Hamming;
    use rand::SeedableRng;

    use super::*;
    use crate::results::KnnResultSet;

    fn binary_store() -> PointStore<u8> {
        // 64 rows of 8 packed bytes with increasing bit weight.
        let rows = (0..64_u8).map(|i| vec![i, i ^ 0x3C, 0, i & 0x0F, 0xF0, i, 0, i]).collect::<Vec<_>>();
        PointStore::from_rows(rows).map_err(|e| e.to_string()).unwrap()
    }

    #[test]
    fn every_point_lands_in_exactly_one_leaf_per_tree() {
        let store = binary_store();
        let mut rng = StdRng::seed_from_u64(13);
        let forest: ClusterForest<u32> = build(&store, &Hamming, 4, 3, CentersInit::Gonzales, 8, &mut rng);

        for tree in &forest.trees {
            let mut seen = vec![0_usize; store.rows()];
            for node in &tree.nodes {
                for &p in &node.points {
                    seen[p as usize] += 1;
                }
            }
            assert!(seen.iter().all(|&n| n == 1), "leaf membership must be a partition");
        }
    }

    #[test]
    fn unlimited_search_matches_linear_scan() {
        let store = binary_store();
        let mut rng = StdRng::seed_from_u64(17);
        let forest: ClusterForest<u32> = build(&store, &Hamming, 4, 3, CentersInit::Gonzales, 8, &mut rng);

        let query = store.row(37).to_vec();
        let mut linear = KnnResultSet::new(5);
        for i in 0..store.rows() {
            linear.add(i, Hamming.distance(&query, store.row(i), None));
        }

        let mut result = KnnResultSet::new(5);
        search(&forest, &store, &Hamming, &query, &mut result, usize::MAX);
        assert_eq!(result.into_sorted_vec(), linear.into_sorted_vec());
    }

    #[test]
    fn inserts_split_overflowing_leaves() {
        let mut store = binary_store();
        let mut rng = StdRng::seed_from_u64(23);
        let mut forest: ClusterForest<u32> = build(&store, &Hamming, 4, 2, CentersInit::Random, 4, &mut rng);

        let new_rows = (64..96_u8).flat_map(|i| vec![i, 0, i, 0, i, 0, i, 0]).collect::<Vec<_>>();
        let range = store.append_flat(&new_rows).map_err(|e| e.to_string()).unwrap();
        add_points(&mut forest, &store, &Hamming, range, &mut rng);

        let query = store.row(80).to_vec();
        let mut result = KnnResultSet::new(1);
        search(&forest, &store, &Hamming, &query, &mut result, usize::MAX);
        assert_eq!(result.into_sorted_vec()[0], (80, 0));
    }
}
