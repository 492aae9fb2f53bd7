//! A single kd-tree with tight bounding boxes, for low-dimensional data.
//!
//! Splits are midpoints of the tight extent on the widest dimension, balanced
//! toward the median when one side would starve. The search tracks the
//! per-dimension excess distance from the query to the current cell, so a
//! subtree is entered only when its cell could still beat the current worst
//! hit. Exact at `eps = 0`.

use proximity::{Element, Metric, Number};
use serde::{Deserialize, Serialize};

use crate::{results::ResultSet, store::PointStore};

/// The built tree: node arena, leaf-ordered row indices, and the root cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SingleKdTree<E> {
    /// The node arena; children refer to it by index.
    nodes: Vec<SingleNode>,
    /// The arena index of the root.
    root: u32,
    /// Row indices, permuted so each leaf owns a contiguous span.
    vind: Vec<u32>,
    /// The tight bounding box of the whole dataset.
    root_bbox: Vec<Interval>,
    /// The leaf capacity the tree was built with.
    leaf_max_size: usize,
    /// Rows copied into leaf order, when reordering was requested.
    reordered: Option<Vec<E>>,
}

/// A closed interval of one bounding-box dimension.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct Interval {
    /// The lower bound.
    low: f64,
    /// The upper bound.
    high: f64,
}

/// A node of the tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum SingleNode {
    /// A contiguous span of `vind`.
    Leaf {
        /// The first owned position in `vind`.
        start: u32,
        /// One past the last owned position in `vind`.
        end: u32,
    },
    /// An internal split with the tight gap between the two sides.
    Split {
        /// The dimension compared against.
        dim: u32,
        /// The largest coordinate on the low side.
        low_val: f64,
        /// The smallest coordinate on the high side.
        high_val: f64,
        /// Arena index of the low child.
        low: u32,
        /// Arena index of the high child.
        high: u32,
    },
}

impl<E: Element> SingleKdTree<E> {
    /// The leaf capacity the tree was built with.
    pub(crate) fn leaf_capacity(&self) -> usize {
        self.leaf_max_size
    }

    /// Bytes held by the arena, the index permutation, and the reordered copy.
    pub(crate) fn used_memory(&self) -> usize {
        self.nodes.len() * core::mem::size_of::<SingleNode>()
            + self.vind.len() * core::mem::size_of::<u32>()
            + self.root_bbox.len() * core::mem::size_of::<Interval>()
            + self.reordered.as_ref().map_or(0, |r| r.len() * core::mem::size_of::<E>())
    }
}

/// Builds the tree over the live rows of `store`.
pub(crate) fn build<E: Element>(store: &PointStore<E>, leaf_max_size: usize, reorder: bool) -> SingleKdTree<E> {
    let vind = store.live_indices();
    ftlog::debug!("Building a single kd-tree with leaf size {leaf_max_size} over {} rows", vind.len());

    let mut builder = SingleBuilder {
        store,
        leaf_max_size: leaf_max_size.max(1),
        nodes: Vec::new(),
        vind,
    };
    let root_bbox = builder.tight_bbox(0, builder.vind.len());
    let root = builder.divide(0, builder.vind.len());

    let reordered = reorder.then(|| {
        let mut data = Vec::with_capacity(builder.vind.len() * store.cols());
        for &i in &builder.vind {
            data.extend_from_slice(store.row(i as usize));
        }
        data
    });

    SingleKdTree {
        nodes: builder.nodes,
        root,
        vind: builder.vind,
        root_bbox,
        leaf_max_size: leaf_max_size.max(1),
        reordered,
    }
}

/// Build-time state shared across the recursion.
struct SingleBuilder<'a, E: Element> {
    /// The dataset rows.
    store: &'a PointStore<E>,
    /// The leaf capacity.
    leaf_max_size: usize,
    /// The growing node arena.
    nodes: Vec<SingleNode>,
    /// The row permutation being produced.
    vind: Vec<u32>,
}

impl<E: Element> SingleBuilder<'_, E> {
    /// The coordinate of permutation position `idx` on `dim`.
    fn coord(&self, idx: usize, dim: usize) -> f64 {
        self.store.row(self.vind[idx] as usize)[dim].as_f64()
    }

    /// The tight bounding box of positions `start..end`.
    fn tight_bbox(&self, start: usize, end: usize) -> Vec<Interval> {
        let cols = self.store.cols();
        let mut bbox = vec![
            Interval {
                low: f64::INFINITY,
                high: f64::NEG_INFINITY,
            };
            cols
        ];
        for idx in start..end {
            for (d, iv) in bbox.iter_mut().enumerate() {
                let x = self.coord(idx, d);
                iv.low = iv.low.min(x);
                iv.high = iv.high.max(x);
            }
        }
        bbox
    }

    /// Recursively splits positions `start..end`, returning the arena index
    /// of the subtree.
    #[allow(clippy::cast_possible_truncation)]
    fn divide(&mut self, start: usize, end: usize) -> u32 {
        let count = end - start;
        if count > self.leaf_max_size {
            let bbox = self.tight_bbox(start, end);
            let (dim, span) = bbox
                .iter()
                .enumerate()
                .map(|(d, iv)| (d, iv.high - iv.low))
                .fold((0, 0.0_f64), |(bd, bs), (d, s)| if s > bs { (d, s) } else { (bd, bs) });

            if span > 0.0 {
                let cutval = (bbox[dim].low + bbox[dim].high) / 2.0;
                let (lim1, lim2) = self.plane_split(start, end, dim, cutval);

                // Balance toward the median within the band of equal
                // coordinates.
                let mid = count / 2;
                let index = if lim1 > mid {
                    lim1
                } else if lim2 < mid {
                    lim2
                } else {
                    mid
                };

                let low_val = (start..start + index).map(|i| self.coord(i, dim)).fold(f64::NEG_INFINITY, f64::max);
                let high_val = (start + index..end).map(|i| self.coord(i, dim)).fold(f64::INFINITY, f64::min);

                let low = self.divide(start, start + index);
                let high = self.divide(start + index, end);
                self.nodes.push(SingleNode::Split {
                    dim: dim as u32,
                    low_val,
                    high_val,
                    low,
                    high,
                });
                return (self.nodes.len() - 1) as u32;
            }
            // Zero extent on every dimension: the rows coincide, keep one
            // (oversized) leaf.
        }

        self.nodes.push(SingleNode::Leaf {
            start: start as u32,
            end: end as u32,
        });
        (self.nodes.len() - 1) as u32
    }

    /// Three-way partition of positions `start..end` on `dim` around
    /// `cutval`: strictly below, equal, strictly above. Returns the sizes of
    /// the first two bands.
    fn plane_split(&mut self, start: usize, end: usize, dim: usize, cutval: f64) -> (usize, usize) {
        let mut lim1 = 0;
        for i in 0..(end - start) {
            if self.coord(start + i, dim) < cutval {
                self.vind.swap(start + i, start + lim1);
                lim1 += 1;
            }
        }
        let mut lim2 = lim1;
        for i in lim1..(end - start) {
            if self.coord(start + i, dim) <= cutval {
                self.vind.swap(start + i, start + lim2);
                lim2 += 1;
            }
        }
        (lim1, lim2)
    }
}

/// Searches the tree. Exact at `eps = 0`; with a positive `eps`, subtrees
/// whose cell is more than `(1 + eps)^2` beyond the current worst hit are
/// skipped.
pub(crate) fn search<E, D, M, R>(tree: &SingleKdTree<E>, store: &PointStore<E>, metric: &M, query: &[E], result: &mut R, eps: f32)
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
    R: ResultSet<D>,
{
    let eps_error = {
        let e = 1.0 + f64::from(eps);
        e * e
    };

    // Excess distance to the root cell, one entry per dimension.
    let mut dists = vec![D::zero(); store.cols()];
    let mut mindist = D::zero();
    for (d, iv) in tree.root_bbox.iter().enumerate() {
        let q = query[d].as_f64();
        if q < iv.low {
            dists[d] = metric.partial(q, iv.low);
        } else if q > iv.high {
            dists[d] = metric.partial(q, iv.high);
        }
        mindist += dists[d];
    }

    let mut cursor = SingleSearch {
        tree,
        store,
        metric,
        query,
        eps_error,
        result,
        _dist: core::marker::PhantomData,
    };
    cursor.search_level(tree.root, mindist, &mut dists);
}

/// Per-query state for the recursive descent.
struct SingleSearch<'a, E: Element, D, M, R> {
    /// The tree being searched.
    tree: &'a SingleKdTree<E>,
    /// The dataset rows.
    store: &'a PointStore<E>,
    /// The metric the tree was built for.
    metric: &'a M,
    /// The query row.
    query: &'a [E],
    /// `(1 + eps)^2`: how loose the cell bound is allowed to be.
    eps_error: f64,
    /// Where accepted candidates go.
    result: &'a mut R,
    /// Ties the distance type `D` to this search without storing a value.
    _dist: core::marker::PhantomData<D>,
}

impl<E: Element, D: Number, M: Metric<E, D>, R: ResultSet<D>> SingleSearch<'_, E, D, M, R> {
    /// Visits `node`, whose cell has lower-bound distance `mindist` with
    /// per-dimension contributions `dists`.
    fn search_level(&mut self, node: u32, mindist: D, dists: &mut [D]) {
        match self.tree.nodes[node as usize] {
            SingleNode::Leaf { start, end } => {
                for idx in start..end {
                    let i = self.tree.vind[idx as usize] as usize;
                    if self.store.is_removed(i) {
                        continue;
                    }
                    let cols = self.store.cols();
                    let row = self.tree.reordered.as_ref().map_or_else(
                        || self.store.row(i),
                        |data| &data[idx as usize * cols..(idx as usize + 1) * cols],
                    );
                    let d = self.metric.distance(self.query, row, Some(self.result.worst_dist()));
                    self.result.add(i, d);
                }
            }
            SingleNode::Split {
                dim,
                low_val,
                high_val,
                low,
                high,
            } => {
                let dim = dim as usize;
                let q = self.query[dim].as_f64();

                // Enter the side the query leans toward; the other side's cut
                // coordinate updates this dimension's excess.
                let (near, far, cut_dist) = if (q - low_val) + (q - high_val) < 0.0 {
                    (low, high, self.metric.partial(q, high_val))
                } else {
                    (high, low, self.metric.partial(q, low_val))
                };

                self.search_level(near, mindist, dists);

                let saved = dists[dim];
                let far_mindist = mindist + cut_dist - saved;
                if far_mindist.as_f64() * self.eps_error <= self.result.worst_dist().as_f64() {
                    dists[dim] = cut_dist;
                    self.search_level(far, far_mindist, dists);
                    dists[dim] = saved;
                }
            }
        }
    }
}
