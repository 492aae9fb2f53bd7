//! Approximate nearest-neighbor search in high-dimensional vector spaces.
//!
//! Given a dataset of rows and a query, the crate returns the `k` rows
//! closest to the query under a metric from the [`proximity`] crate, trading
//! exactness for speed through a family of index structures behind one
//! [`Index`] facade:
//!
//! - [`IndexParams::Linear`]: brute-force scan, the exactness baseline.
//! - [`IndexParams::KdForest`]: randomized kd-trees searched jointly with a
//!   shared branch queue and a bounded leaf-check budget.
//! - [`IndexParams::KMeans`]: a hierarchical k-means tree descended by
//!   pivot distance.
//! - [`IndexParams::KdSingle`]: a single kd-tree with tight bounding boxes,
//!   exact and radius-capable, for low-dimensional data.
//! - [`IndexParams::Hierarchical`]: metric-agnostic clustering trees for
//!   anything the vector-space structures cannot serve (e.g. Hamming).
//! - [`IndexParams::Lsh`]: multi-table, multi-probe LSH over packed
//!   bitstrings.
//! - [`IndexParams::Autotuned`]: measure a grid of candidates on a sample
//!   and pick the structure and `checks` budget for a target recall.
//!
//! All structures share one search protocol: k-NN and radius queries, the
//! `checks` budget as the recall/latency knob, batched multi-core search,
//! incremental [`Index::add_points`] / [`Index::remove_point`] with a rebuild
//! threshold, and snapshots via [`Index::save`] / [`Index::load`].
//!
//! The crate logs build and tuning milestones through [`ftlog`]; the
//! embedding application owns logger initialization and verbosity.

mod autotune;
mod centers;
mod error;
mod index;
mod io;
mod params;
mod results;
mod store;
mod utils;

pub use autotune::AutotuneResult;
pub use centers::CentersInit;
pub use error::{Error, Result};
pub use index::Index;
pub use params::{Checks, IndexParams, SearchParams};
pub use results::{KnnResultSet, RadiusResultSet, ResultSet};
pub use store::PointStore;
pub use utils::{MaxItem, MinItem};
