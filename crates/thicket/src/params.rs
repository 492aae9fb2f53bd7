//! Build-time and search-time parameters.

use serde::{Deserialize, Serialize};

use crate::centers::CentersInit;

/// The leaf-visit budget used when a search asks for the autotuned value but
/// the index was not autotuned.
pub(crate) const DEFAULT_CHECKS: usize = 32;

/// Selects an index structure and fixes its build parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum IndexParams {
    /// Brute-force linear scan. The baseline every other structure is
    /// measured against.
    Linear,
    /// A forest of randomized kd-trees searched jointly.
    KdForest {
        /// How many randomized trees to build.
        trees: usize,
    },
    /// A hierarchical k-means tree.
    KMeans {
        /// The number of clusters per internal node.
        branching: usize,
        /// The cap on Lloyd's iterations per node; `usize::MAX` iterates
        /// until assignments stabilize.
        iterations: usize,
        /// How initial cluster centers are chosen.
        centers_init: CentersInit,
        /// Trades pivot distance against cluster spread when ordering the
        /// descent, in `[0, 1]`.
        cb_index: f32,
    },
    /// A single kd-tree with tight bounding boxes, for low-dimensional data.
    KdSingle {
        /// The maximum number of points per leaf.
        leaf_max_size: usize,
        /// Whether to copy rows into leaf order for cache locality.
        reorder: bool,
    },
    /// A forest of metric-agnostic clustering trees.
    Hierarchical {
        /// The number of children per internal node.
        branching: usize,
        /// How many independent trees to build.
        trees: usize,
        /// How pivots are chosen.
        centers_init: CentersInit,
        /// The maximum number of points per leaf.
        leaf_max_size: usize,
    },
    /// Multi-table, multi-probe locality-sensitive hashing over packed
    /// bitstrings.
    Lsh {
        /// How many hash tables to build.
        table_number: usize,
        /// Bits per hash key, at most 32.
        key_size: usize,
        /// How many bit flips around the exact key to probe.
        multi_probe_level: usize,
    },
    /// Pick the structure and its parameters automatically for a target
    /// recall.
    Autotuned {
        /// The recall to aim for, in `[0, 1]`.
        target_precision: f32,
        /// The weight of build time in the tuning cost.
        build_weight: f32,
        /// The weight of memory use in the tuning cost.
        memory_weight: f32,
        /// The fraction of the dataset to tune on.
        sample_fraction: f32,
    },
    /// Load a previously saved index from disk. The dataset the index was
    /// built on must be presented alongside.
    Saved {
        /// The snapshot location.
        path: std::path::PathBuf,
    },
}

impl IndexParams {
    /// The structure name, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::KdForest { .. } => "kd-forest",
            Self::KMeans { .. } => "kmeans-tree",
            Self::KdSingle { .. } => "kd-single",
            Self::Hierarchical { .. } => "hierarchical",
            Self::Lsh { .. } => "lsh",
            Self::Autotuned { .. } => "autotuned",
            Self::Saved { .. } => "saved",
        }
    }

}

/// The per-query knobs shared by every index structure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchParams {
    /// The leaf-visit budget. The primary recall/latency trade-off.
    pub checks: Checks,
    /// The approximation factor: subtrees whose lower bound exceeds
    /// `worst / (1 + eps)` are skipped.
    pub eps: f32,
    /// Whether results come back sorted by distance.
    pub sorted: bool,
    /// A cap on neighbors returned per radius query.
    pub max_neighbors: Option<usize>,
    /// Worker fan-out for batched queries: `1` stays on the caller thread,
    /// `0` uses all cores, `n > 1` uses a pool of `n`.
    pub cores: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            checks: Checks::Count(DEFAULT_CHECKS),
            eps: 0.0,
            sorted: true,
            max_neighbors: None,
            cores: 1,
        }
    }
}

impl SearchParams {
    /// Replaces the leaf-visit budget.
    #[must_use]
    pub const fn with_checks(mut self, checks: Checks) -> Self {
        self.checks = checks;
        self
    }

    /// Replaces the approximation factor.
    #[must_use]
    pub const fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Replaces the sorted-output flag.
    #[must_use]
    pub const fn with_sorted(mut self, sorted: bool) -> Self {
        self.sorted = sorted;
        self
    }

    /// Replaces the per-query neighbor cap.
    #[must_use]
    pub const fn with_max_neighbors(mut self, max_neighbors: usize) -> Self {
        self.max_neighbors = Some(max_neighbors);
        self
    }

    /// Replaces the worker fan-out.
    #[must_use]
    pub const fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }
}

/// The leaf-visit budget of a single query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checks {
    /// No budget: explore until the structure is exhausted. Exact for the
    /// tree indices.
    Unlimited,
    /// Use the budget the autotuner settled on.
    Autotuned,
    /// Visit at most this many leaves.
    Count(usize),
}

impl Checks {
    /// The concrete budget for this query.
    pub(crate) fn resolve(self, tuned: Option<usize>) -> usize {
        match self {
            Self::Unlimited => usize::MAX,
            Self::Autotuned => tuned.unwrap_or(DEFAULT_CHECKS),
            Self::Count(n) => n,
        }
    }
}
