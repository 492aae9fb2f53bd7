//! The common index facade.
//!
//! One owning [`Index`] type wraps every structure in the family behind a
//! uniform protocol: build, k-NN and radius search with a shared budget knob,
//! incremental add/remove with a rebuild threshold, snapshots, and batched
//! multi-core search that writes into disjoint ranges of caller-provided
//! buffers.

pub(crate) mod hierarchical;
pub(crate) mod kd_forest;
pub(crate) mod kd_single;
pub(crate) mod kmeans;
pub(crate) mod linear;
pub(crate) mod lsh;

use std::path::Path;

use proximity::{DataType, Element, Metric, MetricKind, Number};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    autotune::{self, AutotuneResult},
    io,
    params::{IndexParams, SearchParams},
    results::{KnnResultSet, RadiusResultSet, ResultSet},
    store::PointStore,
    Error, Result,
};

/// The algorithm-specific state of a built index. Holds arenas and tables of
/// row indices, never row data (except the kd-single reorder copy).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum Structure<E, D> {
    /// Nothing built yet.
    Empty,
    /// Brute-force scan; no structure beyond the store itself.
    Linear,
    /// A randomized kd-forest.
    KdForest(kd_forest::KdForest),
    /// A hierarchical k-means tree.
    KMeans(kmeans::KMeansTree<D>),
    /// A single exact kd-tree.
    KdSingle(kd_single::SingleKdTree<E>),
    /// A forest of metric-agnostic clustering trees.
    Hierarchical(hierarchical::ClusterForest<D>),
    /// Multi-probe LSH tables.
    Lsh(lsh::LshTables),
}

impl<E: Element, D: Number> Structure<E, D> {
    /// The algorithm code written to snapshot headers.
    pub(crate) fn algorithm_code(&self) -> Result<u32> {
        match self {
            Self::Empty => Err(Error::InternalInvariant("an empty index has no algorithm code".to_string())),
            Self::Linear => Ok(0),
            Self::KdForest(_) => Ok(1),
            Self::KMeans(_) => Ok(2),
            Self::KdSingle(_) => Ok(3),
            Self::Hierarchical(_) => Ok(4),
            Self::Lsh(_) => Ok(5),
        }
    }

    /// Bytes held by the structure.
    pub(crate) fn used_memory(&self) -> usize {
        match self {
            Self::Empty | Self::Linear => 0,
            Self::KdForest(f) => f.used_memory(),
            Self::KMeans(t) => t.used_memory(),
            Self::KdSingle(t) => t.used_memory(),
            Self::Hierarchical(f) => f.used_memory(),
            Self::Lsh(l) => l.used_memory(),
        }
    }
}

/// Where the index is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BuildState {
    /// No structure; only `build` is legal.
    Empty,
    /// Built and in sync with the store; everything is legal.
    Built,
    /// Built, then modified by adds or removes. Search is legal; saving
    /// requires a rebuild first.
    Dirty,
}

/// An approximate nearest-neighbor index over a [`PointStore`].
///
/// Generic over the element type `E`, the distance accumulator `D`, and the
/// metric `M` fixed at construction. The structure behind the protocol is
/// chosen by [`IndexParams`].
///
/// Concurrent searches on a shared reference are safe; `add_points`,
/// `remove_point`, and `build` need exclusive access, which the borrow
/// checker already enforces.
pub struct Index<E: Element, D: Number, M: Metric<E, D>> {
    /// The dataset rows.
    store: PointStore<E>,
    /// The metric every distance is computed with.
    metric: M,
    /// What was asked for at construction.
    params: IndexParams,
    /// The built structure.
    structure: Structure<E, D>,
    /// Lifecycle state.
    state: BuildState,
    /// The seed all randomized builds derive from; rebuilding on the same
    /// data reproduces the same structure.
    seed: u64,
    /// Randomness for incremental operations (leaf re-splits).
    ops_rng: StdRng,
    /// The autotuner's verdict, when `params` asked for one.
    tuned: Option<AutotuneResult>,
    /// Rows appended since the last full build.
    added_since_build: usize,
    /// The store size at the last full build.
    size_at_build: usize,
}

impl<E: Element, D: Number, M: Metric<E, D>> Index<E, D, M> {
    /// Creates an unbuilt index over `store`.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` for out-of-range parameter values.
    /// * `UnsupportedMetric` when the chosen structure cannot work with
    ///   `metric` (kd-trees need a coordinate-decomposable metric, k-means
    ///   cannot average bitstrings, LSH needs Hamming over bytes).
    pub fn new(store: PointStore<E>, metric: M, params: IndexParams) -> Result<Self> {
        validate_params::<E, D, M>(&params, &metric)?;
        let seed = rand::rng().random();
        Ok(Self {
            store,
            metric,
            params,
            structure: Structure::Empty,
            state: BuildState::Empty,
            seed,
            ops_rng: StdRng::seed_from_u64(seed ^ 0x9E37_79B9_7F4A_7C15),
            tuned: None,
            added_since_build: 0,
            size_at_build: 0,
        })
    }

    /// Fixes the seed of every randomized build decision, making rebuilds on
    /// identical data reproducible.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.ops_rng = StdRng::seed_from_u64(seed ^ 0x9E37_79B9_7F4A_7C15);
        self
    }

    /// The number of live (not removed) rows.
    #[must_use]
    pub fn size(&self) -> usize {
        self.store.live_rows()
    }

    /// The dataset dimensionality.
    #[must_use]
    pub fn veclen(&self) -> usize {
        self.store.cols()
    }

    /// Bytes held by the structure and the store.
    #[must_use]
    pub fn used_memory(&self) -> usize {
        self.structure.used_memory() + self.store.used_memory()
    }

    /// The parameters the index was constructed with.
    #[must_use]
    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    /// The dataset backing the index.
    #[must_use]
    pub fn store(&self) -> &PointStore<E> {
        &self.store
    }

    /// The autotuner's verdict, when this index was built with
    /// [`IndexParams::Autotuned`].
    #[must_use]
    pub fn tuned(&self) -> Option<&AutotuneResult> {
        self.tuned.as_ref()
    }

    /// Tombstones row `index`: it stays addressable but no search returns it.
    /// The slot is reclaimed by the next `build`.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` if the index is unbuilt, or `index` is out of bounds
    ///   or already removed.
    pub fn remove_point(&mut self, index: usize) -> Result<()> {
        if self.state == BuildState::Empty {
            return Err(Error::InvalidInput("cannot remove from an unbuilt index".to_string()));
        }
        self.store.remove(index)?;
        self.state = BuildState::Dirty;
        Ok(())
    }

    /// Finds the `k` nearest rows for each query row, writing into the
    /// caller's buffers.
    ///
    /// `queries` is row-major with the index's dimensionality; `indices` and
    /// `dists` must hold at least `queries_rows * k` entries. Each query's
    /// neighbors are written sorted by distance (ties by row index) at offset
    /// `row * k`; unused slots are filled with `usize::MAX` and the maximum
    /// distance. Returns the total number of neighbors found.
    ///
    /// With `cores != 1` the batch is split into contiguous row ranges and
    /// each worker writes only its own output range.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` if the index is unbuilt, shapes disagree, or `k` is
    ///   zero.
    /// * `ResourceExhausted` if a dedicated worker pool cannot be created.
    pub fn knn_search(&self, queries: &[E], indices: &mut [usize], dists: &mut [D], k: usize, params: &SearchParams) -> Result<usize> {
        self.ensure_searchable()?;
        let rows = self.query_rows(queries)?;
        if k == 0 {
            return Err(Error::InvalidInput("k must be at least 1".to_string()));
        }
        if indices.len() < rows * k || dists.len() < rows * k {
            return Err(Error::InvalidInput(format!(
                "output buffers must hold {} entries for {rows} queries",
                rows * k
            )));
        }

        let cols = self.store.cols();
        let k_eff = k.min(self.store.live_rows());
        let checks = params.checks.resolve(self.tuned.as_ref().map(|t| t.checks));
        let eps = params.eps;

        let run = |query: &[E], idx_out: &mut [usize], dist_out: &mut [D]| -> usize {
            let mut result = KnnResultSet::new(k_eff);
            self.search_into(query, &mut result, checks, eps);
            let hits = result.into_sorted_vec();
            for (slot, &(i, d)) in hits.iter().enumerate() {
                idx_out[slot] = i;
                dist_out[slot] = d;
            }
            for slot in hits.len()..k {
                idx_out[slot] = usize::MAX;
                dist_out[slot] = D::max_value();
            }
            hits.len()
        };

        if params.cores == 1 {
            let mut found = 0;
            for (query, (idx_out, dist_out)) in queries.chunks(cols).zip(indices.chunks_mut(k).zip(dists.chunks_mut(k))) {
                found += run(query, idx_out, dist_out);
            }
            return Ok(found);
        }
        self.dispatch(params.cores, || {
            queries
                .par_chunks(cols)
                .zip(indices.par_chunks_mut(k).zip(dists.par_chunks_mut(k)))
                .map(|(query, (idx_out, dist_out))| run(query, idx_out, dist_out))
                .sum::<usize>()
        })
    }

    /// Finds every row within `radius` of each query row.
    ///
    /// Results per query honor `params.max_neighbors` (keeping the closest)
    /// and come back sorted when `params.sorted` is set. Returns one vector
    /// of `(row, distance)` pairs per query.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` if the index is unbuilt or shapes disagree.
    /// * `ResourceExhausted` if a dedicated worker pool cannot be created.
    pub fn radius_search(&self, queries: &[E], radius: D, params: &SearchParams) -> Result<Vec<Vec<(usize, D)>>> {
        self.ensure_searchable()?;
        let _rows = self.query_rows(queries)?;

        let cols = self.store.cols();
        let checks = params.checks.resolve(self.tuned.as_ref().map(|t| t.checks));
        let (eps, sorted, cap) = (params.eps, params.sorted, params.max_neighbors);

        let run = |query: &[E]| -> Vec<(usize, D)> {
            let mut result = RadiusResultSet::new(radius, cap);
            self.search_into(query, &mut result, checks, eps);
            result.into_vec(sorted)
        };

        if params.cores == 1 {
            return Ok(queries.chunks(cols).map(run).collect());
        }
        self.dispatch(params.cores, || queries.par_chunks(cols).map(run).collect::<Vec<_>>())
    }

    /// Runs `work` with parallel fan-out: the global pool for `cores == 0`, a
    /// dedicated pool of `cores` workers otherwise. The serial `cores == 1`
    /// case is handled at the call sites.
    fn dispatch<T: Send>(&self, cores: usize, work: impl FnOnce() -> T + Send) -> Result<T> {
        if cores == 0 {
            return Ok(work());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cores)
            .build()
            .map_err(|e| Error::ResourceExhausted(e.to_string()))?;
        Ok(pool.install(work))
    }

    /// Dispatches one query to the built structure.
    fn search_into<R: ResultSet<D>>(&self, query: &[E], result: &mut R, checks: usize, eps: f32) {
        search_structure(&self.structure, &self.store, &self.metric, query, result, checks, eps);
    }

    /// Validates that the index can serve queries.
    fn ensure_searchable(&self) -> Result<()> {
        if self.state == BuildState::Empty {
            return Err(Error::InvalidInput("the index has not been built".to_string()));
        }
        Ok(())
    }

    /// Validates a query buffer's shape and returns its row count.
    fn query_rows(&self, queries: &[E]) -> Result<usize> {
        let cols = self.store.cols();
        if queries.is_empty() || queries.len() % cols != 0 {
            return Err(Error::InvalidInput(format!(
                "query buffer of {} elements is not a whole, non-zero number of rows of {cols}",
                queries.len()
            )));
        }
        Ok(queries.len() / cols)
    }
}

impl<E, D, M> Index<E, D, M>
where
    E: Element + Serialize + DeserializeOwned,
    D: Number + Serialize + DeserializeOwned,
    M: Metric<E, D>,
{
    /// Builds the structure chosen at construction over the current store.
    ///
    /// Tombstoned rows are compacted away first, renumbering the survivors.
    /// On failure the index is left empty.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` when the store has no live rows.
    /// * `Serialization` when `params` point at a snapshot that cannot be
    ///   loaded.
    /// * Any autotuner failure, for autotuned params.
    pub fn build(&mut self) -> Result<()> {
        self.structure = Structure::Empty;
        self.state = BuildState::Empty;

        if let IndexParams::Saved { path } = &self.params {
            let path = path.clone();
            return self.adopt_snapshot(&path);
        }

        self.store.compact();
        if self.store.is_empty() {
            return Err(Error::InvalidInput("cannot build an index over an empty dataset".to_string()));
        }

        let resolved = self.resolve_params()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        self.structure = build_structure(&self.store, &self.metric, &resolved, &mut rng)?;
        self.state = BuildState::Built;
        self.added_since_build = 0;
        self.size_at_build = self.store.rows();
        ftlog::info!("Built a {} index over {} rows", resolved.name(), self.store.rows());
        Ok(())
    }

    /// Resolves `Autotuned` params to a concrete structure choice, running
    /// the tuner the first time.
    fn resolve_params(&mut self) -> Result<IndexParams> {
        if let IndexParams::Autotuned {
            target_precision,
            build_weight,
            memory_weight,
            sample_fraction,
        } = self.params
        {
            if self.tuned.is_none() {
                let outcome = autotune::run(
                    &self.store,
                    &self.metric,
                    target_precision,
                    build_weight,
                    memory_weight,
                    sample_fraction,
                    self.seed,
                )?;
                ftlog::info!(
                    "Autotuner chose {} with checks {} (precision {:.3}, target reached: {})",
                    outcome.params.name(),
                    outcome.checks,
                    outcome.precision,
                    outcome.reached_target
                );
                self.tuned = Some(outcome);
            }
            return self
                .tuned
                .as_ref()
                .map(|t| t.params.clone())
                .ok_or_else(|| Error::InternalInvariant("tuning outcome vanished".to_string()));
        }
        Ok(self.params.clone())
    }

    /// Appends rows and either inserts them incrementally or, once the
    /// insertions outgrow `rebuild_threshold` times the size at the last
    /// build, rebuilds from scratch.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` if the index is unbuilt or the buffer shape is wrong.
    pub fn add_points(&mut self, points: &[E], rebuild_threshold: f32) -> Result<()> {
        if self.state == BuildState::Empty {
            return Err(Error::InvalidInput("cannot add to an unbuilt index".to_string()));
        }
        let range = self.store.append_flat(points)?;
        self.added_since_build += range.len();

        #[allow(clippy::cast_precision_loss)]
        if self.added_since_build as f32 > rebuild_threshold * self.size_at_build as f32 {
            ftlog::info!(
                "Rebuilding after {} insertions on a base of {} rows",
                self.added_since_build,
                self.size_at_build
            );
            return self.build();
        }

        match &mut self.structure {
            Structure::Empty | Structure::Linear => {}
            Structure::KdForest(f) => kd_forest::add_points(f, &self.store, range),
            Structure::KMeans(t) => kmeans::add_points(t, &self.store, &self.metric, range),
            Structure::KdSingle(t) => {
                // A leaf-insert path buys little at the dimensionality this
                // tree targets; rebuild the (cheap) structure instead.
                let (leaf_max_size, reorder) = match self.params {
                    IndexParams::KdSingle { leaf_max_size, reorder } => (leaf_max_size, reorder),
                    _ => (t.leaf_capacity(), false),
                };
                *t = kd_single::build(&self.store, leaf_max_size, reorder);
            }
            Structure::Hierarchical(f) => hierarchical::add_points(f, &self.store, &self.metric, range, &mut self.ops_rng),
            Structure::Lsh(l) => lsh::add_points(l, &self.store, range),
        }
        self.state = BuildState::Dirty;
        Ok(())
    }

    /// Writes a snapshot of the built structure.
    ///
    /// The snapshot stores row indices, not vectors: loading requires the
    /// original dataset. Adds and removes after a save do not alter the file.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` unless the index is freshly built (rebuild after any
    ///   add or remove before saving).
    /// * `Serialization` on I/O or encoding failure.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        match self.state {
            BuildState::Built => {}
            BuildState::Empty => return Err(Error::InvalidInput("cannot save an unbuilt index".to_string())),
            BuildState::Dirty => {
                return Err(Error::InvalidInput(
                    "the index has pending adds or removes; rebuild before saving".to_string(),
                ))
            }
        }
        let effective = self.tuned.as_ref().map_or(&self.params, |t| &t.params);
        io::save(path.as_ref(), &self.store, &self.metric, effective, &self.structure)
    }

    /// Loads a snapshot written by [`save`](Index::save), against the same
    /// dataset it was built on.
    ///
    /// # Errors
    ///
    /// * `Serialization` for a bad magic, version, shape, or metric mismatch,
    ///   a truncated stream, or failed decompression.
    pub fn load<P: AsRef<Path>>(path: P, store: PointStore<E>, metric: M) -> Result<Self> {
        let (params, structure) = io::load(path.as_ref(), &store, &metric)?;
        let seed = rand::rng().random();
        let size_at_build = store.rows();
        Ok(Self {
            store,
            metric,
            params,
            structure,
            state: BuildState::Built,
            seed,
            ops_rng: StdRng::seed_from_u64(seed ^ 0x9E37_79B9_7F4A_7C15),
            tuned: None,
            added_since_build: 0,
            size_at_build,
        })
    }

    /// Replaces this index's state with a loaded snapshot.
    fn adopt_snapshot(&mut self, path: &Path) -> Result<()> {
        let (params, structure) = io::load(path, &self.store, &self.metric)?;
        self.params = params;
        self.structure = structure;
        self.state = BuildState::Built;
        self.added_since_build = 0;
        self.size_at_build = self.store.rows();
        Ok(())
    }
}

/// Runs one query against a structure. The shared entry point for the facade
/// and the autotuner's measurements.
pub(crate) fn search_structure<E, D, M, R>(
    structure: &Structure<E, D>,
    store: &PointStore<E>,
    metric: &M,
    query: &[E],
    result: &mut R,
    checks: usize,
    eps: f32,
) where
    E: Element,
    D: Number,
    M: Metric<E, D>,
    R: ResultSet<D>,
{
    match structure {
        Structure::Empty => {}
        Structure::Linear => linear::search(store, metric, query, result),
        Structure::KdForest(f) => kd_forest::search(f, store, metric, query, result, checks, eps),
        Structure::KMeans(t) => kmeans::search(t, store, metric, query, result, checks),
        Structure::KdSingle(t) => kd_single::search(t, store, metric, query, result, eps),
        Structure::Hierarchical(f) => hierarchical::search(f, store, metric, query, result, checks),
        Structure::Lsh(l) => lsh::search(l, store, metric, query, result),
    }
}

/// Builds the structure for concrete (non-`Autotuned`, non-`Saved`) params.
pub(crate) fn build_structure<E, D, M>(store: &PointStore<E>, metric: &M, params: &IndexParams, rng: &mut StdRng) -> Result<Structure<E, D>>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    match *params {
        IndexParams::Linear => Ok(Structure::Linear),
        IndexParams::KdForest { trees } => Ok(Structure::KdForest(kd_forest::build(store, trees, rng))),
        IndexParams::KMeans {
            branching,
            iterations,
            centers_init,
            cb_index,
        } => Ok(Structure::KMeans(kmeans::build(
            store,
            metric,
            branching,
            iterations,
            centers_init,
            cb_index,
            rng,
        ))),
        IndexParams::KdSingle { leaf_max_size, reorder } => Ok(Structure::KdSingle(kd_single::build(store, leaf_max_size, reorder))),
        IndexParams::Hierarchical {
            branching,
            trees,
            centers_init,
            leaf_max_size,
        } => Ok(Structure::Hierarchical(hierarchical::build(
            store,
            metric,
            branching,
            trees,
            centers_init,
            leaf_max_size,
            rng,
        ))),
        IndexParams::Lsh {
            table_number,
            key_size,
            multi_probe_level,
        } => Ok(Structure::Lsh(lsh::build(store, table_number, key_size, multi_probe_level, rng))),
        IndexParams::Autotuned { .. } | IndexParams::Saved { .. } => Err(Error::InternalInvariant(
            "autotuned and saved params must be resolved before building".to_string(),
        )),
    }
}

/// Rejects parameter values and metric pairings the structures cannot serve.
fn validate_params<E: Element, D: Number, M: Metric<E, D>>(params: &IndexParams, metric: &M) -> Result<()> {
    match *params {
        IndexParams::Linear | IndexParams::Saved { .. } => Ok(()),
        IndexParams::KdForest { trees } => {
            if trees == 0 {
                return Err(Error::InvalidInput("a kd-forest needs at least one tree".to_string()));
            }
            require_decomposable::<E, D, M>(metric)
        }
        IndexParams::KMeans { branching, cb_index, .. } => {
            if branching < 2 {
                return Err(Error::InvalidInput("k-means branching must be at least 2".to_string()));
            }
            if !(0.0..=1.0).contains(&cb_index) {
                return Err(Error::InvalidInput("cb_index must lie in [0, 1]".to_string()));
            }
            if metric.kind() == MetricKind::Hamming {
                return Err(Error::UnsupportedMetric(
                    "k-means trees average coordinates, which is undefined for Hamming bitstrings; use the hierarchical index".to_string(),
                ));
            }
            Ok(())
        }
        IndexParams::KdSingle { leaf_max_size, .. } => {
            if leaf_max_size == 0 {
                return Err(Error::InvalidInput("kd-tree leaves must hold at least one point".to_string()));
            }
            require_decomposable::<E, D, M>(metric)
        }
        IndexParams::Hierarchical {
            branching,
            trees,
            leaf_max_size,
            ..
        } => {
            if branching < 2 || trees == 0 || leaf_max_size == 0 {
                return Err(Error::InvalidInput(
                    "hierarchical clustering needs branching >= 2, trees >= 1, and leaf_max_size >= 1".to_string(),
                ));
            }
            Ok(())
        }
        IndexParams::Lsh {
            table_number, key_size, ..
        } => {
            if table_number == 0 || !(1..=32).contains(&key_size) {
                return Err(Error::InvalidInput(
                    "LSH needs at least one table and a key size between 1 and 32 bits".to_string(),
                ));
            }
            if metric.kind() != MetricKind::Hamming || E::DATA_TYPE != DataType::U8 {
                return Err(Error::UnsupportedMetric(
                    "LSH hashes packed bitstrings and requires the Hamming metric over byte rows".to_string(),
                ));
            }
            Ok(())
        }
        IndexParams::Autotuned {
            target_precision,
            sample_fraction,
            ..
        } => {
            if !(0.0..=1.0).contains(&target_precision) {
                return Err(Error::InvalidInput("target_precision must lie in [0, 1]".to_string()));
            }
            if !(sample_fraction > 0.0 && sample_fraction <= 1.0) {
                return Err(Error::InvalidInput("sample_fraction must lie in (0, 1]".to_string()));
            }
            Ok(())
        }
    }
}

/// Part of parameter validation: kd-trees prune with per-coordinate partial
/// distances, which only decomposable metrics provide.
fn require_decomposable<E: Element, D: Number, M: Metric<E, D>>(metric: &M) -> Result<()> {
    if metric.is_decomposable() {
        Ok(())
    } else {
        Err(Error::UnsupportedMetric(format!(
            "kd-tree pruning needs an additive per-coordinate metric; {} is not",
            metric.kind().name()
        )))
    }
}
