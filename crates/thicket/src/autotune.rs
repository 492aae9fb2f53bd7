//! The autotuner: pick a structure and its parameters for a target recall.
//!
//! The tuner draws a sample of the dataset, splits it into a tuning set and a
//! held-out query set, computes exact nearest neighbors by linear scan, and
//! then walks a grid of candidate configurations. Each candidate is built and
//! probed for the smallest `checks` budget that reaches the target precision;
//! the winner minimizes measured search time plus weighted build time and
//! memory.

use std::time::Instant;

use proximity::{Element, Metric, MetricKind, Number};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    centers::CentersInit,
    index::{build_structure, search_structure, Structure},
    params::IndexParams,
    results::KnnResultSet,
    store::PointStore,
    utils::MinItem,
    Error, Result,
};

/// Below this many live rows, tuning is noise; a linear scan wins outright.
const MIN_TUNING_ROWS: usize = 32;

/// The kd-forest side of the candidate grid.
const KD_TREES: [usize; 4] = [1, 4, 8, 16];

/// The k-means side of the candidate grid.
const KMEANS_BRANCHING: [usize; 5] = [16, 32, 64, 128, 256];
const KMEANS_ITERATIONS: [usize; 4] = [1, 5, 10, 15];
const KMEANS_INIT: [CentersInit; 3] = [CentersInit::Random, CentersInit::Gonzales, CentersInit::KMeansPP];

/// What the autotuner settled on.
#[derive(Clone, Debug)]
pub struct AutotuneResult {
    /// The winning configuration.
    pub params: IndexParams,
    /// The smallest leaf-check budget that reached the target precision on
    /// the sample (or the largest budget probed, if the target was missed).
    pub checks: usize,
    /// The precision that budget achieved on the sample.
    pub precision: f32,
    /// Whether any candidate reached the target precision.
    pub reached_target: bool,
}

/// One measured candidate.
struct Candidate {
    /// The configuration.
    params: IndexParams,
    /// The chosen budget.
    checks: usize,
    /// Precision at that budget.
    precision: f32,
    /// Whether the target was reached.
    reached_target: bool,
    /// The cost being minimized.
    cost: f32,
}

/// Runs the tuner over a sample of `store`.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn run<E, D, M>(
    store: &PointStore<E>,
    metric: &M,
    target_precision: f32,
    build_weight: f32,
    memory_weight: f32,
    sample_fraction: f32,
    seed: u64,
) -> Result<AutotuneResult>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let n = store.live_rows();
    let sample_n = ((sample_fraction * n as f32) as usize).min(n);

    if sample_n < MIN_TUNING_ROWS {
        ftlog::info!("Sample of {sample_n} rows is too small to tune on; falling back to a linear scan");
        return Ok(AutotuneResult {
            params: IndexParams::Linear,
            checks: usize::MAX,
            precision: 1.0,
            reached_target: true,
        });
    }

    // Split the sample into a tuning dataset and a held-out query set.
    let sample = store.sample_rows(sample_n, &mut rng);
    let test_n = (sample_n / 10).max(1);
    let query_store = store.gather(&sample[..test_n]);
    let tuning_store = store.gather(&sample[test_n..]);
    let queries = (0..query_store.rows()).map(|i| query_store.row(i).to_vec()).collect::<Vec<_>>();

    // Exact nearest-neighbor distances on the tuning set, by linear scan.
    let truth = queries
        .iter()
        .map(|q| {
            let mut result = KnnResultSet::new(1);
            crate::index::linear::search(&tuning_store, metric, q, &mut result);
            result.into_sorted_vec()[0].1
        })
        .collect::<Vec<D>>();

    let grid = candidate_grid::<E, D, M>(metric);
    if grid.is_empty() {
        // Nothing in the grid can serve this metric; exact scan it is.
        return Ok(AutotuneResult {
            params: IndexParams::Linear,
            checks: usize::MAX,
            precision: 1.0,
            reached_target: true,
        });
    }

    let mut measured = Vec::with_capacity(grid.len());
    for params in grid {
        match measure_candidate(
            &tuning_store,
            metric,
            &queries,
            &truth,
            params,
            target_precision,
            build_weight,
            memory_weight,
            seed,
        ) {
            Ok(candidate) => measured.push(candidate),
            Err(e) => ftlog::warn!("Skipping a tuning candidate: {e}"),
        }
    }

    let reached = measured.iter().any(|c| c.reached_target);
    let winner = if reached {
        measured
            .into_iter()
            .filter(|c| c.reached_target)
            .min_by_key(|c| MinItem((), c.cost))
    } else {
        // No candidate hit the target; surrender the flag and hand back the
        // highest-recall configuration.
        measured.into_iter().min_by_key(|c| MinItem((), -c.precision))
    };

    winner
        .map(|c| AutotuneResult {
            params: c.params,
            checks: c.checks,
            precision: c.precision,
            reached_target: c.reached_target,
        })
        .ok_or_else(|| Error::InternalInvariant("the tuning grid produced no measurements".to_string()))
}

/// The configurations worth trying for this metric.
fn candidate_grid<E: Element, D: Number, M: Metric<E, D>>(metric: &M) -> Vec<IndexParams> {
    let mut grid = Vec::new();
    if metric.is_decomposable() {
        grid.extend(KD_TREES.iter().map(|&trees| IndexParams::KdForest { trees }));
    }
    if metric.kind() != MetricKind::Hamming {
        for &branching in &KMEANS_BRANCHING {
            for &iterations in &KMEANS_ITERATIONS {
                for &centers_init in &KMEANS_INIT {
                    grid.push(IndexParams::KMeans {
                        branching,
                        iterations,
                        centers_init,
                        cb_index: 0.2,
                    });
                }
            }
        }
    }
    grid
}

/// Builds one candidate and finds its smallest adequate `checks` budget.
#[allow(clippy::too_many_arguments, clippy::cast_precision_loss)]
fn measure_candidate<E, D, M>(
    tuning_store: &PointStore<E>,
    metric: &M,
    queries: &[Vec<E>],
    truth: &[D],
    params: IndexParams,
    target_precision: f32,
    build_weight: f32,
    memory_weight: f32,
    seed: u64,
) -> Result<Candidate>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let build_start = Instant::now();
    let structure = build_structure(tuning_store, metric, &params, &mut rng)?;
    let build_time = build_start.elapsed().as_secs_f32();
    let memory_mib = structure.used_memory() as f32 / (1024.0 * 1024.0);

    let max_checks = tuning_store.rows();

    // Double the budget until the target is reached, then binary-search the
    // smallest budget in the last octave that still reaches it.
    let mut checks = 1_usize;
    let (mut precision, mut search_time) = precision_at(&structure, tuning_store, metric, queries, truth, checks);
    while precision < target_precision && checks < max_checks {
        checks = (checks * 2).min(max_checks);
        let (p, t) = precision_at(&structure, tuning_store, metric, queries, truth, checks);
        precision = p;
        search_time = t;
    }
    let reached_target = precision >= target_precision;

    if reached_target && checks > 1 {
        let (mut lo, mut hi) = (checks / 2, checks);
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            let (p, t) = precision_at(&structure, tuning_store, metric, queries, truth, mid);
            if p >= target_precision {
                hi = mid;
                precision = p;
                search_time = t;
            } else {
                lo = mid;
            }
        }
        checks = hi;
    }

    ftlog::debug!(
        "Tuning candidate {} reached precision {precision:.3} at checks {checks}",
        params.name()
    );
    Ok(Candidate {
        params,
        checks,
        precision,
        reached_target,
        cost: search_time + build_weight * build_time + memory_weight * memory_mib,
    })
}

/// Measures precision and wall-clock time of one budget over the query set.
///
/// Precision is discrete: a query counts as correct when the distance found
/// is no worse than the exact nearest-neighbor distance.
#[allow(clippy::cast_precision_loss)]
fn precision_at<E, D, M>(
    structure: &Structure<E, D>,
    tuning_store: &PointStore<E>,
    metric: &M,
    queries: &[Vec<E>],
    truth: &[D],
    checks: usize,
) -> (f32, f32)
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let start = Instant::now();
    let mut correct = 0_usize;
    for (q, &true_dist) in queries.iter().zip(truth) {
        let mut result = KnnResultSet::new(1);
        search_structure(structure, tuning_store, metric, q, &mut result, checks, 0.0);
        let hits = result.into_sorted_vec();
        if hits.first().is_some_and(|&(_, d)| !(true_dist < d)) {
            correct += 1;
        }
    }
    let elapsed = start.elapsed().as_secs_f32();
    (correct as f32 / queries.len() as f32, elapsed)
}
