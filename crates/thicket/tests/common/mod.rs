//! Shared helpers for the integration tests.
#![allow(dead_code)]

use proximity::{Element, Metric, Number};
use rand::{rngs::StdRng, Rng, SeedableRng};
use thicket::{Index, SearchParams};

/// Seeded data generation.
pub mod data_gen {
    use super::{Rng, SeedableRng, StdRng};

    /// Uniform random tabular data.
    pub fn tabular(rows: usize, dim: usize, lo: f32, hi: f32, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..rows).map(|_| (0..dim).map(|_| rng.random_range(lo..hi)).collect()).collect()
    }

    /// Gaussian-ish clusters: `centers` cluster centers with `per_center`
    /// jittered members each. Returns the rows grouped by cluster.
    pub fn clustered(centers: usize, per_center: usize, dim: usize, spread: f32, jitter: f32, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = Vec::with_capacity(centers * per_center);
        for _ in 0..centers {
            let center: Vec<f32> = (0..dim).map(|_| rng.random_range(-spread..spread)).collect();
            for _ in 0..per_center {
                rows.push(center.iter().map(|&c| c + rng.random_range(-jitter..jitter)).collect());
            }
        }
        rows
    }

    /// Binary descriptors: `bases` random byte patterns with `per_base`
    /// members each, every member within `flips` bit flips of its base.
    pub fn binary_clustered(bases: usize, per_base: usize, bytes: usize, flips: usize, seed: u64) -> Vec<Vec<u8>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = Vec::with_capacity(bases * per_base);
        for _ in 0..bases {
            let base: Vec<u8> = (0..bytes).map(|_| rng.random()).collect();
            for _ in 0..per_base {
                let mut row = base.clone();
                for _ in 0..rng.random_range(0..=flips) {
                    let bit = rng.random_range(0..bytes * 8);
                    row[bit / 8] ^= 1 << (bit % 8);
                }
                rows.push(row);
            }
        }
        rows
    }
}

/// Queries near the dataset: jittered copies of randomly drawn rows.
pub fn perturb_rows(rows: &[Vec<f32>], count: usize, jitter: f32, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let base = &rows[rng.random_range(0..rows.len())];
            base.iter().map(|&x| x + rng.random_range(-jitter..jitter)).collect()
        })
        .collect()
}

/// Queries near the dataset: randomly drawn rows with up to `flips` bits
/// flipped.
pub fn perturb_binary(rows: &[Vec<u8>], count: usize, flips: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let mut row = rows[rng.random_range(0..rows.len())].clone();
            for _ in 0..rng.random_range(0..=flips) {
                let bit = rng.random_range(0..row.len() * 8);
                row[bit / 8] ^= 1 << (bit % 8);
            }
            row
        })
        .collect()
}

/// Flattens rows into the row-major buffer the index API takes.
pub fn flatten<E: Copy>(rows: &[Vec<E>]) -> Vec<E> {
    rows.iter().flatten().copied().collect()
}

/// Runs a k-NN query through the facade and returns the found hits.
pub fn knn<E, D, M>(index: &Index<E, D, M>, queries: &[E], k: usize, params: &SearchParams) -> Vec<Vec<(usize, D)>>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let rows = queries.len() / index.veclen();
    let mut ids = vec![usize::MAX; rows * k];
    let mut dists = vec![D::default(); rows * k];
    index
        .knn_search(queries, &mut ids, &mut dists, k, params)
        .map_err(|e| e.to_string())
        .unwrap();
    ids.chunks(k)
        .zip(dists.chunks(k))
        .map(|(ids, dists)| {
            ids.iter()
                .zip(dists)
                .filter(|&(&i, _)| i != usize::MAX)
                .map(|(&i, &d)| (i, d))
                .collect()
        })
        .collect()
}

/// Exact nearest neighbors by brute force, sorted by (distance, index).
pub fn exact_knn<E, D, M>(rows: &[Vec<E>], metric: &M, query: &[E], k: usize) -> Vec<(usize, D)>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let mut all = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (i, metric.distance(query, row, None)))
        .collect::<Vec<_>>();
    all.sort_by_key(|&(i, d)| thicket::MinItem((), (d, i)));
    all.truncate(k);
    all
}

/// Discrete precision: the fraction of found hits whose distance is within
/// the exact k-th nearest distance. Robust to ties in either ranking.
#[allow(clippy::cast_precision_loss)]
pub fn discrete_precision<D: Number>(truth: &[(usize, D)], found: &[(usize, D)]) -> f64 {
    if truth.is_empty() {
        return 1.0;
    }
    let worst = truth[truth.len() - 1].1;
    let good = found.iter().filter(|&&(_, d)| !(worst < d)).count();
    good as f64 / truth.len() as f64
}
