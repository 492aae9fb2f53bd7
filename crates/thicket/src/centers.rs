//! Initial center selection for the clustering indices.

use proximity::{Element, Metric, Number};
use rand::{rngs::StdRng, seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::store::PointStore;

/// Distances below this are treated as duplicates when picking centers.
const DUPLICATE_EPS: f64 = 1e-16;

/// How the clustering indices pick their initial centers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CentersInit {
    /// Distinct rows drawn uniformly at random.
    Random,
    /// Farthest-first traversal: each center maximizes its distance to the
    /// centers already chosen.
    Gonzales,
    /// Potential-weighted sampling in the style of careful k-means seeding.
    KMeansPP,
}

impl CentersInit {
    /// A short name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Gonzales => "gonzales",
            Self::KMeansPP => "kmeans++",
        }
    }
}

/// Picks up to `k` distinct rows from `candidates` to seed a clustering step.
///
/// Fewer than `k` centers come back when the candidates collapse onto fewer
/// than `k` distinct positions; callers treat that as "stop splitting".
pub(crate) fn choose_centers<E, D, M>(
    init: CentersInit,
    k: usize,
    candidates: &[u32],
    store: &PointStore<E>,
    metric: &M,
    rng: &mut StdRng,
) -> Vec<u32>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }
    match init {
        CentersInit::Random => random(k, candidates, store, metric, rng),
        CentersInit::Gonzales => gonzales(k, candidates, store, metric, rng),
        CentersInit::KMeansPP => kmeanspp(k, candidates, store, metric, rng),
    }
}

/// The distance between two stored rows, widened for the selection math.
fn row_dist<E: Element, D: Number, M: Metric<E, D>>(store: &PointStore<E>, metric: &M, a: u32, b: u32) -> f64 {
    metric.distance(store.row(a as usize), store.row(b as usize), None).as_f64()
}

fn random<E, D, M>(k: usize, candidates: &[u32], store: &PointStore<E>, metric: &M, rng: &mut StdRng) -> Vec<u32>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let mut pool = candidates.to_vec();
    pool.shuffle(rng);

    let mut centers: Vec<u32> = Vec::with_capacity(k);
    for c in pool {
        let duplicate = centers.iter().any(|&other| row_dist(store, metric, c, other) < DUPLICATE_EPS);
        if !duplicate {
            centers.push(c);
            if centers.len() == k {
                break;
            }
        }
    }
    centers
}

fn gonzales<E, D, M>(k: usize, candidates: &[u32], store: &PointStore<E>, metric: &M, rng: &mut StdRng) -> Vec<u32>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let first = candidates[rng.random_range(0..candidates.len())];
    let mut centers = vec![first];

    // Distance from each candidate to its closest chosen center.
    let mut closest: Vec<f64> = candidates.iter().map(|&c| row_dist(store, metric, c, first)).collect();

    while centers.len() < k {
        let (best_idx, best_val) = closest
            .iter()
            .enumerate()
            .fold((0, 0.0_f64), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) });
        if best_val < DUPLICATE_EPS {
            // Everything left coincides with a chosen center.
            break;
        }
        let chosen = candidates[best_idx];
        centers.push(chosen);
        for (i, &c) in candidates.iter().enumerate() {
            closest[i] = closest[i].min(row_dist(store, metric, c, chosen));
        }
    }
    centers
}

fn kmeanspp<E, D, M>(k: usize, candidates: &[u32], store: &PointStore<E>, metric: &M, rng: &mut StdRng) -> Vec<u32>
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
{
    let first = candidates[rng.random_range(0..candidates.len())];
    let mut centers = vec![first];

    let mut closest: Vec<f64> = candidates.iter().map(|&c| row_dist(store, metric, c, first)).collect();
    let mut potential: f64 = closest.iter().sum();

    while centers.len() < k {
        if potential < DUPLICATE_EPS {
            break;
        }
        // Sample a candidate with probability proportional to its current
        // potential contribution. The fallback (rounding pushed `rand_val`
        // past every contribution) takes the farthest candidate, which is
        // never a duplicate while the potential is positive.
        let mut rand_val = rng.random_range(0.0..potential);
        let mut chosen_idx = None;
        for (i, &c) in closest.iter().enumerate() {
            if c > 0.0 && rand_val <= c {
                chosen_idx = Some(i);
                break;
            }
            rand_val -= c;
        }
        let chosen_idx = chosen_idx.unwrap_or_else(|| {
            closest
                .iter()
                .enumerate()
                .fold((0, 0.0_f64), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
                .0
        });
        let chosen = candidates[chosen_idx];

        centers.push(chosen);
        potential = 0.0;
        for (i, &c) in candidates.iter().enumerate() {
            closest[i] = closest[i].min(row_dist(store, metric, c, chosen));
            potential += closest[i];
        }
    }
    centers
}
