//! The brute-force baseline: scan every live row.

use proximity::{Element, Metric, Number};

use crate::{results::ResultSet, store::PointStore};

/// Ranks every live row against the query. The result set's worst distance
/// feeds the metric cutoff, so hopeless rows cost only a partial sum.
pub(crate) fn search<E, D, M, R>(store: &PointStore<E>, metric: &M, query: &[E], result: &mut R)
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
    R: ResultSet<D>,
{
    for i in 0..store.rows() {
        if store.is_removed(i) {
            continue;
        }
        let d = metric.distance(query, store.row(i), Some(result.worst_dist()));
        result.add(i, d);
    }
}
