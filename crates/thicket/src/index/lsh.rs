//! Multi-table, multi-probe locality-sensitive hashing over packed
//! bitstrings.
//!
//! Each table keys rows by a random selection of bit positions; a query
//! probes its exact bucket in every table plus the buckets reachable by a few
//! key-bit flips, then ranks the union of candidates by true Hamming
//! distance.

use core::ops::Range;
use std::collections::HashMap;

use proximity::{Element, Metric, Number};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::{results::ResultSet, store::PointStore, utils::VisitSet};

/// Bits per stored element; rows are packed bytes.
const ELEMENT_BITS: usize = 8;

/// The built tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct LshTables {
    /// The hash tables, probed jointly.
    tables: Vec<LshTable>,
    /// Bits per hash key.
    key_size: usize,
    /// The key-bit masks probed around the exact key, the zero mask first.
    probe_masks: Vec<u32>,
}

/// One hash table.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LshTable {
    /// The sampled bit positions, one per key bit.
    bits: Vec<u32>,
    /// Bucketed row indices by key.
    buckets: HashMap<u32, Vec<u32>>,
}

impl LshTables {
    /// Bytes held by the tables.
    pub(crate) fn used_memory(&self) -> usize {
        self.tables
            .iter()
            .map(|t| {
                t.bits.len() * core::mem::size_of::<u32>()
                    + t.buckets
                        .iter()
                        .map(|(_, b)| core::mem::size_of::<u32>() + b.len() * core::mem::size_of::<u32>())
                        .sum::<usize>()
            })
            .sum()
    }
}

/// The key of `row` under the table's bit selection.
fn key_of<E: Element>(table: &LshTable, row: &[E]) -> u32 {
    let mut key = 0_u32;
    for (j, &b) in table.bits.iter().enumerate() {
        let b = b as usize;
        let element = row[b / ELEMENT_BITS].to_u64().unwrap_or(0);
        let bit = (element >> (b % ELEMENT_BITS)) & 1;
        #[allow(clippy::cast_possible_truncation)]
        {
            key |= (bit as u32) << j;
        }
    }
    key
}

/// All masks over the `ceil(key_size / 2)` lowest key positions with at most
/// `multi_probe_level` bits set, in (popcount, numeric) order. The zero mask
/// (the exact bucket) comes first.
fn probe_masks(key_size: usize, multi_probe_level: usize) -> Vec<u32> {
    let flippable = key_size.div_ceil(2).min(31);
    let mut masks = (0_u32..(1 << flippable))
        .filter(|m| (m.count_ones() as usize) <= multi_probe_level)
        .collect::<Vec<_>>();
    masks.sort_by_key(|&m| (m.count_ones(), m));
    masks
}

/// Builds `table_number` tables over the live rows of `store`.
pub(crate) fn build<E: Element>(
    store: &PointStore<E>,
    table_number: usize,
    key_size: usize,
    multi_probe_level: usize,
    rng: &mut StdRng,
) -> LshTables {
    let row_bits = store.cols() * ELEMENT_BITS;
    ftlog::debug!("Building {table_number} LSH tables with {key_size}-bit keys over {row_bits}-bit rows");

    let tables = (0..table_number)
        .map(|_| {
            #[allow(clippy::cast_possible_truncation)]
            let bits = rand::seq::index::sample(rng, row_bits, key_size.min(row_bits))
                .into_iter()
                .map(|b| b as u32)
                .collect::<Vec<_>>();
            let mut table = LshTable {
                bits,
                buckets: HashMap::new(),
            };
            for &i in &store.live_indices() {
                let key = key_of(&table, store.row(i as usize));
                table.buckets.entry(key).or_default().push(i);
            }
            table
        })
        .collect();

    LshTables {
        tables,
        key_size,
        probe_masks: probe_masks(key_size, multi_probe_level),
    }
}

/// Appends freshly added rows directly into every table's buckets.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn add_points<E: Element>(lsh: &mut LshTables, store: &PointStore<E>, new_rows: Range<usize>) {
    for i in new_rows {
        for table in &mut lsh.tables {
            let key = key_of(table, store.row(i));
            table.buckets.entry(key).or_default().push(i as u32);
        }
    }
}

/// Probes every table around the query's key and ranks the candidate union.
pub(crate) fn search<E, D, M, R>(lsh: &LshTables, store: &PointStore<E>, metric: &M, query: &[E], result: &mut R)
where
    E: Element,
    D: Number,
    M: Metric<E, D>,
    R: ResultSet<D>,
{
    let mut visited = VisitSet::new(store.rows());
    for table in &lsh.tables {
        let key = key_of(table, query);
        for &mask in &lsh.probe_masks {
            let Some(bucket) = table.buckets.get(&(key ^ mask)) else {
                continue;
            };
            for &point in bucket {
                let i = point as usize;
                if !visited.insert(i) || store.is_removed(i) {
                    continue;
                }
                let d = metric.distance(query, store.row(i), Some(result.worst_dist()));
                result.add(i, d);
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

    #[test]
    fn probe_masks_are_deterministic_and_complete() {
        let masks = probe_masks(20, 2);
        // ceil(20 / 2) = 10 flippable positions: 1 + 10 + 45 masks.
        assert_eq!(masks.len(), 56);
        assert_eq!(masks[0], 0);
        assert!(masks[1..=10].iter().all(|m| m.count_ones() == 1));
        assert!(masks[11..].iter().all(|m| m.count_ones() == 2));
        let mut sorted = masks.clone();
        sorted.sort_by_key(|&m| (m.count_ones(), m));
        assert_eq!(masks, sorted);
    }

    #[test]
    fn key_reads_the_sampled_bits() {
        let table = LshTable {
            bits: vec![0, 9, 17],
            buckets: HashMap::new(),
        };
        // Row bits: element 0 bit 0 set, element 1 bit 1 set, element 2 bit 1 clear.
        let row: Vec<u8> = vec![0b0000_0001, 0b0000_0010, 0b0000_0000];
        assert_eq!(key_of(&table, &row), 0b011);
    }

    #[test]
    fn exact_duplicates_are_always_found() {
        let rows = (0..128_u8).map(|i| vec![i, i.wrapping_mul(37), 0xA5, i ^ 0x5A]).collect::<Vec<_>>();
        let store = PointStore::from_rows(rows).map_err(|e| e.to_string()).unwrap();
        let mut rng = StdRng::seed_from_u64(31);
        let lsh = build(&store, 8, 12, 1, &mut rng);

        for probe in [3_usize, 40, 77, 127] {
            let query = store.row(probe).to_vec();
            let mut result: KnnResultSet<u32> = KnnResultSet::new(1);
            search(&lsh, &store, &Hamming, &query, &mut result);
            assert_eq!(result.into_sorted_vec()[0], (probe, 0));
        }
    }

    #[test]
    fn added_rows_land_in_buckets() {
        let rows = (0..32_u8).map(|i| vec![i, 0, 0, i]).collect::<Vec<_>>();
        let mut store = PointStore::from_rows(rows).map_err(|e| e.to_string()).unwrap();
        let mut rng = StdRng::seed_from_u64(41);
        let mut lsh = build(&store, 6, 10, 1, &mut rng);

        let range = store.append_flat(&[0xFF, 0xFF, 0xFF, 0xFF]).map_err(|e| e.to_string()).unwrap();
        add_points(&mut lsh, &store, range);

        let mut result: KnnResultSet<u32> = KnnResultSet::new(1);
        search(&lsh, &store, &Hamming, &[0xFF_u8, 0xFF, 0xFF, 0xFF], &mut result);
        assert_eq!(result.into_sorted_vec()[0], (32, 0));
    }
}
