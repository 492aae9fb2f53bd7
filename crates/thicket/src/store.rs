//! The point store: flat row-major dataset rows with a removal bitmap.

use proximity::Element;
use rand::rngs::StdRng;

use crate::{Error, Result};

/// A dataset of fixed-dimensionality rows stored as one flat vector.
///
/// Rows are addressed by stable 0-based indices: appending never moves
/// existing rows, and removal only tombstones a row. Tombstoned slots are not
/// reused until the owning index performs a full rebuild, which compacts the
/// store and renumbers the surviving rows.
#[derive(Clone, Debug)]
pub struct PointStore<E> {
    /// The rows, concatenated.
    data: Vec<E>,
    /// The number of elements per row.
    cols: usize,
    /// The removal bitmap.
    removed: Tombstones,
}

impl<E: Element> PointStore<E> {
    /// Creates a store from a flat row-major buffer.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` if `cols` is zero or `data.len()` is not a multiple
    ///   of `cols`.
    pub fn from_flat(data: Vec<E>, cols: usize) -> Result<Self> {
        if cols == 0 {
            return Err(Error::InvalidInput("rows must have at least one element".to_string()));
        }
        if data.len() % cols != 0 {
            return Err(Error::InvalidInput(format!(
                "flat buffer of {} elements is not a whole number of rows of {cols}",
                data.len()
            )));
        }
        let rows = data.len() / cols;
        Ok(Self {
            data,
            cols,
            removed: Tombstones::with_len(rows),
        })
    }

    /// Creates a store from one vector per row.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` if `rows` is empty (the dimensionality cannot be
    ///   inferred) or the rows disagree on length.
    pub fn from_rows(rows: Vec<Vec<E>>) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if cols == 0 {
            return Err(Error::InvalidInput(
                "cannot infer dimensionality from zero rows or empty rows".to_string(),
            ));
        }
        if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
            return Err(Error::InvalidInput(format!(
                "rows disagree on dimensionality: expected {cols}, found {}",
                bad.len()
            )));
        }
        let data = rows.into_iter().flatten().collect();
        Self::from_flat(data, cols)
    }

    /// The number of logical rows, including tombstoned ones.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.data.len() / self.cols
    }

    /// The number of rows that have not been removed.
    #[must_use]
    pub fn live_rows(&self) -> usize {
        self.rows() - self.removed.count()
    }

    /// The number of elements per row.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Whether the store holds no live rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_rows() == 0
    }

    /// Returns row `i`.
    ///
    /// # Panics
    ///
    /// If `i` is out of bounds. Public API entry points bounds-check before
    /// reaching here.
    #[must_use]
    pub fn row(&self, i: usize) -> &[E] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Whether row `i` has been tombstoned.
    #[must_use]
    pub fn is_removed(&self, i: usize) -> bool {
        self.removed.get(i)
    }

    /// Appends rows from a flat buffer, returning the range of new indices.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` if the buffer is empty or not a whole number of rows.
    pub(crate) fn append_flat(&mut self, points: &[E]) -> Result<core::ops::Range<usize>> {
        if points.is_empty() || points.len() % self.cols != 0 {
            return Err(Error::InvalidInput(format!(
                "appended buffer of {} elements is not a whole, non-zero number of rows of {}",
                points.len(),
                self.cols
            )));
        }
        let start = self.rows();
        self.data.extend_from_slice(points);
        let end = self.rows();
        self.removed.grow(end);
        Ok(start..end)
    }

    /// Tombstones row `i`.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` if `i` is out of bounds or already removed.
    pub(crate) fn remove(&mut self, i: usize) -> Result<()> {
        if i >= self.rows() {
            return Err(Error::InvalidInput(format!("row {i} is out of bounds for {} rows", self.rows())));
        }
        if !self.removed.set(i) {
            return Err(Error::InvalidInput(format!("row {i} is already removed")));
        }
        Ok(())
    }

    /// Drops tombstoned rows in place, renumbering the survivors.
    pub(crate) fn compact(&mut self) {
        if self.removed.count() == 0 {
            return;
        }
        let cols = self.cols;
        let mut write = 0;
        for read in 0..self.rows() {
            if self.removed.get(read) {
                continue;
            }
            if write != read {
                let (w, r) = (write * cols, read * cols);
                for j in 0..cols {
                    self.data[w + j] = self.data[r + j];
                }
            }
            write += 1;
        }
        self.data.truncate(write * cols);
        self.removed = Tombstones::with_len(write);
    }

    /// The indices of all live rows, in increasing order.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn live_indices(&self) -> Vec<u32> {
        (0..self.rows()).filter(|&i| !self.removed.get(i)).map(|i| i as u32).collect()
    }

    /// Draws `n` distinct live rows uniformly at random.
    pub(crate) fn sample_rows(&self, n: usize, rng: &mut StdRng) -> Vec<u32> {
        let live = self.live_indices();
        let n = n.min(live.len());
        rand::seq::index::sample(rng, live.len(), n).into_iter().map(|i| live[i]).collect()
    }

    /// Copies the given rows into a new, fully live store.
    pub(crate) fn gather(&self, indices: &[u32]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i as usize));
        }
        Self {
            data,
            cols: self.cols,
            removed: Tombstones::with_len(indices.len()),
        }
    }

    /// Bytes held by the row storage and the bitmap.
    pub(crate) fn used_memory(&self) -> usize {
        self.data.len() * core::mem::size_of::<E>() + self.removed.used_memory()
    }
}

/// One bit per logical row; set bits mark removed rows.
#[derive(Clone, Debug, Default)]
struct Tombstones {
    /// The packed bits.
    bits: Vec<u64>,
    /// The number of rows covered.
    len: usize,
    /// How many bits are set.
    count: usize,
}

impl Tombstones {
    /// An all-clear bitmap covering `len` rows.
    fn with_len(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(64)],
            len,
            count: 0,
        }
    }

    /// Whether bit `i` is set.
    fn get(&self, i: usize) -> bool {
        i < self.len && self.bits[i / 64] & (1 << (i % 64)) != 0
    }

    /// Sets bit `i`. Returns false if it was already set.
    fn set(&mut self, i: usize) -> bool {
        let (word, bit) = (i / 64, 1_u64 << (i % 64));
        if self.bits[word] & bit != 0 {
            return false;
        }
        self.bits[word] |= bit;
        self.count += 1;
        true
    }

    /// Extends coverage to `new_len` rows, the new bits all clear.
    fn grow(&mut self, new_len: usize) {
        self.len = new_len;
        self.bits.resize(new_len.div_ceil(64), 0);
    }

    /// How many bits are set.
    fn count(&self) -> usize {
        self.count
    }

    /// Bytes held by the packed bits.
    fn used_memory(&self) -> usize {
        self.bits.len() * core::mem::size_of::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn shape_validation() {
        assert!(PointStore::<f32>::from_flat(vec![1.0, 2.0, 3.0], 2).is_err());
        assert!(PointStore::<f32>::from_flat(vec![], 0).is_err());
        assert!(PointStore::<f32>::from_rows(vec![]).is_err());
        assert!(PointStore::from_rows(vec![vec![1.0_f32], vec![1.0, 2.0]]).is_err());

        let store = PointStore::from_flat(vec![1.0_f32, 2.0, 3.0, 4.0], 2).map_err(|e| e.to_string());
        assert!(store.is_ok_and(|s| s.rows() == 2 && s.cols() == 2));
    }

    #[test]
    fn append_keeps_existing_indices() -> Result<()> {
        let mut store = PointStore::from_rows(vec![vec![1_i32, 2], vec![3, 4]])?;
        let range = store.append_flat(&[5, 6, 7, 8])?;
        assert_eq!(range, 2..4);
        assert_eq!(store.row(0), &[1, 2]);
        assert_eq!(store.row(3), &[7, 8]);
        assert_eq!(store.rows(), 4);
        Ok(())
    }

    #[test]
    fn remove_and_compact() -> Result<()> {
        let mut store = PointStore::from_rows(vec![vec![0_i32], vec![1], vec![2], vec![3]])?;
        store.remove(1)?;
        store.remove(3)?;
        assert!(store.remove(1).is_err());
        assert_eq!(store.live_rows(), 2);
        assert!(store.is_removed(1));
        assert_eq!(store.live_indices(), vec![0, 2]);

        store.compact();
        assert_eq!(store.rows(), 2);
        assert_eq!(store.live_rows(), 2);
        assert_eq!(store.row(0), &[0]);
        assert_eq!(store.row(1), &[2]);
        Ok(())
    }

    #[test]
    fn sampling_skips_removed_rows() -> Result<()> {
        let mut store = PointStore::from_rows((0..50).map(|i| vec![i]).collect::<Vec<Vec<i32>>>())?;
        for i in 0..25 {
            store.remove(2 * i + 1)?;
        }
        let mut rng = StdRng::seed_from_u64(42);
        let sample = store.sample_rows(10, &mut rng);
        assert_eq!(sample.len(), 10);
        assert!(sample.iter().all(|&i| i % 2 == 0));
        Ok(())
    }
}
