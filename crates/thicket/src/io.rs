//! Index snapshots: a fixed header followed by an LZ4-compressed payload.
//!
//! The header pins the file type, format version, element type, algorithm,
//! and dataset shape; the payload is the `bincode` encoding of the build
//! parameters, the metric identity, and the structure arenas. Only row and
//! arena indices are written, never pointers and never row data, so loading
//! a snapshot requires presenting the dataset it was built on.

use std::io::Write;
use std::path::Path;

use proximity::{Element, Metric, Number};
use serde::{de::DeserializeOwned, Serialize};

use crate::{index::Structure, params::IndexParams, store::PointStore, Error, Result};

/// The 24-byte file signature.
const MAGIC: [u8; 24] = *b"THICKET.NEIGHBOR.INDEX.1";

/// The 16-byte format version, NUL-padded ASCII.
const VERSION: [u8; 16] = *b"0.1.0\0\0\0\0\0\0\0\0\0\0\0";

/// Header length in bytes: magic, version, two u32 tags, four u64 fields.
const HEADER_LEN: usize = 24 + 16 + 4 + 4 + 8 + 8 + 8 + 8;

/// Compression codes for the header.
const COMPRESSION_LZ4: u64 = 1;

/// Writes a snapshot of `structure` to `path`.
pub(crate) fn save<E, D, M>(path: &Path, store: &PointStore<E>, metric: &M, params: &IndexParams, structure: &Structure<E, D>) -> Result<()>
where
    E: Element + Serialize,
    D: Number + Serialize,
    M: Metric<E, D>,
{
    let algorithm = structure.algorithm_code()?;
    let payload = bincode::serialize(&(params, metric.kind().code(), metric.order(), structure))
        .map_err(|e| Error::Serialization(format!("payload encoding failed: {e}")))?;
    let compressed = lz4_flex::compress(&payload);

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&MAGIC);
    header.extend_from_slice(&VERSION);
    header.extend_from_slice(&E::DATA_TYPE.code().to_le_bytes());
    header.extend_from_slice(&algorithm.to_le_bytes());
    header.extend_from_slice(&(store.rows() as u64).to_le_bytes());
    header.extend_from_slice(&(store.cols() as u64).to_le_bytes());
    header.extend_from_slice(&COMPRESSION_LZ4.to_le_bytes());
    header.extend_from_slice(&(payload.len() as u64).to_le_bytes());

    let mut file = std::fs::File::create(path)?;
    file.write_all(&header)?;
    file.write_all(&compressed)?;
    Ok(())
}

/// Reads a snapshot from `path`, validating it against the presented dataset
/// and metric.
pub(crate) fn load<E, D, M>(path: &Path, store: &PointStore<E>, metric: &M) -> Result<(IndexParams, Structure<E, D>)>
where
    E: Element + DeserializeOwned,
    D: Number + DeserializeOwned,
    M: Metric<E, D>,
{
    let bytes = std::fs::read(path)?;
    if bytes.len() < HEADER_LEN {
        return Err(Error::Serialization("snapshot is shorter than its header".to_string()));
    }

    let mut cursor = Reader { bytes: &bytes, at: 0 };
    if cursor.take(24) != MAGIC {
        return Err(Error::Serialization("bad magic: not an index snapshot".to_string()));
    }
    if cursor.take(16) != VERSION {
        return Err(Error::Serialization("unsupported snapshot version".to_string()));
    }
    let data_type = cursor.u32()?;
    let algorithm = cursor.u32()?;
    let rows = cursor.u64()?;
    let cols = cursor.u64()?;
    let compression = cursor.u64()?;
    let uncompressed_size = cursor.u64()?;

    if data_type != E::DATA_TYPE.code() {
        return Err(Error::Serialization(format!(
            "snapshot element type {data_type} does not match the dataset's {}",
            E::DATA_TYPE.code()
        )));
    }
    if rows != store.rows() as u64 || cols != store.cols() as u64 {
        return Err(Error::Serialization(format!(
            "snapshot shape {rows}x{cols} does not match the presented dataset {}x{}",
            store.rows(),
            store.cols()
        )));
    }

    let body = &bytes[HEADER_LEN..];
    let payload = match compression {
        0 => body.to_vec(),
        COMPRESSION_LZ4 => {
            let size = usize::try_from(uncompressed_size).map_err(|_| Error::Serialization("payload size overflows".to_string()))?;
            lz4_flex::decompress(body, size).map_err(|e| Error::Serialization(format!("LZ4 decompression failed: {e}")))?
        }
        other => return Err(Error::Serialization(format!("unknown compression code {other}"))),
    };

    let (params, metric_kind, metric_order, structure): (IndexParams, u32, f64, Structure<E, D>) =
        bincode::deserialize(&payload).map_err(|e| Error::Serialization(format!("payload decoding failed: {e}")))?;

    if metric_kind != metric.kind().code() {
        return Err(Error::Serialization(format!(
            "snapshot was built with metric code {metric_kind}, not {}",
            metric.kind().code()
        )));
    }
    if metric_order.to_bits() != metric.order().to_bits() {
        return Err(Error::Serialization(
            "snapshot was built with a different Minkowski order".to_string(),
        ));
    }
    if structure.algorithm_code()? != algorithm {
        return Err(Error::Serialization("header and payload disagree on the algorithm".to_string()));
    }

    Ok((params, structure))
}

/// A bounds-checked little-endian reader over the header bytes.
struct Reader<'a> {
    /// The whole file.
    bytes: &'a [u8],
    /// The read position.
    at: usize,
}

impl<'a> Reader<'a> {
    /// Takes `n` raw bytes. Only called within the already-validated header
    /// length.
    fn take(&mut self, n: usize) -> &'a [u8] {
        let slice = &self.bytes[self.at..self.at + n];
        self.at += n;
        slice
    }

    /// Reads a little-endian `u32`.
    fn u32(&mut self) -> Result<u32> {
        let raw: [u8; 4] = self
            .take(4)
            .try_into()
            .map_err(|_| Error::Serialization("truncated header".to_string()))?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Reads a little-endian `u64`.
    fn u64(&mut self) -> Result<u64> {
        let raw: [u8; 8] = self
            .take(8)
            .try_into()
            .map_err(|_| Error::Serialization("truncated header".to_string()))?;
        Ok(u64::from_le_bytes(raw))
    }
}
