//! Distance metrics for nearest-neighbor search.
//!
//! This crate provides the numeric plumbing and distance computations used by
//! the index structures in the `thicket` crate:
//!
//! - [`Number`], [`Float`] and [`Element`]: blanket traits over the primitive
//!   numeric types, in the flavor of `num_traits`.
//! - [`vectors`] and [`bits`]: plain distance functions over slices.
//! - [`Metric`]: the capability object an index is keyed on. It computes full
//!   distances with an optional early-termination cutoff and, for metrics
//!   that decompose as a sum over coordinates, single-coordinate partial
//!   distances usable for bounding-box pruning.

pub mod bits;
pub mod vectors;

mod metric;
mod number;

pub use metric::{ChiSquared, Euclidean, Hamming, Hellinger, KullbackLeibler, Manhattan, Metric, MetricKind, Minkowski};
pub use number::{DataType, Element, Float, Number};
