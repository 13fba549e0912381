//! # Constants and type definitions for phzfit
//!
//! This module centralizes the **numerical constants** and **common type
//! definitions** shared by the grid, likelihood, fitting and calibration layers.
//!
//! ## Overview
//!
//! - Numerical floors used to keep chi-square terms finite
//! - Default tolerances of the scale-factor search
//! - Core type aliases (source identifiers, region maps, correction maps)

use std::collections::BTreeMap;

// -------------------------------------------------------------------------------------------------
// Numerical constants
// -------------------------------------------------------------------------------------------------

/// Smallest positive normal double, substituted for a zero flux error.
pub const MIN_POSITIVE: f64 = f64::MIN_POSITIVE;

/// Residual assigned to a non-detection whose probability underflows to zero.
///
/// Equal to `-2·ln(MIN_POSITIVE)` (≈ 1416.79).
pub const SATURATED_RESIDUAL: f64 = 1416.7928370645282;

/// Default relative accuracy of the scale-factor step-halving search.
pub const DEFAULT_SCALE_FACTOR_ACCURACY: f64 = 1e-5;

/// Default iteration cap of the scale-factor step-halving search.
pub const DEFAULT_SCALE_FACTOR_MAX_ITER: usize = 1000;

/// Initial absolute step of the scale-factor search when no positive closed-form start exists.
pub const SCALE_FACTOR_FALLBACK_STEP: f64 = 10.0;

/// Ratio between the finite-difference step and the accuracy threshold of the search.
pub const SCALE_FACTOR_DERIVATIVE_RATIO: f64 = 10.0;

/// Default number of likelihood samples taken along the scale factor.
pub const DEFAULT_SCALE_FACTOR_SAMPLES: usize = 101;

/// Default half-width of the scale-factor sampling interval, in units of its sigma.
pub const DEFAULT_SCALE_FACTOR_SAMPLE_RANGE: f64 = 5.0;

/// Default number of sources pulled from a catalog reader per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 5000;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Catalog identifier of a source.
pub type SourceId = i64;

/// Named parameter-space regions, iterated in lexicographic name order.
pub type RegionMap<T> = BTreeMap<String, T>;

/// Filter name → multiplicative zero-point correction.
pub type PhotometricCorrectionMap = BTreeMap<String, f64>;
