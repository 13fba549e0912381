//! Per-band chi-square residuals.
//!
//! Each function returns the contribution of a single band to the chi-square of a
//! source/model pair for a trial scale factor `alpha`. Numerical degeneracies are
//! recovered here and never surfaced:
//!
//! * a zero flux error makes the variance [`MIN_POSITIVE`],
//! * a non-detection probability that underflows to zero is clamped to
//!   [`SATURATED_RESIDUAL`].
use std::f64::consts::SQRT_2;

use statrs::function::erf::erf;

use crate::constants::{MIN_POSITIVE, SATURATED_RESIDUAL};
use crate::photometry::FluxErrorPair;

#[inline]
pub(crate) fn variance(error: f64) -> f64 {
    if error != 0.0 {
        error * error
    } else {
        MIN_POSITIVE
    }
}

#[inline]
fn non_zero(error: f64) -> f64 {
    if error != 0.0 {
        error
    } else {
        MIN_POSITIVE
    }
}

/// `((alpha·F_model − F_source) / σ_source)²`.
#[inline]
pub fn normal_residual(source: &FluxErrorPair, model_flux: f64, alpha: f64) -> f64 {
    let diff = alpha * model_flux - source.flux;
    (diff * diff) / variance(source.error)
}

/// Non-detection residual: `−2·ln[½(1 + erf((F_source − alpha·F_model)/(√2·σ)))]`.
///
/// The probability that a model of flux `alpha·F_model` stays below the detection
/// limit `F_source`. When the error function saturates at −1 the residual is clamped
/// to [`SATURATED_RESIDUAL`].
#[inline]
pub fn upper_limit_residual(source: &FluxErrorPair, model_flux: f64, alpha: f64) -> f64 {
    let err = non_zero(source.error);
    let e = erf((source.flux - alpha * model_flux) / (SQRT_2 * err));
    if e <= -1.0 {
        SATURATED_RESIDUAL
    } else {
        let p = 0.5 * (1.0 + e);
        if p > 0.0 {
            -2.0 * p.ln()
        } else {
            SATURATED_RESIDUAL
        }
    }
}

/// Step approximation of [`upper_limit_residual`]: 0 below the limit, saturated above.
#[inline]
pub fn upper_limit_fast_residual(source: &FluxErrorPair, model_flux: f64, alpha: f64) -> f64 {
    if alpha * model_flux <= source.flux {
        0.0
    } else {
        SATURATED_RESIDUAL
    }
}
