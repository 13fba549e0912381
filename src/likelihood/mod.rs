//! # Likelihood family
//!
//! Pure functions computing, for one source/model pair, the scale factor and the
//! log-likelihood `−½·χ²`.
//!
//! ## Overview
//! -----------------
//! A member of the family is fixed by two policies:
//!
//! * **missing data** – when active, bands flagged missing contribute nothing to the
//!   chi-square nor to the scale factor;
//! * **non-detections** – disabled, *accurate* (error-function probability of staying
//!   under the limit) or *fast* (a step function with the same saturation value).
//!
//! The combinations are enumerated by [`LikelihoodFamily`] and resolved **once per
//! run** with [`LikelihoodFamily::for_catalog`], which only switches a policy on when
//! the catalog actually contains flagged bands. The all-off member keeps the closed
//! form scale factor and a branch-free residual loop.
//!
//! See also
//! ------------
//! * [`residual`] – per-band residuals.
//! * [`scale_factor`] – closed form and bounded search.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::photometry::{FluxErrorPair, Photometry, Source};

pub mod residual;
pub mod scale_factor;

use residual::{normal_residual, upper_limit_fast_residual, upper_limit_residual};
use scale_factor::{closed_form, search, ScaleFactor, ScaleFactorSearch};

/// Treatment of bands flagged as non-detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpperLimitPolicy {
    Disabled,
    Accurate,
    Fast,
}

/// Concrete likelihood strategy (missing-data × non-detection policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LikelihoodFamily {
    Normal,
    MissingData,
    UpperLimit,
    UpperLimitFast,
    MissingDataUpperLimit,
    MissingDataUpperLimitFast,
}

/// Result of evaluating one model against one source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelEvaluation {
    pub scale_factor: ScaleFactor,
    pub log_likelihood: f64,
}

impl LikelihoodFamily {
    pub const ALL: [LikelihoodFamily; 6] = [
        LikelihoodFamily::Normal,
        LikelihoodFamily::MissingData,
        LikelihoodFamily::UpperLimit,
        LikelihoodFamily::UpperLimitFast,
        LikelihoodFamily::MissingDataUpperLimit,
        LikelihoodFamily::MissingDataUpperLimitFast,
    ];

    pub fn new(missing_data: bool, upper_limit: UpperLimitPolicy) -> Self {
        use LikelihoodFamily::*;
        match (missing_data, upper_limit) {
            (false, UpperLimitPolicy::Disabled) => Normal,
            (true, UpperLimitPolicy::Disabled) => MissingData,
            (false, UpperLimitPolicy::Accurate) => UpperLimit,
            (false, UpperLimitPolicy::Fast) => UpperLimitFast,
            (true, UpperLimitPolicy::Accurate) => MissingDataUpperLimit,
            (true, UpperLimitPolicy::Fast) => MissingDataUpperLimitFast,
        }
    }

    /// Pick the cheapest member able to handle every flag present in `sources`.
    ///
    /// Arguments
    /// -----------------
    /// * `sources` – the catalog (or calibration sample) about to be processed.
    /// * `fast_upper_limit` – use the step approximation for non-detections.
    pub fn for_catalog<'a>(
        sources: impl IntoIterator<Item = &'a Source>,
        fast_upper_limit: bool,
    ) -> Self {
        let (mut missing, mut upper) = (false, false);
        for source in sources {
            missing |= source.photometry.has_missing();
            upper |= source.photometry.has_upper_limit();
            if missing && upper {
                break;
            }
        }
        let policy = match (upper, fast_upper_limit) {
            (false, _) => UpperLimitPolicy::Disabled,
            (true, false) => UpperLimitPolicy::Accurate,
            (true, true) => UpperLimitPolicy::Fast,
        };
        Self::new(missing, policy)
    }

    #[inline]
    pub fn handles_missing_data(self) -> bool {
        matches!(
            self,
            LikelihoodFamily::MissingData
                | LikelihoodFamily::MissingDataUpperLimit
                | LikelihoodFamily::MissingDataUpperLimitFast
        )
    }

    #[inline]
    pub fn upper_limit_policy(self) -> UpperLimitPolicy {
        match self {
            LikelihoodFamily::Normal | LikelihoodFamily::MissingData => UpperLimitPolicy::Disabled,
            LikelihoodFamily::UpperLimit | LikelihoodFamily::MissingDataUpperLimit => {
                UpperLimitPolicy::Accurate
            }
            LikelihoodFamily::UpperLimitFast | LikelihoodFamily::MissingDataUpperLimitFast => {
                UpperLimitPolicy::Fast
            }
        }
    }

    /// Chi-square contribution of a single band.
    #[inline]
    pub fn residual(self, source: &FluxErrorPair, model_flux: f64, alpha: f64) -> f64 {
        if source.missing && self.handles_missing_data() {
            return 0.0;
        }
        if source.upper_limit {
            match self.upper_limit_policy() {
                UpperLimitPolicy::Accurate => return upper_limit_residual(source, model_flux, alpha),
                UpperLimitPolicy::Fast => {
                    return upper_limit_fast_residual(source, model_flux, alpha)
                }
                UpperLimitPolicy::Disabled => {}
            }
        }
        normal_residual(source, model_flux, alpha)
    }

    /// Total chi-square of `model` scaled by `alpha` against `source`.
    pub fn chi_square(self, source: &Photometry, model: &Photometry, alpha: f64) -> f64 {
        source
            .values()
            .iter()
            .zip(model.values())
            .map(|(s, m)| self.residual(s, m.flux, alpha))
            .sum()
    }

    /// `−½·χ²`.
    #[inline]
    pub fn log_likelihood(self, source: &Photometry, model: &Photometry, alpha: f64) -> f64 {
        -0.5 * self.chi_square(source, model, alpha)
    }

    fn needs_search(self, source: &Photometry) -> bool {
        self.upper_limit_policy() != UpperLimitPolicy::Disabled
            && source
                .values()
                .iter()
                .any(|v| v.upper_limit && !(v.missing && self.handles_missing_data()))
    }

    /// Scale factor of `model` against `source`.
    ///
    /// The closed form is used unless a non-detection policy is active and the source
    /// has at least one non-detected band. In that case the bounded search starts from
    /// the closed-form value, or from 0 when the chi-square is already lower there.
    pub fn scale_factor(
        self,
        source: &Photometry,
        model: &Photometry,
        params: &ScaleFactorSearch,
    ) -> ScaleFactor {
        let start = closed_form(source, model, self.handles_missing_data());
        if !self.needs_search(source) {
            return ScaleFactor::closed_form(start);
        }
        let chi = |a: f64| self.chi_square(source, model, a);
        // the origin satisfies every upper limit
        let start = if chi(0.0) < chi(start) { 0.0 } else { start };
        search(chi, start, params)
    }

    /// Scale factor and log-likelihood in one pass.
    pub fn evaluate(
        self,
        source: &Photometry,
        model: &Photometry,
        params: &ScaleFactorSearch,
    ) -> ModelEvaluation {
        let scale_factor = self.scale_factor(source, model, params);
        ModelEvaluation {
            scale_factor,
            log_likelihood: self.log_likelihood(source, model, scale_factor.value),
        }
    }
}

impl fmt::Display for LikelihoodFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let missing = if self.handles_missing_data() {
            "missing-data"
        } else {
            "complete"
        };
        let upper = match self.upper_limit_policy() {
            UpperLimitPolicy::Disabled => "no upper limits",
            UpperLimitPolicy::Accurate => "accurate upper limits",
            UpperLimitPolicy::Fast => "fast upper limits",
        };
        write!(f, "{missing}, {upper}")
    }
}
