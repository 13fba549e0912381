//! # Scale factors
//!
//! The scale factor `α` is the multiplicative constant applied to a model's fluxes
//! to best match an observed source.
//!
//! ## Closed form
//! -----------------
//! Without non-detections the normal chi-square is a parabola in `α`, minimized by
//!
//! ```text
//! α = Σ(F_model·F_source/σ²) / Σ(F_model²/σ²)
//! ```
//!
//! where bands with a negative (or zero) source flux are dropped from the numerator
//! so that noise cannot flip the sign of the model, and missing bands are skipped
//! entirely when the missing-data policy is active.
//!
//! ## Bounded search
//! -----------------
//! With at least one non-detection there is no closed form. [`search`] walks the
//! chi-square from the closed-form start with a sign-adaptive, step-halving scheme:
//!
//! 0. measure the slope at the start to pick the initial direction,
//! 1. take a step; undo and halve it if `α` would become negative or the chi-square grows,
//! 2. measure the slope with a small forward difference,
//! 3. reverse and halve the step when the slope says the minimum was overshot,
//! 4. stop when the step falls under the accuracy threshold, when the slope is flat,
//!    or when the iteration cap is hit.
//!
//! The outcome is reported as a [`ScaleFactor`], whose `converged` flag tells the
//! caller whether the cap was exhausted. The value returned is the best one met.
//!
//! ## Sampling
//! -----------------
//! Optionally the likelihood is also sampled along `α` around the optimum, over
//! `[α − k·σ_α, α + k·σ_α]` with `σ_α = 1/sqrt(Σ F_model²/σ²)` (see
//! [`ScaleFactorSampling`]). The samples give a mean scale factor, see
//! [`mean_scale_factor`].
use serde::{Deserialize, Serialize};

use super::residual::variance;
use crate::constants::{
    DEFAULT_SCALE_FACTOR_ACCURACY, DEFAULT_SCALE_FACTOR_MAX_ITER, DEFAULT_SCALE_FACTOR_SAMPLES,
    DEFAULT_SCALE_FACTOR_SAMPLE_RANGE, SCALE_FACTOR_DERIVATIVE_RATIO, SCALE_FACTOR_FALLBACK_STEP,
};
use crate::photometry::Photometry;

/// Outcome of a scale-factor computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactor {
    pub value: f64,
    /// False when the search stopped on its iteration cap.
    pub converged: bool,
    /// Search iterations spent (0 for the closed form).
    pub iterations: usize,
}

impl ScaleFactor {
    pub fn closed_form(value: f64) -> Self {
        Self {
            value,
            converged: true,
            iterations: 0,
        }
    }
}

/// Tuning of the bounded scale-factor search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactorSearch {
    /// Relative accuracy on `α` (absolute when the start value is 0).
    pub accuracy: f64,
    pub max_iter: usize,
}

impl Default for ScaleFactorSearch {
    fn default() -> Self {
        Self {
            accuracy: DEFAULT_SCALE_FACTOR_ACCURACY,
            max_iter: DEFAULT_SCALE_FACTOR_MAX_ITER,
        }
    }
}

/// Layout of the likelihood samples taken along the scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactorSampling {
    /// Number of samples, at least 3.
    pub samples: usize,
    /// Half-width of the sampled interval, in units of `σ_α`.
    pub range_in_sigma: f64,
}

impl Default for ScaleFactorSampling {
    fn default() -> Self {
        Self {
            samples: DEFAULT_SCALE_FACTOR_SAMPLES,
            range_in_sigma: DEFAULT_SCALE_FACTOR_SAMPLE_RANGE,
        }
    }
}

impl ScaleFactorSampling {
    /// Sample positions around `alpha` for a scale-factor uncertainty `sigma`.
    pub fn points(&self, alpha: f64, sigma: f64) -> Vec<f64> {
        sample_points(alpha, sigma * self.range_in_sigma, self.samples)
    }
}

/// `n` evenly spaced values covering `[center − half_width, center + half_width]`.
///
/// The first and last samples are the interval bounds; a single sample sits on
/// `center`.
pub fn sample_points(center: f64, half_width: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![center],
        _ => {
            let step = 2.0 * half_width / (n - 1) as f64;
            (0..n)
                .map(|i| center - half_width + step * i as f64)
                .collect()
        }
    }
}

/// Uncertainty of the closed-form scale factor, `1/sqrt(Σ F_model²/σ²)`.
///
/// Bands flagged missing in the source carry no information and are skipped.
/// Non-detections are kept, with their limit error.
///
/// Return
/// ----------
/// * `σ_α`, or 0 when no band constrains the scale factor.
pub fn sigma_scale_factor(source: &Photometry, model: &Photometry) -> f64 {
    let weight: f64 = source
        .values()
        .iter()
        .zip(model.values())
        .filter(|(s, _)| !s.missing)
        .map(|(s, m)| m.flux * m.flux / variance(s.error))
        .sum();
    if weight > 0.0 && weight.is_finite() {
        1.0 / weight.sqrt()
    } else {
        0.0
    }
}

/// Likelihood-weighted mean of the sampled scale factors.
///
/// `logs` are the log-likelihoods (or log-posteriors, any constant shift cancels)
/// at `points`. They are turned into weights `exp(log − max)` and the mean is the
/// ratio of the trapezoid integrals of `α·w` and `w` over the samples.
///
/// Return
/// ----------
/// * `None` when no sample carries weight (all logs `-inf` or NaN) or the inputs
///   do not line up.
pub fn mean_scale_factor(points: &[f64], logs: &[f64]) -> Option<f64> {
    if points.len() != logs.len() || points.is_empty() {
        return None;
    }
    let max = logs
        .iter()
        .copied()
        .filter(|l| !l.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return None;
    }
    let last = points.len() - 1;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, (a, l)) in points.iter().zip(logs).enumerate() {
        // evenly spaced knots: the trapezoid halves the end points
        let edge = if last > 0 && (i == 0 || i == last) { 0.5 } else { 1.0 };
        let w = if l.is_nan() { 0.0 } else { edge * (l - max).exp() };
        num += a * w;
        den += w;
    }
    (den > 0.0).then(|| num / den)
}

/// Closed-form chi-square minimizing scale factor.
///
/// Arguments
/// -----------------
/// * `source` – observed photometry.
/// * `model` – model photometry, same filters and order.
/// * `skip_missing` – ignore bands flagged missing in the source.
///
/// Return
/// ----------
/// * The scale factor, 0 when no band constrains it.
pub fn closed_form(source: &Photometry, model: &Photometry, skip_missing: bool) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for (s, m) in source.values().iter().zip(model.values()) {
        if skip_missing && s.missing {
            continue;
        }
        let var = variance(s.error);
        if s.flux > 0.0 {
            num += m.flux * s.flux / var;
        }
        den += m.flux * m.flux / var;
    }
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Minimize `chi(α)` over `α ≥ 0` starting from `start`.
///
/// Arguments
/// -----------------
/// * `chi` – the chi-square as a function of the scale factor.
/// * `start` – first guess, usually the closed-form value.
/// * `params` – accuracy and iteration cap.
///
/// Return
/// ----------
/// * A [`ScaleFactor`] holding the lowest chi-square point met. `converged` is false
///   when `params.max_iter` iterations were spent without meeting a stop condition.
///
/// See also
/// ------------
/// * [`closed_form`] – the start value used by the likelihood family.
pub fn search(chi: impl Fn(f64) -> f64, start: f64, params: &ScaleFactorSearch) -> ScaleFactor {
    let (mut a, mut step, threshold) = if start > 0.0 && start.is_finite() {
        (start, start, params.accuracy * start)
    } else {
        (0.0, SCALE_FACTOR_FALLBACK_STEP, params.accuracy)
    };
    let der_step = threshold * SCALE_FACTOR_DERIVATIVE_RATIO;
    let mut chi_a = chi(a);
    // the closed-form start may sit on either side of the minimum
    let mut dir_right = chi(a + der_step) - chi_a <= 0.0;
    if !dir_right {
        step = -step;
    }
    let mut iterations = 0;
    let mut converged = false;

    while iterations < params.max_iter {
        if step.abs() <= threshold {
            converged = true;
            break;
        }
        iterations += 1;

        a += step;
        if a < 0.0 {
            a -= step;
            step *= 0.5;
            continue;
        }
        let next = chi(a);
        if next > chi_a {
            a -= step;
            step *= 0.5;
            continue;
        }
        chi_a = next;

        let d_chi = chi(a + der_step) - chi_a;
        if d_chi.abs() <= f64::EPSILON * chi_a.abs() {
            // flat: settle between the last two points if it is not worse
            let mid = a - step / 2.0;
            if mid >= 0.0 && chi(mid) <= chi_a {
                a = mid;
            }
            converged = true;
            break;
        }
        if (dir_right && d_chi > 0.0) || (!dir_right && d_chi < 0.0) {
            dir_right = !dir_right;
            step *= -0.5;
        }
    }
    if !converged && step.abs() <= threshold {
        converged = true;
    }

    ScaleFactor {
        value: a.max(0.0),
        converged,
        iterations,
    }
}

#[cfg(test)]
mod scale_factor_test {
    use super::*;
    use crate::photometry::FluxErrorPair;
    use approx::assert_relative_eq;

    fn phot(values: &[(f64, f64)]) -> Photometry {
        Photometry::from_pairs(
            &["a", "b", "c"][..values.len()],
            values.iter().map(|(f, e)| FluxErrorPair::new(*f, *e)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn closed_form_recovers_exact_scaling() {
        let model = phot(&[(1.0, 0.0), (2.0, 0.0), (3.0, 0.0)]);
        let source = phot(&[(2.5, 0.1), (5.0, 0.2), (7.5, 0.3)]);
        assert_relative_eq!(closed_form(&source, &model, false), 2.5, epsilon = 1e-12);
    }

    #[test]
    fn negative_source_flux_is_dropped_from_numerator() {
        let model = phot(&[(1.0, 0.0), (1.0, 0.0)]);
        let source = phot(&[(2.0, 1.0), (-2.0, 1.0)]);
        // numerator 2, denominator 2
        assert_relative_eq!(closed_form(&source, &model, false), 1.0);
    }

    #[test]
    fn missing_bands_are_skipped_when_requested() {
        let model = phot(&[(1.0, 0.0), (1.0, 0.0)]);
        let mut source = phot(&[(2.0, 1.0), (8.0, 1.0)]);
        source.values_mut()[1].missing = true;
        assert_relative_eq!(closed_form(&source, &model, true), 2.0);
        assert_relative_eq!(closed_form(&source, &model, false), 5.0);
    }

    #[test]
    fn search_finds_parabola_minimum() {
        let params = ScaleFactorSearch::default();
        let sf = search(|a| (a - 3.7) * (a - 3.7), 1.0, &params);
        assert!(sf.converged);
        assert_relative_eq!(sf.value, 3.7, epsilon = 5e-4);
    }

    #[test]
    fn search_stays_non_negative() {
        let params = ScaleFactorSearch::default();
        let sf = search(|a| (a + 2.0) * (a + 2.0), 1.0, &params);
        assert!(sf.value >= 0.0);
        assert!(sf.value < 1e-3);
    }

    #[test]
    fn exhausted_cap_is_reported() {
        let params = ScaleFactorSearch {
            accuracy: 1e-12,
            max_iter: 3,
        };
        let sf = search(|a| (a - 50.0).powi(2), 1.0, &params);
        assert!(!sf.converged);
        assert_eq!(sf.iterations, 3);
        // still the best point met so far
        assert!(sf.value > 1.0);
    }

    #[test]
    fn sigma_uses_every_constraining_band() {
        let model = phot(&[(2.0, 0.0), (11.0, 0.0)]);
        let mut source = phot(&[(1.0, 0.5), (1.0, 0.7)]);
        assert_relative_eq!(sigma_scale_factor(&source, &model), 0.06166982, epsilon = 1e-8);
        source.values_mut()[0].missing = true;
        assert_relative_eq!(sigma_scale_factor(&source, &model), 0.7 / 11.0, epsilon = 1e-12);
        source.values_mut()[1].missing = true;
        assert_eq!(sigma_scale_factor(&source, &model), 0.0);
    }

    #[test]
    fn samples_span_the_interval() {
        let points = sample_points(1.0, 0.5, 11);
        assert_eq!(points.len(), 11);
        assert_relative_eq!(points[0], 0.5);
        assert_relative_eq!(points[1], 0.6);
        assert_relative_eq!(points[5], 1.0);
        assert_relative_eq!(points[10], 1.5);
        assert_eq!(sample_points(2.0, 0.5, 1), vec![2.0]);

        let sampling = ScaleFactorSampling {
            samples: 5,
            range_in_sigma: 2.0,
        };
        assert_eq!(sampling.points(3.0, 0.25), vec![2.5, 2.75, 3.0, 3.25, 3.5]);
    }

    #[test]
    fn symmetric_likelihood_has_its_mean_at_the_center() {
        let points = sample_points(4.0, 1.5, 101);
        let logs: Vec<f64> = points.iter().map(|a| -0.5 * ((a - 4.0) / 0.3).powi(2)).collect();
        assert_relative_eq!(mean_scale_factor(&points, &logs).unwrap(), 4.0, epsilon = 1e-12);

        // a constant shift of the logs does not move the mean
        let shifted: Vec<f64> = logs.iter().map(|l| l - 700.0).collect();
        assert_relative_eq!(mean_scale_factor(&points, &shifted).unwrap(), 4.0, epsilon = 1e-12);

        // a skewed likelihood pulls it towards the heavy side
        let skewed: Vec<f64> = points.iter().map(|a| 2.0 * a).collect();
        assert!(mean_scale_factor(&points, &skewed).unwrap() > 4.0);

        assert_eq!(mean_scale_factor(&points, &vec![f64::NEG_INFINITY; 101]), None);
        assert_eq!(mean_scale_factor(&points[..3], &logs), None);
    }
}
