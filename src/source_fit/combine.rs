//! Combination of per-region 1-D distributions into one curve per axis.
//!
//! Each region's curve lives on the scale of its own normalization log. Curves are
//! brought to a common scale with [`region_weights`], merged on the union of their
//! knots and finally renormalized (or restored to the absolute likelihood scale).
use itertools::Itertools;

use crate::phz_errors::PhzError;
use crate::region_fit::marginalization::Pdf1D;
use crate::source_fit::modifiers::nearest_z_index;

/// Relative weights of regions given their normalization logs.
///
/// The reference is the largest finite normalization log: its region gets weight
/// exactly 1 and every other region `exp(norm − reference) ≤ 1`. Regions with a
/// non-finite normalization log (no cell, or no finite likelihood) get 0.
///
/// Return
/// ----------
/// * `(reference, weights)`, with `reference = −∞` when no region is finite.
pub fn region_weights(normalization_logs: &[f64]) -> (f64, Vec<f64>) {
    let reference = normalization_logs
        .iter()
        .copied()
        .filter(|n| n.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    let weights = normalization_logs
        .iter()
        .map(|n| {
            if n.is_finite() {
                (n - reference).exp()
            } else {
                0.0
            }
        })
        .collect();
    (reference, weights)
}

/// Linear interpolation of a numeric curve at `at`, 0 outside its knots.
fn interpolate(x: &[f64], y: &[f64], at: f64) -> f64 {
    match x.len() {
        0 => 0.0,
        1 => {
            if at == x[0] {
                y[0]
            } else {
                0.0
            }
        }
        n => {
            if at < x[0] || at > x[n - 1] {
                return 0.0;
            }
            let hi = x.partition_point(|v| *v < at);
            if hi == 0 || x[hi] == at {
                return y[hi];
            }
            let lo = hi - 1;
            let t = (at - x[lo]) / (x[hi] - x[lo]);
            y[lo] + t * (y[hi] - y[lo])
        }
    }
}

/// Weighted sum of curves defined over the same axis.
///
/// Numeric curves are evaluated on the sorted union of every knot; categorical
/// curves are summed per label, labels kept in first-seen order.
///
/// Return
/// ----------
/// * `Ok(None)` when `curves` is empty.
/// * `Err(PhzError::InvalidAxis)` when numeric and categorical curves are mixed.
pub fn combine_pdfs(curves: &[(&Pdf1D, f64)]) -> Result<Option<Pdf1D>, PhzError> {
    let Some((first, _)) = curves.first() else {
        return Ok(None);
    };
    let mixed = || PhzError::InvalidAxis("cannot combine numeric and categorical curves".into());

    match first {
        Pdf1D::Numeric { .. } => {
            let mut knots = Vec::with_capacity(curves.len());
            for (pdf, _) in curves {
                match pdf {
                    Pdf1D::Numeric { x, .. } => knots.push(x.iter().copied()),
                    Pdf1D::Categorical { .. } => return Err(mixed()),
                }
            }
            let x: Vec<f64> = knots
                .into_iter()
                .kmerge_by(|a, b| a < b)
                .dedup()
                .collect();
            let y = x
                .iter()
                .map(|at| {
                    curves
                        .iter()
                        .map(|(pdf, w)| match pdf {
                            Pdf1D::Numeric { x, y } => w * interpolate(x, y, *at),
                            Pdf1D::Categorical { .. } => 0.0,
                        })
                        .sum()
                })
                .collect();
            Ok(Some(Pdf1D::Numeric { x, y }))
        }
        Pdf1D::Categorical { .. } => {
            let mut labels: Vec<String> = Vec::new();
            let mut y: Vec<f64> = Vec::new();
            for (pdf, w) in curves {
                let Pdf1D::Categorical {
                    labels: pdf_labels,
                    y: pdf_y,
                } = pdf
                else {
                    return Err(mixed());
                };
                for (label, v) in pdf_labels.iter().zip(pdf_y) {
                    match labels.iter().position(|l| l == label) {
                        Some(i) => y[i] += w * v,
                        None => {
                            labels.push(label.clone());
                            y.push(w * v);
                        }
                    }
                }
            }
            Ok(Some(Pdf1D::Categorical { labels, y }))
        }
    }
}

/// Scale `pdf` to unit mass.
///
/// Numeric curves use their trapezoid integral, or their sum for a single knot;
/// categorical curves their sum. A curve of zero or non-finite mass is left as is.
pub fn normalize_pdf(pdf: &mut Pdf1D) {
    let mass = pdf.integral();
    if mass > 0.0 && mass.is_finite() {
        pdf.scale(1.0 / mass);
    }
}

/// Re-expand a single-knot redshift curve onto the full model axis `z_axis`.
///
/// The node nearest the knot gets 1, every other node 0.
pub(crate) fn expand_point_pdf(pdf: &Pdf1D, z_axis: &[f64], normalize: bool) -> Pdf1D {
    let mut y = vec![0.0; z_axis.len()];
    if let (Pdf1D::Numeric { x, .. }, false) = (pdf, z_axis.is_empty()) {
        if let Some(knot) = x.first() {
            y[nearest_z_index(z_axis, *knot)] = 1.0;
        }
    }
    let mut expanded = Pdf1D::Numeric {
        x: z_axis.to_vec(),
        y,
    };
    if normalize {
        normalize_pdf(&mut expanded);
    }
    expanded
}
