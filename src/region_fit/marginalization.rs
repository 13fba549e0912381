//! Collapsing a posterior grid onto a single axis.
//!
//! Every [`Marginalization`] reduces the cells sharing one coordinate on the target
//! axis to a single value, producing a [`Pdf1D`]. The sum and interpolated variants
//! are both weighted sums: the interpolated one weights each knot of the other
//! numeric axes with its trapezoid share, so the result equals the nested trapezoid
//! integral without materialising intermediate grids.
use serde::{Deserialize, Serialize};

use crate::grid::{AxisRef, DoubleGrid, ModelParameter};

/// Reduction used to build a 1-D distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Marginalization {
    /// Sum of the cells.
    Sum,
    /// Profile: maximum over the other axes.
    Max,
    /// Trapezoid integral over the other numeric axes, sum over the categorical ones.
    Interpolated,
}

/// A one-dimensional distribution over a grid axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pdf1D {
    Numeric { x: Vec<f64>, y: Vec<f64> },
    Categorical { labels: Vec<String>, y: Vec<f64> },
}

impl Pdf1D {
    #[inline]
    pub fn y(&self) -> &[f64] {
        match self {
            Pdf1D::Numeric { y, .. } | Pdf1D::Categorical { y, .. } => y,
        }
    }

    #[inline]
    pub fn y_mut(&mut self) -> &mut [f64] {
        match self {
            Pdf1D::Numeric { y, .. } | Pdf1D::Categorical { y, .. } => y,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.y().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.y().is_empty()
    }

    /// Position of the highest value (first one on ties).
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, v) in self.y().iter().enumerate() {
            if best.is_none_or(|(_, b)| *v > b) {
                best = Some((i, *v));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Area under the curve.
    ///
    /// Trapezoid integral for numeric curves with at least two knots, plain sum
    /// otherwise.
    pub fn integral(&self) -> f64 {
        match self {
            Pdf1D::Numeric { x, y } if x.len() > 1 => trapezoid_weights(x)
                .iter()
                .zip(y)
                .map(|(w, v)| w * v)
                .sum(),
            _ => self.y().iter().sum(),
        }
    }

    pub fn scale(&mut self, factor: f64) {
        self.y_mut().iter_mut().for_each(|v| *v *= factor);
    }
}

/// Trapezoid quadrature weights of the knots `x`.
///
/// A single knot gets weight 1, so that integrating over it returns its value.
pub(crate) fn trapezoid_weights(x: &[f64]) -> Vec<f64> {
    match x.len() {
        0 => Vec::new(),
        1 => vec![1.0],
        n => (0..n)
            .map(|i| {
                let left = if i > 0 { x[i] - x[i - 1] } else { 0.0 };
                let right = if i + 1 < n { x[i + 1] - x[i] } else { 0.0 };
                0.5 * (left + right)
            })
            .collect(),
    }
}

impl Marginalization {
    /// Collapse `grid` onto `axis`.
    ///
    /// Arguments
    /// -----------------
    /// * `grid` – the (posterior) grid.
    /// * `axis` – the axis kept in the output.
    ///
    /// Return
    /// ----------
    /// * A [`Pdf1D`] with one value per knot of `axis`, numeric or categorical like
    ///   the axis itself.
    pub fn marginalize(self, grid: &DoubleGrid, axis: ModelParameter) -> Pdf1D {
        let target = axis.index();
        let n = grid.axes().len_of(axis);

        let y = match self {
            Marginalization::Max => {
                let mut y = vec![f64::NEG_INFINITY; n];
                for (coords, v) in grid.iter() {
                    let slot = &mut y[coords[target]];
                    if *v > *slot {
                        *slot = *v;
                    }
                }
                y.iter_mut()
                    .filter(|v| **v == f64::NEG_INFINITY)
                    .for_each(|v| *v = 0.0);
                y
            }
            Marginalization::Sum | Marginalization::Interpolated => {
                let weights: Vec<Vec<f64>> = ModelParameter::ALL
                    .iter()
                    .map(|p| match grid.axis(*p) {
                        AxisRef::Numeric(x)
                            if self == Marginalization::Interpolated && *p != axis =>
                        {
                            trapezoid_weights(x)
                        }
                        other => vec![1.0; other.len()],
                    })
                    .collect();
                let mut y = vec![0.0; n];
                for (coords, v) in grid.iter() {
                    let w: f64 = coords
                        .iter()
                        .zip(&weights)
                        .map(|(c, ws)| ws[*c])
                        .product();
                    y[coords[target]] += w * v;
                }
                y
            }
        };

        match grid.axis(axis) {
            AxisRef::Numeric(x) => Pdf1D::Numeric { x: x.to_vec(), y },
            AxisRef::Categorical(labels) => Pdf1D::Categorical {
                labels: labels.to_vec(),
                y,
            },
        }
    }
}
