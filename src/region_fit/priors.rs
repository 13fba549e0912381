//! # Priors
//!
//! Reweighting strategies applied, in order, to the linear likelihood grid of one
//! region. Each prior multiplies the grid in place and must leave its shape intact;
//! the engine rejects a prior that does not.
//!
//! Built-ins
//! -----------------
//! * [`AxisFunctionPrior`] – `f(value)` of a numeric axis (e.g. a volume prior on z).
//! * [`AxisWeightPrior`] – per-name weight on a categorical axis (e.g. SED weights).
//! * [`GenericGridPrior`] – a region-keyed auxiliary weight grid.
//!
//! Any `Fn(&PriorContext, &mut DoubleGrid) -> Result<(), PhzError>` closure is a
//! [`Prior`] as well.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::constants::RegionMap;
use crate::grid::{
    check_region_compatibility, AxisRef, DoubleGrid, ModelParameter, PhotometryGrid,
};
use crate::photometry::Source;
use crate::phz_errors::PhzError;

/// Read-only inputs available to a prior.
#[derive(Debug, Clone, Copy)]
pub struct PriorContext<'a> {
    pub region: &'a str,
    pub source: &'a Source,
    pub model_grid: &'a PhotometryGrid,
    /// Linear likelihood before any prior, peak 1.
    pub likelihood: &'a DoubleGrid,
    pub scale_factor: &'a DoubleGrid,
}

pub trait Prior: Send + Sync {
    /// Reweight `posterior` in place.
    fn apply(&self, ctx: &PriorContext<'_>, posterior: &mut DoubleGrid) -> Result<(), PhzError>;

    /// Refuse a model layout this prior cannot be applied to.
    ///
    /// Called once before any source is fitted. Priors holding no auxiliary grid
    /// accept everything.
    fn check_compatibility(
        &self,
        _model_grids: &RegionMap<PhotometryGrid>,
    ) -> Result<(), PhzError> {
        Ok(())
    }
}

impl<F> Prior for F
where
    F: Fn(&PriorContext<'_>, &mut DoubleGrid) -> Result<(), PhzError> + Send + Sync,
{
    fn apply(&self, ctx: &PriorContext<'_>, posterior: &mut DoubleGrid) -> Result<(), PhzError> {
        self(ctx, posterior)
    }
}

/// Multiply every cell by `f(axis value)` on a numeric axis.
#[derive(Clone)]
pub struct AxisFunctionPrior {
    axis: ModelParameter,
    function: Arc<dyn Fn(f64) -> f64 + Send + Sync>,
}

impl AxisFunctionPrior {
    pub fn new(
        axis: ModelParameter,
        function: impl Fn(f64) -> f64 + Send + Sync + 'static,
    ) -> Result<Self, PhzError> {
        if !axis.is_numeric() {
            return Err(PhzError::InvalidAxis(format!(
                "a function prior needs a numeric axis, {axis} is categorical"
            )));
        }
        Ok(Self {
            axis,
            function: Arc::new(function),
        })
    }
}

impl fmt::Debug for AxisFunctionPrior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AxisFunctionPrior")
            .field("axis", &self.axis)
            .finish_non_exhaustive()
    }
}

impl Prior for AxisFunctionPrior {
    fn apply(&self, _ctx: &PriorContext<'_>, posterior: &mut DoubleGrid) -> Result<(), PhzError> {
        let factors: Vec<f64> = match posterior.axis(self.axis) {
            AxisRef::Numeric(values) => values.iter().map(|v| (self.function)(*v)).collect(),
            AxisRef::Categorical(_) => {
                return Err(PhzError::InvalidAxis(format!("{} is not numeric", self.axis)))
            }
        };
        multiply_along(posterior, self.axis, &factors);
        Ok(())
    }
}

/// Multiply every cell by the weight of its label on a categorical axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisWeightPrior {
    axis: ModelParameter,
    weights: BTreeMap<String, f64>,
}

impl AxisWeightPrior {
    pub fn new(axis: ModelParameter, weights: BTreeMap<String, f64>) -> Result<Self, PhzError> {
        if axis.is_numeric() {
            return Err(PhzError::InvalidAxis(format!(
                "a weight prior needs a categorical axis, {axis} is numeric"
            )));
        }
        Ok(Self { axis, weights })
    }
}

impl Prior for AxisWeightPrior {
    fn apply(&self, ctx: &PriorContext<'_>, posterior: &mut DoubleGrid) -> Result<(), PhzError> {
        let factors = match posterior.axis(self.axis) {
            AxisRef::Categorical(labels) => labels
                .iter()
                .map(|l| {
                    self.weights.get(l).copied().ok_or_else(|| {
                        PhzError::ConfigurationInconsistency(format!(
                            "no {} prior weight for {l} in region {}",
                            self.axis, ctx.region
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            AxisRef::Numeric(_) => {
                return Err(PhzError::InvalidAxis(format!("{} is not categorical", self.axis)))
            }
        };
        multiply_along(posterior, self.axis, &factors);
        Ok(())
    }
}

fn multiply_along(grid: &mut DoubleGrid, axis: ModelParameter, factors: &[f64]) {
    let k = axis.index();
    let coords: Vec<_> = grid.axes().iter_coords().collect();
    for (c, v) in coords.iter().zip(grid.cells_mut()) {
        *v *= factors[c[k]];
    }
}

/// Multiply by a region-keyed auxiliary weight grid.
///
/// The weight grids mirror the model layout. A fit on a reduced model grid (for
/// instance after the redshift has been fixed) looks the weights up by axis value,
/// so every remaining knot must exist on the weight grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericGridPrior {
    grids: RegionMap<DoubleGrid>,
}

impl GenericGridPrior {
    pub fn new(grids: RegionMap<DoubleGrid>) -> Self {
        Self { grids }
    }
}

impl Prior for GenericGridPrior {
    fn check_compatibility(
        &self,
        model_grids: &RegionMap<PhotometryGrid>,
    ) -> Result<(), PhzError> {
        check_region_compatibility(model_grids, &self.grids, "prior")
    }

    fn apply(&self, ctx: &PriorContext<'_>, posterior: &mut DoubleGrid) -> Result<(), PhzError> {
        let weights = self.grids.get(ctx.region).ok_or_else(|| {
            PhzError::ConfigurationInconsistency(format!(
                "no prior grid for region {}",
                ctx.region
            ))
        })?;

        let aligned = weights.cells_at(posterior.axes()).map_err(|e| {
            PhzError::ConfigurationInconsistency(format!("prior of region {}: {e}", ctx.region))
        })?;
        for (v, w) in posterior.cells_mut().iter_mut().zip(aligned) {
            *v *= w;
        }
        Ok(())
    }
}
