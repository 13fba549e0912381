//! # Region fit engine
//!
//! Fits one source against the model grid of one parameter-space region.
//!
//! ## Stages
//! -----------------
//! A fit walks the [`RegionFitStage`] sequence:
//!
//! 1. **LikelihoodComputed** – every cell gets a scale factor and a log-likelihood
//!    from the selected [`LikelihoodFamily`] member. The best fit by raw likelihood is
//!    recorded here, before any prior can move the optimum.
//! 2. **PriorsApplied** – the log-likelihoods are shifted by their maximum (kept as
//!    the region's *normalization log*) and exponentiated, so the linear likelihood
//!    peaks at exactly 1. The priors then reweight a copy of it in the order given.
//! 3. **BestFitLocated** – the maximum of the posterior grid.
//! 4. **Marginalized** – one [`Pdf1D`] per requested axis. Skipped when no axis
//!    is requested, in which case the fit ends at the previous stage. On request the
//!    linear likelihood is reduced the same way, next to the posterior.
//!
//! Scale-factor sampling
//! -----------------
//! With [`RegionFitEngine::with_scale_factor_sampling`] every cell also gets its
//! `σ_α` and the log-likelihood at evenly spaced scale factors around its optimum
//! ([`ScaleFactorSamples`]). The posterior best fit then reports the mean scale
//! factor of those samples instead of the optimum. The priors only add a per-cell
//! constant to the sampled logs, so the likelihood samples give the posterior mean.
//!
//! A region whose grid has no cell, or whose posterior is zero everywhere, has no
//! best fit. The source-level orchestration decides what to do with it.
//!
//! See also
//! ------------
//! * [`priors`] – the reweighting strategies.
//! * [`marginalization`] – the 1-D reductions.
use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::grid::{Coords, DoubleGrid, Grid, GridAxes, ModelParameter, PhotometryGrid};
use crate::likelihood::scale_factor::{
    mean_scale_factor, sigma_scale_factor, ScaleFactorSampling, ScaleFactorSearch,
};
use crate::likelihood::LikelihoodFamily;
use crate::photometry::Source;
use crate::phz_errors::PhzError;

pub mod marginalization;
pub mod priors;

use marginalization::{Marginalization, Pdf1D};
use priors::{Prior, PriorContext};

/// Progress of a single source × region fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegionFitStage {
    Init,
    LikelihoodComputed,
    PriorsApplied,
    BestFitLocated,
    Marginalized,
}

/// Location and figures of merit of a best-fitting model cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestFit {
    pub coords: Coords,
    pub scale_factor: f64,
    /// Log-likelihood of the cell (absolute, not shifted).
    pub likelihood_log: f64,
    /// Log-posterior of the cell on the same absolute scale.
    pub posterior_log: f64,
}

/// Likelihood sampled along the scale factor, cell by cell.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleFactorSamples {
    pub sampling: ScaleFactorSampling,
    /// `σ_α` of every cell.
    pub sigma: DoubleGrid,
    /// Log-likelihood at each sample position of every cell.
    pub likelihood_log: Grid<Vec<f64>>,
}

impl ScaleFactorSamples {
    /// Mean scale factor of the cell at `flat`, whose optimum is `alpha`.
    pub fn mean_at(&self, flat: usize, alpha: f64) -> Option<f64> {
        let sigma = *self.sigma.cells().get(flat)?;
        let logs = self.likelihood_log.cells().get(flat)?;
        mean_scale_factor(&self.sampling.points(alpha, sigma), logs)
    }
}

/// Everything a region fit produces for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionResult {
    pub region: String,
    pub stage: RegionFitStage,
    /// Absolute log-likelihood per cell.
    pub likelihood_log: DoubleGrid,
    /// Linear likelihood, peak 1.
    pub likelihood: DoubleGrid,
    /// Linear posterior on the likelihood's scale.
    pub posterior: DoubleGrid,
    pub scale_factor: DoubleGrid,
    /// Maximum log-likelihood, subtracted before exponentiation.
    pub normalization_log: f64,
    pub best_likelihood: Option<BestFit>,
    pub best_posterior: Option<BestFit>,
    pub pdfs: BTreeMap<ModelParameter, Pdf1D>,
    /// Marginals of the linear likelihood, when requested.
    pub likelihood_pdfs: BTreeMap<ModelParameter, Pdf1D>,
    pub scale_factor_samples: Option<ScaleFactorSamples>,
    /// Cells whose scale-factor search stopped on its iteration cap.
    pub non_converged: usize,
}

impl RegionResult {
    /// Axes of the fitted (possibly modified) grid.
    pub fn axes(&self) -> &GridAxes {
        self.posterior.axes()
    }

    /// True when the fit located a posterior maximum.
    pub fn is_usable(&self) -> bool {
        self.best_posterior.is_some()
    }
}

/// Per-region fitting pipeline, shared by every source of a run.
#[derive(Clone, Copy)]
pub struct RegionFitEngine<'a> {
    likelihood: LikelihoodFamily,
    search: ScaleFactorSearch,
    priors: &'a [Box<dyn Prior>],
    marginalizations: &'a [(ModelParameter, Marginalization)],
    likelihood_marginals: bool,
    scale_sampling: Option<ScaleFactorSampling>,
}

impl<'a> RegionFitEngine<'a> {
    pub fn new(likelihood: LikelihoodFamily, search: ScaleFactorSearch) -> Self {
        Self {
            likelihood,
            search,
            priors: &[],
            marginalizations: &[],
            likelihood_marginals: false,
            scale_sampling: None,
        }
    }

    pub fn with_priors(mut self, priors: &'a [Box<dyn Prior>]) -> Self {
        self.priors = priors;
        self
    }

    pub fn with_marginalizations(
        mut self,
        marginalizations: &'a [(ModelParameter, Marginalization)],
    ) -> Self {
        self.marginalizations = marginalizations;
        self
    }

    /// Also reduce the linear likelihood along every requested axis.
    pub fn with_likelihood_marginals(mut self, enabled: bool) -> Self {
        self.likelihood_marginals = enabled;
        self
    }

    pub fn with_scale_factor_sampling(mut self, sampling: Option<ScaleFactorSampling>) -> Self {
        self.scale_sampling = sampling;
        self
    }

    #[inline]
    pub fn likelihood(&self) -> LikelihoodFamily {
        self.likelihood
    }

    /// Fit `source` against the model grid of `region`.
    ///
    /// Arguments
    /// -----------------
    /// * `region` – region name, handed to the priors.
    /// * `source` – the (corrected) source.
    /// * `grid` – the region's model grid, already through any modifier chain.
    ///
    /// Return
    /// ----------
    /// * The [`RegionResult`], or the first error raised by a prior. A prior that
    ///   changes the grid layout is a `ConfigurationInconsistency`.
    pub fn fit(
        &self,
        region: &str,
        source: &Source,
        grid: &PhotometryGrid,
    ) -> Result<RegionResult, PhzError> {
        let mut stage = RegionFitStage::Init;

        // likelihood and scale factors
        let mut non_converged = 0;
        let evaluations = grid.map(|model| {
            let eval = self
                .likelihood
                .evaluate(&source.photometry, model, &self.search);
            if !eval.scale_factor.converged {
                non_converged += 1;
            }
            eval
        });
        let likelihood_log = evaluations.map(|e| e.log_likelihood);
        let scale_factor = evaluations.map(|e| e.scale_factor.value);
        if non_converged > 0 {
            warn!(
                "source {}: scale-factor search hit its iteration cap on {non_converged} \
                 of {} cells of region {region}",
                source.id,
                grid.len()
            );
        }
        let scale_factor_samples = self.scale_sampling.map(|sampling| {
            let sigma = grid.map(|model| sigma_scale_factor(&source.photometry, model));
            let sampled = Grid::from_fn(grid.axes().clone(), |c| {
                sampling
                    .points(scale_factor[c], sigma[c])
                    .into_iter()
                    .map(|a| self.likelihood.log_likelihood(&source.photometry, &grid[c], a))
                    .collect()
            });
            ScaleFactorSamples {
                sampling,
                sigma,
                likelihood_log: sampled,
            }
        });
        let best_cell = argmax(likelihood_log.cells());
        stage = advance(stage, RegionFitStage::LikelihoodComputed);

        // log shift, then priors
        let normalization_log = best_cell
            .map(|i| likelihood_log.cells()[i])
            .unwrap_or(f64::NEG_INFINITY);
        let likelihood = if normalization_log.is_finite() {
            likelihood_log.map(|l| (l - normalization_log).exp())
        } else {
            likelihood_log.map(|_| 0.0)
        };
        let mut posterior = likelihood.clone();
        let ctx = PriorContext {
            region,
            source,
            model_grid: grid,
            likelihood: &likelihood,
            scale_factor: &scale_factor,
        };
        for prior in self.priors {
            prior.apply(&ctx, &mut posterior)?;
            if posterior.axes() != likelihood.axes() || posterior.len() != likelihood.len() {
                return Err(PhzError::ConfigurationInconsistency(format!(
                    "a prior changed the layout of the grid of region {region}"
                )));
            }
        }
        stage = advance(stage, RegionFitStage::PriorsApplied);

        // best fits
        let best_at = |flat: usize| -> BestFit {
            let coords = grid.axes().coords(flat);
            BestFit {
                coords,
                scale_factor: scale_factor.cells()[flat],
                likelihood_log: likelihood_log.cells()[flat],
                posterior_log: posterior.cells()[flat].ln() + normalization_log,
            }
        };
        let best_likelihood = if normalization_log.is_finite() {
            best_cell.map(best_at)
        } else {
            None
        };
        let best_posterior = argmax(posterior.cells())
            .filter(|i| posterior.cells()[*i] > 0.0 && normalization_log.is_finite())
            .map(|flat| {
                let mut best = best_at(flat);
                if let Some(mean) = scale_factor_samples
                    .as_ref()
                    .and_then(|s| s.mean_at(flat, best.scale_factor))
                {
                    best.scale_factor = mean;
                }
                best
            });
        stage = advance(stage, RegionFitStage::BestFitLocated);

        // marginals
        let mut pdfs = BTreeMap::new();
        let mut likelihood_pdfs = BTreeMap::new();
        if !self.marginalizations.is_empty() {
            for (axis, method) in self.marginalizations {
                pdfs.insert(*axis, method.marginalize(&posterior, *axis));
                if self.likelihood_marginals {
                    likelihood_pdfs.insert(*axis, method.marginalize(&likelihood, *axis));
                }
            }
            stage = advance(stage, RegionFitStage::Marginalized);
        }

        debug!(
            "source {} region {region}: {} cells, normalization log {normalization_log:.3}, stage {stage:?}",
            source.id,
            grid.len()
        );

        Ok(RegionResult {
            region: region.to_string(),
            stage,
            likelihood_log,
            likelihood,
            posterior,
            scale_factor,
            normalization_log,
            best_likelihood,
            best_posterior,
            pdfs,
            likelihood_pdfs,
            scale_factor_samples,
            non_converged,
        })
    }
}

#[inline]
fn advance(from: RegionFitStage, to: RegionFitStage) -> RegionFitStage {
    debug_assert!(from < to, "region fit stage {to:?} reached from {from:?}");
    to
}

/// Position of the largest non-NaN value (first one on ties).
pub(crate) fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        if best.is_none_or(|(_, b)| *v > b) {
            best = Some((i, *v));
        }
    }
    best.map(|(i, _)| i)
}
