//! # Source fit orchestration
//!
//! Fits one source against every region of the model and merges the per-region
//! answers into a single [`SourceResult`].
//!
//! ## Steps
//! -----------------
//! 1. Apply the zero-point correction map (and the optional error adjustment) to a
//!    copy of the source photometry.
//! 2. For every region, in [`RegionMap`] order, run the grid-modifier chain on the
//!    region's grid. The grid is only copied once a modifier produces a new one.
//! 3. Run the [`RegionFitEngine`] on the result.
//! 4. Pick the region holding the best posterior (first region on ties) and,
//!    independently, the one holding the best raw likelihood.
//! 5. Merge each requested 1-D marginal across regions, see [`combine`]. The
//!    likelihood marginals, when enabled, are merged with the same region weights;
//!    a redshift marginal reduced to one knot by a fixed redshift is only expanded
//!    onto the model redshift axis on the posterior side.
//!
//! When no region yields a posterior maximum the first region is used and a warning
//! is logged. Its best model is then the raw-likelihood optimum, if it has one.
//!
//! Construction checks every auxiliary grid (priors, modifiers) against the model
//! layout, so an inconsistent configuration fails before any source is fitted.
use std::borrow::Cow;
use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::constants::{PhotometricCorrectionMap, RegionMap, SourceId};
use crate::grid::{AxisValue, Coords, ModelParameter, PhotometryGrid};
use crate::likelihood::scale_factor::{ScaleFactorSampling, ScaleFactorSearch};
use crate::likelihood::LikelihoodFamily;
use crate::photometry::{adjust_errors, apply_photometric_correction, AdjustErrorParamMap, Photometry, Source};
use crate::phz_errors::PhzError;
use crate::phz_params::PhzParams;
use crate::region_fit::marginalization::{Marginalization, Pdf1D};
use crate::region_fit::priors::Prior;
use crate::region_fit::{BestFit, RegionFitEngine, RegionFitStage, RegionResult};

pub mod combine;
pub mod modifiers;

use combine::{combine_pdfs, expand_point_pdf, normalize_pdf, region_weights};
use modifiers::GridModifier;

/// The model selected for a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestModel {
    pub region: String,
    /// Position of `region` in region-map order.
    pub region_index: usize,
    /// Coordinates on the fitted (possibly modified) grid of the region.
    pub coords: Coords,
    pub z: f64,
    pub ebv: f64,
    pub reddening_curve: String,
    pub sed: String,
    pub scale_factor: f64,
    pub posterior_log: f64,
    pub likelihood_log: f64,
    /// Model photometry of the cell, before scaling.
    pub photometry: Photometry,
}

/// Per-region figures kept in the source result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDiagnostics {
    pub region: String,
    pub stage: RegionFitStage,
    pub cells: usize,
    pub normalization_log: f64,
    pub best_posterior_log: Option<f64>,
    pub best_likelihood_log: Option<f64>,
    pub non_converged: usize,
}

impl From<&RegionResult> for RegionDiagnostics {
    fn from(r: &RegionResult) -> Self {
        Self {
            region: r.region.clone(),
            stage: r.stage,
            cells: r.posterior.len(),
            normalization_log: r.normalization_log,
            best_posterior_log: r.best_posterior.map(|b| b.posterior_log),
            best_likelihood_log: r.best_likelihood.map(|b| b.likelihood_log),
            non_converged: r.non_converged,
        }
    }
}

/// Everything produced for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResult {
    pub source_id: SourceId,
    /// Best model by posterior; `None` only when the fallback region has no cell.
    pub best_model: Option<BestModel>,
    /// Best model by raw likelihood, before priors.
    pub best_likelihood_model: Option<BestModel>,
    /// True when no region produced a posterior maximum.
    pub used_fallback_region: bool,
    pub pdfs: BTreeMap<ModelParameter, Pdf1D>,
    /// Marginals of the likelihood (before priors); empty unless requested.
    pub likelihood_pdfs: BTreeMap<ModelParameter, Pdf1D>,
    pub regions: Vec<RegionDiagnostics>,
}

/// Per-source fit over every region of a model.
///
/// Borrows the model grids and the correction map for the whole run. It is `Sync`
/// and is shared by reference between catalog workers.
pub struct SourceFitOrchestrator<'a> {
    grids: &'a RegionMap<PhotometryGrid>,
    /// Filter list shared by every non-empty region.
    filters: Option<&'a [String]>,
    corrections: &'a PhotometricCorrectionMap,
    error_adjustment: Option<&'a AdjustErrorParamMap>,
    likelihood: LikelihoodFamily,
    search: ScaleFactorSearch,
    scale_sampling: Option<ScaleFactorSampling>,
    normalize_pdfs: bool,
    likelihood_pdfs: bool,
    modifiers: Vec<Box<dyn GridModifier>>,
    priors: Vec<Box<dyn Prior>>,
    marginalizations: Vec<(ModelParameter, Marginalization)>,
}

impl<'a> SourceFitOrchestrator<'a> {
    /// Start a configuration with default search settings, no modifier, no prior and
    /// no marginalization.
    ///
    /// Return
    /// ----------
    /// * `Err(PhzError::EmptyGrid)` when `grids` holds no region.
    /// * `Err(PhzError::ConfigurationInconsistency)` when the regions do not share one
    ///   filter list.
    ///
    /// Sources are later fitted band by band against that list, so their filters must
    /// match it exactly, order included.
    pub fn new(
        grids: &'a RegionMap<PhotometryGrid>,
        corrections: &'a PhotometricCorrectionMap,
        likelihood: LikelihoodFamily,
    ) -> Result<Self, PhzError> {
        if grids.is_empty() {
            return Err(PhzError::EmptyGrid);
        }
        let mut filters: Option<&'a [String]> = None;
        for (name, grid) in grids {
            match (filters, grid.filters()) {
                (None, Some(f)) => filters = Some(f),
                (Some(expected), Some(f)) if expected != f => {
                    return Err(PhzError::ConfigurationInconsistency(format!(
                        "region {name} has filters {f:?}, expected {expected:?}"
                    )))
                }
                _ => {}
            }
        }
        Ok(Self {
            grids,
            filters,
            corrections,
            error_adjustment: None,
            likelihood,
            search: ScaleFactorSearch::default(),
            scale_sampling: None,
            normalize_pdfs: true,
            likelihood_pdfs: false,
            modifiers: Vec::new(),
            priors: Vec::new(),
            marginalizations: Vec::new(),
        })
    }

    /// Take the scale-factor search and sampling settings, the PDF normalization and
    /// the likelihood-marginal switch from `params`.
    pub fn with_params(mut self, params: &PhzParams) -> Self {
        self.search = params.scale_factor_search();
        self.scale_sampling = params.scale_factor_sampling;
        self.normalize_pdfs = params.normalize_pdfs;
        self.likelihood_pdfs = params.likelihood_pdfs;
        self
    }

    /// Also merge the likelihood marginals of every requested axis.
    pub fn with_likelihood_pdfs(mut self, enabled: bool) -> Self {
        self.likelihood_pdfs = enabled;
        self
    }

    /// Sample the likelihood along the scale factor; the best model then reports
    /// the mean scale factor.
    pub fn with_scale_factor_sampling(mut self, sampling: Option<ScaleFactorSampling>) -> Self {
        self.scale_sampling = sampling;
        self
    }

    pub fn with_error_adjustment(mut self, params: &'a AdjustErrorParamMap) -> Self {
        self.error_adjustment = Some(params);
        self
    }

    /// Append a grid modifier; modifiers run in the order they are added.
    pub fn with_modifier(mut self, modifier: Box<dyn GridModifier>) -> Result<Self, PhzError> {
        modifier.check_compatibility(self.grids)?;
        self.modifiers.push(modifier);
        Ok(self)
    }

    /// Append a prior; priors run in the order they are added.
    pub fn with_prior(mut self, prior: Box<dyn Prior>) -> Result<Self, PhzError> {
        prior.check_compatibility(self.grids)?;
        self.priors.push(prior);
        Ok(self)
    }

    /// Request the 1-D distribution of `axis`, reduced with `method`.
    pub fn with_marginalization(mut self, axis: ModelParameter, method: Marginalization) -> Self {
        self.marginalizations.retain(|(a, _)| *a != axis);
        self.marginalizations.push((axis, method));
        self
    }

    #[inline]
    pub fn grids(&self) -> &'a RegionMap<PhotometryGrid> {
        self.grids
    }

    #[inline]
    pub fn likelihood(&self) -> LikelihoodFamily {
        self.likelihood
    }

    /// Reject a source whose bands are not the model bands in model order.
    fn check_filters(&self, source: &Source) -> Result<(), PhzError> {
        match self.filters {
            Some(expected) if source.photometry.filters()[..] != *expected => {
                Err(PhzError::ConfigurationInconsistency(format!(
                    "source {} has filters {:?}, the model grid has {:?}",
                    source.id,
                    source.photometry.filters(),
                    expected
                )))
            }
            _ => Ok(()),
        }
    }

    /// Fit `source` and return the per-region results next to the grids they were
    /// computed on.
    fn fit_regions(
        &self,
        source: &Source,
    ) -> Result<Vec<(RegionResult, Cow<'a, PhotometryGrid>)>, PhzError> {
        self.check_filters(source)?;
        let mut corrected = apply_photometric_correction(source, self.corrections)?;
        if let Some(params) = self.error_adjustment {
            adjust_errors(&mut corrected, params)?;
        }

        let engine = RegionFitEngine::new(self.likelihood, self.search)
            .with_priors(&self.priors)
            .with_marginalizations(&self.marginalizations)
            .with_likelihood_marginals(self.likelihood_pdfs)
            .with_scale_factor_sampling(self.scale_sampling);

        let mut results = Vec::with_capacity(self.grids.len());
        for (name, grid) in self.grids {
            let mut current: Cow<'a, PhotometryGrid> = Cow::Borrowed(grid);
            for modifier in &self.modifiers {
                current = Cow::Owned(modifier.modify(name, &current, source)?);
            }
            let result = engine.fit(name, &corrected, &current)?;
            results.push((result, current));
        }
        Ok(results)
    }

    /// Fit `source` against every region.
    ///
    /// Return
    /// ----------
    /// * The merged [`SourceResult`].
    /// * `Err(PhzError::MissingRequiredAttribute)` when the source lacks a correction,
    ///   an error-adjustment entry or an attribute a modifier needs.
    /// * `Err(PhzError::ConfigurationInconsistency)` when the source filters differ from
    ///   the model filters, or raised by a prior or a modifier.
    pub fn fit(&self, source: &Source) -> Result<SourceResult, PhzError> {
        let regions = self.fit_regions(source)?;

        let best_posterior = pick_best(&regions, |r| r.best_posterior.map(|b| b.posterior_log));
        let best_likelihood =
            pick_best(&regions, |r| r.best_likelihood.map(|b| b.likelihood_log));

        let (best_model, used_fallback_region) = match best_posterior {
            Some(i) => (extract_best_model(&regions, i, regions[i].0.best_posterior), false),
            None => {
                let first = regions.first().map(|(r, _)| r.region.as_str()).unwrap_or("");
                warn!(
                    "source {} has no usable region result, falling back to the first region {first}",
                    source.id
                );
                let fallback = regions
                    .first()
                    .and_then(|(r, _)| r.best_likelihood)
                    .and_then(|b| extract_best_model(&regions, 0, Some(b)));
                (fallback, true)
            }
        };
        let best_likelihood_model =
            best_likelihood.and_then(|i| {
            extract_best_model(&regions, i, regions[i].0.best_likelihood)
        });

        let pdfs = self.combine(&regions, |r| &r.pdfs, true)?;
        let likelihood_pdfs = if self.likelihood_pdfs {
            self.combine(&regions, |r| &r.likelihood_pdfs, false)?
        } else {
            BTreeMap::new()
        };

        Ok(SourceResult {
            source_id: source.id,
            best_model,
            best_likelihood_model,
            used_fallback_region,
            pdfs,
            likelihood_pdfs,
            regions: regions.iter().map(|(r, _)| r.into()).collect(),
        })
    }

    /// Best-fitting model of `source`, without marginals.
    ///
    /// Runs the same region fits as [`SourceFitOrchestrator::fit`] but only extracts
    /// the best model by posterior (with the first-region fallback).
    pub fn best_model(&self, source: &Source) -> Result<Option<BestModel>, PhzError> {
        Ok(self.fit(source)?.best_model)
    }

    /// Merge the per-region marginals picked by `select`, weighted by the regions'
    /// normalization logs. `expand_fixed_z` puts a one-knot redshift curve back on
    /// the model redshift axis.
    fn combine(
        &self,
        regions: &[(RegionResult, Cow<'a, PhotometryGrid>)],
        select: impl Fn(&RegionResult) -> &BTreeMap<ModelParameter, Pdf1D>,
        expand_fixed_z: bool,
    ) -> Result<BTreeMap<ModelParameter, Pdf1D>, PhzError> {
        let mut pdfs = BTreeMap::new();
        if self.marginalizations.is_empty() {
            return Ok(pdfs);
        }
        let norm_logs: Vec<f64> = regions.iter().map(|(r, _)| r.normalization_log).collect();
        let (reference, weights) = region_weights(&norm_logs);

        for (axis, _) in &self.marginalizations {
            let curves: Vec<(&Pdf1D, f64)> = regions
                .iter()
                .zip(&weights)
                .filter(|(_, w)| **w > 0.0)
                .filter_map(|((r, _), w)| select(r).get(axis).map(|p| (p, *w)))
                .filter(|(p, _)| !p.is_empty())
                .collect();
            let Some(mut combined) = combine_pdfs(&curves)? else {
                continue;
            };
            if expand_fixed_z && *axis == ModelParameter::Z && combined.len() == 1 {
                let original_z = self
                    .grids
                    .values()
                    .next()
                    .map(|g| g.axes().z())
                    .unwrap_or(&[]);
                combined = expand_point_pdf(&combined, original_z, self.normalize_pdfs);
            } else if self.normalize_pdfs {
                normalize_pdf(&mut combined);
            } else {
                combined.scale(reference.exp());
            }
            pdfs.insert(*axis, combined);
        }
        Ok(pdfs)
    }
}

/// Index of the region with the highest `score`, first one on ties.
fn pick_best(
    regions: &[(RegionResult, Cow<'_, PhotometryGrid>)],
    score: impl Fn(&RegionResult) -> Option<f64>,
) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, (r, _)) in regions.iter().enumerate() {
        if let Some(s) = score(r) {
            if best.is_none_or(|(_, b)| s > b) {
                best = Some((i, s));
            }
        }
    }
    best.map(|(i, _)| i)
}

fn extract_best_model(
    regions: &[(RegionResult, Cow<'_, PhotometryGrid>)],
    index: usize,
    fit: Option<BestFit>,
) -> Option<BestModel> {
    let fit = fit?;
    let (result, grid) = regions.get(index)?;
    let axes = grid.axes();
    let numeric = |p: ModelParameter| match axes.value_at(p, fit.coords[p.index()]) {
        Some(AxisValue::Numeric(v)) => v,
        _ => f64::NAN,
    };
    let label = |p: ModelParameter| match axes.value_at(p, fit.coords[p.index()]) {
        Some(AxisValue::Categorical(s)) => s.to_string(),
        _ => String::new(),
    };
    Some(BestModel {
        region: result.region.clone(),
        region_index: index,
        coords: fit.coords,
        z: numeric(ModelParameter::Z),
        ebv: numeric(ModelParameter::Ebv),
        reddening_curve: label(ModelParameter::ReddeningCurve),
        sed: label(ModelParameter::Sed),
        scale_factor: fit.scale_factor,
        posterior_log: fit.posterior_log,
        likelihood_log: fit.likelihood_log,
        photometry: grid.get(fit.coords)?.clone(),
    })
}

#[cfg(test)]
mod source_fit_test {
    use super::*;
    use crate::grid::{Grid, GridAxes};
    use crate::photometry::{shared_filters, FluxErrorPair};
    use approx::assert_relative_eq;
    use modifiers::FixRedshiftModifier;

    /// Two regions over z ∈ {0, 0.5, 1}: "blue" has g/r = 1 + z, "red" g/r = 0.5 + z.
    fn grids() -> RegionMap<PhotometryGrid> {
        let filters = shared_filters(&["g", "r"]);
        let mut grids = RegionMap::new();
        for (name, offset) in [("blue", 1.0), ("red", 0.5)] {
            let axes = GridAxes::from_values(&[0.0, 0.5, 1.0], &[0.0], &["none"], &[name]).unwrap();
            let f = filters.clone();
            grids.insert(
                name.to_string(),
                Grid::from_fn(axes, move |c| {
                    let z = c[0] as f64 * 0.5;
                    Photometry::new(
                        f.clone(),
                        vec![
                            FluxErrorPair::new(offset + z, 0.0),
                            FluxErrorPair::new(1.0, 0.0),
                        ],
                    )
                    .unwrap()
                }),
            );
        }
        grids
    }

    fn corrections() -> PhotometricCorrectionMap {
        [("g".to_string(), 1.0), ("r".to_string(), 1.0)]
            .into_iter()
            .collect()
    }

    fn source(g: f64, r: f64) -> Source {
        Source::new(
            42,
            Photometry::from_pairs(
                &["g", "r"],
                vec![FluxErrorPair::new(g, 0.05), FluxErrorPair::new(r, 0.05)],
            )
            .unwrap(),
        )
    }

    #[test]
    fn best_region_and_combined_pdf() {
        let grids = grids();
        let corr = corrections();
        let fitter = SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal)
            .unwrap()
            .with_marginalization(ModelParameter::Z, Marginalization::Sum)
            .with_marginalization(ModelParameter::Sed, Marginalization::Sum);
        // g/r = 1.5 matches blue at z = 0.5 and red at z = 1.0 exactly, first region wins
        let result = fitter.fit(&source(3.0, 2.0)).unwrap();
        let best = result.best_model.unwrap();
        assert!(!result.used_fallback_region);
        assert_eq!(best.region, "blue");
        assert_eq!(best.z, 0.5);
        assert_relative_eq!(best.scale_factor, 2.0, epsilon = 1e-9);
        assert_eq!(result.regions.len(), 2);

        let z = &result.pdfs[&ModelParameter::Z];
        assert_eq!(z.len(), 3);
        assert_relative_eq!(z.integral(), 1.0, epsilon = 1e-12);
        let sed = &result.pdfs[&ModelParameter::Sed];
        assert_relative_eq!(sed.y().iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn fixed_redshift_outside_every_region_falls_back() {
        let grids = grids();
        let corr = corrections();
        let fitter = SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal)
            .unwrap()
            .with_modifier(Box::new(FixRedshiftModifier))
            .unwrap();
        let result = fitter
            .fit(&source(3.0, 2.0).with_fixed_redshift(4.0))
            .unwrap();
        assert!(result.used_fallback_region);
        assert!(result.best_model.is_none());
        assert!(result.regions.iter().all(|r| r.cells == 0));
    }

    #[test]
    fn fixed_redshift_pdf_is_expanded() {
        let grids = grids();
        let corr = corrections();
        let fitter = SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal)
            .unwrap()
            .with_modifier(Box::new(FixRedshiftModifier))
            .unwrap()
            .with_marginalization(ModelParameter::Z, Marginalization::Sum);
        let result = fitter
            .fit(&source(3.0, 2.0).with_fixed_redshift(0.45))
            .unwrap();
        let best = result.best_model.unwrap();
        assert_eq!(best.z, 0.5);
        assert_eq!(best.region, "blue");
        let z = &result.pdfs[&ModelParameter::Z];
        assert_eq!(z.len(), 3);
        assert_eq!(z.argmax(), Some(1));
    }

    #[test]
    fn missing_correction_aborts() {
        let grids = grids();
        let corr: PhotometricCorrectionMap = [("g".to_string(), 1.0)].into_iter().collect();
        let fitter = SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal).unwrap();
        assert!(matches!(
            fitter.fit(&source(1.0, 1.0)),
            Err(PhzError::MissingRequiredAttribute { source_id: 42, .. })
        ));
    }

    #[test]
    fn likelihood_marginals_are_combined_on_request() {
        let grids = grids();
        let corr = corrections();
        let base = || {
            SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal)
                .unwrap()
                .with_marginalization(ModelParameter::Z, Marginalization::Sum)
        };
        let without = base().fit(&source(3.0, 2.0)).unwrap();
        assert!(without.likelihood_pdfs.is_empty());

        let params = PhzParams::builder().likelihood_pdfs(true).build().unwrap();
        let result = base().with_params(&params).fit(&source(3.0, 2.0)).unwrap();
        let z = &result.likelihood_pdfs[&ModelParameter::Z];
        assert_eq!(z.len(), 3);
        assert_relative_eq!(z.integral(), 1.0, epsilon = 1e-12);
        // without priors the likelihood and posterior marginals coincide
        for (l, p) in z.y().iter().zip(result.pdfs[&ModelParameter::Z].y()) {
            assert_relative_eq!(*l, *p, epsilon = 1e-12);
        }

        // a fixed redshift leaves a single knot on the likelihood side
        let fixed = base()
            .with_likelihood_pdfs(true)
            .with_modifier(Box::new(FixRedshiftModifier))
            .unwrap()
            .fit(&source(3.0, 2.0).with_fixed_redshift(0.45))
            .unwrap();
        assert_eq!(fixed.pdfs[&ModelParameter::Z].len(), 3);
        assert_eq!(fixed.likelihood_pdfs[&ModelParameter::Z].len(), 1);
    }

    #[test]
    fn sampled_best_model_reports_the_mean_scale_factor() {
        let grids = grids();
        let corr = corrections();
        let fitter = SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal)
            .unwrap()
            .with_scale_factor_sampling(Some(ScaleFactorSampling::default()));
        let best = fitter.best_model(&source(3.0, 2.0)).unwrap().unwrap();
        // symmetric samples around α = 2
        assert_relative_eq!(best.scale_factor, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn reordered_or_extra_filters_are_rejected() {
        let grids = grids();
        let corr: PhotometricCorrectionMap = ["g", "r", "i"]
            .into_iter()
            .map(|f| (f.to_string(), 1.0))
            .collect();
        let fitter = SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal).unwrap();

        let swapped = Source::new(
            7,
            Photometry::from_pairs(
                &["r", "g"],
                vec![FluxErrorPair::new(2.0, 0.05), FluxErrorPair::new(3.0, 0.05)],
            )
            .unwrap(),
        );
        let extra = Source::new(
            8,
            Photometry::from_pairs(
                &["r", "g", "i"],
                vec![FluxErrorPair::new(2.0, 0.05); 3],
            )
            .unwrap(),
        );
        for bad in [&swapped, &extra] {
            match fitter.fit(bad) {
                Err(PhzError::ConfigurationInconsistency(msg)) => {
                    assert!(msg.contains(&format!("source {}", bad.id)), "{msg}")
                }
                other => panic!("expected a filter mismatch, got {other:?}"),
            }
        }
        assert!(fitter.fit(&source(3.0, 2.0)).is_ok());
    }
}
