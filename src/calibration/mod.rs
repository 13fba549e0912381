//! # Zero-point calibration
//!
//! Iteratively derives the per-filter photometric correction map from a sample of
//! sources with known redshift.
//!
//! ## Iteration
//! -----------------
//! 1. Find each source's best model with the current map applied, the redshift
//!    being fixed through [`FixRedshiftModifier`]. No prior, no marginal.
//! 2. Scale that model to the *uncorrected* source photometry (scale factor `α`).
//! 3. For every filter, the implied correction of a source is `α·F_model / F_source`,
//!    the factor that brings the source onto the scaled model. Missing and
//!    non-detected bands, and zero fluxes, give no sample.
//! 4. A [`CorrectionSelector`] reduces each filter's samples to one value. The result
//!    replaces the map.
//!
//! The [`StopCriterion`] is consulted before every iteration and the
//! [`CancellationToken`] is polled right after it. A cancellation aborts the run with
//! [`PhzError::UserCancellation`]; the in-progress map is dropped.
//!
//! See also
//! -----------------
//! * [`selectors`] – median, weighted median, mean and weighted mean.
//! * [`stop_criteria`] – iteration ceiling and tolerance.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use log::{info, warn};

use crate::catalog::CatalogProcessor;
use crate::constants::{PhotometricCorrectionMap, RegionMap};
use crate::grid::PhotometryGrid;
use crate::likelihood::LikelihoodFamily;
use crate::photometry::Source;
use crate::phz_errors::PhzError;
use crate::phz_params::PhzParams;
use crate::source_fit::modifiers::FixRedshiftModifier;
use crate::source_fit::{BestModel, SourceFitOrchestrator, SourceResult};

pub mod selectors;
pub mod stop_criteria;

use selectors::{CorrectionSample, CorrectionSelector};
use stop_criteria::StopCriterion;

/// Cooperative cancellation flag, cheap to clone and share across threads.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Map with every filter of `source` set to 1.
pub fn initial_corrections(source: &Source) -> PhotometricCorrectionMap {
    source
        .photometry
        .filters()
        .iter()
        .map(|f| (f.clone(), 1.0))
        .collect()
}

pub struct CalibrationLoop<'g> {
    grids: &'g RegionMap<PhotometryGrid>,
    likelihood: LikelihoodFamily,
    params: PhzParams,
    selector: CorrectionSelector,
    cancellation: CancellationToken,
}

impl<'g> CalibrationLoop<'g> {
    pub fn new(
        grids: &'g RegionMap<PhotometryGrid>,
        likelihood: LikelihoodFamily,
        params: PhzParams,
    ) -> Self {
        Self {
            grids,
            likelihood,
            params,
            selector: CorrectionSelector::default(),
            cancellation: CancellationToken::default(),
        }
    }

    pub fn with_selector(mut self, selector: CorrectionSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Calibrate from a map with every filter of the first source at 1.
    ///
    /// Arguments
    /// -----------------
    /// * `sources` – the calibration sample, each with a fixed redshift.
    /// * `stop` – asked before each iteration.
    /// * `progress` – called with `(iteration, map)` after each iteration.
    ///
    /// Return
    /// ----------
    /// * The final correction map.
    /// * `Err(PhzError::InvalidParameter)` for an empty sample.
    /// * `Err(PhzError::UserCancellation)` when the token was cancelled.
    /// * Any fit error, e.g. a source without fixed redshift.
    pub fn run(
        &self,
        sources: &[Source],
        stop: impl StopCriterion,
        progress: impl FnMut(usize, &PhotometricCorrectionMap),
    ) -> Result<PhotometricCorrectionMap, PhzError> {
        let first = sources.first().ok_or_else(|| {
            PhzError::InvalidParameter("the calibration sample is empty".into())
        })?;
        self.run_from(sources, initial_corrections(first), stop, progress)
    }

    /// Calibrate starting from `initial`.
    pub fn run_from(
        &self,
        sources: &[Source],
        initial: PhotometricCorrectionMap,
        mut stop: impl StopCriterion,
        mut progress: impl FnMut(usize, &PhotometricCorrectionMap),
    ) -> Result<PhotometricCorrectionMap, PhzError> {
        let mut corrections = initial;
        let mut completed = 0;
        while !stop.should_stop(completed, &corrections) {
            if self.cancellation.is_cancelled() {
                return Err(PhzError::UserCancellation);
            }
            corrections = self.iterate(sources, &corrections)?;
            completed += 1;

            info!("calibration iteration {completed}");
            for (filter, value) in &corrections {
                info!("  {filter} : {value}");
            }
            progress(completed, &corrections);
        }
        Ok(corrections)
    }

    /// One calibration step: best fits, implied corrections, selection.
    pub fn iterate(
        &self,
        sources: &[Source],
        corrections: &PhotometricCorrectionMap,
    ) -> Result<PhotometricCorrectionMap, PhzError> {
        let orchestrator = SourceFitOrchestrator::new(self.grids, corrections, self.likelihood)?
            .with_params(&self.params)
            .with_modifier(Box::new(FixRedshiftModifier))?;
        let processor = CatalogProcessor::new(&orchestrator, &self.params)?;

        let mut samples: AHashMap<String, Vec<CorrectionSample>> = AHashMap::new();
        let mut position = 0;
        let mut sink = |result: SourceResult| -> Result<(), PhzError> {
            let source = sources.get(position).ok_or_else(|| {
                PhzError::ConfigurationInconsistency(format!(
                    "result for source {} has no matching input",
                    result.source_id
                ))
            })?;
            position += 1;
            match &result.best_model {
                Some(model) => self.collect_samples(source, model, &mut samples),
                None => warn!(
                    "calibration source {} has no best model and is skipped",
                    source.id
                ),
            }
            Ok(())
        };
        processor.process(sources, &mut sink)?;

        Ok(self.selector.select_all(corrections.keys(), &samples))
    }

    fn collect_samples(
        &self,
        source: &Source,
        model: &BestModel,
        samples: &mut AHashMap<String, Vec<CorrectionSample>>,
    ) {
        let alpha = self
            .likelihood
            .scale_factor(
                &source.photometry,
                &model.photometry,
                &self.params.scale_factor_search(),
            )
            .value;
        for ((filter, observed), fitted) in source.photometry.iter().zip(model.photometry.values())
        {
            if observed.missing || observed.upper_limit || observed.flux == 0.0 {
                continue;
            }
            let correction = alpha * fitted.flux / observed.flux;
            if !correction.is_finite() {
                continue;
            }
            samples
                .entry(filter.to_string())
                .or_default()
                .push(CorrectionSample::new(correction, observed.snr()));
        }
    }
}

#[cfg(test)]
mod calibration_test {
    use super::*;
    use crate::grid::{Grid, GridAxes};
    use crate::photometry::{FluxErrorPair, Photometry};
    use approx::assert_relative_eq;
    use stop_criteria::MaxIterations;

    fn grids() -> RegionMap<PhotometryGrid> {
        let axes = GridAxes::from_values(&[0.0, 1.0], &[0.0], &["c"], &["s"]).unwrap();
        let grid = Grid::from_fn(axes, |c| {
            Photometry::from_pairs(
                &["g", "r"],
                vec![
                    FluxErrorPair::new(1.0 + c[0] as f64, 0.0),
                    FluxErrorPair::new(1.0, 0.0),
                ],
            )
            .unwrap()
        });
        [("all".to_string(), grid)].into_iter().collect()
    }

    /// A z = 1 source whose g band reads 10% high.
    fn sample() -> Vec<Source> {
        vec![Source::new(
            1,
            Photometry::from_pairs(
                &["g", "r"],
                vec![FluxErrorPair::new(2.2, 0.1), FluxErrorPair::new(1.0, 0.1)],
            )
            .unwrap(),
        )
        .with_fixed_redshift(1.0)]
    }

    fn params() -> PhzParams {
        PhzParams::builder().workers(1).build().unwrap()
    }

    #[test]
    fn no_iteration_returns_the_initial_map() {
        let grids = grids();
        let calib = CalibrationLoop::new(&grids, LikelihoodFamily::Normal, params());
        let out = calib.run(&sample(), MaxIterations(0), |_, _| {}).unwrap();
        assert_eq!(out, initial_corrections(&sample()[0]));
    }

    #[test]
    fn one_iteration_moves_the_offset_band() {
        let grids = grids();
        let calib = CalibrationLoop::new(&grids, LikelihoodFamily::Normal, params());
        let mut seen = Vec::new();
        let out = calib
            .run(&sample(), MaxIterations(1), |i, m| seen.push((i, m.clone())))
            .unwrap();
        assert_eq!(seen.len(), 1);
        // g corrected down, r up, both by the shared scale factor
        assert!(out["g"] < 1.0);
        assert!(out["r"] > 1.0);
        assert_relative_eq!(out["g"] * 2.2 / (out["r"] * 1.0), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn cancelled_token_aborts() {
        let grids = grids();
        let token = CancellationToken::new();
        token.cancel();
        let calib = CalibrationLoop::new(&grids, LikelihoodFamily::Normal, params())
            .with_cancellation(token.clone());
        assert_eq!(
            calib.run(&sample(), MaxIterations(3), |_, _| {}),
            Err(PhzError::UserCancellation)
        );
        assert!(token.is_cancelled());
    }

    #[test]
    fn missing_fixed_redshift_is_fatal() {
        let grids = grids();
        let calib = CalibrationLoop::new(&grids, LikelihoodFamily::Normal, params());
        let mut sources = sample();
        sources[0].fixed_redshift = None;
        assert!(matches!(
            calib.run(&sources, MaxIterations(1), |_, _| {}),
            Err(PhzError::MissingRequiredAttribute { source_id: 1, .. })
        ));
    }
}
