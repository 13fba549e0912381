//! # Photometry
//!
//! Per-filter flux measurements shared by observed sources and model grid cells.
//!
//! ## Overview
//! -----------------
//! * [`FluxErrorPair`] – one band: flux, 1σ error, and the *missing* / *upper-limit* flags.
//! * [`Photometry`] – an ordered vector of [`FluxErrorPair`] aligned with a shared,
//!   reference-counted filter-name list. Model cells of a grid share one list, so the
//!   homogeneity check at serialization time is a pointer comparison in the common case.
//! * [`Source`] – a catalog entry: identifier, observed photometry and the optional
//!   attributes consumed by the grid modifiers (fixed redshift, galactic dust column
//!   density, per-filter bandpass shifts).
//!
//! Corrections
//! -----------------
//! * [`apply_photometric_correction`] multiplies every non-missing flux by its filter's
//!   zero-point correction (a fresh copy is returned, the source is untouched).
//! * [`adjust_errors`] rescales flux errors with the per-filter `(alpha, beta, gamma)`
//!   recipe of an [`AdjustErrorParamMap`].
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::{PhotometricCorrectionMap, SourceId};
use crate::phz_errors::PhzError;

/// One photometric band measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FluxErrorPair {
    pub flux: f64,
    pub error: f64,
    /// The band carries no information for this source.
    pub missing: bool,
    /// The flux is a detection threshold, not a measurement.
    pub upper_limit: bool,
}

impl FluxErrorPair {
    pub fn new(flux: f64, error: f64) -> Self {
        Self {
            flux,
            error,
            missing: false,
            upper_limit: false,
        }
    }

    pub fn missing() -> Self {
        Self {
            flux: 0.0,
            error: 0.0,
            missing: true,
            upper_limit: false,
        }
    }

    pub fn upper_limit(flux: f64, error: f64) -> Self {
        Self {
            flux,
            error,
            missing: false,
            upper_limit: true,
        }
    }

    /// Signal-to-noise ratio `flux / error`.
    #[inline]
    pub fn snr(&self) -> f64 {
        self.flux / self.error
    }
}

/// Flux/error pairs aligned with a shared list of filter names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPhotometry")]
pub struct Photometry {
    filters: Arc<[String]>,
    values: Vec<FluxErrorPair>,
}

#[derive(Deserialize)]
struct RawPhotometry {
    filters: Arc<[String]>,
    values: Vec<FluxErrorPair>,
}

impl TryFrom<RawPhotometry> for Photometry {
    type Error = PhzError;

    fn try_from(raw: RawPhotometry) -> Result<Self, PhzError> {
        Photometry::new(raw.filters, raw.values)
    }
}

impl Photometry {
    /// Build a photometry vector.
    ///
    /// Arguments
    /// -----------------
    /// * `filters` – shared filter names, one per value.
    /// * `values` – the measurements, in filter order.
    ///
    /// Return
    /// ----------
    /// * `Err(PhzError::ConfigurationInconsistency)` when the two lengths differ.
    pub fn new(filters: Arc<[String]>, values: Vec<FluxErrorPair>) -> Result<Self, PhzError> {
        if filters.len() != values.len() {
            return Err(PhzError::ConfigurationInconsistency(format!(
                "photometry has {} values for {} filters",
                values.len(),
                filters.len()
            )));
        }
        Ok(Self { filters, values })
    }

    /// Shorthand building a fresh filter list from string slices.
    pub fn from_pairs(filters: &[&str], values: Vec<FluxErrorPair>) -> Result<Self, PhzError> {
        Self::new(shared_filters(filters), values)
    }

    #[inline]
    pub fn filters(&self) -> &Arc<[String]> {
        &self.filters
    }

    #[inline]
    pub fn values(&self) -> &[FluxErrorPair] {
        &self.values
    }

    #[inline]
    pub fn values_mut(&mut self) -> &mut [FluxErrorPair] {
        &mut self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate `(filter name, value)` pairs in filter order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FluxErrorPair)> {
        self.filters
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn get(&self, filter: &str) -> Option<&FluxErrorPair> {
        self.filters
            .iter()
            .position(|f| f == filter)
            .map(|i| &self.values[i])
    }

    /// True when both photometries list the same filters in the same order.
    pub fn same_filters(&self, other: &Photometry) -> bool {
        Arc::ptr_eq(&self.filters, &other.filters) || self.filters == other.filters
    }

    pub fn has_missing(&self) -> bool {
        self.values.iter().any(|v| v.missing)
    }

    pub fn has_upper_limit(&self) -> bool {
        self.values.iter().any(|v| v.upper_limit && !v.missing)
    }
}

/// Build a shared filter-name list.
pub fn shared_filters(filters: &[&str]) -> Arc<[String]> {
    filters.iter().map(|f| f.to_string()).collect()
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: SourceId,
    pub photometry: Photometry,
    /// Known redshift (calibration samples, spectroscopic priors).
    pub fixed_redshift: Option<f64>,
    /// Galactic E(B-V) along the line of sight.
    pub dust_column_density: Option<f64>,
    /// Per-filter bandpass shift, aligned with the photometry filters.
    pub filter_shifts: Option<Vec<f64>>,
}

impl Source {
    pub fn new(id: SourceId, photometry: Photometry) -> Self {
        Self {
            id,
            photometry,
            fixed_redshift: None,
            dust_column_density: None,
            filter_shifts: None,
        }
    }

    pub fn with_fixed_redshift(mut self, z: f64) -> Self {
        self.fixed_redshift = Some(z);
        self
    }

    pub fn with_dust_column_density(mut self, ebv: f64) -> Self {
        self.dust_column_density = Some(ebv);
        self
    }

    pub fn with_filter_shifts(mut self, shifts: Vec<f64>) -> Self {
        self.filter_shifts = Some(shifts);
        self
    }

    pub(crate) fn missing_attribute(&self, attribute: impl Into<String>) -> PhzError {
        PhzError::MissingRequiredAttribute {
            source_id: self.id,
            attribute: attribute.into(),
        }
    }
}

/// Return a copy of `source` whose fluxes are multiplied by their zero-point correction.
///
/// Missing bands are copied untouched. Every filter of the source must be present in
/// `corrections`.
///
/// Return
/// ----------
/// * `Err(PhzError::MissingRequiredAttribute)` naming the filter without a correction.
pub fn apply_photometric_correction(
    source: &Source,
    corrections: &PhotometricCorrectionMap,
) -> Result<Source, PhzError> {
    let mut corrected = source.clone();
    let filters = Arc::clone(corrected.photometry.filters());
    for (filter, value) in filters.iter().zip(corrected.photometry.values_mut()) {
        let factor = corrections.get(filter).ok_or_else(|| {
            source.missing_attribute(format!("photometric correction for filter {filter}"))
        })?;
        if !value.missing {
            value.flux *= factor;
        }
    }
    Ok(corrected)
}

/// Per-filter coefficients of the flux-error adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustErrorParams {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for AdjustErrorParams {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 0.0,
            gamma: 0.0,
        }
    }
}

/// Filter name → error adjustment coefficients.
pub type AdjustErrorParamMap = BTreeMap<String, AdjustErrorParams>;

/// Rescale the flux errors of `source` in place.
///
/// For a detected band with positive flux the new error is
/// `sqrt(alpha²·error² + (beta²·flux + gamma)·flux)`; non-detections and
/// non-positive fluxes only get `alpha·error`. Missing bands are left alone.
pub fn adjust_errors(source: &mut Source, params: &AdjustErrorParamMap) -> Result<(), PhzError> {
    let filters = Arc::clone(source.photometry.filters());
    let id = source.id;
    for (filter, value) in filters.iter().zip(source.photometry.values_mut()) {
        let p = params
            .get(filter)
            .ok_or_else(|| PhzError::MissingRequiredAttribute {
                source_id: id,
                attribute: format!("error adjustment parameters for filter {filter}"),
            })?;
        if value.missing {
            continue;
        }
        if value.upper_limit || value.flux <= 0.0 {
            value.error *= p.alpha;
        } else {
            let e2 = p.alpha * p.alpha * value.error * value.error
                + (p.beta * p.beta * value.flux + p.gamma) * value.flux;
            value.error = e2.sqrt();
        }
    }
    Ok(())
}

#[cfg(test)]
mod photometry_test {
    use super::*;
    use approx::assert_relative_eq;

    fn source() -> Source {
        let phot = Photometry::from_pairs(
            &["g", "r", "i"],
            vec![
                FluxErrorPair::new(2.0, 0.5),
                FluxErrorPair::missing(),
                FluxErrorPair::upper_limit(1.0, 0.2),
            ],
        )
        .unwrap();
        Source::new(7, phot)
    }

    #[test]
    fn correction_skips_missing_bands() {
        let corr: PhotometricCorrectionMap = [("g", 1.5), ("r", 3.0), ("i", 2.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let out = apply_photometric_correction(&source(), &corr).unwrap();
        let v = out.photometry.values();
        assert_relative_eq!(v[0].flux, 3.0);
        assert_eq!(v[1].flux, 0.0);
        assert!(v[1].missing);
        assert_relative_eq!(v[2].flux, 2.0);
        // the input is untouched
        assert_relative_eq!(source().photometry.values()[0].flux, 2.0);
    }

    #[test]
    fn correction_requires_every_filter() {
        let corr: PhotometricCorrectionMap = [("g".to_string(), 1.0)].into_iter().collect();
        let err = apply_photometric_correction(&source(), &corr).unwrap_err();
        assert_eq!(
            err,
            PhzError::MissingRequiredAttribute {
                source_id: 7,
                attribute: "photometric correction for filter r".into()
            }
        );
    }

    #[test]
    fn error_adjustment_recipe() {
        let params: AdjustErrorParamMap = ["g", "r", "i"]
            .into_iter()
            .map(|f| {
                (
                    f.to_string(),
                    AdjustErrorParams {
                        alpha: 2.0,
                        beta: 0.5,
                        gamma: 1.0,
                    },
                )
            })
            .collect();
        let mut s = source();
        adjust_errors(&mut s, &params).unwrap();
        let v = s.photometry.values();
        // sqrt(4·0.25 + (0.25·2 + 1)·2) = sqrt(1 + 3) = 2
        assert_relative_eq!(v[0].error, 2.0);
        assert_eq!(v[1].error, 0.0);
        assert_relative_eq!(v[2].error, 0.4);
    }

    #[test]
    fn photometry_length_mismatch_is_rejected() {
        let res = Photometry::from_pairs(&["g", "r"], vec![FluxErrorPair::new(1.0, 1.0)]);
        assert!(matches!(res, Err(PhzError::ConfigurationInconsistency(_))));

        let raw = RawPhotometry {
            filters: shared_filters(&["g", "r"]),
            values: vec![FluxErrorPair::new(1.0, 1.0)],
        };
        assert!(matches!(
            Photometry::try_from(raw),
            Err(PhzError::ConfigurationInconsistency(_))
        ));
    }
}
