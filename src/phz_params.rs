//! # Run configuration
//!
//! [`PhzParams`] gathers the tunables of a fitting or calibration run: the bounded
//! scale-factor search, the non-detection treatment, PDF normalization and the
//! catalog scheduling (chunk size, worker count, progress cadence).
//!
//! Values are set through the validating [`PhzParamsBuilder`]:
//!
//! ```rust
//! use phzfit::phz_params::PhzParams;
//!
//! let params = PhzParams::builder()
//!     .workers(4)
//!     .chunk_size(1000)
//!     .fast_upper_limit(true)
//!     .build()
//!     .unwrap();
//! assert_eq!(params.workers, 4);
//! ```
//!
//! Validation rules
//! -----------------
//! * `scale_factor_accuracy > 0`, `scale_factor_max_iter ≥ 1`.
//! * `chunk_size ≥ 1`, `workers ≥ 1`.
//! * when scale-factor sampling is on: `samples ≥ 3`, `range_in_sigma > 0`.
//!
//! NaN is rejected wherever a float must be positive.
use std::fmt;
use std::thread;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_SCALE_FACTOR_ACCURACY, DEFAULT_SCALE_FACTOR_MAX_ITER,
};
use crate::likelihood::scale_factor::{ScaleFactorSampling, ScaleFactorSearch};
use crate::phz_errors::PhzError;

/// Tunables of a photo-z run.
///
/// See also
/// -----------------
/// * [`PhzParamsBuilder`] – validated construction.
/// * [`crate::catalog::CatalogProcessor`] – consumes the scheduling fields.
/// * [`crate::source_fit::SourceFitOrchestrator::with_params`] – consumes the fit fields.
#[derive(Debug, Clone, PartialEq)]
pub struct PhzParams {
    // --- Scale factor ---
    /// Relative accuracy of the bounded search on α.
    pub scale_factor_accuracy: f64,
    pub scale_factor_max_iter: usize,
    /// Sample the likelihood along the scale factor; off by default.
    pub scale_factor_sampling: Option<ScaleFactorSampling>,

    // --- Likelihood / output ---
    /// Use the step approximation for non-detections instead of the error function.
    pub fast_upper_limit: bool,
    /// Rescale every combined 1-D distribution to unit mass.
    pub normalize_pdfs: bool,
    /// Also produce the 1-D marginals of the likelihood, before priors.
    pub likelihood_pdfs: bool,

    // --- Scheduling ---
    /// Sources pulled from a reader per chunk.
    pub chunk_size: usize,
    pub workers: usize,
    /// Minimum delay between two progress callbacks.
    pub progress_interval: Duration,
}

impl PhzParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> PhzParamsBuilder {
        PhzParamsBuilder::new()
    }

    /// Scale-factor search settings derived from these parameters.
    pub fn scale_factor_search(&self) -> ScaleFactorSearch {
        ScaleFactorSearch {
            accuracy: self.scale_factor_accuracy,
            max_iter: self.scale_factor_max_iter,
        }
    }
}

impl Default for PhzParams {
    fn default() -> Self {
        PhzParams {
            scale_factor_accuracy: DEFAULT_SCALE_FACTOR_ACCURACY,
            scale_factor_max_iter: DEFAULT_SCALE_FACTOR_MAX_ITER,
            scale_factor_sampling: None,
            fast_upper_limit: false,
            normalize_pdfs: true,
            likelihood_pdfs: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// Builder for [`PhzParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct PhzParamsBuilder {
    params: PhzParams,
}

impl PhzParamsBuilder {
    pub fn new() -> Self {
        Self {
            params: PhzParams::default(),
        }
    }

    pub fn scale_factor_accuracy(mut self, v: f64) -> Self {
        self.params.scale_factor_accuracy = v;
        self
    }
    pub fn scale_factor_max_iter(mut self, v: usize) -> Self {
        self.params.scale_factor_max_iter = v;
        self
    }
    pub fn scale_factor_sampling(mut self, v: Option<ScaleFactorSampling>) -> Self {
        self.params.scale_factor_sampling = v;
        self
    }
    pub fn fast_upper_limit(mut self, v: bool) -> Self {
        self.params.fast_upper_limit = v;
        self
    }
    pub fn normalize_pdfs(mut self, v: bool) -> Self {
        self.params.normalize_pdfs = v;
        self
    }
    pub fn likelihood_pdfs(mut self, v: bool) -> Self {
        self.params.likelihood_pdfs = v;
        self
    }
    pub fn chunk_size(mut self, v: usize) -> Self {
        self.params.chunk_size = v;
        self
    }
    pub fn workers(mut self, v: usize) -> Self {
        self.params.workers = v;
        self
    }
    pub fn progress_interval(mut self, v: Duration) -> Self {
        self.params.progress_interval = v;
        self
    }

    #[inline]
    fn gt0(x: f64) -> bool {
        x.is_finite() && x > 0.0
    }

    /// Finalize the builder.
    ///
    /// Return
    /// ----------
    /// * `Ok(PhzParams)` when every field is valid.
    /// * `Err(PhzError::InvalidParameter)` naming the first offending field otherwise.
    pub fn build(self) -> Result<PhzParams, PhzError> {
        let p = &self.params;

        if !Self::gt0(p.scale_factor_accuracy) {
            return Err(PhzError::InvalidParameter(
                "scale_factor_accuracy must be > 0".into(),
            ));
        }
        if p.scale_factor_max_iter == 0 {
            return Err(PhzError::InvalidParameter(
                "scale_factor_max_iter must be >= 1".into(),
            ));
        }
        if let Some(sampling) = &p.scale_factor_sampling {
            if sampling.samples < 3 {
                return Err(PhzError::InvalidParameter(
                    "scale_factor_sampling.samples must be >= 3".into(),
                ));
            }
            if !Self::gt0(sampling.range_in_sigma) {
                return Err(PhzError::InvalidParameter(
                    "scale_factor_sampling.range_in_sigma must be > 0".into(),
                ));
            }
        }
        if p.chunk_size == 0 {
            return Err(PhzError::InvalidParameter("chunk_size must be >= 1".into()));
        }
        if p.workers == 0 {
            return Err(PhzError::InvalidParameter("workers must be >= 1".into()));
        }

        Ok(self.params)
    }
}

impl fmt::Display for PhzParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            const PARAM_COL: usize = 40;
            writeln!(f, "Photo-z Run Parameters")?;
            writeln!(f, "----------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = if s.len() < PARAM_COL {
                        " ".repeat(PARAM_COL - s.len())
                    } else {
                        " ".to_string()
                    };
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            writeln!(f, "[Scale factor]")?;
            line!(
                "scale_factor_accuracy = {:.1e}",
                self.scale_factor_accuracy,
                "Relative accuracy of the bounded search"
            )?;
            line!(
                "scale_factor_max_iter = {}",
                self.scale_factor_max_iter,
                "Search iteration cap"
            )?;
            match &self.scale_factor_sampling {
                Some(sampling) => line!(
                    "scale_factor_sampling = {}",
                    format!("{} x {} sigma", sampling.samples, sampling.range_in_sigma),
                    "Likelihood samples along the scale factor"
                )?,
                None => line!(
                    "scale_factor_sampling = {}",
                    "off",
                    "Likelihood samples along the scale factor"
                )?,
            }

            writeln!(f, "\n[Likelihood / output]")?;
            line!(
                "fast_upper_limit      = {}",
                self.fast_upper_limit,
                "Step approximation for non-detections"
            )?;
            line!(
                "normalize_pdfs        = {}",
                self.normalize_pdfs,
                "Unit-mass 1-D distributions"
            )?;
            line!(
                "likelihood_pdfs       = {}",
                self.likelihood_pdfs,
                "1-D marginals of the likelihood"
            )?;

            writeln!(f, "\n[Scheduling]")?;
            line!(
                "chunk_size            = {}",
                self.chunk_size,
                "Sources per chunk"
            )?;
            line!("workers               = {}", self.workers, "Worker threads")?;
            line!(
                "progress_interval     = {:?}",
                self.progress_interval,
                "Minimum delay between progress reports"
            )?;

            Ok(())
        } else {
            write!(
                f,
                "PhzParams(accuracy={:.1e}, max_iter={}, fast_upper_limit={}, normalize_pdfs={}, chunk_size={}, workers={})",
                self.scale_factor_accuracy,
                self.scale_factor_max_iter,
                self.fast_upper_limit,
                self.normalize_pdfs,
                self.chunk_size,
                self.workers,
            )
        }
    }
}
