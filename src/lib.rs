//! Template-fitting photometric redshift engine.
//!
//! A source's multi-band photometry is compared with every cell of a model grid
//! (redshift × E(B-V) × reddening curve × SED), per parameter-space region. The
//! result is a best-fitting model and 1-D distributions of the model parameters.
//! The same machinery calibrates the per-filter zero points on sources with known
//! redshift.
//!
//! * [`grid`] – the model grid and its binary file format.
//! * [`likelihood`] – chi-square, scale factor and non-detection handling.
//! * [`region_fit`] – the per-region pipeline (priors, best fit, marginals).
//! * [`source_fit`] – per-source orchestration over every region.
//! * [`catalog`] – chunked and parallel catalog processing.
//! * [`calibration`] – the zero-point calibration loop.
pub mod calibration;
pub mod catalog;
pub mod constants;
pub mod grid;
pub mod likelihood;
pub mod photometry;
pub mod phz_errors;
pub mod phz_params;
pub mod region_fit;
pub mod source_fit;
