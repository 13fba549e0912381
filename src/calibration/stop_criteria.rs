//! Stop criteria of the calibration loop.
//!
//! A criterion is asked before every iteration, with the number of iterations already
//! completed and the current correction map. The loop runs while it answers `false`.
use crate::constants::PhotometricCorrectionMap;

pub trait StopCriterion {
    fn should_stop(&mut self, completed: usize, corrections: &PhotometricCorrectionMap) -> bool;
}

impl<F> StopCriterion for F
where
    F: FnMut(usize, &PhotometricCorrectionMap) -> bool,
{
    fn should_stop(&mut self, completed: usize, corrections: &PhotometricCorrectionMap) -> bool {
        self(completed, corrections)
    }
}

#[inline]
fn ceiling_reached(completed: usize, max_iterations: i64) -> bool {
    usize::try_from(max_iterations).is_ok_and(|max| completed >= max)
}

/// Stop after a fixed number of iterations. A negative ceiling never stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxIterations(pub i64);

impl StopCriterion for MaxIterations {
    fn should_stop(&mut self, completed: usize, _: &PhotometricCorrectionMap) -> bool {
        ceiling_reached(completed, self.0)
    }
}

/// Stop once no filter moved by `tolerance` or more since the previous check, or on
/// the iteration ceiling (negative for none).
#[derive(Debug, Clone, PartialEq)]
pub struct Tolerance {
    tolerance: f64,
    max_iterations: i64,
    previous: Option<PhotometricCorrectionMap>,
}

impl Tolerance {
    pub fn new(tolerance: f64, max_iterations: i64) -> Self {
        Self {
            tolerance,
            max_iterations,
            previous: None,
        }
    }
}

impl StopCriterion for Tolerance {
    fn should_stop(&mut self, completed: usize, corrections: &PhotometricCorrectionMap) -> bool {
        if ceiling_reached(completed, self.max_iterations) {
            return true;
        }
        let converged = self.previous.as_ref().is_some_and(|previous| {
            corrections.iter().all(|(filter, value)| {
                previous
                    .get(filter)
                    .is_some_and(|p| (value - p).abs() < self.tolerance)
            })
        });
        self.previous = Some(corrections.clone());
        converged
    }
}
