//! Reduction of per-source implied corrections to one value per filter.
use ahash::AHashMap;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::constants::PhotometricCorrectionMap;

/// One source's implied correction for one filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionSample {
    pub correction: f64,
    /// Signal-to-noise of the source in the filter.
    pub weight: f64,
}

impl CorrectionSample {
    pub fn new(correction: f64, weight: f64) -> Self {
        Self { correction, weight }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CorrectionSelector {
    #[default]
    Median,
    WeightedMedian,
    Mean,
    WeightedMean,
}

impl CorrectionSelector {
    /// Reduce the samples of a single filter; 1 when there is none.
    pub fn select(self, samples: &[CorrectionSample]) -> f64 {
        if samples.is_empty() {
            return 1.0;
        }
        match self {
            CorrectionSelector::Median => median(samples),
            CorrectionSelector::WeightedMedian => weighted_median(samples),
            CorrectionSelector::Mean => mean(samples),
            CorrectionSelector::WeightedMean => weighted_mean(samples),
        }
    }

    /// Reduce every filter of `filters`. Filters absent from `samples` get 1.
    pub fn select_all<'a>(
        self,
        filters: impl IntoIterator<Item = &'a String>,
        samples: &AHashMap<String, Vec<CorrectionSample>>,
    ) -> PhotometricCorrectionMap {
        filters
            .into_iter()
            .map(|f| {
                let value = samples.get(f).map_or(1.0, |s| self.select(s));
                (f.clone(), value)
            })
            .collect()
    }
}

fn sorted(samples: &[CorrectionSample]) -> Vec<CorrectionSample> {
    let mut sorted = samples.to_vec();
    sorted.sort_by_key(|s| OrderedFloat(s.correction));
    sorted
}

fn median(samples: &[CorrectionSample]) -> f64 {
    let sorted = sorted(samples);
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2].correction
    } else {
        0.5 * (sorted[n / 2 - 1].correction + sorted[n / 2].correction)
    }
}

/// First sorted value whose cumulative weight reaches half of the total.
fn weighted_median(samples: &[CorrectionSample]) -> f64 {
    let sorted = sorted(samples);
    let half = 0.5 * sorted.iter().map(|s| s.weight).sum::<f64>();
    let mut cumulative = 0.0;
    for s in &sorted {
        cumulative += s.weight;
        if cumulative >= half {
            return s.correction;
        }
    }
    // NaN weights
    median(samples)
}

fn mean(samples: &[CorrectionSample]) -> f64 {
    samples.iter().map(|s| s.correction).sum::<f64>() / samples.len() as f64
}

fn weighted_mean(samples: &[CorrectionSample]) -> f64 {
    let total: f64 = samples.iter().map(|s| s.weight).sum();
    if !(total > 0.0 && total.is_finite()) {
        return mean(samples);
    }
    samples.iter().map(|s| s.weight * s.correction).sum::<f64>() / total
}
