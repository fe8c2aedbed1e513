use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Number of points per class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelHistogram {
    counts: Vec<u64>,
}

impl LabelHistogram {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![0; num_classes],
        }
    }

    pub fn from_labels(labels: &[u8], num_classes: usize) -> Result<Self> {
        let mut histogram = Self::new(num_classes);
        histogram.add_labels(labels)?;
        Ok(histogram)
    }

    pub fn from_counts(counts: Vec<u64>) -> Self {
        Self { counts }
    }

    pub fn add_labels(&mut self, labels: &[u8]) -> Result<()> {
        for label in labels {
            match self.counts.get_mut(*label as usize) {
                Some(count) => *count += 1,
                None => bail!(
                    "Label {} is out of range for a histogram over {} classes",
                    label,
                    self.counts.len()
                ),
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &LabelHistogram) -> Result<()> {
        if other.counts.len() != self.counts.len() {
            bail!(
                "Can't merge histograms over {} and {} classes",
                self.counts.len(),
                other.counts.len()
            );
        }
        for (count, other_count) in self.counts.iter_mut().zip(other.counts.iter()) {
            *count += *other_count;
        }
        Ok(())
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn probabilities(&self) -> Vec<f32> {
        let total = self.total() as f32;
        self.counts
            .iter()
            .map(|count| *count as f32 / total)
            .collect()
    }
}

/// Inverse-frequency class weights, `w[c] = (max(p) / p[c])^(1/3)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelWeights {
    weights: Vec<f32>,
}

impl LabelWeights {
    /// A class that never occurs gets a weight of `+inf`
    pub fn from_histogram(histogram: &LabelHistogram) -> Self {
        Self::from_probabilities(histogram.probabilities())
    }

    /// Like `from_histogram`, but every class probability is raised to at least `min_probability` before
    /// inverting, so all weights stay finite
    pub fn from_histogram_floored(histogram: &LabelHistogram, min_probability: f32) -> Self {
        let probabilities = histogram
            .probabilities()
            .into_iter()
            .map(|p| if p.is_nan() { min_probability } else { p.max(min_probability) })
            .collect();
        Self::from_probabilities(probabilities)
    }

    fn from_probabilities(probabilities: Vec<f32>) -> Self {
        let max = probabilities.iter().copied().fold(0.0_f32, f32::max);
        let weights = probabilities
            .iter()
            .map(|p| (max / p).powf(1.0 / 3.0))
            .collect();
        Self { weights }
    }

    /// Every class gets the same weight of 1
    pub fn uniform(num_classes: usize) -> Self {
        Self {
            weights: vec![1.0; num_classes],
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weight_of(&self, label: u8) -> f32 {
        self.weights.get(label as usize).copied().unwrap_or(0.0)
    }

    /// True if any weight is infinite or NaN, i.e. some class did not occur in the histogram
    pub fn has_degenerate(&self) -> bool {
        self.weights.iter().any(|w| !w.is_finite())
    }
}

pub fn compute_weights(labels: &[u8], num_classes: usize) -> Result<LabelWeights> {
    let histogram = LabelHistogram::from_labels(labels, num_classes)?;
    Ok(LabelWeights::from_histogram(&histogram))
}
