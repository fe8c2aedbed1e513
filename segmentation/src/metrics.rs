use std::fmt::Display;

use anyhow::{bail, Result};

use crate::labels::CLASS_NAMES;

pub const EPSILON: f64 = 1e-6;

/// Per-class seen/correct/union counts, accumulated over any number of scenes. Accumulators of independent
/// shards can be summed with `merge`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionAccumulator {
    seen: Vec<u64>,
    correct: Vec<u64>,
    union: Vec<u64>,
}

impl ConfusionAccumulator {
    pub fn new(num_classes: usize) -> Self {
        Self {
            seen: vec![0; num_classes],
            correct: vec![0; num_classes],
            union: vec![0; num_classes],
        }
    }

    pub fn reset(&mut self) {
        self.seen.iter_mut().for_each(|c| *c = 0);
        self.correct.iter_mut().for_each(|c| *c = 0);
        self.union.iter_mut().for_each(|c| *c = 0);
    }

    pub fn num_classes(&self) -> usize {
        self.seen.len()
    }

    pub fn accumulate(&mut self, predicted: &[u8], ground_truth: &[u8]) -> Result<()> {
        if predicted.len() != ground_truth.len() {
            bail!(
                "Got {} predictions for {} ground truth labels",
                predicted.len(),
                ground_truth.len()
            );
        }
        let num_classes = self.num_classes();
        if let Some(class) = predicted
            .iter()
            .chain(ground_truth.iter())
            .find(|class| **class as usize >= num_classes)
        {
            bail!("Class {} is out of range (expected < {})", class, num_classes);
        }

        for (pred, truth) in predicted.iter().zip(ground_truth.iter()) {
            let pred = *pred as usize;
            let truth = *truth as usize;
            self.seen[truth] += 1;
            self.union[truth] += 1;
            if pred == truth {
                self.correct[truth] += 1;
            } else {
                self.union[pred] += 1;
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &ConfusionAccumulator) -> Result<()> {
        if other.num_classes() != self.num_classes() {
            bail!(
                "Can't merge metrics over {} classes into metrics over {} classes",
                other.num_classes(),
                self.num_classes()
            );
        }
        let pairs = self
            .seen
            .iter_mut()
            .zip(other.seen.iter())
            .chain(self.correct.iter_mut().zip(other.correct.iter()))
            .chain(self.union.iter_mut().zip(other.union.iter()));
        for (count, other_count) in pairs {
            *count += *other_count;
        }
        Ok(())
    }

    pub fn seen(&self) -> &[u64] {
        &self.seen
    }

    pub fn correct(&self) -> &[u64] {
        &self.correct
    }

    pub fn union(&self) -> &[u64] {
        &self.union
    }

    pub fn total_seen(&self) -> u64 {
        self.seen.iter().sum()
    }

    /// IoU of one class, `None` if the class was neither predicted nor present
    pub fn class_iou(&self, class: usize) -> Option<f64> {
        match self.union.get(class) {
            Some(union) if *union > 0 => Some(self.correct[class] as f64 / (*union as f64 + EPSILON)),
            _ => None,
        }
    }

    /// Mean IoU over the classes that occur in the ground truth. Classes that were never seen are left out
    /// instead of counting as zero
    pub fn mean_iou(&self) -> f64 {
        let ious = (0..self.num_classes())
            .filter(|class| self.seen[*class] > 0)
            .map(|class| self.correct[class] as f64 / (self.union[class] as f64 + EPSILON))
            .collect::<Vec<_>>();
        if ious.is_empty() {
            return 0.0;
        }
        ious.iter().sum::<f64>() / ious.len() as f64
    }

    pub fn overall_accuracy(&self) -> f64 {
        let correct = self.correct.iter().sum::<u64>() as f64;
        correct / (self.total_seen() as f64 + EPSILON)
    }

    /// Mean of the per-class accuracies over the classes that occur in the ground truth
    pub fn mean_class_accuracy(&self) -> f64 {
        let accuracies = (0..self.num_classes())
            .filter(|class| self.seen[*class] > 0)
            .map(|class| self.correct[class] as f64 / (self.seen[class] as f64 + EPSILON))
            .collect::<Vec<_>>();
        if accuracies.is_empty() {
            return 0.0;
        }
        accuracies.iter().sum::<f64>() / accuracies.len() as f64
    }
}

/// Display adapter printing the per-class IoU table, optionally together with one weight per class
pub struct IouTable<'a> {
    metrics: &'a ConfusionAccumulator,
    weights: Option<&'a [f32]>,
}

impl<'a> IouTable<'a> {
    pub fn new(metrics: &'a ConfusionAccumulator) -> Self {
        Self {
            metrics,
            weights: None,
        }
    }

    pub fn with_weights(mut self, weights: &'a [f32]) -> Self {
        self.weights = Some(weights);
        self
    }
}

impl Display for IouTable<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "------- IoU --------")?;
        for class in 0..self.metrics.num_classes() {
            let name = CLASS_NAMES.get(class).copied().unwrap_or("unknown");
            let iou = self.metrics.class_iou(class).unwrap_or(0.0);
            match self.weights {
                Some(weights) => writeln!(
                    f,
                    "class {:<14} weight: {:.3}, IoU: {:.3}",
                    name,
                    weights.get(class).copied().unwrap_or(0.0),
                    iou
                )?,
                None => writeln!(f, "class {:<14} IoU: {:.3}", name, iou)?,
            }
        }
        writeln!(f, "mean IoU: {:.4}", self.metrics.mean_iou())?;
        writeln!(f, "accuracy: {:.4}", self.metrics.overall_accuracy())?;
        write!(f, "mean class accuracy: {:.4}", self.metrics.mean_class_accuracy())
    }
}
