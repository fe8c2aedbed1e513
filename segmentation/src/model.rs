//! Interface between blocks and a segmentation model, and a per-point linear softmax classifier as baseline.
//!
//! Models consume batches in channel-major layout `[B][C][K]` and produce class probabilities per point in
//! layout `[B][K][num_classes]`.

use anyhow::{bail, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::tiling::Block;

/// Channel-major batch of blocks. Batches are always `batch_size` blocks large, missing blocks are zero
#[derive(Debug, Clone)]
pub struct BlockBatch {
    data: Vec<f32>,
    batch_size: usize,
    num_channels: usize,
    num_points: usize,
    real_size: usize,
}

impl BlockBatch {
    pub fn from_blocks(blocks: &[Block], batch_size: usize) -> Result<Self> {
        if blocks.is_empty() {
            bail!("Can't build a batch without blocks");
        }
        if blocks.len() > batch_size {
            bail!(
                "Got {} blocks for a batch of size {}",
                blocks.len(),
                batch_size
            );
        }
        let num_channels = blocks[0].num_channels;
        let num_points = blocks[0].len();
        if let Some(block) = blocks
            .iter()
            .find(|b| b.num_channels != num_channels || b.len() != num_points)
        {
            bail!(
                "Blocks in a batch must have the same shape, found {}x{} and {}x{}",
                num_points,
                num_channels,
                block.len(),
                block.num_channels
            );
        }

        let mut data = vec![0.0; batch_size * num_channels * num_points];
        for (b, block) in blocks.iter().enumerate() {
            let block_offset = b * num_channels * num_points;
            for k in 0..num_points {
                for (c, value) in block.point(k).iter().enumerate() {
                    data[block_offset + c * num_points + k] = *value;
                }
            }
        }

        Ok(Self {
            data,
            batch_size,
            num_channels,
            num_points,
            real_size: blocks.len(),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of blocks in the batch that are not zero padding
    pub fn real_size(&self) -> usize {
        self.real_size
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn value(&self, block: usize, channel: usize, point: usize) -> f32 {
        self.data[(block * self.num_channels + channel) * self.num_points + point]
    }

    /// All values of one channel of one block
    pub fn channel(&self, block: usize, channel: usize) -> &[f32] {
        let start = (block * self.num_channels + channel) * self.num_points;
        &self.data[start..start + self.num_points]
    }

    fn point_features(&self, block: usize, point: usize) -> impl Iterator<Item = f32> + Clone + '_ {
        (0..self.num_channels).map(move |c| self.value(block, c, point))
    }
}

/// Class probabilities for every point of every block in a batch
#[derive(Debug, Clone)]
pub struct Predictions {
    probabilities: Vec<f32>,
    batch_size: usize,
    num_points: usize,
    num_classes: usize,
}

impl Predictions {
    pub fn new(
        probabilities: Vec<f32>,
        batch_size: usize,
        num_points: usize,
        num_classes: usize,
    ) -> Result<Self> {
        if probabilities.len() != batch_size * num_points * num_classes {
            bail!(
                "Predictions of shape {}x{}x{} need {} values, got {}",
                batch_size,
                num_points,
                num_classes,
                batch_size * num_points * num_classes,
                probabilities.len()
            );
        }
        Ok(Self {
            probabilities,
            batch_size,
            num_points,
            num_classes,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn probabilities(&self, block: usize, point: usize) -> &[f32] {
        let start = (block * self.num_points + point) * self.num_classes;
        &self.probabilities[start..start + self.num_classes]
    }

    /// Most probable class of every point of one block, lowest class on ties
    pub fn argmax(&self, block: usize) -> Vec<u8> {
        (0..self.num_points)
            .map(|point| {
                let probabilities = self.probabilities(block, point);
                let mut best = 0;
                for (class, p) in probabilities.iter().enumerate().skip(1) {
                    if *p > probabilities[best] {
                        best = class;
                    }
                }
                best as u8
            })
            .collect()
    }
}

/// Class-weighted cross entropy of the first `labels.len() / num_points` blocks of `predictions`,
/// `sum(w[y] * -ln p[y]) / sum(w[y])`
pub fn weighted_cross_entropy(
    predictions: &Predictions,
    labels: &[u8],
    class_weights: &[f32],
) -> Result<f32> {
    let num_points = predictions.num_points;
    if labels.len() % num_points.max(1) != 0 || labels.len() / num_points.max(1) > predictions.batch_size {
        bail!(
            "{} labels don't fit predictions for {} blocks of {} points",
            labels.len(),
            predictions.batch_size,
            num_points
        );
    }
    let mut loss = 0.0_f64;
    let mut total_weight = 0.0_f64;
    for (idx, label) in labels.iter().enumerate() {
        if *label as usize >= predictions.num_classes {
            bail!("Label {} is out of range", label);
        }
        let weight = class_weights.get(*label as usize).copied().unwrap_or(0.0) as f64;
        let p = predictions.probabilities(idx / num_points, idx % num_points)[*label as usize];
        loss -= weight * (p.max(f32::MIN_POSITIVE) as f64).ln();
        total_weight += weight;
    }
    if total_weight <= 0.0 || !total_weight.is_finite() {
        bail!("Sum of loss weights is {}, can't normalize the loss", total_weight);
    }
    Ok((loss / total_weight) as f32)
}

pub trait SegmentationModel {
    fn num_classes(&self) -> usize;
    fn input_channels(&self) -> usize;
    fn predict(&self, batch: &BlockBatch) -> Result<Predictions>;
}

pub trait TrainableModel: SegmentationModel {
    /// One optimization step on the real blocks of `batch`. `labels` holds `real_size * num_points` labels in
    /// block order. Returns the class-weighted cross entropy before the step
    fn train_step(
        &mut self,
        batch: &BlockBatch,
        labels: &[u8],
        class_weights: &[f32],
        learning_rate: f32,
    ) -> Result<f32>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum OptimizerState {
    Adam {
        first_moment: Vec<f32>,
        second_moment: Vec<f32>,
        step: u64,
        weight_decay: f32,
    },
    Sgd {
        velocity: Vec<f32>,
        momentum: f32,
    },
}

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPSILON: f32 = 1e-8;
const SGD_MOMENTUM: f32 = 0.9;

impl OptimizerState {
    fn new(kind: OptimizerKind, num_parameters: usize, weight_decay: f32) -> Self {
        match kind {
            OptimizerKind::Adam => OptimizerState::Adam {
                first_moment: vec![0.0; num_parameters],
                second_moment: vec![0.0; num_parameters],
                step: 0,
                weight_decay,
            },
            OptimizerKind::Sgd => OptimizerState::Sgd {
                velocity: vec![0.0; num_parameters],
                momentum: SGD_MOMENTUM,
            },
        }
    }

    fn apply(&mut self, parameters: &mut [f32], gradients: &[f32], learning_rate: f32) {
        match self {
            OptimizerState::Adam {
                first_moment,
                second_moment,
                step,
                weight_decay,
            } => {
                *step += 1;
                let bias1 = 1.0 - ADAM_BETA1.powi(*step as i32);
                let bias2 = 1.0 - ADAM_BETA2.powi(*step as i32);
                for (idx, parameter) in parameters.iter_mut().enumerate() {
                    let g = gradients[idx] + *weight_decay * *parameter;
                    first_moment[idx] = ADAM_BETA1 * first_moment[idx] + (1.0 - ADAM_BETA1) * g;
                    second_moment[idx] = ADAM_BETA2 * second_moment[idx] + (1.0 - ADAM_BETA2) * g * g;
                    let m = first_moment[idx] / bias1;
                    let v = second_moment[idx] / bias2;
                    *parameter -= learning_rate * m / (v.sqrt() + ADAM_EPSILON);
                }
            }
            OptimizerState::Sgd { velocity, momentum } => {
                for (idx, parameter) in parameters.iter_mut().enumerate() {
                    velocity[idx] = *momentum * velocity[idx] + gradients[idx];
                    *parameter -= learning_rate * velocity[idx];
                }
            }
        }
    }
}

/// Per-point linear map from the input channels to class scores, followed by a softmax. Parameters are stored
/// as `num_classes` rows of `input_channels` weights, followed by one bias per class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSoftmaxModel {
    input_channels: usize,
    num_classes: usize,
    parameters: Vec<f32>,
    optimizer: OptimizerState,
}

impl LinearSoftmaxModel {
    pub fn new<R: Rng + ?Sized>(
        input_channels: usize,
        num_classes: usize,
        optimizer: OptimizerKind,
        weight_decay: f32,
        rng: &mut R,
    ) -> Self {
        let limit = (6.0 / (input_channels + num_classes) as f32).sqrt();
        let num_weights = input_channels * num_classes;
        let parameters = (0..num_weights + num_classes)
            .map(|idx| {
                if idx < num_weights {
                    rng.gen_range(-limit..limit)
                } else {
                    0.0
                }
            })
            .collect::<Vec<_>>();
        let optimizer = OptimizerState::new(optimizer, parameters.len(), weight_decay);
        Self {
            input_channels,
            num_classes,
            parameters,
            optimizer,
        }
    }

    pub fn optimizer_kind(&self) -> OptimizerKind {
        match self.optimizer {
            OptimizerState::Adam { .. } => OptimizerKind::Adam,
            OptimizerState::Sgd { .. } => OptimizerKind::Sgd,
        }
    }

    fn check_batch(&self, batch: &BlockBatch) -> Result<()> {
        if batch.num_channels() != self.input_channels {
            bail!(
                "Model expects {} input channels, but the batch has {}",
                self.input_channels,
                batch.num_channels()
            );
        }
        Ok(())
    }

    /// Softmax of the class scores of one point, written into `out`
    fn point_probabilities(&self, features: impl Iterator<Item = f32> + Clone, out: &mut [f32]) {
        let num_weights = self.input_channels * self.num_classes;
        for (class, score) in out.iter_mut().enumerate() {
            let row = &self.parameters[class * self.input_channels..(class + 1) * self.input_channels];
            *score = row
                .iter()
                .zip(features.clone())
                .map(|(w, x)| w * x)
                .sum::<f32>()
                + self.parameters[num_weights + class];
        }
        let max = out.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for score in out.iter_mut() {
            *score = (*score - max).exp();
            sum += *score;
        }
        for score in out.iter_mut() {
            *score /= sum;
        }
    }
}

impl SegmentationModel for LinearSoftmaxModel {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn input_channels(&self) -> usize {
        self.input_channels
    }

    fn predict(&self, batch: &BlockBatch) -> Result<Predictions> {
        self.check_batch(batch)?;
        let num_points = batch.num_points();
        let mut probabilities = vec![0.0; batch.batch_size() * num_points * self.num_classes];
        for (idx, out) in probabilities.chunks_exact_mut(self.num_classes).enumerate() {
            let (block, point) = (idx / num_points, idx % num_points);
            self.point_probabilities(batch.point_features(block, point), out);
        }
        Predictions::new(probabilities, batch.batch_size(), num_points, self.num_classes)
    }
}

impl TrainableModel for LinearSoftmaxModel {
    fn train_step(
        &mut self,
        batch: &BlockBatch,
        labels: &[u8],
        class_weights: &[f32],
        learning_rate: f32,
    ) -> Result<f32> {
        self.check_batch(batch)?;
        let num_points = batch.num_points();
        if labels.len() != batch.real_size() * num_points {
            bail!(
                "Expected {} labels for {} blocks, got {}",
                batch.real_size() * num_points,
                batch.real_size(),
                labels.len()
            );
        }
        if class_weights.len() != self.num_classes {
            bail!(
                "Expected {} class weights, got {}",
                self.num_classes,
                class_weights.len()
            );
        }
        if let Some(label) = labels.iter().find(|l| **l as usize >= self.num_classes) {
            bail!("Label {} is out of range", label);
        }

        let total_weight = labels
            .iter()
            .map(|l| class_weights[*l as usize] as f64)
            .sum::<f64>();
        if total_weight <= 0.0 || !total_weight.is_finite() {
            bail!("Sum of loss weights is {}, can't normalize the loss", total_weight);
        }

        let num_weights = self.input_channels * self.num_classes;
        let mut gradients = vec![0.0_f32; self.parameters.len()];
        let mut probabilities = vec![0.0_f32; self.num_classes];
        let mut loss = 0.0_f64;
        for (idx, label) in labels.iter().enumerate() {
            let (block, point) = (idx / num_points, idx % num_points);
            let label = *label as usize;
            let weight = class_weights[label];
            self.point_probabilities(batch.point_features(block, point), &mut probabilities);
            loss -= weight as f64 * (probabilities[label].max(f32::MIN_POSITIVE) as f64).ln();

            let scale = weight / total_weight as f32;
            for class in 0..self.num_classes {
                let target = if class == label { 1.0 } else { 0.0 };
                let delta = scale * (probabilities[class] - target);
                for (c, x) in batch.point_features(block, point).enumerate() {
                    gradients[class * self.input_channels + c] += delta * x;
                }
                gradients[num_weights + class] += delta;
            }
        }

        self.optimizer
            .apply(&mut self.parameters, &gradients, learning_rate);
        Ok((loss / total_weight) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn block(rng: &mut StdRng, num_points: usize) -> Block {
        let mut points = Vec::with_capacity(num_points * 2);
        let mut labels = Vec::with_capacity(num_points);
        for _ in 0..num_points {
            let x: f32 = rng.gen_range(-1.0..1.0);
            points.extend_from_slice(&[x, rng.gen_range(-1.0..1.0)]);
            labels.push(u8::from(x > 0.0));
        }
        Block {
            points,
            num_channels: 2,
            labels,
            sample_weights: vec![1.0; num_points],
            original_indices: (0..num_points).collect(),
        }
    }

    #[test]
    fn test_batch_is_channel_major_and_padded() -> Result<()> {
        let block = Block {
            points: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            num_channels: 3,
            labels: vec![0, 0],
            sample_weights: vec![1.0; 2],
            original_indices: vec![0, 1],
        };
        let batch = BlockBatch::from_blocks(&[block], 2)?;
        assert_eq!(batch.real_size(), 1);
        assert_eq!(batch.channel(0, 0), &[1.0, 4.0]);
        assert_eq!(batch.channel(0, 2), &[3.0, 6.0]);
        assert_eq!(batch.channel(1, 1), &[0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_probabilities_sum_to_one() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let model = LinearSoftmaxModel::new(2, 4, OptimizerKind::Adam, 0.0, &mut rng);
        let batch = BlockBatch::from_blocks(&[block(&mut rng, 16)], 1)?;
        let predictions = model.predict(&batch)?;
        for point in 0..16 {
            let sum = predictions.probabilities(0, point).iter().sum::<f32>();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        assert_eq!(predictions.argmax(0).len(), 16);
        Ok(())
    }

    #[test]
    fn test_training_separates_classes() -> Result<()> {
        for optimizer in [OptimizerKind::Adam, OptimizerKind::Sgd] {
            let mut rng = StdRng::seed_from_u64(9);
            let mut model = LinearSoftmaxModel::new(2, 2, optimizer, 0.0, &mut rng);
            let blocks = (0..4).map(|_| block(&mut rng, 64)).collect::<Vec<_>>();
            let batch = BlockBatch::from_blocks(&blocks, 4)?;
            let labels = blocks.iter().flat_map(|b| b.labels.clone()).collect::<Vec<_>>();

            let first_loss = model.train_step(&batch, &labels, &[1.0, 1.0], 0.05)?;
            let mut last_loss = first_loss;
            for _ in 0..200 {
                last_loss = model.train_step(&batch, &labels, &[1.0, 1.0], 0.05)?;
            }
            assert!(
                last_loss < first_loss * 0.5,
                "Loss of {:?} went from {} to {}",
                optimizer,
                first_loss,
                last_loss
            );

            let predictions = model.predict(&batch)?;
            let correct = (0..4)
                .flat_map(|b| predictions.argmax(b))
                .zip(labels.iter())
                .filter(|(p, l)| p == *l)
                .count();
            assert!(correct as f64 / labels.len() as f64 > 0.9);
        }
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_rejected() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut model = LinearSoftmaxModel::new(3, 2, OptimizerKind::Sgd, 0.0, &mut rng);
        let batch = BlockBatch::from_blocks(&[block(&mut rng, 8)], 1)?;
        assert!(model.predict(&batch).is_err());
        assert!(model.train_step(&batch, &[0; 8], &[1.0, 1.0], 0.1).is_err());
        Ok(())
    }
}
