use std::{fmt::Display, path::PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use readers::write_labeled_points;
use serde::{Deserialize, Serialize};

use crate::{
    dataset::SceneDataset,
    metrics::{ConfusionAccumulator, IouTable},
    model::{BlockBatch, SegmentationModel},
    predictions::write_predictions,
    voting::VotePool,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub batch_size: usize,
    /// Number of full tilings per scene whose predictions are voted on
    pub num_votes: usize,
    pub seed: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_votes: 5,
            seed: 0,
        }
    }
}

/// Predicts a label for every point of one scene. Every vote tiles the scene anew, so the points that end up
/// together in a block differ between votes
pub fn predict_scene<M: SegmentationModel + ?Sized, R: Rng + ?Sized>(
    model: &M,
    dataset: &SceneDataset,
    scene_index: usize,
    config: &InferenceConfig,
    rng: &mut R,
) -> Result<Vec<u8>> {
    if config.num_votes == 0 {
        bail!("num_votes must be at least 1");
    }
    if config.batch_size == 0 {
        bail!("batch_size must be at least 1");
    }
    if model.input_channels() != dataset.schema().len() {
        bail!(
            "Model expects {} input channels, but the dataset provides {} ({})",
            model.input_channels(),
            dataset.schema().len(),
            dataset.schema()
        );
    }
    let scene = dataset.scene(scene_index)?;

    let mut pool = VotePool::new(scene.len(), model.num_classes());
    for vote in 0..config.num_votes {
        let blocks = dataset.full_tiling(scene_index, rng)?;
        for chunk in blocks.chunks(config.batch_size) {
            let batch = BlockBatch::from_blocks(chunk, config.batch_size)?;
            let predictions = model.predict(&batch)?;
            for (block_index, block) in chunk.iter().enumerate() {
                pool.add_block_votes(block, &predictions.argmax(block_index))?;
            }
        }
        debug!(
            "Vote {}/{} on scene {}: {} blocks",
            vote + 1,
            config.num_votes,
            scene.name(),
            blocks.len()
        );
    }
    if pool.skipped_votes() > 0 {
        debug!(
            "Skipped {} votes of points with zero or infinite weight in scene {}",
            pool.skipped_votes(),
            scene.name()
        );
    }
    pool.finalize()
}

/// Where per-scene predictions go. Text files are always written, LAS files on request
#[derive(Debug, Clone)]
pub struct PredictionOutput {
    pub dir: PathBuf,
    pub export_las: bool,
}

pub struct SceneResult {
    pub scene: String,
    pub metrics: ConfusionAccumulator,
}

/// Metrics of every scene and of all scenes together
pub struct EvaluationReport {
    pub scenes: Vec<SceneResult>,
    pub total: ConfusionAccumulator,
}

impl Display for EvaluationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for result in &self.scenes {
            writeln!(f, "Mean IoU of {}: {:.4}", result.scene, result.metrics.mean_iou())?;
        }
        write!(f, "{}", IouTable::new(&self.total))
    }
}

/// Predicts all scenes of `dataset` and compares the predictions with the scene labels. Every scene is reduced
/// into its own accumulator first, which is then merged into the total
pub fn evaluate_scenes<M: SegmentationModel + ?Sized>(
    model: &M,
    dataset: &SceneDataset,
    config: &InferenceConfig,
    output: Option<&PredictionOutput>,
) -> Result<EvaluationReport> {
    let mut total = ConfusionAccumulator::new(model.num_classes());
    let mut scenes = Vec::with_capacity(dataset.len());
    for (scene_index, scene) in dataset.scenes().iter().enumerate() {
        info!(
            "Inference [{}/{}] {} ...",
            scene_index + 1,
            dataset.len(),
            scene.name()
        );
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(scene_index as u64));
        let predicted = predict_scene(model, dataset, scene_index, config, &mut rng)
            .with_context(|| format!("Inference failed for scene {}", scene.name()))?;

        let mut shard = ConfusionAccumulator::new(model.num_classes());
        shard.accumulate(&predicted, scene.labels())?;
        info!("Mean IoU of {}: {:.4}", scene.name(), shard.mean_iou());

        if let Some(output) = output {
            write_predictions(output.dir.join(format!("{}.txt", scene.name())), &predicted)?;
            if output.export_las {
                write_labeled_points(
                    output.dir.join(format!("{}_pred.las", scene.name())),
                    scene.positions(),
                    &predicted,
                )?;
            }
        }

        total.merge(&shard)?;
        scenes.push(SceneResult {
            scene: scene.name().to_owned(),
            metrics: shard,
        });
    }
    Ok(EvaluationReport { scenes, total })
}
