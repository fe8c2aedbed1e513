#![allow(dead_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use pasture_core::nalgebra::Vector3;
use rand::{rngs::StdRng, Rng, SeedableRng};
use segmentation::{
    dataset::{Scene, SceneDataset},
    geometry::FeatureMatrix,
    labels::NUM_CLASSES,
    model::{BlockBatch, Predictions, SegmentationModel},
    schema::{Channel, ChannelSchema, GeometryFeature},
    tiling::TilingConfig,
};

/// Raw classification code that maps to each class index
pub const RAW_CODE_OF_CLASS: [u8; NUM_CLASSES] = [1, 2, 3, 6, 13, 11, 7, 8];

/// Label of a point at height `z`: one class per meter, starting at z = 0
pub fn label_for_height(z: f64) -> u8 {
    (z.floor().max(0.0) as usize).min(NUM_CLASSES - 1) as u8
}

/// `count` random points in `[0, extent_x) x [0, extent_y) x [0, NUM_CLASSES)`, labelled by their height
pub fn gen_random_positions(
    count: usize,
    extent_x: f64,
    extent_y: f64,
    rng: &mut StdRng,
) -> (Vec<Vector3<f64>>, Vec<u8>) {
    let positions = (0..count)
        .map(|_| {
            Vector3::new(
                rng.gen_range(0.0..extent_x),
                rng.gen_range(0.0..extent_y),
                rng.gen_range(0.0..NUM_CLASSES as f64),
            )
        })
        .collect::<Vec<_>>();
    let labels = positions.iter().map(|p| label_for_height(p.z)).collect();
    (positions, labels)
}

pub fn gen_random_scene(name: &str, count: usize, extent_x: f64, extent_y: f64, seed: u64) -> Result<Scene> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (positions, labels) = gen_random_positions(count, extent_x, extent_y, &mut rng);
    Scene::new(name.to_owned(), positions, labels, None)
}

/// Like `gen_random_scene`, with random values for the given geometry features
pub fn gen_random_scene_with_features(
    name: &str,
    count: usize,
    features: &[GeometryFeature],
    seed: u64,
) -> Result<Scene> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (positions, labels) = gen_random_positions(count, 3.0, 2.0, &mut rng);
    let values = (0..count * features.len())
        .map(|_| rng.gen_range(0.0..1.0))
        .collect();
    let features = FeatureMatrix::new(count, features.len(), values)?;
    Scene::new(name.to_owned(), positions, labels, Some(features))
}

/// Tiling with small blocks so that tests stay fast
pub fn small_tiling() -> TilingConfig {
    TilingConfig {
        block_points: 64,
        min_occupancy: 16,
        ..Default::default()
    }
}

pub fn gen_random_dataset(num_scenes: usize, points_per_scene: usize, seed: u64) -> Result<SceneDataset> {
    let scenes = (0..num_scenes)
        .map(|idx| {
            gen_random_scene(
                &format!("scene_{}", idx),
                points_per_scene,
                3.0 + idx as f64,
                2.0,
                seed + idx as u64,
            )
        })
        .collect::<Result<Vec<_>>>()?;
    SceneDataset::new(scenes, small_tiling(), ChannelSchema::coordinates_only())
}

/// Model that knows the labelling rule of the generated scenes: it predicts the class from the local z channel,
/// which holds the absolute height
pub struct HeightModel {
    schema: ChannelSchema,
}

impl HeightModel {
    pub fn new(schema: ChannelSchema) -> Self {
        Self { schema }
    }
}

impl SegmentationModel for HeightModel {
    fn num_classes(&self) -> usize {
        NUM_CLASSES
    }

    fn input_channels(&self) -> usize {
        self.schema.len()
    }

    fn predict(&self, batch: &BlockBatch) -> Result<Predictions> {
        let z_channel = self
            .schema
            .index_of(Channel::LocalZ)
            .context("Schema without local z")?;
        let mut probabilities =
            vec![0.0; batch.batch_size() * batch.num_points() * NUM_CLASSES];
        for block in 0..batch.batch_size() {
            for (point, z) in batch.channel(block, z_channel).iter().enumerate() {
                let class = label_for_height(*z as f64) as usize;
                probabilities[(block * batch.num_points() + point) * NUM_CLASSES + class] = 1.0;
            }
        }
        Predictions::new(probabilities, batch.batch_size(), batch.num_points(), NUM_CLASSES)
    }
}

pub fn temp_dir(name: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("segmentation_{}_{}", name, std::process::id()));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Could not create temporary directory {}", dir.display()))?;
    Ok(dir)
}
