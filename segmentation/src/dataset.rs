use std::{fs::File, io::BufReader, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use human_repr::HumanCount;
use itertools::Itertools;
use log::{info, warn};
use pasture_core::{
    math::AABB,
    nalgebra::{Point3, Vector3},
};
use rand::Rng;
use rayon::prelude::*;
use readers::{read_labeled_points, scene_name};
use serde::{Deserialize, Serialize};

use crate::{
    geometry::{FeatureMatrix, GeometryFeatureProvider},
    grid::{bounds_of, voxel_downsample, SparseGrid},
    labels::{remap_all, CLASS_NAMES, NUM_CLASSES},
    schema::ChannelSchema,
    tiling::{Block, BlockTiler, TilingConfig},
    weights::{LabelHistogram, LabelWeights},
};

#[derive(Serialize, Deserialize)]
#[serde(remote = "AABB<f64>")]
struct AABBDeff64 {
    #[serde(getter = "AABB::min")]
    min: Point3<f64>,
    #[serde(getter = "AABB::max")]
    max: Point3<f64>,
}

impl From<AABBDeff64> for AABB<f64> {
    fn from(def: AABBDeff64) -> Self {
        AABB::<f64>::from_min_max_unchecked(def.min, def.max)
    }
}

/// All points of one scan with their class labels. The bounds are computed once on construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "SceneRecord")]
pub struct Scene {
    name: String,
    positions: Vec<Vector3<f64>>,
    labels: Vec<u8>,
    features: Option<FeatureMatrix>,
    #[serde(with = "AABBDeff64")]
    bounds: AABB<f64>,
}

impl Scene {
    pub fn new(
        name: String,
        positions: Vec<Vector3<f64>>,
        labels: Vec<u8>,
        features: Option<FeatureMatrix>,
    ) -> Result<Self> {
        let bounds = bounds_of(&positions).ok_or_else(|| anyhow!("Scene {} has no points", name))?;
        if labels.len() != positions.len() {
            bail!(
                "Scene {} has {} points but {} labels",
                name,
                positions.len(),
                labels.len()
            );
        }
        if let Some(features) = &features {
            if features.rows() != positions.len() {
                bail!(
                    "Scene {} has {} points but {} rows of geometry features",
                    name,
                    positions.len(),
                    features.rows()
                );
            }
        }
        if let Some((idx, label)) = labels
            .iter()
            .find_position(|label| **label as usize >= NUM_CLASSES)
        {
            bail!(
                "Label {} of point {} in scene {} is not a class index",
                label,
                idx,
                name
            );
        }
        Ok(Self {
            name,
            positions,
            labels,
            features,
            bounds,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn positions(&self) -> &[Vector3<f64>] {
        &self.positions
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    pub fn features(&self) -> Option<&FeatureMatrix> {
        self.features.as_ref()
    }

    pub fn bounds(&self) -> &AABB<f64> {
        &self.bounds
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Unchecked serialized layout of `Scene`. Deserialized scenes pass through `Scene::new` again
#[derive(Deserialize)]
struct SceneRecord {
    name: String,
    positions: Vec<Vector3<f64>>,
    labels: Vec<u8>,
    features: Option<FeatureMatrix>,
    #[serde(with = "AABBDeff64")]
    bounds: AABB<f64>,
}

impl TryFrom<SceneRecord> for Scene {
    type Error = anyhow::Error;

    fn try_from(record: SceneRecord) -> Result<Self> {
        let scene = Scene::new(record.name, record.positions, record.labels, record.features)?;
        if scene.bounds.min() != record.bounds.min() || scene.bounds.max() != record.bounds.max() {
            bail!(
                "Stored bounds of scene {} do not match its points",
                scene.name
            );
        }
        Ok(scene)
    }
}

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    tiling: TilingConfig,
    schema: ChannelSchema,
    label_weights: LabelWeights,
    scenes: Vec<Scene>,
}

/// The scenes of one split (training or test) together with everything needed to cut blocks from them
pub struct SceneDataset {
    scenes: Vec<Scene>,
    column_indices: Vec<SparseGrid>,
    tiling: TilingConfig,
    schema: ChannelSchema,
    histogram: LabelHistogram,
    label_weights: LabelWeights,
}

impl SceneDataset {
    pub fn new(scenes: Vec<Scene>, tiling: TilingConfig, schema: ChannelSchema) -> Result<Self> {
        Self::build(scenes, tiling, schema, None)
    }

    fn build(
        scenes: Vec<Scene>,
        tiling: TilingConfig,
        schema: ChannelSchema,
        label_weights: Option<LabelWeights>,
    ) -> Result<Self> {
        tiling.validate()?;
        let num_features = schema.geometry_features().len();
        for scene in &scenes {
            let scene_features = scene.features().map(|f| f.columns()).unwrap_or(0);
            if scene_features != num_features {
                bail!(
                    "Scene {} has {} geometry features, but the channel schema {} expects {}",
                    scene.name(),
                    scene_features,
                    schema,
                    num_features
                );
            }
        }

        let tiler = BlockTiler::new(&tiling, &schema);
        let column_indices = scenes
            .par_iter()
            .map(|scene| tiler.column_index(scene))
            .collect::<Result<Vec<_>>>()?;

        let mut histogram = LabelHistogram::new(NUM_CLASSES);
        for scene in &scenes {
            histogram.add_labels(scene.labels())?;
        }
        let label_weights =
            label_weights.unwrap_or_else(|| LabelWeights::from_histogram(&histogram));
        if label_weights.len() != NUM_CLASSES {
            bail!(
                "Got {} label weights for {} classes",
                label_weights.len(),
                NUM_CLASSES
            );
        }

        Ok(Self {
            scenes,
            column_indices,
            tiling,
            schema,
            histogram,
            label_weights,
        })
    }

    /// Reads the given LAS files in parallel and maps their classifications to class indices. Every scan is
    /// optionally thinned to one point per voxel of side `downsample_voxel`, then geometry features are optionally
    /// computed on the remaining points
    pub fn from_las_files<P: AsRef<Path> + Sync>(
        paths: &[P],
        tiling: TilingConfig,
        downsample_voxel: Option<f64>,
        geometry: Option<&dyn GeometryFeatureProvider>,
    ) -> Result<Self> {
        if paths.is_empty() {
            bail!("No LAS files given");
        }
        let scenes = paths
            .par_iter()
            .map(|path| -> Result<Scene> {
                let path = path.as_ref();
                let points = read_labeled_points(path)?;
                let labels = remap_all(&points.classifications)
                    .with_context(|| format!("Invalid classifications in {}", path.display()))?;
                let (positions, labels) = match downsample_voxel {
                    Some(voxel_size) => {
                        let kept = voxel_downsample(&points.positions, voxel_size).with_context(|| {
                            format!("Failed to downsample {}", path.display())
                        })?;
                        info!(
                            "Downsampled {} from {} to {} points",
                            path.display(),
                            points.positions.len().human_count_bare(),
                            kept.len().human_count_bare()
                        );
                        (
                            kept.iter().map(|idx| points.positions[*idx]).collect(),
                            kept.iter().map(|idx| labels[*idx]).collect(),
                        )
                    }
                    None => (points.positions, labels),
                };
                let features = match geometry {
                    Some(provider) => Some(
                        provider
                            .compute(&positions)
                            .with_context(|| {
                                format!("Failed to compute geometry features for {}", path.display())
                            })?
                            .features,
                    ),
                    None => None,
                };
                Scene::new(scene_name(path), positions, labels, features)
            })
            .collect::<Result<Vec<_>>>()?;

        let schema = match geometry {
            Some(provider) => ChannelSchema::new(provider.features()),
            None => ChannelSchema::coordinates_only(),
        };
        let dataset = Self::new(scenes, tiling, schema)?;
        dataset.log_summary();
        Ok(dataset)
    }

    pub fn log_summary(&self) {
        info!(
            "Dataset with {} scenes and {} points, channels {}",
            self.scenes.len(),
            self.num_points().human_count_bare(),
            self.schema
        );
        for (class, count) in self.histogram.counts().iter().enumerate() {
            info!(
                "  {:<10} {:>10} points, weight {:.3}",
                CLASS_NAMES[class],
                count.human_count_bare(),
                self.label_weights.as_slice()[class]
            );
        }
        if self.label_weights.has_degenerate() {
            warn!("Some classes do not occur in the dataset, their label weights are infinite");
        }
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn num_points(&self) -> usize {
        self.scenes.iter().map(|s| s.len()).sum()
    }

    pub fn scene(&self, index: usize) -> Result<&Scene> {
        self.scenes
            .get(index)
            .ok_or_else(|| anyhow!("Scene index {} out of range ({} scenes)", index, self.scenes.len()))
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn schema(&self) -> &ChannelSchema {
        &self.schema
    }

    pub fn tiling(&self) -> &TilingConfig {
        &self.tiling
    }

    pub fn label_weights(&self) -> &LabelWeights {
        &self.label_weights
    }

    pub fn label_histogram(&self) -> &LabelHistogram {
        &self.histogram
    }

    pub fn recompute_label_weights(&mut self) {
        self.label_weights = LabelWeights::from_histogram(&self.histogram);
    }

    /// Same scenes and label weights with a different tiling config
    pub fn retile(self, tiling: TilingConfig) -> Result<Self> {
        if tiling == self.tiling {
            return Ok(self);
        }
        Self::build(self.scenes, tiling, self.schema, Some(self.label_weights))
    }

    /// Random training block from scene `scene_index`. Every call draws a new block
    pub fn training_block<R: Rng + ?Sized>(&self, scene_index: usize, rng: &mut R) -> Result<Block> {
        let scene = self.scene(scene_index)?;
        BlockTiler::new(&self.tiling, &self.schema).sample_block(
            scene,
            &self.column_indices[scene_index],
            &self.label_weights,
            rng,
        )
    }

    /// All blocks of the inference grid over scene `scene_index`
    pub fn full_tiling<R: Rng + ?Sized>(&self, scene_index: usize, rng: &mut R) -> Result<Vec<Block>> {
        let scene = self.scene(scene_index)?;
        BlockTiler::new(&self.tiling, &self.schema).tile_scene(
            scene,
            &self.column_indices[scene_index],
            &self.label_weights,
            rng,
        )
    }

    /// Scene indices for one training epoch. Every scene appears in proportion to its share of all points, so
    /// that the epoch covers about `sample_rate` times the dataset's points
    pub fn sample_schedule(&self, sample_rate: f64) -> Vec<usize> {
        let total_points = self.num_points() as f64;
        let num_iterations =
            (total_points * sample_rate / self.tiling.block_points as f64).floor();
        self.scenes
            .iter()
            .enumerate()
            .flat_map(|(index, scene)| {
                let share = scene.len() as f64 / total_points;
                let repetitions = (share * num_iterations).round() as usize;
                std::iter::repeat(index).take(repetitions)
            })
            .collect()
    }

    /// Writes all scenes, the tiling config, the channel schema and the label weights into a single file
    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            tiling: &self.tiling,
            schema: &self.schema,
            label_weights: &self.label_weights,
            scenes: &self.scenes,
        };
        crate::config::write_atomically(path, |writer| {
            bincode::serialize_into(writer, &snapshot)
                .with_context(|| format!("Failed to serialize dataset snapshot {}", path.display()))
        })?;
        info!(
            "Stored snapshot of {} scenes in {}",
            self.scenes.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Could not open dataset snapshot {}", path.display()))?;
        let snapshot: Snapshot = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("Could not parse dataset snapshot {}", path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            bail!(
                "Dataset snapshot {} has version {}, expected version {}",
                path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }
        let dataset = Self::build(
            snapshot.scenes,
            snapshot.tiling,
            snapshot.schema,
            Some(snapshot.label_weights),
        )?;
        info!(
            "Loaded snapshot of {} scenes from {}",
            dataset.len(),
            path.display()
        );
        Ok(dataset)
    }
}

/// Whether a dataset is read from a snapshot instead of LAS files, and whether a freshly read dataset is stored
/// as a snapshot
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub path: Option<std::path::PathBuf>,
    pub load: bool,
    pub save: bool,
}

/// Loads the dataset from the snapshot if requested, otherwise reads the LAS files (and stores a snapshot if
/// requested)
pub fn open_dataset<P: AsRef<Path> + Sync>(
    files: &[P],
    tiling: TilingConfig,
    geometry: &crate::geometry::GeometryConfig,
    snapshot: &SnapshotOptions,
) -> Result<SceneDataset> {
    if snapshot.load {
        let path = snapshot
            .path
            .as_ref()
            .ok_or_else(|| anyhow!("Loading a snapshot requires a snapshot path"))?;
        let dataset = SceneDataset::load_snapshot(path)?;
        if dataset.tiling() != &tiling {
            info!("Snapshot {} was stored with another tiling config, retiling", path.display());
        }
        let dataset = dataset.retile(tiling)?;
        dataset.log_summary();
        return Ok(dataset);
    }

    let provider = geometry.provider();
    let dataset = SceneDataset::from_las_files(
        files,
        tiling,
        geometry.downsample_voxel,
        provider
            .as_ref()
            .map(|p| p as &dyn GeometryFeatureProvider),
    )?;
    if snapshot.save {
        let path = snapshot
            .path
            .as_ref()
            .ok_or_else(|| anyhow!("Saving a snapshot requires a snapshot path"))?;
        dataset.save_snapshot(path)?;
    }
    Ok(dataset)
}

/// Borrowing counterpart of `Snapshot`, serializes to the same bytes
#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    tiling: &'a TilingConfig,
    schema: &'a ChannelSchema,
    label_weights: &'a LabelWeights,
    scenes: &'a [Scene],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(name: &str, count: usize) -> Result<Scene> {
        let positions = (0..count)
            .map(|i| Vector3::new(i as f64, (i % 3) as f64, 1.0))
            .collect();
        Scene::new(name.to_owned(), positions, vec![0; count], None)
    }

    #[test]
    fn test_scene_bounds_are_exact() -> Result<()> {
        let scene = Scene::new(
            "bounds".to_owned(),
            vec![Vector3::new(1.0, -2.0, 3.0), Vector3::new(-1.0, 5.0, 0.5)],
            vec![0, 1],
            None,
        )?;
        assert_eq!(scene.bounds().min().coords, Vector3::new(-1.0, -2.0, 0.5));
        assert_eq!(scene.bounds().max().coords, Vector3::new(1.0, 5.0, 3.0));
        Ok(())
    }

    #[test]
    fn test_invalid_scenes() {
        assert!(Scene::new("empty".to_owned(), vec![], vec![], None).is_err());
        assert!(Scene::new("labels".to_owned(), vec![Vector3::zeros()], vec![0, 1], None).is_err());
        assert!(Scene::new("range".to_owned(), vec![Vector3::zeros()], vec![8], None).is_err());
    }

    #[test]
    fn test_sample_schedule_is_proportional() -> Result<()> {
        let tiling = TilingConfig {
            block_points: 10,
            ..Default::default()
        };
        let dataset = SceneDataset::new(
            vec![scene("small", 100)?, scene("large", 300)?],
            tiling,
            ChannelSchema::coordinates_only(),
        )?;
        let schedule = dataset.sample_schedule(1.0);
        assert_eq!(schedule.iter().filter(|idx| **idx == 0).count(), 10);
        assert_eq!(schedule.iter().filter(|idx| **idx == 1).count(), 30);
        assert_eq!(dataset.sample_schedule(0.5).len(), 20);
        Ok(())
    }

    #[test]
    fn test_feature_width_must_match_schema() -> Result<()> {
        let result = SceneDataset::new(
            vec![scene("plain", 10)?],
            TilingConfig::default(),
            ChannelSchema::new(&[crate::schema::GeometryFeature::Planarity]),
        );
        assert!(result.is_err());
        Ok(())
    }

    fn write_snapshot_of(dataset: &SceneDataset, name: &str) -> Result<std::path::PathBuf> {
        let dir = std::env::temp_dir().join("segmentation_dataset_tests");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        dataset.save_snapshot(&path)?;
        Ok(path)
    }

    #[test]
    fn test_snapshot_with_fewer_labels_than_points_is_rejected() -> Result<()> {
        let mut dataset = SceneDataset::new(
            vec![scene("short_labels", 50)?],
            TilingConfig::default(),
            ChannelSchema::coordinates_only(),
        )?;
        dataset.scenes[0].labels.truncate(10);
        let path = write_snapshot_of(&dataset, "short_labels.snapshot")?;
        let result = SceneDataset::load_snapshot(&path);
        std::fs::remove_file(&path)?;
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_snapshot_with_invalid_scene_contents_is_rejected() -> Result<()> {
        let mut out_of_range = SceneDataset::new(
            vec![scene("out_of_range", 20)?],
            TilingConfig::default(),
            ChannelSchema::coordinates_only(),
        )?;
        out_of_range.scenes[0].labels[3] = NUM_CLASSES as u8;
        let path = write_snapshot_of(&out_of_range, "out_of_range.snapshot")?;
        let result = SceneDataset::load_snapshot(&path);
        std::fs::remove_file(&path)?;
        assert!(result.is_err());

        let mut moved_bounds = SceneDataset::new(
            vec![scene("moved_bounds", 20)?],
            TilingConfig::default(),
            ChannelSchema::coordinates_only(),
        )?;
        moved_bounds.scenes[0].bounds = AABB::from_min_max_unchecked(
            Point3::new(-100.0, -100.0, -100.0),
            Point3::new(100.0, 100.0, 100.0),
        );
        let path = write_snapshot_of(&moved_bounds, "moved_bounds.snapshot")?;
        let result = SceneDataset::load_snapshot(&path);
        std::fs::remove_file(&path)?;
        assert!(result.is_err());

        let valid = SceneDataset::new(
            vec![scene("valid", 20)?],
            TilingConfig::default(),
            ChannelSchema::coordinates_only(),
        )?;
        let path = write_snapshot_of(&valid, "valid.snapshot")?;
        let result = SceneDataset::load_snapshot(&path);
        std::fs::remove_file(&path)?;
        assert_eq!(20, result?.num_points());
        Ok(())
    }
}
