//! Partitioning of a scene into blocks of exactly `block_points` points.
//!
//! Two modes exist. Sampling mode draws a single block around a random anchor point and is used for training.
//! Grid mode enumerates a regular grid of overlapping square footprints over the whole scene and turns every
//! occupied footprint into one or more blocks. Footprints are squares in the xy-plane and unbounded along z.
//! Both modes write the same channel layout, given by the `ChannelSchema`.

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use pasture_core::nalgebra::{Vector2, Vector3};
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::Scene,
    grid::{CellShape, SparseGrid},
    schema::ChannelSchema,
    weights::LabelWeights,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Number of points in every block
    pub block_points: usize,
    /// Side length of the square block footprint
    pub block_size: f64,
    /// Distance between neighbouring footprints in grid mode
    pub stride: f64,
    /// Footprints are grown by this amount in grid mode to keep points on the border
    pub padding: f64,
    /// A sampled footprint must contain more than this many points
    pub min_occupancy: usize,
    pub max_sampling_attempts: usize,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            block_points: 4096,
            block_size: 1.0,
            stride: 0.5,
            padding: 0.001,
            min_occupancy: 1024,
            max_sampling_attempts: 10_000,
        }
    }
}

impl TilingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_points == 0 {
            bail!("block_points must be at least 1");
        }
        if self.block_size <= 0.0 || !self.block_size.is_finite() {
            bail!("block_size must be positive (got {})", self.block_size);
        }
        if self.stride <= 0.0 || self.stride > self.block_size {
            bail!(
                "stride must be in (0, block_size] to cover the whole scene (got stride {} and block_size {})",
                self.stride,
                self.block_size
            );
        }
        if self.padding < 0.0 {
            bail!("padding must not be negative (got {})", self.padding);
        }
        if self.max_sampling_attempts == 0 {
            bail!("max_sampling_attempts must be at least 1");
        }
        Ok(())
    }
}

/// Fixed-size unit of model input. `points` holds `len() * num_channels` values, one row per point
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub points: Vec<f32>,
    pub num_channels: usize,
    pub labels: Vec<u8>,
    pub sample_weights: Vec<f32>,
    /// Index of every block point in its scene. Indices repeat when a footprint was oversampled
    pub original_indices: Vec<usize>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn point(&self, index: usize) -> &[f32] {
        &self.points[index * self.num_channels..(index + 1) * self.num_channels]
    }

    pub fn point_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.points[index * self.num_channels..(index + 1) * self.num_channels]
    }
}

/// One footprint of the inference grid together with the points that fall into it
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub ix: usize,
    pub iy: usize,
    pub min: Vector2<f64>,
    pub max: Vector2<f64>,
    /// Scene indices of the points within the padded footprint, ascending
    pub point_indices: Vec<usize>,
}

impl GridCell {
    pub fn center(&self) -> Vector2<f64> {
        (self.min + self.max) / 2.0
    }
}

/// Number of footprints along one axis so that the grid covers `extent`, including a trailing partial
/// footprint. Never less than one
pub fn grid_dimension(extent: f64, block_size: f64, stride: f64) -> usize {
    let cells = ((extent - block_size) / stride).ceil() + 1.0;
    if cells.is_finite() && cells > 1.0 {
        cells as usize
    } else {
        1
    }
}

/// Start and end of footprint `index` along one axis. The last footprints are pulled back inside the bounds
/// instead of overhanging them
fn footprint_range(min: f64, max: f64, index: usize, block_size: f64, stride: f64) -> (f64, f64) {
    let start = min + index as f64 * stride;
    let end = (start + block_size).min(max);
    (end - block_size, end)
}

/// Draws exactly `count` entries from `candidates`: without replacement if there are enough candidates, with
/// replacement otherwise
pub fn resample_indices<R: Rng + ?Sized>(candidates: &[usize], count: usize, rng: &mut R) -> Vec<usize> {
    if candidates.is_empty() {
        return vec![];
    }
    if candidates.len() >= count {
        rand::seq::index::sample(rng, candidates.len(), count)
            .into_iter()
            .map(|idx| candidates[idx])
            .collect()
    } else {
        (0..count)
            .map(|_| candidates[rng.gen_range(0..candidates.len())])
            .collect()
    }
}

/// Extends `indices` to the next multiple of `block_points` by repeating random entries of itself, then
/// shuffles the result. Repetitions are drawn without replacement as long as the deficit allows it
pub fn pad_and_shuffle<R: Rng + ?Sized>(
    mut indices: Vec<usize>,
    block_points: usize,
    rng: &mut R,
) -> Vec<usize> {
    if indices.is_empty() {
        return indices;
    }
    let num_blocks = (indices.len() + block_points - 1) / block_points;
    let deficit = num_blocks * block_points - indices.len();
    let padding = resample_indices(&indices, deficit, rng);
    indices.extend(padding);
    indices.shuffle(rng);
    indices
}

/// Cuts scenes into blocks. Borrows the tiling config and the channel schema of a dataset
pub struct BlockTiler<'a> {
    config: &'a TilingConfig,
    schema: &'a ChannelSchema,
}

impl<'a> BlockTiler<'a> {
    pub fn new(config: &'a TilingConfig, schema: &'a ChannelSchema) -> Self {
        Self { config, schema }
    }

    pub fn config(&self) -> &TilingConfig {
        self.config
    }

    /// Column index over the scene used for all footprint queries. Column width is the block size, so a
    /// footprint touches at most 3x3 columns
    pub fn column_index(&self, scene: &Scene) -> Result<SparseGrid> {
        SparseGrid::from_positions(scene.positions(), self.config.block_size, CellShape::Columns)
            .with_context(|| format!("Could not build column index for scene {}", scene.name()))
    }

    /// Sampling mode: draws random anchor points until the footprint around an anchor holds more than
    /// `min_occupancy` points, then resamples that footprint to exactly `block_points` points
    pub fn sample_block<R: Rng + ?Sized>(
        &self,
        scene: &Scene,
        index: &SparseGrid,
        weights: &LabelWeights,
        rng: &mut R,
    ) -> Result<Block> {
        let positions = scene.positions();
        if positions.len() <= self.config.min_occupancy {
            bail!(
                "Scene {} is too sparse for block size {}: it has {} points, but a block needs more than {}",
                scene.name(),
                self.config.block_size,
                positions.len(),
                self.config.min_occupancy
            );
        }

        let half_size = self.config.block_size / 2.0;
        for attempt in 0..self.config.max_sampling_attempts {
            let anchor = positions[rng.gen_range(0..positions.len())];
            let min = Vector3::new(anchor.x - half_size, anchor.y - half_size, anchor.z);
            let max = Vector3::new(anchor.x + half_size, anchor.y + half_size, anchor.z);
            let candidates = index.indices_in_box(positions, &min, &max);
            if candidates.len() <= self.config.min_occupancy {
                continue;
            }
            if attempt > 0 {
                debug!(
                    "Found block in scene {} after {} attempts",
                    scene.name(),
                    attempt + 1
                );
            }
            let selected = resample_indices(&candidates, self.config.block_points, rng);
            return self.assemble_block(scene, &selected, anchor.xy(), weights);
        }

        Err(anyhow!(
            "Scene {} is too sparse for block size {}: no footprint with more than {} points found in {} attempts",
            scene.name(),
            self.config.block_size,
            self.config.min_occupancy,
            self.config.max_sampling_attempts
        ))
    }

    /// All occupied footprints of the inference grid, y-major then x. Deterministic for a given scene
    pub fn grid_cells(&self, scene: &Scene, index: &SparseGrid) -> Vec<GridCell> {
        let bounds = scene.bounds();
        let (min, max) = (bounds.min(), bounds.max());
        let TilingConfig {
            block_size,
            stride,
            padding,
            ..
        } = *self.config;
        let grid_x = grid_dimension(max.x - min.x, block_size, stride);
        let grid_y = grid_dimension(max.y - min.y, block_size, stride);

        let mut cells = Vec::new();
        for iy in 0..grid_y {
            let (start_y, end_y) = footprint_range(min.y, max.y, iy, block_size, stride);
            for ix in 0..grid_x {
                let (start_x, end_x) = footprint_range(min.x, max.x, ix, block_size, stride);
                let point_indices = index.indices_in_box(
                    scene.positions(),
                    &Vector3::new(start_x - padding, start_y - padding, 0.0),
                    &Vector3::new(end_x + padding, end_y + padding, 0.0),
                );
                if point_indices.is_empty() {
                    continue;
                }
                cells.push(GridCell {
                    ix,
                    iy,
                    min: Vector2::new(start_x, start_y),
                    max: Vector2::new(end_x, end_y),
                    point_indices,
                });
            }
        }
        cells
    }

    /// Grid mode: turns every occupied footprint into `ceil(n / block_points)` blocks. The footprint's points
    /// are padded with random repetitions and shuffled, so randomness only decides which points share a block
    /// and which are repeated
    pub fn tile_scene<R: Rng + ?Sized>(
        &self,
        scene: &Scene,
        index: &SparseGrid,
        weights: &LabelWeights,
        rng: &mut R,
    ) -> Result<Vec<Block>> {
        let cells = self.grid_cells(scene, index);
        let mut blocks = Vec::new();
        for cell in cells {
            let center = cell.center();
            let indices = pad_and_shuffle(cell.point_indices, self.config.block_points, rng);
            for chunk in indices.chunks_exact(self.config.block_points) {
                blocks.push(self.assemble_block(scene, chunk, center, weights)?);
            }
        }
        debug!(
            "Tiled scene {} ({} points) into {} blocks",
            scene.name(),
            scene.len(),
            blocks.len()
        );
        Ok(blocks)
    }

    /// Builds a block from the given scene indices. x and y are made relative to `center`, z stays absolute.
    /// The global channels are the scene position divided by the maximum of the scene bounds
    pub fn assemble_block(
        &self,
        scene: &Scene,
        indices: &[usize],
        center: Vector2<f64>,
        weights: &LabelWeights,
    ) -> Result<Block> {
        let num_channels = self.schema.len();
        let num_features = self.schema.geometry_features().len();
        let scene_features = match (scene.features(), num_features) {
            (_, 0) => None,
            (Some(features), n) if features.columns() == n => Some(features),
            (Some(features), n) => bail!(
                "Scene {} has {} geometry features, but the channel schema expects {}",
                scene.name(),
                features.columns(),
                n
            ),
            (None, n) => bail!(
                "Scene {} has no geometry features, but the channel schema expects {}",
                scene.name(),
                n
            ),
        };

        let bounds_max = scene.bounds().max();
        let normalizer = |value: f64| if value == 0.0 { 1.0 } else { value };
        let norm = Vector3::new(
            normalizer(bounds_max.x),
            normalizer(bounds_max.y),
            normalizer(bounds_max.z),
        );

        let positions = scene.positions();
        let labels = scene.labels();
        let mut points = Vec::with_capacity(indices.len() * num_channels);
        let mut block_labels = Vec::with_capacity(indices.len());
        let mut sample_weights = Vec::with_capacity(indices.len());
        for idx in indices {
            let position = positions.get(*idx).ok_or_else(|| {
                anyhow!(
                    "Point index {} is out of range for scene {} with {} points",
                    idx,
                    scene.name(),
                    positions.len()
                )
            })?;
            points.extend_from_slice(&[
                (position.x - center.x) as f32,
                (position.y - center.y) as f32,
                position.z as f32,
                (position.x / norm.x) as f32,
                (position.y / norm.y) as f32,
                (position.z / norm.z) as f32,
            ]);
            if let Some(features) = scene_features {
                points.extend_from_slice(features.row(*idx));
            }
            let label = labels[*idx];
            block_labels.push(label);
            sample_weights.push(weights.weight_of(label));
        }

        Ok(Block {
            points,
            num_channels,
            labels: block_labels,
            sample_weights,
            original_indices: indices.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_grid_dimension() {
        assert_eq!(grid_dimension(10.0, 1.0, 0.5), 19);
        assert_eq!(grid_dimension(10.2, 1.0, 0.5), 20);
        assert_eq!(grid_dimension(1.0, 1.0, 0.5), 1);
        assert_eq!(grid_dimension(0.3, 1.0, 0.5), 1);
        assert_eq!(grid_dimension(0.0, 1.0, 0.5), 1);
    }

    #[test]
    fn test_trailing_footprint_is_pulled_inside() {
        let dims = grid_dimension(10.2, 1.0, 0.5);
        let (start, end) = footprint_range(0.0, 10.2, dims - 1, 1.0, 0.5);
        assert!((end - 10.2).abs() < 1e-12);
        assert!((start - 9.2).abs() < 1e-12);
        let (start, end) = footprint_range(0.0, 10.2, 3, 1.0, 0.5);
        assert_eq!((start, end), (1.5, 2.5));
    }

    #[test]
    fn test_resample_without_replacement_when_enough_candidates() {
        let mut rng = StdRng::seed_from_u64(3);
        let candidates = (100..200).collect::<Vec<_>>();
        let mut selected = resample_indices(&candidates, 60, &mut rng);
        assert_eq!(selected.len(), 60);
        selected.sort_unstable();
        selected.dedup();
        assert_eq!(selected.len(), 60);
        assert!(selected.iter().all(|idx| candidates.contains(idx)));
    }

    #[test]
    fn test_resample_with_replacement_when_too_few_candidates() {
        let mut rng = StdRng::seed_from_u64(4);
        let selected = resample_indices(&[7, 8, 9], 10, &mut rng);
        assert_eq!(selected.len(), 10);
        assert!(selected.iter().all(|idx| (7..=9).contains(idx)));
    }

    #[test]
    fn test_pad_and_shuffle_keeps_every_index() {
        let mut rng = StdRng::seed_from_u64(5);
        for count in [1, 5, 8, 9, 30] {
            let indices = (0..count).collect::<Vec<_>>();
            let padded = pad_and_shuffle(indices, 8, &mut rng);
            assert_eq!(padded.len() % 8, 0);
            assert_eq!(padded.len(), ((count + 7) / 8) * 8);
            for idx in 0..count {
                assert!(padded.contains(&idx), "Index {} was dropped", idx);
            }
        }
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = TilingConfig::default();
        assert!(config.validate().is_ok());
        config.stride = 2.0;
        assert!(config.validate().is_err());
        config = TilingConfig {
            block_points: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
