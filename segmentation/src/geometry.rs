//! Local geometry descriptors per point, computed from the eigenvalues of the scatter matrix of the point's
//! spherical neighbourhood.

use anyhow::{bail, Result};
use itertools::Itertools;
use log::{info, warn};
use pasture_core::nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    grid::{CellShape, SparseGrid},
    schema::GeometryFeature,
};

/// Row-major `rows x columns` matrix of per-point feature values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FeatureMatrixRecord")]
pub struct FeatureMatrix {
    rows: usize,
    columns: usize,
    data: Vec<f32>,
}

impl FeatureMatrix {
    pub fn new(rows: usize, columns: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * columns {
            bail!(
                "Feature matrix of shape {}x{} needs {} values, got {}",
                rows,
                columns,
                rows * columns,
                data.len()
            );
        }
        Ok(Self {
            rows,
            columns,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.columns..(index + 1) * self.columns]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Unchecked serialized layout of `FeatureMatrix`
#[derive(Deserialize)]
struct FeatureMatrixRecord {
    rows: usize,
    columns: usize,
    data: Vec<f32>,
}

impl TryFrom<FeatureMatrixRecord> for FeatureMatrix {
    type Error = anyhow::Error;

    fn try_from(record: FeatureMatrixRecord) -> Result<Self> {
        Self::new(record.rows, record.columns, record.data)
    }
}

pub struct GeometryOutput {
    pub features: FeatureMatrix,
    /// Points without any neighbour in range. Their features are all zero
    pub isolated_points: Vec<usize>,
}

pub trait GeometryFeatureProvider: Sync {
    /// Features produced by `compute`, in column order
    fn features(&self) -> &[GeometryFeature];
    fn compute(&self, positions: &[Vector3<f64>]) -> Result<GeometryOutput>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    pub enabled: bool,
    pub radius: f64,
    pub features: Vec<GeometryFeature>,
    /// Side length of the voxels that LAS files are thinned to on load, before any features are computed
    pub downsample_voxel: Option<f64>,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            radius: 0.8,
            features: GeometryFeature::ALL.to_vec(),
            downsample_voxel: None,
        }
    }
}

impl GeometryConfig {
    pub fn provider(&self) -> Option<PcaFeatureProvider> {
        if self.enabled {
            Some(PcaFeatureProvider::new(self.radius, self.features.clone()))
        } else {
            None
        }
    }
}

pub struct PcaFeatureProvider {
    radius: f64,
    features: Vec<GeometryFeature>,
}

impl PcaFeatureProvider {
    /// Repeated features are dropped, so the columns line up with `ChannelSchema::new(features)`
    pub fn new(radius: f64, features: Vec<GeometryFeature>) -> Self {
        let features = features.into_iter().unique().collect();
        Self { radius, features }
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }
}

/// Eigenvalues of the scatter matrix `sum (p - c)(p - c)^T` of the given points around their centroid `c`,
/// sorted descending. The scatter is not divided by the number of points
pub fn neighbourhood_eigenvalues(points: impl Iterator<Item = Vector3<f64>> + Clone) -> [f64; 3] {
    let (sum, count) = points
        .clone()
        .fold((Vector3::zeros(), 0_usize), |(sum, count), p| (sum + p, count + 1));
    if count == 0 {
        return [0.0; 3];
    }
    let centroid = sum / count as f64;
    let scatter = points.fold(Matrix3::zeros(), |scatter: Matrix3<f64>, p| {
        let d = p - centroid;
        scatter + d * d.transpose()
    });
    let mut eigenvalues = scatter
        .symmetric_eigenvalues()
        .iter()
        .map(|lambda| lambda.max(0.0))
        .collect::<Vec<_>>();
    eigenvalues.sort_by(|a, b| b.total_cmp(a));
    [eigenvalues[0], eigenvalues[1], eigenvalues[2]]
}

/// Value of `feature` for eigenvalues sorted descending. Degenerate neighbourhoods yield zero
pub fn feature_value(feature: GeometryFeature, eigenvalues: &[f64; 3]) -> f64 {
    let [l0, l1, l2] = *eigenvalues;
    let sum = l0 + l1 + l2;
    match feature {
        GeometryFeature::Planarity if l0 > 0.0 => (l1 - l2) / l0,
        GeometryFeature::Omnivariance => (l0 * l1 * l2).cbrt(),
        GeometryFeature::SurfaceVariation if sum > 0.0 => l2 / sum,
        _ => 0.0,
    }
}

impl GeometryFeatureProvider for PcaFeatureProvider {
    fn features(&self) -> &[GeometryFeature] {
        &self.features
    }

    fn compute(&self, positions: &[Vector3<f64>]) -> Result<GeometryOutput> {
        if self.radius <= 0.0 {
            bail!("Neighbourhood radius must be positive (got {})", self.radius);
        }
        let grid = SparseGrid::from_positions(positions, self.radius, CellShape::Cubes)?;

        let rows = positions
            .par_iter()
            .enumerate()
            .map(|(idx, position)| {
                let neighbours = grid.within_radius(positions, position, self.radius);
                if neighbours.len() < 2 {
                    return (idx, None);
                }
                let eigenvalues =
                    neighbourhood_eigenvalues(neighbours.iter().map(|n| positions[*n]));
                let row = self
                    .features
                    .iter()
                    .map(|feature| feature_value(*feature, &eigenvalues) as f32)
                    .collect::<Vec<_>>();
                (idx, Some(row))
            })
            .collect::<Vec<_>>();

        let columns = self.features.len();
        let mut data = Vec::with_capacity(positions.len() * columns);
        let mut isolated_points = vec![];
        for (idx, row) in rows {
            match row {
                Some(row) => data.extend(row),
                None => {
                    isolated_points.push(idx);
                    data.extend(std::iter::repeat(0.0).take(columns));
                }
            }
        }
        if !isolated_points.is_empty() {
            warn!(
                "{} of {} points have no neighbour within {}",
                isolated_points.len(),
                positions.len(),
                self.radius
            );
        }
        info!(
            "Computed {} geometry features for {} points",
            columns,
            positions.len()
        );

        Ok(GeometryOutput {
            features: FeatureMatrix::new(positions.len(), columns, data)?,
            isolated_points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_plane_is_planar() {
        let mut rng = StdRng::seed_from_u64(1);
        let points = (0..500)
            .map(|_| Vector3::new(rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), 0.0))
            .collect::<Vec<_>>();
        let eigenvalues = neighbourhood_eigenvalues(points.iter().copied());
        assert!(eigenvalues[0] >= eigenvalues[1] && eigenvalues[1] >= eigenvalues[2]);
        assert!(feature_value(GeometryFeature::Planarity, &eigenvalues) > 0.8);
        assert!(feature_value(GeometryFeature::SurfaceVariation, &eigenvalues) < 1e-6);
        assert!(feature_value(GeometryFeature::Omnivariance, &eigenvalues) / eigenvalues[0] < 1e-4);
    }

    #[test]
    fn test_line_is_not_planar() {
        let points = (0..100).map(|i| Vector3::new(i as f64 * 0.01, 0.0, 0.0));
        let eigenvalues = neighbourhood_eigenvalues(points);
        assert!(feature_value(GeometryFeature::Planarity, &eigenvalues) < 1e-6);
    }

    #[test]
    fn test_isolated_points_get_zero_features() -> Result<()> {
        let mut positions = (0..50)
            .map(|i| Vector3::new((i % 7) as f64 * 0.1, (i / 7) as f64 * 0.1, (i % 3) as f64 * 0.05))
            .collect::<Vec<_>>();
        positions.push(Vector3::new(100.0, 100.0, 100.0));

        let provider = PcaFeatureProvider::new(0.8, GeometryFeature::ALL.to_vec());
        let output = provider.compute(&positions)?;
        assert_eq!(output.features.rows(), 51);
        assert_eq!(output.features.columns(), 3);
        assert_eq!(output.isolated_points, vec![50]);
        assert_eq!(output.features.row(50), &[0.0, 0.0, 0.0]);
        assert!(output.features.row(0).iter().any(|v| *v != 0.0));
        Ok(())
    }

    #[test]
    fn test_tetrahedron_scatter_is_unnormalized() {
        let points = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ];
        let eigenvalues = neighbourhood_eigenvalues(points.iter().copied());
        for (actual, expected) in eigenvalues.iter().zip([1.0, 1.0, 0.25]) {
            assert!((actual - expected).abs() < 1e-9, "{:?}", eigenvalues);
        }
        let omnivariance = feature_value(GeometryFeature::Omnivariance, &eigenvalues);
        assert!((omnivariance - 0.25_f64.cbrt()).abs() < 1e-9);
        assert!((omnivariance - 0.63).abs() < 1e-3);
        assert!((feature_value(GeometryFeature::Planarity, &eigenvalues) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_repeated_features_yield_one_column() -> Result<()> {
        let provider = PcaFeatureProvider::new(
            0.8,
            vec![GeometryFeature::Planarity, GeometryFeature::Planarity],
        );
        assert_eq!(provider.features(), &[GeometryFeature::Planarity]);
        assert_eq!(
            crate::schema::ChannelSchema::new(provider.features()),
            crate::schema::ChannelSchema::new(&[GeometryFeature::Planarity, GeometryFeature::Planarity])
        );

        let positions = (0..20)
            .map(|i| Vector3::new((i % 5) as f64 * 0.1, (i / 5) as f64 * 0.1, 0.0))
            .collect::<Vec<_>>();
        let output = provider.compute(&positions)?;
        assert_eq!(output.features.columns(), 1);
        assert_eq!(output.features.data().len(), 20);
        Ok(())
    }

    #[test]
    fn test_feature_matrix_shape_is_checked() {
        assert!(FeatureMatrix::new(2, 3, vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_malformed_feature_matrix_is_not_deserialized() -> Result<()> {
        let valid = FeatureMatrix::new(2, 2, vec![0.5; 4])?;
        let bytes = bincode::serialize(&valid)?;
        assert_eq!(valid, bincode::deserialize::<FeatureMatrix>(&bytes)?);

        // Same layout as a matrix, but 5 values for a 2x3 shape
        let malformed = bincode::serialize(&(2_usize, 3_usize, vec![0.0_f32; 5]))?;
        assert!(bincode::deserialize::<FeatureMatrix>(&malformed).is_err());
        Ok(())
    }
}
