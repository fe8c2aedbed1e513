use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use pasture_core::{
    containers::{BorrowedBuffer, BorrowedMutBuffer, OwningBuffer, VectorBuffer},
    layout::{
        attributes::{CLASSIFICATION, POSITION_3D},
        PointType,
    },
    nalgebra::Vector3,
};
use pasture_io::{
    base::{PointReader, PointWriter},
    las::{LASReader, LASWriter},
    las_rs::{Builder, Transform, Vector},
};

use crate::Point;

/// Positions (in world space) and raw classification codes of all points in a single scan file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabeledPoints {
    pub positions: Vec<Vector3<f64>>,
    pub classifications: Vec<u8>,
}

impl LabeledPoints {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Reads all points of the LAS file at `path`. Positions are converted into world space using the
/// scale and offset of the LAS header
pub fn read_labeled_points<P: AsRef<Path>>(path: P) -> Result<LabeledPoints> {
    let path = path.as_ref();
    let mut reader = LASReader::from_path(path, false)
        .with_context(|| format!("Can't open LAS file {}", path.display()))?;
    let point_count = reader.las_metadata().point_count();
    let points = reader
        .read::<VectorBuffer>(point_count)
        .with_context(|| format!("Error while reading points from LAS file {}", path.display()))?;
    if points.len() != point_count {
        bail!(
            "LAS file {} announces {} points but {} points could be read",
            path.display(),
            point_count,
            points.len()
        );
    }

    let positions_view = points.view_attribute::<Vector3<f64>>(&POSITION_3D);
    let classifications_view = points.view_attribute::<u8>(&CLASSIFICATION);
    let positions = (0..points.len())
        .map(|idx| positions_view.at(idx))
        .collect::<Vec<_>>();
    let classifications = (0..points.len())
        .map(|idx| classifications_view.at(idx))
        .collect::<Vec<_>>();

    debug!("Read {} points from {}", positions.len(), path.display());

    Ok(LabeledPoints {
        positions,
        classifications,
    })
}

/// Writes the given positions and classification codes into a new LAS file at `path`. Scale and offset of
/// the LAS header are derived from the bounds of the positions, at millimeter precision or coarser
pub fn write_labeled_points<P: AsRef<Path>>(
    path: P,
    positions: &[Vector3<f64>],
    classifications: &[u8],
) -> Result<()> {
    let path = path.as_ref();
    if positions.len() != classifications.len() {
        bail!(
            "Got {} positions but {} classifications",
            positions.len(),
            classifications.len()
        );
    }
    if positions.is_empty() {
        bail!("Refusing to write an empty LAS file {}", path.display());
    }

    let pos_max = Vector3::new(f64::MAX, f64::MAX, f64::MAX);
    let pos_min = Vector3::new(f64::MIN, f64::MIN, f64::MIN);
    let (min_position, max_position) = positions
        .iter()
        .fold((pos_max, pos_min), |state, pos| (state.0.inf(pos), state.1.sup(pos)));
    let max_extent = (max_position - min_position).max();
    let min_scale = max_extent / (i32::MAX as f64);
    // Round min_scale to higher next power of ten
    let mut scale = 10_f64.powf(min_scale.log10().ceil());
    // We clamp at millimeter precision to prevent underflows
    if !scale.is_finite() || scale < 0.001 {
        scale = 0.001;
    }

    let mut builder = Builder::from((1, 2));
    builder.transforms = Vector {
        x: Transform {
            offset: min_position.x,
            scale,
        },
        y: Transform {
            offset: min_position.y,
            scale,
        },
        z: Transform {
            offset: min_position.z,
            scale,
        },
    };
    let header = builder
        .into_header()
        .map_err(|why| anyhow!("Failed to build LAS header: {}", why))?;

    let mut buffer = VectorBuffer::with_capacity(positions.len(), Point::layout());
    for (position, classification) in positions.iter().zip(classifications.iter()) {
        buffer.view_mut().push_point(Point {
            position: *position,
            classification: *classification,
        });
    }

    let mut writer = LASWriter::from_path_and_header(path, header)
        .with_context(|| format!("Could not create LAS writer for {}", path.display()))?;
    writer.write(&buffer).context("Failed to write points")?;
    writer.flush().context("Failed to flush LAS writer")?;

    debug!("Wrote {} points to {}", positions.len(), path.display());
    Ok(())
}
