mod files;
mod labeled_points;

pub use self::files::*;
pub use self::labeled_points::*;

use pasture_core::nalgebra::Vector3;
use pasture_derive::PointType;

/// The attributes of a labelled scan point that survive a round trip through a LAS file
#[repr(C, packed)]
#[derive(
    PointType, Copy, Clone, Debug, Default, bytemuck::AnyBitPattern, bytemuck::NoUninit,
)]
pub struct Point {
    #[pasture(BUILTIN_POSITION_3D)]
    pub position: Vector3<f64>,
    #[pasture(BUILTIN_CLASSIFICATION)]
    pub classification: u8,
}
