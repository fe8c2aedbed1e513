use std::{fmt::Display, str::FromStr};

use anyhow::{anyhow, Error, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Per-point descriptors derived from the eigenvalues of a local neighbourhood
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GeometryFeature {
    Planarity,
    Omnivariance,
    SurfaceVariation,
}

impl GeometryFeature {
    pub const ALL: [GeometryFeature; 3] = [
        GeometryFeature::Planarity,
        GeometryFeature::Omnivariance,
        GeometryFeature::SurfaceVariation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            GeometryFeature::Planarity => "planarity",
            GeometryFeature::Omnivariance => "omnivariance",
            GeometryFeature::SurfaceVariation => "surface_variation",
        }
    }
}

impl Display for GeometryFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Accepts the long names as well as the one-letter names `p`, `o` and `c`
impl FromStr for GeometryFeature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "p" | "planarity" => Ok(GeometryFeature::Planarity),
            "o" | "omnivariance" => Ok(GeometryFeature::Omnivariance),
            "c" | "curvature" | "surface_variation" => Ok(GeometryFeature::SurfaceVariation),
            other => Err(anyhow!("Unknown geometry feature \"{}\"", other)),
        }
    }
}

/// One input channel of a block
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    LocalX,
    LocalY,
    LocalZ,
    GlobalNormX,
    GlobalNormY,
    GlobalNormZ,
    Geometry(GeometryFeature),
}

impl Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::LocalX => write!(f, "local_x"),
            Channel::LocalY => write!(f, "local_y"),
            Channel::LocalZ => write!(f, "local_z"),
            Channel::GlobalNormX => write!(f, "global_norm_x"),
            Channel::GlobalNormY => write!(f, "global_norm_y"),
            Channel::GlobalNormZ => write!(f, "global_norm_z"),
            Channel::Geometry(feature) => write!(f, "{}", feature),
        }
    }
}

/// Ordered list of the channels of every point in a block. Models are built for one schema and checkpoints
/// remember it, so a dataset with different geometry features can't be fed into a model by accident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSchema {
    channels: Vec<Channel>,
}

impl ChannelSchema {
    pub const COORDINATE_CHANNELS: [Channel; 6] = [
        Channel::LocalX,
        Channel::LocalY,
        Channel::LocalZ,
        Channel::GlobalNormX,
        Channel::GlobalNormY,
        Channel::GlobalNormZ,
    ];

    /// Schema with the six coordinate channels followed by the given geometry features. Duplicate features
    /// are only added once
    pub fn new(geometry_features: &[GeometryFeature]) -> Self {
        let channels = Self::COORDINATE_CHANNELS
            .iter()
            .copied()
            .chain(
                geometry_features
                    .iter()
                    .copied()
                    .unique()
                    .map(Channel::Geometry),
            )
            .collect();
        Self { channels }
    }

    pub fn coordinates_only() -> Self {
        Self::new(&[])
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn index_of(&self, channel: Channel) -> Option<usize> {
        self.channels.iter().position(|c| *c == channel)
    }

    pub fn geometry_features(&self) -> Vec<GeometryFeature> {
        self.channels
            .iter()
            .filter_map(|channel| match channel {
                Channel::Geometry(feature) => Some(*feature),
                _ => None,
            })
            .collect()
    }
}

impl Display for ChannelSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.channels.iter().join(", "))
    }
}
