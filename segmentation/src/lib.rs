extern crate serde;

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod geometry;
pub mod grid;
pub mod inference;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod predictions;
pub mod schema;
pub mod tiling;
pub mod training;
pub mod voting;
pub mod weights;
