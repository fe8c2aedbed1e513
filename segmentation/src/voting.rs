//! Per-point vote pool for multi-pass inference.
//!
//! Each inference pass over a scene's full tiling contributes one vote per block point. Padding points carry a
//! zero (or non-finite) sample weight and are left out of the tally. Once all passes are in, `finalize`
//! reduces every row of the pool to its arg-max class.

use anyhow::{bail, Result};

use crate::tiling::Block;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VoteState {
    Accumulating,
    Finalized,
}

#[derive(Debug, Clone)]
pub struct VotePool {
    num_points: usize,
    num_classes: usize,
    pool: Vec<u32>,
    state: VoteState,
    skipped_votes: u64,
}

impl VotePool {
    pub fn new(num_points: usize, num_classes: usize) -> Self {
        Self {
            num_points,
            num_classes,
            pool: vec![0; num_points * num_classes],
            state: VoteState::Accumulating,
            skipped_votes: 0,
        }
    }

    /// Clears the pool and resizes it for another scene
    pub fn reset(&mut self, num_points: usize, num_classes: usize) {
        self.num_points = num_points;
        self.num_classes = num_classes;
        self.pool.clear();
        self.pool.resize(num_points * num_classes, 0);
        self.state = VoteState::Accumulating;
        self.skipped_votes = 0;
    }

    pub fn state(&self) -> VoteState {
        self.state
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Number of entries that were ignored because of a zero or non-finite weight
    pub fn skipped_votes(&self) -> u64 {
        self.skipped_votes
    }

    /// Vote counts of a single point, one entry per class
    pub fn votes(&self, point: usize) -> Option<&[u32]> {
        if point >= self.num_points {
            return None;
        }
        let start = point * self.num_classes;
        Some(&self.pool[start..start + self.num_classes])
    }

    /// Adds one vote for `predicted[i]` to point `point_indices[i]`, unless `weights[i]` is zero or not finite.
    /// The whole call is validated before any vote is counted
    pub fn add_vote(&mut self, point_indices: &[usize], predicted: &[u8], weights: &[f32]) -> Result<()> {
        if self.state == VoteState::Finalized {
            bail!("Can't add votes to a finalized vote pool");
        }
        if point_indices.len() != predicted.len() || point_indices.len() != weights.len() {
            bail!(
                "Vote slices differ in length ({} indices, {} predictions, {} weights)",
                point_indices.len(),
                predicted.len(),
                weights.len()
            );
        }
        if let Some(idx) = point_indices.iter().find(|idx| **idx >= self.num_points) {
            bail!(
                "Point index {} is out of range for a pool over {} points",
                idx,
                self.num_points
            );
        }
        if let Some(class) = predicted
            .iter()
            .find(|class| **class as usize >= self.num_classes)
        {
            bail!(
                "Predicted class {} is out of range for a pool over {} classes",
                class,
                self.num_classes
            );
        }

        for ((point, class), weight) in point_indices.iter().zip(predicted.iter()).zip(weights.iter()) {
            if *weight == 0.0 || !weight.is_finite() {
                self.skipped_votes += 1;
                continue;
            }
            self.pool[point * self.num_classes + *class as usize] += 1;
        }
        Ok(())
    }

    pub fn add_block_votes(&mut self, block: &Block, predicted: &[u8]) -> Result<()> {
        self.add_vote(&block.original_indices, predicted, &block.sample_weights)
    }

    /// Sums the votes of another pool of the same shape into this one
    pub fn merge(&mut self, other: &VotePool) -> Result<()> {
        if self.state == VoteState::Finalized {
            bail!("Can't merge into a finalized vote pool");
        }
        if self.num_points != other.num_points || self.num_classes != other.num_classes {
            bail!(
                "Can't merge a vote pool of shape {}x{} into one of shape {}x{}",
                other.num_points,
                other.num_classes,
                self.num_points,
                self.num_classes
            );
        }
        for (votes, other_votes) in self.pool.iter_mut().zip(other.pool.iter()) {
            *votes += *other_votes;
        }
        self.skipped_votes += other.skipped_votes;
        Ok(())
    }

    /// Returns the class with the most votes for every point, the lowest class index wins ties. Points without
    /// any vote resolve to class 0
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        if self.state == VoteState::Finalized {
            bail!("Vote pool was already finalized");
        }
        self.state = VoteState::Finalized;
        if self.num_classes == 0 {
            bail!("Can't finalize a vote pool without classes");
        }

        Ok(self
            .pool
            .chunks_exact(self.num_classes)
            .map(|row| {
                let mut best = 0;
                for (class, votes) in row.iter().enumerate().skip(1) {
                    if *votes > row[best] {
                        best = class;
                    }
                }
                best as u8
            })
            .collect())
    }
}
