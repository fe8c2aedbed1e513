use std::{fs::File, io::BufReader, path::Path};

use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{config::write_atomically, model::LinearSoftmaxModel, schema::ChannelSchema};

/// Model parameters and optimizer state after a given epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    /// Best mean IoU on the evaluation split so far, if there was an evaluation
    pub class_avg_iou: Option<f64>,
    pub schema: ChannelSchema,
    pub model: LinearSoftmaxModel,
}

impl Checkpoint {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        write_atomically(path, |writer| {
            bincode::serialize_into(writer, self)
                .with_context(|| format!("Failed to serialize checkpoint {}", path.display()))
        })?;
        info!("Saved checkpoint of epoch {} to {}", self.epoch, path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Could not open checkpoint {}", path.display()))?;
        bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("Could not parse checkpoint {}", path.display()))
    }

    /// Loads the checkpoint at `path` for resuming training. A missing or unreadable checkpoint, or one that
    /// was trained on other channels, is not an error: training then starts from scratch
    pub fn try_resume<P: AsRef<Path>>(path: P, schema: &ChannelSchema) -> Option<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No existing checkpoint at {}, starting training from scratch", path.display());
            return None;
        }
        match Self::load(path).and_then(|checkpoint| checkpoint.check_schema(schema).map(|_| checkpoint)) {
            Ok(checkpoint) => {
                info!(
                    "Resuming from checkpoint {} after epoch {}",
                    path.display(),
                    checkpoint.epoch
                );
                Some(checkpoint)
            }
            Err(why) => {
                warn!("Could not resume from checkpoint, starting training from scratch: {:#}", why);
                None
            }
        }
    }

    pub fn check_schema(&self, schema: &ChannelSchema) -> Result<()> {
        if &self.schema != schema {
            bail!(
                "Checkpoint was trained on channels {}, but the dataset provides {}",
                self.schema,
                schema
            );
        }
        Ok(())
    }
}
