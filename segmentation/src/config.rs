use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    geometry::GeometryConfig, inference::InferenceConfig, tiling::TilingConfig,
    training::TrainingConfig,
};

/// All settings of a training or inference run. Missing sections and fields fall back to their defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub tiling: TilingConfig,
    pub geometry: GeometryConfig,
    pub training: TrainingConfig,
    pub inference: InferenceConfig,
}

impl ExperimentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: ExperimentConfig =
            serde_json::from_reader(BufReader::new(File::open(path).with_context(|| {
                format!("Could not open experiment config file {}", path.display())
            })?))
            .with_context(|| format!("Could not parse experiment config {}", path.display()))?;
        config.tiling.validate()?;
        Ok(config)
    }

    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_atomically(path.as_ref(), |writer| {
            serde_json::to_writer_pretty(writer, self).context("Failed to serialize experiment config")
        })
    }
}

/// Directory layout of one experiment: `<root>/checkpoints` for model files, `<root>/predictions` for
/// per-scene outputs
#[derive(Debug, Clone)]
pub struct ExperimentDirs {
    pub root: PathBuf,
}

impl ExperimentDirs {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn checkpoints(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn predictions(&self) -> PathBuf {
        self.root.join("predictions")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn create(&self) -> Result<()> {
        for dir in [self.checkpoints(), self.predictions()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Writes a file through `write` into a temporary sibling of `path`, then moves it over `path`. A failed write
/// leaves an existing file at `path` untouched
pub fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("Path {} does not name a file", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut writer = BufWriter::new(
        File::create(&tmp_path)
            .with_context(|| format!("Failed to create temporary file {}", tmp_path.display()))?,
    );
    write(&mut writer)?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush temporary file {}", tmp_path.display()))?;
    drop(writer);

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to overwrite existing file {}", path.display()))?;
    Ok(())
}
