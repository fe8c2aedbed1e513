use std::{path::PathBuf, time::Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use readers::get_all_las_files;
use segmentation::{
    checkpoint::Checkpoint,
    config::{ExperimentConfig, ExperimentDirs},
    dataset::{open_dataset, SnapshotOptions},
    inference::{evaluate_scenes, PredictionOutput},
    schema::GeometryFeature,
    training::BEST_MODEL_FILE,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory with the labelled LAS files to predict
    rootdir: PathBuf,
    #[arg(long, help = "Name of the training run inside the experiment directory")]
    log_dir: String,
    #[arg(long, default_value = "log")]
    exp_dir: PathBuf,
    #[arg(long, help = "Only predict this file of rootdir")]
    test_area: Option<String>,
    #[arg(long, short, help = "JSON experiment config [default: the config stored with the training run]")]
    config: Option<PathBuf>,
    #[arg(long, default_value = BEST_MODEL_FILE, help = "Checkpoint file inside the run's checkpoint directory")]
    model: String,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    num_votes: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    calculate_geometry: bool,
    #[arg(long, value_delimiter = ',', help = "Geometry features to compute, e.g. p,o,c")]
    geometry_features: Option<Vec<GeometryFeature>>,
    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = "0.05",
        help = "Thin every scan to one point per voxel of this side length before computing features"
    )]
    downsample: Option<f64>,
    #[arg(long, default_value_t = false, help = "Also write the predictions as LAS files")]
    export_las: bool,
    #[arg(long)]
    snapshot: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    load: bool,
    #[arg(long, default_value_t = false)]
    save: bool,
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();
    let dirs = ExperimentDirs::new(args.exp_dir.join("sem_seg").join(&args.log_dir));
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::load(path)?,
        None if dirs.config_file().exists() => ExperimentConfig::load(dirs.config_file())?,
        None => ExperimentConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config.inference.batch_size = batch_size;
    }
    if let Some(num_votes) = args.num_votes {
        config.inference.num_votes = num_votes;
    }
    if let Some(seed) = args.seed {
        config.inference.seed = seed;
    }
    if args.calculate_geometry {
        config.geometry.enabled = true;
    }
    if let Some(features) = &args.geometry_features {
        config.geometry.features = features.clone();
    }
    if let Some(voxel_size) = args.downsample {
        config.geometry.downsample_voxel = Some(voxel_size);
    }

    let checkpoint_path = dirs.checkpoints().join(&args.model);
    let checkpoint = Checkpoint::load(&checkpoint_path)
        .with_context(|| format!("Inference needs a trained model at {}", checkpoint_path.display()))?;
    info!(
        "Loaded model of epoch {} from {}",
        checkpoint.epoch,
        checkpoint_path.display()
    );

    let mut files = get_all_las_files(&args.rootdir)?;
    if let Some(area) = &args.test_area {
        files.retain(|file| {
            file.file_name()
                .map(|name| name.to_string_lossy() == area.as_str())
                .unwrap_or(false)
        });
    }
    if files.is_empty() && !args.load {
        bail!("No LAS files to predict in {}", args.rootdir.display());
    }

    let timer = Instant::now();
    let dataset = open_dataset(
        &files,
        config.tiling.clone(),
        &config.geometry,
        &SnapshotOptions {
            path: args.snapshot.clone(),
            load: args.load,
            save: args.save,
        },
    )
    .context("Failed to load test data")?;
    checkpoint.check_schema(dataset.schema())?;
    info!("Loading data took {:.1}s", timer.elapsed().as_secs_f64());

    dirs.create()?;
    let output = PredictionOutput {
        dir: dirs.predictions(),
        export_las: args.export_las,
    };
    info!("---- EVALUATION WHOLE SCENE ----");
    let report = evaluate_scenes(&checkpoint.model, &dataset, &config.inference, Some(&output))?;
    info!("\n{}", report);
    info!(
        "Wrote predictions of {} scenes to {} in {:.1}s",
        report.scenes.len(),
        output.dir.display(),
        timer.elapsed().as_secs_f64()
    );

    Ok(())
}
