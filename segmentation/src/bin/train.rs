use std::{
    path::{Path, PathBuf},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use readers::get_all_las_files;
use segmentation::{
    config::{ExperimentConfig, ExperimentDirs},
    dataset::{open_dataset, SnapshotOptions},
    model::OptimizerKind,
    schema::GeometryFeature,
    training::Trainer,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory with the labelled LAS files for training
    rootdir: PathBuf,
    #[arg(long, help = "File name of a scan in rootdir that is held out from training and used for evaluation")]
    test_area: Option<String>,
    #[arg(long, help = "Directory with LAS files for evaluation, takes precedence over --test-area")]
    eval_dir: Option<PathBuf>,
    #[arg(long, short, help = "JSON experiment config, command line options override its values")]
    config: Option<PathBuf>,
    #[arg(long, default_value = "log")]
    exp_dir: PathBuf,
    #[arg(long, help = "Name of this run inside the experiment directory [default: current unix time]")]
    log_dir: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f32>,
    #[arg(long, help = "Adam or SGD")]
    optimizer: Option<String>,
    #[arg(long)]
    block_points: Option<usize>,
    #[arg(long)]
    sample_rate: Option<f64>,
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
    #[arg(long, help = "Dataset snapshot of the training scenes")]
    snapshot: Option<PathBuf>,
    #[arg(long, help = "Dataset snapshot of the evaluation scenes")]
    eval_snapshot: Option<PathBuf>,
    #[arg(long, default_value_t = false, help = "Load the datasets from their snapshots")]
    load: bool,
    #[arg(long, default_value_t = false, help = "Store the datasets as snapshots after reading them")]
    save: bool,
}

fn parse_optimizer(name: &str) -> Result<OptimizerKind> {
    match name.to_lowercase().as_str() {
        "adam" => Ok(OptimizerKind::Adam),
        "sgd" => Ok(OptimizerKind::Sgd),
        _ => bail!("Unknown optimizer {}, expected Adam or SGD", name),
    }
}

fn experiment_config(args: &Args) -> Result<ExperimentConfig> {
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.training.learning_rate = learning_rate;
    }
    if let Some(optimizer) = &args.optimizer {
        config.training.optimizer = parse_optimizer(optimizer)?;
    }
    if let Some(block_points) = args.block_points {
        config.tiling.block_points = block_points;
    }
    if let Some(sample_rate) = args.sample_rate {
        config.training.sample_rate = sample_rate;
    }
    if let Some(seed) = args.seed {
        config.training.seed = seed;
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
    config.tiling.validate()?;
    Ok(config)
}

fn split_files(args: &Args) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let all_files = get_all_las_files(&args.rootdir)?;
    let is_test_area = |file: &Path| {
        args.test_area
            .as_ref()
            .and_then(|area| file.file_name().map(|name| name.to_string_lossy() == area.as_str()))
            .unwrap_or(false)
    };
    let (test_files, train_files): (Vec<_>, Vec<_>) =
        all_files.into_iter().partition(|file| is_test_area(file));
    let eval_files = match &args.eval_dir {
        Some(dir) => get_all_las_files(dir)?,
        None => test_files,
    };
    Ok((train_files, eval_files))
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();
    let config = experiment_config(&args)?;

    let run_name = match &args.log_dir {
        Some(name) => name.clone(),
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("System time is before the unix epoch")?
            .as_secs()
            .to_string(),
    };
    let dirs = ExperimentDirs::new(args.exp_dir.join("sem_seg").join(run_name));
    dirs.create()?;
    config.store(dirs.config_file())?;
    info!("Experiment directory {}", dirs.root.display());
    info!("Parameters: {:?}", config);

    let (train_files, eval_files) = split_files(&args)?;
    if train_files.is_empty() && !args.load {
        bail!("No training files found in {}", args.rootdir.display());
    }

    let timer = Instant::now();
    info!("Start loading training data ...");
    let train = open_dataset(
        &train_files,
        config.tiling.clone(),
        &config.geometry,
        &SnapshotOptions {
            path: args.snapshot.clone(),
            load: args.load,
            save: args.save,
        },
    )
    .context("Failed to load training data")?;

    let eval = if eval_files.is_empty() && !(args.load && args.eval_snapshot.is_some()) {
        info!("No evaluation scenes, training without evaluation");
        None
    } else {
        info!("Start loading evaluation data ...");
        Some(
            open_dataset(
                &eval_files,
                config.tiling.clone(),
                &config.geometry,
                &SnapshotOptions {
                    path: args.eval_snapshot.clone(),
                    load: args.load && args.eval_snapshot.is_some(),
                    save: args.save && args.eval_snapshot.is_some(),
                },
            )
            .context("Failed to load evaluation data")?,
        )
    };
    info!("Loading data took {:.1}s", timer.elapsed().as_secs_f64());

    let trainer = Trainer::new(&config.training, &train, eval.as_ref(), dirs.checkpoints())?;
    info!("Loss weights: {:?}", trainer.loss_weights().as_slice());
    let (mut model, start_epoch, best_iou) = trainer.initial_state();
    let summaries = trainer.run(&mut model, start_epoch, best_iou)?;

    let best_epoch = summaries
        .iter()
        .max_by(|a, b| {
            let accuracy = |s: &segmentation::training::EpochSummary| {
                s.evaluation
                    .as_ref()
                    .map(|e| e.metrics.overall_accuracy())
                    .unwrap_or(s.accuracy)
            };
            accuracy(a).total_cmp(&accuracy(b))
        })
        .map(|s| s.epoch + 1);
    if let Some(best_epoch) = best_epoch {
        info!("Highest accuracy in epoch {}", best_epoch);
    }
    info!("Training took {:.1}s", timer.elapsed().as_secs_f64());

    Ok(())
}
