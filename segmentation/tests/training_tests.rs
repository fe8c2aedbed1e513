mod common;

use anyhow::Result;
use common::*;
use scopeguard::defer;
use segmentation::{
    checkpoint::Checkpoint,
    inference::{evaluate_scenes, InferenceConfig},
    model::OptimizerKind,
    training::{Trainer, TrainingConfig, BEST_MODEL_FILE, LATEST_MODEL_FILE},
};

fn smoke_config(epochs: usize) -> TrainingConfig {
    TrainingConfig {
        batch_size: 4,
        epochs,
        learning_rate: 0.01,
        checkpoint_every: 1,
        seed: 5,
        ..Default::default()
    }
}

#[test]
fn test_training_writes_checkpoints() -> Result<()> {
    let dir = temp_dir("training_checkpoints")?;
    let cleanup_dir = dir.clone();
    defer! {
        std::fs::remove_dir_all(&cleanup_dir).unwrap();
    }

    let train = gen_random_dataset(2, 600, 100)?;
    let eval = gen_random_dataset(1, 600, 200)?;
    let config = smoke_config(2);
    let trainer = Trainer::new(&config, &train, Some(&eval), dir.clone())?;
    let (mut model, start_epoch, best_iou) = trainer.initial_state();
    assert_eq!(0, start_epoch);
    assert_eq!(None, best_iou);

    let summaries = trainer.run(&mut model, start_epoch, best_iou)?;
    assert_eq!(2, summaries.len());
    for summary in &summaries {
        assert!(summary.mean_loss.is_finite());
        assert!((0.0..=1.0).contains(&summary.accuracy));
        let evaluation = summary.evaluation.as_ref().expect("evaluation summary");
        assert!(evaluation.mean_loss.is_finite());
        assert!(evaluation.metrics.total_seen() > 0);
    }

    let best = Checkpoint::load(dir.join(BEST_MODEL_FILE))?;
    assert!(best.class_avg_iou.is_some());
    assert_eq!(train.schema(), &best.schema);
    let latest = Checkpoint::load(dir.join(LATEST_MODEL_FILE))?;
    assert_eq!(2, latest.epoch);

    // The trained model can predict whole scenes
    let report = evaluate_scenes(&best.model, &eval, &InferenceConfig::default(), None)?;
    assert_eq!(600, report.total.total_seen());
    Ok(())
}

#[test]
fn test_training_resumes_from_best_checkpoint() -> Result<()> {
    let dir = temp_dir("training_resume")?;
    let cleanup_dir = dir.clone();
    defer! {
        std::fs::remove_dir_all(&cleanup_dir).unwrap();
    }

    let train = gen_random_dataset(2, 600, 300)?;
    let config = TrainingConfig {
        optimizer: OptimizerKind::Sgd,
        ..smoke_config(1)
    };
    let trainer = Trainer::new(&config, &train, None, dir.clone())?;
    let (mut model, start_epoch, best_iou) = trainer.initial_state();
    trainer.run(&mut model, start_epoch, best_iou)?;

    let longer = TrainingConfig {
        optimizer: OptimizerKind::Sgd,
        ..smoke_config(3)
    };
    let trainer = Trainer::new(&longer, &train, None, dir.clone())?;
    let (resumed, start_epoch, _) = trainer.initial_state();
    assert_eq!(1, start_epoch);
    assert_eq!(model, resumed);
    Ok(())
}

#[test]
fn test_unreadable_checkpoint_starts_fresh() -> Result<()> {
    let dir = temp_dir("training_corrupt")?;
    let cleanup_dir = dir.clone();
    defer! {
        std::fs::remove_dir_all(&cleanup_dir).unwrap();
    }

    std::fs::write(dir.join(BEST_MODEL_FILE), b"garbage")?;
    let train = gen_random_dataset(1, 600, 400)?;
    let config = smoke_config(1);
    let trainer = Trainer::new(&config, &train, None, dir.clone())?;
    let (_, start_epoch, best_iou) = trainer.initial_state();
    assert_eq!(0, start_epoch);
    assert_eq!(None, best_iou);
    Ok(())
}
