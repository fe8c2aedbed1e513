mod common;

use anyhow::Result;
use common::*;
use rand::{rngs::StdRng, SeedableRng};
use readers::{get_all_las_files, write_labeled_points};
use scopeguard::defer;
use segmentation::{
    dataset::{open_dataset, SceneDataset, SnapshotOptions},
    geometry::{GeometryConfig, GeometryFeatureProvider, PcaFeatureProvider},
    labels::NUM_CLASSES,
    schema::GeometryFeature,
};

fn write_scans(dir: &std::path::Path, count: usize) -> Result<Vec<Vec<u8>>> {
    let mut expected_labels = vec![];
    for idx in 0..count {
        let mut rng = StdRng::seed_from_u64(idx as u64);
        let (positions, labels) = gen_random_positions(500, 3.0, 2.0, &mut rng);
        let raw_codes = labels
            .iter()
            .map(|label| RAW_CODE_OF_CLASS[*label as usize])
            .collect::<Vec<_>>();
        write_labeled_points(dir.join(format!("scan_{}.las", idx)), &positions, &raw_codes)?;
        expected_labels.push(labels);
    }
    Ok(expected_labels)
}

#[test]
fn test_las_files_are_remapped_on_load() -> Result<()> {
    let dir = temp_dir("las_dataset")?;
    let cleanup_dir = dir.clone();
    defer! {
        std::fs::remove_dir_all(&cleanup_dir).unwrap();
    }

    let expected_labels = write_scans(&dir, 2)?;
    let files = get_all_las_files(&dir)?;
    assert_eq!(2, files.len());

    let dataset = SceneDataset::from_las_files(&files, small_tiling(), None, None)?;
    assert_eq!(2, dataset.len());
    assert_eq!(1000, dataset.num_points());
    for (idx, labels) in expected_labels.iter().enumerate() {
        let scene = dataset
            .scenes()
            .iter()
            .find(|scene| scene.name() == format!("scan_{}", idx))
            .expect("scene of every scan");
        assert_eq!(labels.as_slice(), scene.labels());
        assert!(scene.labels().iter().all(|label| (*label as usize) < NUM_CLASSES));
    }
    assert_eq!(1000, dataset.label_histogram().total());
    Ok(())
}

#[test]
fn test_geometry_features_from_las_files() -> Result<()> {
    let dir = temp_dir("las_geometry")?;
    let cleanup_dir = dir.clone();
    defer! {
        std::fs::remove_dir_all(&cleanup_dir).unwrap();
    }

    write_scans(&dir, 1)?;
    let files = get_all_las_files(&dir)?;
    let features = vec![GeometryFeature::Planarity, GeometryFeature::SurfaceVariation];
    let provider = PcaFeatureProvider::new(0.8, features.clone());
    let dataset = SceneDataset::from_las_files(
        &files,
        small_tiling(),
        None,
        Some(&provider as &dyn GeometryFeatureProvider),
    )?;

    assert_eq!(8, dataset.schema().len());
    let scene = dataset.scene(0)?;
    let matrix = scene.features().expect("geometry features");
    assert_eq!(scene.len(), matrix.rows());
    assert_eq!(features.len(), matrix.columns());
    assert!(matrix.data().iter().all(|value| value.is_finite() && *value >= 0.0));
    Ok(())
}

#[test]
fn test_downsampling_keeps_labels_of_kept_points() -> Result<()> {
    let dir = temp_dir("las_downsample")?;
    let cleanup_dir = dir.clone();
    defer! {
        std::fs::remove_dir_all(&cleanup_dir).unwrap();
    }

    write_scans(&dir, 1)?;
    let files = get_all_las_files(&dir)?;
    let full = SceneDataset::from_las_files(&files, small_tiling(), None, None)?;
    let geometry = GeometryConfig {
        enabled: true,
        features: vec![GeometryFeature::Omnivariance],
        downsample_voxel: Some(0.5),
        ..Default::default()
    };
    let thinned = open_dataset(&files, small_tiling(), &geometry, &SnapshotOptions::default())?;

    let full_scene = full.scene(0)?;
    let scene = thinned.scene(0)?;
    assert!(scene.len() < full_scene.len());
    assert_eq!(scene.len(), scene.features().expect("geometry features").rows());
    for (position, label) in scene.positions().iter().zip(scene.labels()) {
        let original = full_scene
            .positions()
            .iter()
            .position(|p| p == position)
            .expect("kept point is a point of the scan");
        assert_eq!(full_scene.labels()[original], *label);
    }
    Ok(())
}

#[test]
fn test_open_dataset_stores_snapshot() -> Result<()> {
    let dir = temp_dir("las_snapshot")?;
    let cleanup_dir = dir.clone();
    defer! {
        std::fs::remove_dir_all(&cleanup_dir).unwrap();
    }

    write_scans(&dir, 2)?;
    let files = get_all_las_files(&dir)?;
    let snapshot = dir.join("snapshots").join("train.snapshot");
    let options = SnapshotOptions {
        path: Some(snapshot.clone()),
        load: false,
        save: true,
    };
    let dataset = open_dataset(&files, small_tiling(), &GeometryConfig::default(), &options)?;
    assert!(snapshot.exists());

    let loaded = open_dataset(
        &files,
        small_tiling(),
        &GeometryConfig::default(),
        &SnapshotOptions {
            load: true,
            save: false,
            ..options
        },
    )?;
    assert_eq!(dataset.num_points(), loaded.num_points());
    assert_eq!(dataset.label_weights(), loaded.label_weights());
    Ok(())
}
