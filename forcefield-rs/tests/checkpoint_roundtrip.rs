//! Saving and restoring potentials, including damaged checkpoints.

mod common;

use std::collections::BTreeMap;

use candle_core::Device;
use common::{batches, dimer, morse, trimer};
use forcefield_rs::checkpoint::{CheckpointRecord, CheckpointSummary, RestoreOutcome, EXP_AVG_PREFIX};
use forcefield_rs::data::DataSource;
use forcefield_rs::{ForceFieldError, Potential, Trainer, TrainOptions};

fn params(potential: &Potential) -> BTreeMap<String, Vec<f64>> {
    potential
        .parameters()
        .unwrap()
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().flatten_all().unwrap().to_vec1::<f64>().unwrap()))
        .collect()
}

/// A potential after two epochs of training, so every piece of state is
/// non-trivial.
fn trained() -> Potential {
    let mut potential = morse(1);
    let data = DataSource::Batches(batches(&[dimer(0.0), trimer(), dimer(0.1)], 2));
    let options = TrainOptions {
        epochs: 2,
        include_forces: true,
        ..Default::default()
    };
    Trainer::new(&mut potential, options)
        .unwrap()
        .train(&data, &data)
        .unwrap();
    potential.set_description("two epochs on fixtures");
    potential
}

#[test]
fn test_roundtrip_restores_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    let original = trained();
    original.save(&path).unwrap();

    let restored = Potential::load("morse", &path, &Device::Cpu, true).unwrap();
    assert_eq!(params(&restored), params(&original));
    assert_eq!(restored.model().model_args().unwrap(), original.model().model_args().unwrap());
    assert_eq!(restored.last_epoch(), 1);
    assert_eq!(restored.validation_metrics(), original.validation_metrics());
    assert_eq!(restored.description(), "two epochs on fixtures");
    assert!((restored.learning_rate() - original.learning_rate()).abs() < 1e-15);

    let report = restored.restore_report().unwrap();
    assert!(!report.is_degraded());
    assert_eq!(report.optimizer, RestoreOutcome::Restored("split tensors"));
}

#[test]
fn test_weights_only_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    let original = trained();
    original.save(&path).unwrap();

    let restored = Potential::load("morse", &path, &Device::Cpu, false).unwrap();
    assert_eq!(params(&restored), params(&original));
    assert_eq!(restored.validation_metrics().get("loss"), Some(&0.0));
}

#[test]
fn test_corrupted_optimizer_still_loads_weights() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    let original = trained();
    original.save(&path).unwrap();

    let mut record = CheckpointRecord::read(&path, &Device::Cpu).unwrap();
    record.metadata.insert("optimizer".into(), "{not json".into());
    record.tensors.retain(|name, _| !name.starts_with(EXP_AVG_PREFIX));
    record.write(&path).unwrap();

    let restored = Potential::load("morse", &path, &Device::Cpu, true).unwrap();
    assert_eq!(params(&restored), params(&original));
    let report = restored.restore_report().unwrap();
    assert!(report.optimizer.is_defaulted());
    assert!(report.is_degraded());
    assert!(!report.scheduler.is_defaulted());
    assert_eq!(restored.last_epoch(), 1);
}

#[test]
fn test_missing_metadata_defaults_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    trained().save(&path).unwrap();

    let mut record = CheckpointRecord::read(&path, &Device::Cpu).unwrap();
    record.metadata.remove("last_epoch");
    record.write(&path).unwrap();

    let restored = Potential::load("morse", &path, &Device::Cpu, true).unwrap();
    assert_eq!(restored.last_epoch(), -1);
    assert!(restored.validation_metrics().is_empty());
    assert!(restored.restore_report().unwrap().metadata.is_defaulted());
}

#[test]
fn test_model_name_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    morse(1).save(&path).unwrap();
    let err = Potential::load("m3gnet", &path, &Device::Cpu, true).err().unwrap();
    assert!(matches!(err, ForceFieldError::CheckpointMismatch { .. }));
}

#[test]
fn test_summary_reads_header_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    let original = trained();
    original.save(&path).unwrap();

    let summary = CheckpointSummary::read(&path).unwrap();
    assert_eq!(summary.model_name, "morse");
    assert_eq!(summary.last_epoch, 1);
    assert_eq!(&summary.validation_metrics, original.validation_metrics());
}

#[test]
fn test_single_head_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("multi.safetensors");
    let multi = morse(3);
    multi.save(&path).unwrap();

    let single = Potential::load_from_multi_head_model("morse", 2, &path, &Device::Cpu).unwrap();
    assert_eq!(single.model().num_heads(), 1);
    assert!(Potential::load_from_multi_head_model("morse", 3, &path, &Device::Cpu).is_err());
    assert!(Potential::load_from_multi_head_model("morse", -1, &path, &Device::Cpu).is_ok());
}
