//! Training loop.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

use crate::batch::GraphBatch;
use crate::config::TrainOptions;
use crate::data::{load_shard, shard_order, DataSource};
use crate::distributed::ProcessContext;
use crate::error::{ForceFieldError, Result};
use crate::loss::{compose, LossSettings, LossTerms};
use crate::metrics::{EpochMetrics, EpochSummary, MetricsSink};
use crate::multi_head::interleave;
use crate::potential::Potential;
use crate::selection::{CheckpointPolicy, EpochDecision, TrainingContext};

/// Pass over a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Optimise on every batch.
    Train,
    /// Evaluate under the EMA weights.
    Val,
}

impl Mode {
    /// Label used in logs and metric keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
        }
    }
}

/// Outcome of [`Trainer::train`].
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    /// Epochs run by this call.
    pub epochs_run: usize,
    /// Whether the run stopped before the last epoch.
    pub stopped_early: bool,
    /// Validation summary of the last epoch run.
    pub last_val: Option<EpochSummary>,
    /// Best selection metric seen.
    pub best_metric: f64,
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use candle_core::Device;
/// use forcefield_rs::data::{load_batches, DataSource};
/// use forcefield_rs::{Potential, RunConfig, Trainer};
///
/// # fn main() -> forcefield_rs::Result<()> {
/// let config = RunConfig::from_preset("morse")?;
/// let mut potential = Potential::from_config(&config, &Device::Cpu)?;
/// let train = DataSource::Batches(load_batches("train.json", 32, &Device::Cpu)?);
/// let val = DataSource::Batches(load_batches("val.json", 32, &Device::Cpu)?);
///
/// let mut trainer = Trainer::new(&mut potential, config.training.clone())?;
/// let report = trainer.train(&train, &val)?;
/// println!("stopped early: {}", report.stopped_early);
/// # Ok(())
/// # }
/// ```
pub struct Trainer<'a> {
    potential: &'a mut Potential,
    options: TrainOptions,
    context: TrainingContext,
    policy: CheckpointPolicy,
    sink: Option<Box<dyn MetricsSink + 'a>>,
}

impl<'a> Trainer<'a> {
    /// Create a trainer for a single process.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::InvalidConfig`] if the options are invalid.
    pub fn new(potential: &'a mut Potential, options: TrainOptions) -> Result<Self> {
        Self::with_process(potential, options, ProcessContext::single())
    }

    /// Create a trainer for one process of a data-parallel run.
    pub fn with_process(
        potential: &'a mut Potential,
        options: TrainOptions,
        process: ProcessContext,
    ) -> Result<Self> {
        options.validate()?;
        crate::engine::enable_second_order();
        let context = TrainingContext::new(process, options.metric_name);
        let policy = CheckpointPolicy::from_options(&options);
        Ok(Self {
            potential,
            options,
            context,
            policy,
            sink: None,
        })
    }

    /// Send epoch records to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn MetricsSink + 'a>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Selection state.
    pub fn context(&self) -> &TrainingContext {
        &self.context
    }

    /// Train from the epoch after the potential's last completed one until
    /// `epochs`, or until early stopping.
    ///
    /// # Errors
    ///
    /// Returns an error if the data does not match the options or any step
    /// fails.
    pub fn train(&mut self, train: &DataSource, val: &DataSource) -> Result<TrainReport> {
        self.check_sources(train, val)?;

        tracing::info!(
            "Number of trainable parameters: {}",
            self.potential.trainable_parameter_count()?
        );

        let first = usize::try_from(self.potential.last_epoch() + 1).unwrap_or(0);
        let mut report = TrainReport {
            best_metric: f64::INFINITY,
            ..Default::default()
        };

        for epoch in first..self.options.epochs {
            tracing::info!("Epoch: {epoch} / {}", self.options.epochs);

            let summary = match (train, val) {
                (DataSource::MultiHead(train), DataSource::MultiHead(val)) => {
                    self.run_multi_head(train, epoch, Mode::Train)?;
                    self.run_multi_head(val, epoch, Mode::Val)?
                }
                (DataSource::Shards(shards), DataSource::Batches(val)) => {
                    for (index, path) in shard_order(shards, self.options.seed, epoch).iter().enumerate() {
                        let batches = load_shard(
                            path,
                            index,
                            epoch,
                            self.options.seed,
                            self.context.process,
                            self.options.batch_size,
                            self.potential.device(),
                        )?;
                        self.run_epoch(&batches, epoch, Mode::Train)?;
                    }
                    self.run_epoch(val, epoch, Mode::Val)?
                }
                (DataSource::Batches(train), DataSource::Batches(val)) => {
                    self.run_epoch(train, epoch, Mode::Train)?;
                    self.run_epoch(val, epoch, Mode::Val)?
                }
                _ => {
                    return Err(ForceFieldError::invalid_config(
                        "training and validation data layouts do not match",
                    ))
                }
            };

            self.potential.step_scheduler(summary.loss)?;
            self.potential.set_last_epoch(epoch as i64);
            self.potential
                .set_validation_metrics(summary.validation_metrics());

            report.epochs_run += 1;
            report.last_val = Some(summary);

            let decision = self
                .policy
                .after_epoch(self.potential, &mut self.context, epoch, &summary)?;
            report.best_metric = self.context.best_metric;
            if decision == EpochDecision::Stop {
                report.stopped_early = true;
                break;
            }
        }

        Ok(report)
    }

    fn check_sources(&self, train: &DataSource, val: &DataSource) -> Result<()> {
        match (train, val) {
            (DataSource::MultiHead(train), DataSource::MultiHead(val)) => {
                if !self.options.multi_head {
                    return Err(ForceFieldError::invalid_config(
                        "per-dataset sources require multi_head",
                    ));
                }
                let names = self.options.dataset_names.len();
                if train.len() != names || val.len() != names {
                    return Err(ForceFieldError::invalid_config(format!(
                        "{names} dataset names for {} train and {} val sources",
                        train.len(),
                        val.len()
                    )));
                }
                if names > self.potential.model().num_heads() {
                    return Err(ForceFieldError::invalid_config(format!(
                        "{names} datasets but the model has {} heads",
                        self.potential.model().num_heads()
                    )));
                }
                Ok(())
            }
            (DataSource::Batches(_) | DataSource::Shards(_), DataSource::Batches(_)) => {
                if self.options.multi_head {
                    return Err(ForceFieldError::invalid_config(
                        "multi-head training needs one source per dataset",
                    ));
                }
                Ok(())
            }
            _ => Err(ForceFieldError::invalid_config(
                "validation data must be in memory and match the training layout",
            )),
        }
    }

    /// Evaluate the potential on `val` once, with unit force and 0.1 stress
    /// weights.
    pub fn test_model(
        potential: &'a mut Potential,
        val: &DataSource,
        options: &TrainOptions,
    ) -> Result<EpochSummary> {
        let options = TrainOptions {
            force_loss_ratio: 1.0,
            stress_loss_ratio: 0.1,
            ..options.clone()
        };
        let mut trainer = Self::new(potential, options)?;
        trainer.check_sources(val, val)?;
        match val {
            DataSource::Batches(batches) => trainer.run_epoch(batches, 1, Mode::Val),
            DataSource::MultiHead(sources) => trainer.run_multi_head(sources, 1, Mode::Val),
            DataSource::Shards(_) => Err(ForceFieldError::invalid_config(
                "testing needs in-memory batches",
            )),
        }
    }

    fn progress_bar(&self, len: usize) -> Result<ProgressBar> {
        if !self.options.progress_bar {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }

    fn should_log(&self) -> bool {
        !self.options.is_distributed || self.context.process.is_coordinator()
    }

    /// One pass over single-dataset `batches`.
    pub fn run_epoch(&mut self, batches: &[GraphBatch], epoch: usize, mode: Mode) -> Result<EpochSummary> {
        let start = Instant::now();
        let settings = LossSettings::for_dataset(&self.options, None);
        let pb = self.progress_bar(batches.len())?;

        self.potential.set_training(mode == Mode::Train);
        let run = |potential: &mut Potential| -> Result<EpochMetrics> {
            let mut metrics = EpochMetrics::default();
            for batch in batches {
                let terms = step(potential, batch, None, &settings, mode)?;
                metrics.update(&terms, &settings)?;
                pb.set_message(format!("{:.4}", terms.loss_value()?));
                pb.inc(1);
            }
            Ok(metrics)
        };
        let metrics = match mode {
            Mode::Train => run(self.potential)?,
            Mode::Val => self.potential.with_ema_weights(run)?,
        };
        pb.finish_and_clear();

        let summary = metrics.summary();
        let lr = self.potential.learning_rate();
        tracing::info!(
            "{}: Loss: {:.4}, MAE(e): {:.4}, MAE(f): {:.4}, MAE(s): {:.4}, Time: {:.2}s, lr: {:.8}",
            mode.as_str(),
            summary.loss,
            summary.mae_energy,
            summary.mae_forces,
            summary.mae_stress,
            start.elapsed().as_secs_f64(),
            lr
        );
        if self.should_log() {
            if let Some(sink) = self.sink.as_mut() {
                sink.log(epoch, &summary.record(mode.as_str(), lr))?;
            }
        }
        Ok(summary)
    }

    /// One interleaved pass over every dataset. Returns the per-dataset
    /// summaries summed.
    pub fn run_multi_head(&mut self, sources: &[Vec<GraphBatch>], epoch: usize, mode: Mode) -> Result<EpochSummary> {
        let start = Instant::now();
        let names = self.options.dataset_names.clone();
        if sources.len() != names.len() {
            return Err(ForceFieldError::invalid_config(format!(
                "{} dataset names for {} sources",
                names.len(),
                sources.len()
            )));
        }
        let settings: Vec<LossSettings> = names
            .iter()
            .map(|name| LossSettings::for_dataset(&self.options, Some(name)))
            .collect();
        let total: usize = sources.iter().map(Vec::len).sum();
        let pb = self.progress_bar(total)?;
        let seed = self.options.seed.wrapping_add(epoch as u64);

        self.potential.set_training(mode == Mode::Train);
        let run = |potential: &mut Potential| -> Result<Vec<EpochMetrics>> {
            let mut metrics = vec![EpochMetrics::default(); sources.len()];
            for (dataset, batch) in interleave(sources, seed) {
                let terms = step(potential, batch, Some(dataset), &settings[dataset], mode)?;
                metrics[dataset].update(&terms, &settings[dataset])?;
                pb.inc(1);
            }
            Ok(metrics)
        };
        let metrics = match mode {
            Mode::Train => run(self.potential)?,
            Mode::Val => self.potential.with_ema_weights(run)?,
        };
        pb.finish_and_clear();

        let mut total = EpochSummary::default();
        let mut records = Vec::with_capacity(names.len());
        for (name, dataset) in names.iter().zip(&metrics) {
            let summary = dataset.summary();
            tracing::info!(
                "{name} {}: Loss: {:.4}, MAE(e): {:.4}, MAE(f): {:.4}, MAE(s): {:.4}, Time: {:.2}s",
                mode.as_str(),
                summary.loss,
                summary.mae_energy,
                summary.mae_forces,
                summary.mae_stress,
                start.elapsed().as_secs_f64()
            );
            records.push(summary.dataset_record(name, mode.as_str()));
            total = total.add(&summary);
        }
        tracing::info!(
            "{}: Loss: {:.4}, MAE(e): {:.4}, MAE(f): {:.4}, MAE(s): {:.4}",
            mode.as_str(),
            total.loss,
            total.mae_energy,
            total.mae_forces,
            total.mae_stress
        );

        if self.should_log() {
            let lr = self.potential.learning_rate();
            if let Some(sink) = self.sink.as_mut() {
                for record in &records {
                    sink.log(epoch, record)?;
                }
                sink.log(epoch, &std::collections::BTreeMap::from([("lr".to_string(), lr)]))?;
            }
        }
        Ok(total)
    }
}

/// Evaluate one batch, and in training mode apply one optimizer step.
fn step(
    potential: &mut Potential,
    batch: &GraphBatch,
    head: Option<usize>,
    settings: &LossSettings,
    mode: Mode,
) -> Result<LossTerms> {
    let batch = batch.to_device(potential.device())?;
    let output = potential.evaluate(&batch, settings.include_forces, settings.include_stresses, head)?;
    let terms = compose(&batch, &output, settings)?;
    if mode == Mode::Train {
        let mut grads = terms.loss.backward()?;
        potential.apply_gradients(&mut grads)?;
    }
    Ok(terms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tests::{dimer, trimer};
    use crate::config::PotentialConfig;
    use crate::metrics::MemorySink;
    use candle_core::Device;

    fn potential(num_heads: usize) -> Potential {
        let args = serde_json::json!({ "num_terms": 2, "num_species": 4, "num_heads": num_heads });
        Potential::new("morse", &args, &PotentialConfig::default(), &Device::Cpu).unwrap()
    }

    fn batches() -> Vec<GraphBatch> {
        vec![
            GraphBatch::collate(&[dimer(0.0), trimer()], &Device::Cpu).unwrap(),
            GraphBatch::collate(&[dimer(0.2)], &Device::Cpu).unwrap(),
        ]
    }

    #[test]
    fn test_train_runs_all_epochs_and_logs() {
        let mut p = potential(1);
        let options = TrainOptions {
            epochs: 3,
            include_forces: true,
            ..Default::default()
        };
        let data = DataSource::Batches(batches());
        let report = Trainer::new(&mut p, options)
            .unwrap()
            .with_sink(Box::new(MemorySink::default()))
            .train(&data, &data)
            .unwrap();
        assert_eq!(report.epochs_run, 3);
        assert!(!report.stopped_early);
        assert_eq!(p.last_epoch(), 2);
        assert!(p.validation_metrics().contains_key("MAE_force"));
    }

    #[test]
    fn test_sink_receives_mode_keys() {
        let mut p = potential(1);
        let mut sink = MemorySink::default();
        {
            let options = TrainOptions {
                epochs: 1,
                ..Default::default()
            };
            let data = DataSource::Batches(batches());
            Trainer::new(&mut p, options)
                .unwrap()
                .with_sink(Box::new(SinkRef(&mut sink)))
                .train(&data, &data)
                .unwrap();
        }
        assert!(sink.last("train/loss").is_some());
        assert!(sink.last("val/mae_tot").is_some());
        assert_eq!(sink.last("val/lr"), Some(1e-3));
    }

    struct SinkRef<'s>(&'s mut MemorySink);

    impl MetricsSink for SinkRef<'_> {
        fn log(&mut self, epoch: usize, values: &std::collections::BTreeMap<String, f64>) -> Result<()> {
            self.0.log(epoch, values)
        }
    }

    #[test]
    fn test_resume_skips_completed_epochs() {
        let mut p = potential(1);
        p.set_last_epoch(4);
        let options = TrainOptions {
            epochs: 6,
            ..Default::default()
        };
        let data = DataSource::Batches(batches());
        let report = Trainer::new(&mut p, options).unwrap().train(&data, &data).unwrap();
        assert_eq!(report.epochs_run, 1);
    }

    #[test]
    fn test_multi_head_layout_checked() {
        let mut p = potential(2);
        let options = TrainOptions {
            epochs: 1,
            ..Default::default()
        };
        let data = DataSource::MultiHead(vec![batches(), batches()]);
        let err = Trainer::new(&mut p, options).unwrap().train(&data, &data).unwrap_err();
        assert!(matches!(err, ForceFieldError::InvalidConfig(_)));
    }

    #[test]
    fn test_multi_head_sink_records() {
        let mut p = potential(2);
        let mut sink = MemorySink::default();
        {
            let options = TrainOptions {
                epochs: 1,
                multi_head: true,
                include_forces: true,
                dataset_names: vec!["MPF".into(), "QM9".into()],
                ..Default::default()
            };
            let data = DataSource::MultiHead(vec![batches(), vec![batches().remove(1)]]);
            Trainer::new(&mut p, options)
                .unwrap()
                .with_sink(Box::new(SinkRef(&mut sink)))
                .train(&data, &data)
                .unwrap();
        }
        assert!(sink.last("MPF/train_loss").is_some());
        assert_eq!(sink.last("QM9/val_mae_f"), Some(0.0));
        assert!(sink.last("MPF/val_mae_f").unwrap() > 0.0);
        assert!(sink.last("lr").is_some());
    }

    #[test]
    fn test_test_model_uses_validation_pass() {
        let mut p = potential(1);
        let before = p.parameters().unwrap()[0].1.as_tensor().to_vec1::<f64>().unwrap();
        let summary = Trainer::test_model(
            &mut p,
            &DataSource::Batches(batches()),
            &TrainOptions::default(),
        )
        .unwrap();
        assert!(summary.loss > 0.0);
        let after = p.parameters().unwrap()[0].1.as_tensor().to_vec1::<f64>().unwrap();
        assert_eq!(before, after);
    }
}
