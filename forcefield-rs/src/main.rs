//! CLI entry point for forcefield-rs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forcefield_rs::data::{load_batches, DataSource};
use forcefield_rs::distributed::ProcessContext;
use forcefield_rs::metrics::JsonlMetricsSink;
use forcefield_rs::{GraphBatch, Potential, RunConfig, Trainer};

#[derive(Parser)]
#[command(name = "forcefield")]
#[command(about = "Train and evaluate graph potential-energy models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: PathBuf,
        /// Resume from checkpoint, restoring optimizer and scheduler state
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Fine-tune only the last N interaction layers (-1 trains everything)
        #[arg(long, allow_hyphen_values = true)]
        finetune_layers: Option<i64>,
        /// Re-initialise the output heads before fine-tuning
        #[arg(long)]
        reset_heads: bool,
    },
    /// Evaluate a checkpoint on a dataset
    Test {
        /// Path to configuration file
        config: PathBuf,
        /// Checkpoint to evaluate
        #[arg(long)]
        checkpoint: PathBuf,
    },
    /// Predict energies, forces and stresses
    Predict {
        /// Checkpoint to load
        #[arg(long)]
        checkpoint: PathBuf,
        /// Structures to predict (JSON array of graph records)
        #[arg(long)]
        data: PathBuf,
        /// Model identifier stored in the checkpoint
        #[arg(long, default_value = "morse")]
        model: String,
        /// Batch size
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
        /// Also predict forces
        #[arg(long)]
        forces: bool,
        /// Also predict stresses
        #[arg(long)]
        stresses: bool,
        /// Write predictions here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,
        /// Preset (morse, morse-multi-head)
        #[arg(long, default_value = "morse")]
        preset: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Must precede the first backward pass on this thread
    forcefield_rs::engine::enable_second_order();

    // Initialize logging; stdout carries command output
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = load_config(&config)?;
            println!("✓ Configuration is valid");
            println!("  Model: {}", config.model.name);
            println!("  Selection metric: {}", config.training.metric_name);
            println!("  Training files: {}", config.data.train.len());
        }
        Commands::Train {
            config,
            resume,
            finetune_layers,
            reset_heads,
        } => {
            tracing::info!("Starting training with config: {}", config.display());
            let config = load_config(&config)?;
            let device = config.resolve_device();
            let process = ProcessContext::from_env()?;

            let mut options = config.training.clone();
            options.is_distributed |= process.is_distributed();

            let mut potential = match &resume {
                Some(checkpoint) => Potential::load(&config.model.name, checkpoint, &device, true)
                    .with_context(|| format!("failed to resume from {}", checkpoint.display()))?,
                None => Potential::from_config(&config, &device)?,
            };
            if let Some(layers) = finetune_layers {
                potential.finetune_mode(layers, reset_heads)?;
            }

            let (train, val) = load_sources(&config, options.batch_size, &device)?;
            let mut trainer = Trainer::with_process(&mut potential, options.clone(), process)?;
            if process.is_coordinator() {
                let sink = JsonlMetricsSink::create(options.save_path.join("metrics.jsonl"))?;
                trainer = trainer.with_sink(Box::new(sink));
            }
            let report = trainer.train(&train, &val)?;

            println!("✓ Training finished after {} epochs", report.epochs_run);
            if report.stopped_early {
                println!("  Stopped early");
            }
            if let Some(val) = report.last_val {
                println!("  Last validation loss: {:.6}", val.loss);
            }
            if options.save_checkpoint {
                println!("  Checkpoints: {}", options.save_path.display());
            }
        }
        Commands::Test { config, checkpoint } => {
            let config = load_config(&config)?;
            let device = config.resolve_device();
            let mut potential = Potential::load(&config.model.name, &checkpoint, &device, false)
                .with_context(|| format!("failed to load {}", checkpoint.display()))?;
            let (_, val) = load_sources(&config, config.training.batch_size, &device)?;
            let summary = Trainer::test_model(&mut potential, &val, &config.training)?;
            println!("✓ Evaluated {}", checkpoint.display());
            println!("  Loss: {:.6}", summary.loss);
            println!("  MAE(e): {:.6}", summary.mae_energy);
            println!("  MAE(f): {:.6}", summary.mae_forces);
            println!("  MAE(s): {:.6}", summary.mae_stress);
        }
        Commands::Predict {
            checkpoint,
            data,
            model,
            batch_size,
            forces,
            stresses,
            output,
        } => {
            let device = Device::Cpu;
            let mut potential = Potential::load(&model, &checkpoint, &device, false)
                .with_context(|| format!("failed to load {}", checkpoint.display()))?;
            let batches = load_batches(&data, batch_size, &device)?;
            let predictions = potential.predict_properties(&batches, forces, stresses)?;
            let json = serde_json::to_string_pretty(&predictions)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("✓ Predictions written to: {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = RunConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<RunConfig> {
    let config = RunConfig::from_file(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Training and validation sources for the configured data layout.
fn load_sources(config: &RunConfig, batch_size: usize, device: &Device) -> anyhow::Result<(DataSource, DataSource)> {
    let load_each = |paths: &[PathBuf]| -> anyhow::Result<Vec<Vec<GraphBatch>>> {
        paths
            .iter()
            .map(|path| {
                load_batches(path, batch_size, device)
                    .with_context(|| format!("failed to load {}", path.display()))
            })
            .collect()
    };

    let val = load_each(&config.data.val)?;
    if config.training.multi_head {
        return Ok((
            DataSource::MultiHead(load_each(&config.data.train)?),
            DataSource::MultiHead(val),
        ));
    }
    let val = DataSource::Batches(val.into_iter().flatten().collect());
    let train = if config.data.streaming {
        DataSource::Shards(config.data.train.clone())
    } else {
        DataSource::Batches(load_each(&config.data.train)?.into_iter().flatten().collect())
    };
    Ok((train, val))
}
