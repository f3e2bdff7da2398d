//! # forcefield-rs
//!
//! Differentiable training and inference engine for graph neural network
//! potential-energy models.
//!
//! A model maps a batch of structure graphs to per-structure energies.
//! Forces follow as the negative gradient with respect to atom positions,
//! and stresses as the gradient with respect to a symmetric strain applied
//! to positions and cells. Around that derivative engine the crate provides
//! a full training pipeline.
//!
//! ## Features
//!
//! - **Autodiff forces and stresses** - one joint backward pass, with second
//!   order gradients for force-matching losses
//! - **Training loop** - Adam, gradient clipping, learning rate schedules
//!   and an exponential moving average of the weights
//! - **Multi-head training** - datasets interleaved round-robin, one output
//!   head per dataset
//! - **Checkpoints** - best, last and periodic safetensors files, early
//!   stopping, and restore that degrades gracefully
//! - **Calculator** - single-structure energies, forces and Voigt stress
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starter configuration
//! forcefield init config.yaml --preset morse
//!
//! # Validate it
//! forcefield validate config.yaml
//!
//! # Train
//! forcefield train config.yaml
//!
//! # Predict with the best checkpoint
//! forcefield predict --checkpoint results/best_model.safetensors --data test.json
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use candle_core::Device;
//! use forcefield_rs::data::{load_batches, DataSource};
//! use forcefield_rs::{Potential, RunConfig, Trainer};
//!
//! # fn main() -> forcefield_rs::Result<()> {
//! let config = RunConfig::from_file("config.yaml")?;
//! config.validate()?;
//!
//! let device = config.resolve_device();
//! let mut potential = Potential::from_config(&config, &device)?;
//! let train = DataSource::Batches(load_batches(&config.data.train[0], 32, &device)?);
//! let val = DataSource::Batches(load_batches(&config.data.val[0], 32, &device)?);
//!
//! let mut trainer = Trainer::new(&mut potential, config.training.clone())?;
//! trainer.train(&train, &val)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Building a Potential
//!
//! ```rust
//! use candle_core::Device;
//! use forcefield_rs::{ForceFieldError, Potential, PotentialConfig};
//!
//! # fn main() -> forcefield_rs::Result<()> {
//! let args = serde_json::json!({ "num_terms": 2, "num_species": 8 });
//! let potential = Potential::new("morse", &args, &PotentialConfig::default(), &Device::Cpu)?;
//! assert_eq!(potential.last_epoch(), -1);
//!
//! let err = Potential::new("graphormer", &args, &PotentialConfig::default(), &Device::Cpu);
//! assert!(matches!(err, Err(ForceFieldError::UnsupportedModel(_))));
//! # Ok(())
//! # }
//! ```
//!
//! ## Selecting Checkpoints
//!
//! ```rust
//! use forcefield_rs::{SelectionMetric, TrainOptions};
//!
//! let options = TrainOptions {
//!     include_forces: true,
//!     metric_name: SelectionMetric::ValMaeF,
//!     early_stop_patience: 50,
//!     ..Default::default()
//! };
//! assert!(options.validate().is_ok());
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod calculator;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod ema;
pub mod engine;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod multi_head;
pub mod optimizer;
pub mod potential;
pub mod scheduler;
pub mod selection;
pub mod strain;
pub mod trainer;

pub use batch::{GraphBatch, GraphRecord};
pub use calculator::Calculator;
pub use config::{PotentialConfig, RunConfig, SelectionMetric, TrainOptions};
pub use error::{ForceFieldError, Result};
pub use potential::Potential;
pub use trainer::Trainer;
