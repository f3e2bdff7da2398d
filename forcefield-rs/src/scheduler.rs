//! Learning rate schedulers, stepped once per epoch.

use serde::{Deserialize, Serialize};

use crate::error::{ForceFieldError, Result};
use crate::optimizer::Adam;

/// Relative improvement `ReduceLROnPlateau` requires to reset its patience.
pub const DEFAULT_PLATEAU_THRESHOLD: f64 = 1e-4;

/// Smallest learning rate change `ReduceLROnPlateau` applies.
const PLATEAU_EPS: f64 = 1e-8;

fn default_threshold() -> f64 {
    DEFAULT_PLATEAU_THRESHOLD
}

/// Learning rate scheduler types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SchedulerKind {
    /// Multiply the learning rate by `gamma` every `step_size` epochs.
    StepLR {
        /// Period in epochs
        step_size: usize,
        /// Decay factor
        gamma: f64,
    },
    /// Multiply the learning rate by `factor` once the validation loss has
    /// not improved for more than `patience` epochs.
    ReduceLROnPlateau {
        /// Decay factor
        factor: f64,
        /// Epochs without improvement tolerated
        patience: usize,
        /// Relative improvement threshold
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
}

impl Default for SchedulerKind {
    fn default() -> Self {
        Self::StepLR {
            step_size: 10,
            gamma: 0.95,
        }
    }
}

impl SchedulerKind {
    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::InvalidConfig`] describing the bad value.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::StepLR { step_size, gamma } => {
                if *step_size == 0 {
                    return Err(ForceFieldError::invalid_config(
                        "StepLR step_size must be at least 1",
                    ));
                }
                if !(*gamma > 0.0) {
                    return Err(ForceFieldError::invalid_config(
                        "StepLR gamma must be positive",
                    ));
                }
            }
            Self::ReduceLROnPlateau {
                factor, threshold, ..
            } => {
                if !(*factor > 0.0 && *factor < 1.0) {
                    return Err(ForceFieldError::invalid_config(
                        "ReduceLROnPlateau factor must be in (0, 1)",
                    ));
                }
                if *threshold < 0.0 {
                    return Err(ForceFieldError::invalid_config(
                        "ReduceLROnPlateau threshold must be non-negative",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether stepping needs the validation loss.
    pub fn needs_metric(&self) -> bool {
        matches!(self, Self::ReduceLROnPlateau { .. })
    }
}

/// Learning rate scheduler with serializable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LRScheduler {
    /// Scheduler type
    kind: SchedulerKind,
    /// Learning rate at construction
    base_lr: f64,
    /// Learning rate after the last step
    last_lr: f64,
    /// Steps taken
    last_epoch: usize,
    /// Best metric seen (plateau only)
    #[serde(default)]
    best: Option<f64>,
    /// Steps since the best metric (plateau only)
    #[serde(default)]
    num_bad_epochs: usize,
}

impl LRScheduler {
    /// Create a new scheduler starting at `base_lr`.
    pub fn new(kind: SchedulerKind, base_lr: f64) -> Self {
        Self {
            kind,
            base_lr,
            last_lr: base_lr,
            last_epoch: 0,
            best: None,
            num_bad_epochs: 0,
        }
    }

    /// Scheduler type.
    pub fn kind(&self) -> &SchedulerKind {
        &self.kind
    }

    /// Learning rate after the last step.
    pub fn get_last_lr(&self) -> f64 {
        self.last_lr
    }

    /// Step the scheduler and update the optimizer.
    ///
    /// `metric` is the validation loss; it is required by the plateau
    /// scheduler and ignored otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::Training`] when the plateau scheduler gets
    /// no metric.
    pub fn step(&mut self, optimizer: Option<&mut Adam>, metric: Option<f64>) -> Result<()> {
        self.last_epoch += 1;
        match self.kind {
            SchedulerKind::StepLR { step_size, gamma } => {
                let decays = (self.last_epoch / step_size) as i32;
                self.last_lr = self.base_lr * gamma.powi(decays);
            }
            SchedulerKind::ReduceLROnPlateau {
                factor,
                patience,
                threshold,
            } => {
                let metric = metric.ok_or_else(|| {
                    ForceFieldError::training("ReduceLROnPlateau needs the validation loss")
                })?;
                let improved = self
                    .best
                    .map_or(true, |best| metric < best * (1.0 - threshold));
                if improved {
                    self.best = Some(metric);
                    self.num_bad_epochs = 0;
                } else {
                    self.num_bad_epochs += 1;
                }
                if self.num_bad_epochs > patience {
                    let reduced = self.last_lr * factor;
                    if self.last_lr - reduced > PLATEAU_EPS {
                        tracing::info!(
                            "Reducing learning rate from {:.3e} to {:.3e}",
                            self.last_lr,
                            reduced
                        );
                        self.last_lr = reduced;
                    }
                    self.num_bad_epochs = 0;
                }
            }
        }
        if let Some(optimizer) = optimizer {
            optimizer.set_learning_rate(self.last_lr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_lr() {
        let mut scheduler = LRScheduler::new(SchedulerKind::default(), 1e-3);
        for _ in 0..9 {
            scheduler.step(None, None).unwrap();
        }
        assert_eq!(scheduler.get_last_lr(), 1e-3);
        scheduler.step(None, None).unwrap();
        assert!((scheduler.get_last_lr() - 0.95e-3).abs() < 1e-15);
        for _ in 0..10 {
            scheduler.step(None, None).unwrap();
        }
        assert!((scheduler.get_last_lr() - 0.95f64.powi(2) * 1e-3).abs() < 1e-15);
    }

    #[test]
    fn test_plateau_reduces_after_patience() {
        let kind = SchedulerKind::ReduceLROnPlateau {
            factor: 0.5,
            patience: 2,
            threshold: DEFAULT_PLATEAU_THRESHOLD,
        };
        let mut scheduler = LRScheduler::new(kind, 1.0);
        scheduler.step(None, Some(1.0)).unwrap();
        scheduler.step(None, Some(1.0)).unwrap();
        scheduler.step(None, Some(1.0)).unwrap();
        assert_eq!(scheduler.get_last_lr(), 1.0);
        scheduler.step(None, Some(1.0)).unwrap();
        assert_eq!(scheduler.get_last_lr(), 0.5);
        // Improvement resets the counter.
        scheduler.step(None, Some(0.1)).unwrap();
        scheduler.step(None, Some(0.1)).unwrap();
        assert_eq!(scheduler.get_last_lr(), 0.5);
    }

    #[test]
    fn test_plateau_requires_metric() {
        let kind = SchedulerKind::ReduceLROnPlateau {
            factor: 0.8,
            patience: 50,
            threshold: DEFAULT_PLATEAU_THRESHOLD,
        };
        let mut scheduler = LRScheduler::new(kind, 1e-3);
        assert!(scheduler.step(None, None).is_err());
    }

    #[test]
    fn test_updates_optimizer() {
        let mut adam = Adam::new(Vec::new(), crate::optimizer::AdamConfig::default());
        let mut scheduler = LRScheduler::new(
            SchedulerKind::StepLR {
                step_size: 1,
                gamma: 0.5,
            },
            1e-3,
        );
        scheduler.step(Some(&mut adam), None).unwrap();
        assert_eq!(adam.learning_rate(), 5e-4);
    }

    #[test]
    fn test_state_serde() {
        let mut scheduler = LRScheduler::new(
            SchedulerKind::ReduceLROnPlateau {
                factor: 0.8,
                patience: 50,
                threshold: DEFAULT_PLATEAU_THRESHOLD,
            },
            1e-3,
        );
        scheduler.step(None, Some(0.3)).unwrap();
        let json = serde_json::to_string(&scheduler).unwrap();
        let restored: LRScheduler = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, scheduler);
    }

    #[test]
    fn test_validate() {
        assert!(SchedulerKind::StepLR {
            step_size: 0,
            gamma: 0.9
        }
        .validate()
        .is_err());
        assert!(SchedulerKind::default().validate().is_ok());
    }
}
