//! Declarative configuration for label workers and battles.
//!
//! Defaults match what a fresh dataset or battle gets when the caller sends
//! an empty object.

use serde::{Deserialize, Serialize};

use crate::engine::{ModelKind, QueryStrategyConfig};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("stopping criterion {0:?} needs a stopping_criteria_value")]
    MissingStoppingValue(StoppingCriterion),
    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("{field} must be positive")]
    NonPositive { field: &'static str },
    #[error(
        "query strategy {strategy} is implemented for {required} classes only, but the dataset has {actual}"
    )]
    UnsupportedClassCount {
        strategy: &'static str,
        required: usize,
        actual: usize,
    },
    #[error("feature names are not part of the dataset: {0:?}")]
    UnknownFeatures(Vec<String>),
    #[error("dataset needs labeled samples of at least two classes, found {labeled} samples in {classes} classes")]
    InsufficientLabels { labeled: usize, classes: usize },
    #[error("invalid query strategy: {0}")]
    InvalidStrategy(String),
}

/// Per-dataset settings of a label worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveLearningConfig {
    pub query_strategy: QueryStrategyConfig,
    pub model: ModelKind,
    pub batch_size: usize,
    /// Number of ADDs between two retrains.
    pub counter_until_next_model_update: usize,
    /// Every n-th suggestion is a random unlabeled sample. 0 disables.
    pub random_sample_every: usize,
}

impl Default for ActiveLearningConfig {
    fn default() -> Self {
        Self {
            query_strategy: QueryStrategyConfig::default(),
            model: ModelKind::default(),
            batch_size: 5,
            counter_until_next_model_update: 5,
            random_sample_every: 10,
        }
    }
}

impl ActiveLearningConfig {
    pub fn with_query_strategy(mut self, strategy: QueryStrategyConfig) -> Self {
        self.query_strategy = strategy;
        self
    }

    pub fn with_model(mut self, model: ModelKind) -> Self {
        self.model = model;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_random_sample_every(mut self, every: usize) -> Self {
        self.random_sample_every = every;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "batch_size",
            });
        }
        if self.counter_until_next_model_update == 0 {
            return Err(ConfigError::NonPositive {
                field: "counter_until_next_model_update",
            });
        }
        self.query_strategy
            .validate()
            .map_err(ConfigError::InvalidStrategy)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppingCriterion {
    /// Run until the unlabeled pool is empty.
    #[default]
    AllLabeled,
    /// Fixed number of iterations.
    NumOfQueries,
    /// Budget in queried samples.
    CostLimit,
    /// Fraction of the initial unlabeled pool that may be queried.
    PercentOfUnlabel,
    /// Wall clock limit in seconds.
    TimeLimit,
}

/// One side of a battle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub query_strategy: QueryStrategyConfig,
    pub model: ModelKind,
}

fn default_nbr_of_random_sample() -> usize {
    100
}

fn default_bins() -> usize {
    20
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationBoundariesConfig {
    #[serde(default = "default_nbr_of_random_sample")]
    pub nbr_of_random_sample: usize,
    #[serde(default = "default_bins")]
    pub max_x_bins: usize,
    #[serde(default = "default_bins")]
    pub max_y_bins: usize,
}

impl Default for ClassificationBoundariesConfig {
    fn default() -> Self {
        Self {
            nbr_of_random_sample: default_nbr_of_random_sample(),
            max_x_bins: default_bins(),
            max_y_bins: default_bins(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlotConfig {
    /// Two feature names to project onto. `None` means the first two.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<(String, String)>,
    #[serde(default)]
    pub classification_boundaries: ClassificationBoundariesConfig,
}

fn default_batch_size() -> usize {
    5
}

fn default_random_seed() -> u64 {
    42
}

fn default_train_test_split() -> f64 {
    0.3
}

fn default_initially_labeled() -> f64 {
    0.05
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlBattleConfig {
    pub exp_configs: [ExperimentConfig; 2],
    #[serde(default)]
    pub stopping_criteria: StoppingCriterion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopping_criteria_value: Option<f64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
    /// Fraction of the dataset held out for scoring.
    #[serde(default = "default_train_test_split")]
    pub train_test_split: f64,
    /// Fraction of the training split labeled before the first iteration.
    #[serde(default = "default_initially_labeled")]
    pub initially_labeled: f64,
    #[serde(default)]
    pub plot_config: PlotConfig,
}

impl AlBattleConfig {
    pub fn new(first: ExperimentConfig, second: ExperimentConfig) -> Self {
        Self {
            exp_configs: [first, second],
            stopping_criteria: StoppingCriterion::default(),
            stopping_criteria_value: None,
            batch_size: default_batch_size(),
            random_seed: default_random_seed(),
            train_test_split: default_train_test_split(),
            initially_labeled: default_initially_labeled(),
            plot_config: PlotConfig::default(),
        }
    }

    pub fn with_stopping(mut self, criterion: StoppingCriterion, value: Option<f64>) -> Self {
        self.stopping_criteria = criterion;
        self.stopping_criteria_value = value;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    /// Checks that do not need the dataset.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "batch_size",
            });
        }
        for (field, value) in [
            ("train_test_split", self.train_test_split),
            ("initially_labeled", self.initially_labeled),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }

        if self.stopping_criteria != StoppingCriterion::AllLabeled {
            let value = self
                .stopping_criteria_value
                .ok_or(ConfigError::MissingStoppingValue(self.stopping_criteria))?;
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::NonPositive {
                    field: "stopping_criteria_value",
                });
            }
            if self.stopping_criteria == StoppingCriterion::PercentOfUnlabel && value > 1.0 {
                return Err(ConfigError::OutOfRange {
                    field: "stopping_criteria_value",
                    value,
                });
            }
        }

        if self.plot_config.classification_boundaries.nbr_of_random_sample == 0 {
            return Err(ConfigError::NonPositive {
                field: "nbr_of_random_sample",
            });
        }

        for exp in &self.exp_configs {
            exp.query_strategy
                .validate()
                .map_err(ConfigError::InvalidStrategy)?;
        }
        Ok(())
    }
}
