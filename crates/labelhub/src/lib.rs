//! labelhub: process orchestration for active-learning label workers and
//! strategy battles.

pub mod battle;
pub mod bridge;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod label_worker;
pub mod registry;
pub mod spawn;
pub mod worker_handle;

pub use battle::{
    BattleAnalyzer, BattleRegistry, BattleStore, ExperimentId, FileBattleStore,
    InProcessExperimentSpawner, ProcessExperimentSpawner, Status, StatusCode,
};
pub use config::{ActiveLearningConfig, AlBattleConfig, ConfigError, StoppingCriterion};
pub use dataset::{Dataset, DatasetId, InMemorySampleStore, LabelId, SampleId, SampleStore};
pub use registry::WorkerRegistry;
pub use worker_handle::{
    InProcessSpawner, ProcessSpawner, WorkerError, WorkerHandle, WorkerHandleConfig,
};

/// Crate version, as reported by `labelhub --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
