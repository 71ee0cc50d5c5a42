//! Strategy battles: two active-learning experiments on the same split,
//! run side by side and compared afterwards.
//!
//! - **experiment**: the child-side query loop and its process entry point
//! - **side**: spawning the two experiment processes
//! - **holder**: one running battle, polled for status
//! - **registry**: active and finished battles by id
//! - **analyzer**: comparison of a finished battle
//! - **persistence**: durable storage of finished battles

pub mod analyzer;
pub mod experiment;
pub mod holder;
pub mod persistence;
pub mod preparation;
pub mod registry;
pub mod results;
pub mod side;
pub mod status;
pub mod validation;

crate::dataset::id_type!(
    /// Battle identifier. Unique for the lifetime of the data directory.
    ExperimentId
);

pub use analyzer::{BattleAnalyzer, BattleMetrics, IterationMetrics};
pub use holder::{BattleError, BattleHolder};
pub use persistence::{BattleStore, FileBattleStore, PersistenceError, StoredBattle};
pub use registry::{BattleRegistry, BattleSummary, RegistryError};
pub use results::{ExperimentResults, MetaData, MetricScores};
pub use side::{ExperimentSpawner, InProcessExperimentSpawner, ProcessExperimentSpawner};
pub use status::{Status, StatusCode};
