//! Dataset snapshots and the sample store the orchestrator reads through.
//!
//! Worker and experiment processes never talk to the store themselves: the parent
//! loads a [`Dataset`] snapshot and ships it with the INIT frame. The parent only
//! reads the store again for the random fallback and for restarts.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

pub(crate) use id_type;

id_type!(
    /// Externally stable sample identifier (database id).
    SampleId
);
id_type!(
    /// Identifier of a label class.
    LabelId
);
id_type!(DatasetId);

/// One row of a dataset: feature vector plus the label assigned so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: SampleId,
    pub features: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<LabelId>,
}

/// Point-in-time copy of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub feature_names: Vec<String>,
    /// Declared label vocabulary. Labels used by samples are added implicitly.
    #[serde(default)]
    pub labels: Vec<LabelId>,
    pub samples: Vec<Sample>,
}

impl Dataset {
    pub fn labeled(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter().filter(|s| s.label.is_some())
    }

    pub fn unlabeled_ids(&self) -> Vec<SampleId> {
        self.samples
            .iter()
            .filter(|s| s.label.is_none())
            .map(|s| s.id)
            .collect()
    }

    /// Distinct labels that occur on at least one sample, ascending.
    pub fn classes(&self) -> Vec<LabelId> {
        self.labeled()
            .filter_map(|s| s.label)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Declared vocabulary merged with labels in use, ascending.
    pub fn vocabulary(&self) -> Vec<LabelId> {
        self.labels
            .iter()
            .copied()
            .chain(self.labeled().filter_map(|s| s.label))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn feature_width(&self) -> usize {
        self.feature_names.len()
    }

    pub fn sample(&self, id: SampleId) -> Option<&Sample> {
        self.samples.iter().find(|s| s.id == id)
    }
}

/// Bidirectional SampleId <-> dense internal index map.
///
/// Built once per worker or experiment and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct IdMapping {
    to_external: Vec<SampleId>,
    to_internal: HashMap<SampleId, usize>,
}

impl IdMapping {
    pub fn new(ids: impl IntoIterator<Item = SampleId>) -> Self {
        let to_external: Vec<SampleId> = ids.into_iter().collect();
        let to_internal = to_external
            .iter()
            .enumerate()
            .map(|(idx, id)| (*id, idx))
            .collect();
        Self {
            to_external,
            to_internal,
        }
    }

    pub fn internal(&self, id: SampleId) -> Option<usize> {
        self.to_internal.get(&id).copied()
    }

    pub fn external(&self, idx: usize) -> Option<SampleId> {
        self.to_external.get(idx).copied()
    }

    pub fn len(&self) -> usize {
        self.to_external.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_external.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("dataset {0} not found")]
    DatasetNotFound(DatasetId),
    #[error("sample {sample_id} not found in dataset {dataset_id}")]
    SampleNotFound {
        dataset_id: DatasetId,
        sample_id: SampleId,
    },
    #[error("sample store unavailable: {0}")]
    Unavailable(String),
}

/// Read access to datasets and their labeling state.
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn dataset(&self, id: DatasetId) -> Result<Dataset, StoreError>;

    async fn unlabeled_sample_ids(&self, id: DatasetId) -> Result<Vec<SampleId>, StoreError>;
}

/// DashMap-backed store used by the CLI and tests.
#[derive(Default)]
pub struct InMemorySampleStore {
    datasets: DashMap<DatasetId, Dataset>,
}

impl InMemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dataset: Dataset) {
        self.datasets.insert(dataset.id, dataset);
    }

    pub fn set_label(
        &self,
        dataset_id: DatasetId,
        sample_id: SampleId,
        label: Option<LabelId>,
    ) -> Result<(), StoreError> {
        let mut dataset = self
            .datasets
            .get_mut(&dataset_id)
            .ok_or(StoreError::DatasetNotFound(dataset_id))?;
        let sample = dataset
            .samples
            .iter_mut()
            .find(|s| s.id == sample_id)
            .ok_or(StoreError::SampleNotFound {
                dataset_id,
                sample_id,
            })?;
        sample.label = label;
        Ok(())
    }
}

#[async_trait]
impl SampleStore for InMemorySampleStore {
    async fn dataset(&self, id: DatasetId) -> Result<Dataset, StoreError> {
        self.datasets
            .get(&id)
            .map(|d| d.clone())
            .ok_or(StoreError::DatasetNotFound(id))
    }

    async fn unlabeled_sample_ids(&self, id: DatasetId) -> Result<Vec<SampleId>, StoreError> {
        self.datasets
            .get(&id)
            .map(|d| d.unlabeled_ids())
            .ok_or(StoreError::DatasetNotFound(id))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Two well separated clusters per class on a line, `per_class` samples each.
    /// Sample ids start at 100 so they never coincide with internal indices.
    pub fn clustered(id: u64, classes: u64, per_class: u64, labeled: bool) -> Dataset {
        let mut samples = Vec::new();
        let mut next = 100;
        for class in 0..classes {
            for i in 0..per_class {
                let x = class as f64 * 10.0 + i as f64 * 0.1;
                samples.push(Sample {
                    id: SampleId(next),
                    features: vec![x, x * 0.5 + 1.0],
                    label: labeled.then_some(LabelId(class + 1)),
                });
                next += 1;
            }
        }
        Dataset {
            id: DatasetId(id),
            feature_names: vec!["width".to_string(), "height".to_string()],
            labels: (1..=classes).map(LabelId).collect(),
            samples,
        }
    }
}
