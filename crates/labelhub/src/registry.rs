//! Worker registry - lazy per-dataset cache of label worker handles.
//!
//! The single source of truth for "is a worker running for dataset D".
//! Creation is serialized per dataset through a `OnceCell`, so concurrent
//! callers never start two workers for the same dataset.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::config::ActiveLearningConfig;
use crate::dataset::{DatasetId, SampleStore};
use crate::worker_handle::{WorkerError, WorkerHandle, WorkerHandleConfig};

type Slot = Arc<OnceCell<Arc<WorkerHandle>>>;

pub struct WorkerRegistry {
    workers: DashMap<DatasetId, Slot>,
    store: Arc<dyn SampleStore>,
    handle_config: WorkerHandleConfig,
    default_config: ActiveLearningConfig,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn SampleStore>, handle_config: WorkerHandleConfig) -> Self {
        Self {
            workers: DashMap::new(),
            store,
            handle_config,
            default_config: ActiveLearningConfig::default(),
        }
    }

    /// Configuration used for workers created without an explicit one.
    pub fn with_default_config(mut self, config: ActiveLearningConfig) -> Self {
        self.default_config = config;
        self
    }

    /// Returns the running handle or starts one with the default configuration.
    pub async fn get_or_create(&self, dataset_id: DatasetId) -> Result<Arc<WorkerHandle>, WorkerError> {
        self.get_or_create_with(dataset_id, self.default_config.clone())
            .await
    }

    async fn get_or_create_with(
        &self,
        dataset_id: DatasetId,
        config: ActiveLearningConfig,
    ) -> Result<Arc<WorkerHandle>, WorkerError> {
        // Clone the slot out so no DashMap guard is held across the await.
        let slot = Arc::clone(self.workers.entry(dataset_id).or_default().value());
        let handle = slot
            .get_or_try_init(|| async {
                tracing::info!(%dataset_id, "Creating label worker");
                WorkerHandle::start(
                    dataset_id,
                    Arc::clone(&self.store),
                    config,
                    self.handle_config.clone(),
                )
                .await
                .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    /// Read-only lookup; never starts a worker.
    pub fn get(&self, dataset_id: DatasetId) -> Option<Arc<WorkerHandle>> {
        self.workers
            .get(&dataset_id)
            .and_then(|slot| slot.get().cloned())
    }

    pub fn contains(&self, dataset_id: DatasetId) -> bool {
        self.get(dataset_id).is_some()
    }

    /// Applies a new configuration: restarts a running worker in place or
    /// starts a new one.
    pub async fn restart_with_config(
        &self,
        dataset_id: DatasetId,
        config: ActiveLearningConfig,
    ) -> Result<Arc<WorkerHandle>, WorkerError> {
        match self.get(dataset_id) {
            Some(handle) => {
                handle.restart_process(Some(config)).await?;
                Ok(handle)
            }
            None => {
                let handle = self.get_or_create_with(dataset_id, config.clone()).await?;
                // A concurrent caller may have won the slot with its own config.
                if handle.config().await != config {
                    handle.restart_process(Some(config)).await?;
                }
                Ok(handle)
            }
        }
    }

    /// Stops and forgets the worker for one dataset.
    pub async fn remove(&self, dataset_id: DatasetId) -> bool {
        let Some((_, slot)) = self.workers.remove(&dataset_id) else {
            return false;
        };
        if let Some(handle) = slot.get() {
            handle.stop().await;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.workers.iter().filter(|slot| slot.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every worker. Called once on orchestrator shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<WorkerHandle>> = self
            .workers
            .iter()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        self.workers.clear();
        tracing::info!(count = handles.len(), "Stopping label workers");
        for handle in handles {
            handle.stop().await;
        }
    }
}
