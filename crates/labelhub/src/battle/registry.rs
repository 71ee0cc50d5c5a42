//! Battle registry - every battle of this process by id.
//!
//! A battle lives in `active` while its holder runs and moves to `finished`
//! once its analyzer exists. Ids come from one counter that only grows and
//! starts above every persisted id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde::Serialize;

use super::ExperimentId;
use super::analyzer::BattleAnalyzer;
use super::holder::{BattleError, BattleHolder};
use super::persistence::{BattleStore, PersistenceError, StoredBattle};
use super::side::ExperimentSpawner;
use super::status::{Status, StatusCode};
use super::validation::validate_battle;
use crate::config::{AlBattleConfig, ConfigError};
use crate::dataset::{DatasetId, SampleStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("experiment {0} not found")]
    NotFound(ExperimentId),
    #[error("experiment {0} is not finished yet")]
    NotFinished(ExperimentId),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Battle(#[from] BattleError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// One row of [`BattleRegistry::get_all`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BattleSummary {
    pub id: ExperimentId,
    pub dataset_id: DatasetId,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type Holder = Arc<Mutex<BattleHolder>>;

fn lock(holder: &Holder) -> MutexGuard<'_, BattleHolder> {
    holder.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BattleRegistry {
    active: DashMap<ExperimentId, Holder>,
    finished: DashMap<ExperimentId, Arc<BattleAnalyzer>>,
    next_id: AtomicU64,
    samples: Arc<dyn SampleStore>,
    spawner: Arc<dyn ExperimentSpawner>,
}

impl BattleRegistry {
    pub fn new(samples: Arc<dyn SampleStore>, spawner: Arc<dyn ExperimentSpawner>) -> Self {
        Self {
            active: DashMap::new(),
            finished: DashMap::new(),
            next_id: AtomicU64::new(0),
            samples,
            spawner,
        }
    }

    /// The id the next battle will get.
    pub fn id_counter(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Validates `config` against the dataset, then allocates an id and starts
    /// the battle. A rejected configuration consumes no id.
    pub async fn create_and_start(
        &self,
        dataset_id: DatasetId,
        config: AlBattleConfig,
    ) -> Result<ExperimentId, RegistryError> {
        let dataset = self.samples.dataset(dataset_id).await?;
        validate_battle(&config, &dataset)?;

        let id = ExperimentId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let holder = BattleHolder::start(config, dataset, Arc::clone(&self.spawner));
        self.active.insert(id, Arc::new(Mutex::new(holder)));
        tracing::info!(experiment_id = %id, %dataset_id, "Battle started");
        Ok(id)
    }

    pub fn has_active(&self, id: ExperimentId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn has_finished(&self, id: ExperimentId) -> bool {
        self.finished.contains_key(&id)
    }

    fn holder(&self, id: ExperimentId) -> Option<Holder> {
        // Clone out so no DashMap guard is held while the holder is locked.
        self.active.get(&id).map(|h| Arc::clone(h.value()))
    }

    pub fn get_status(&self, id: ExperimentId) -> Result<Status, RegistryError> {
        if self.has_finished(id) {
            return Ok(Status::new(StatusCode::Completed));
        }
        let holder = self.holder(id).ok_or(RegistryError::NotFound(id))?;
        let status = lock(&holder).get_status()?;
        Ok(status)
    }

    /// The analyzer of a completed battle, moving it to the finished table on
    /// first access.
    pub fn get_or_create_finished(&self, id: ExperimentId) -> Result<Arc<BattleAnalyzer>, RegistryError> {
        if let Some(analyzer) = self.finished.get(&id) {
            return Ok(Arc::clone(analyzer.value()));
        }
        let holder = self.holder(id).ok_or(RegistryError::NotFound(id))?;
        let analyzer = {
            let mut holder = lock(&holder);
            if holder.get_status()?.code != StatusCode::Completed {
                return Err(RegistryError::NotFinished(id));
            }
            holder.analyzer().ok_or(RegistryError::NotFinished(id))?
        };
        self.set_finished(id, Arc::clone(&analyzer));
        Ok(analyzer)
    }

    /// Moves a battle from the active to the finished table.
    pub fn set_finished(&self, id: ExperimentId, analyzer: Arc<BattleAnalyzer>) {
        self.finished.insert(id, analyzer);
        self.active.remove(&id);
        tracing::info!(experiment_id = %id, "Battle finished");
    }

    /// Status of every battle, by ascending id.
    pub fn get_all(&self) -> Vec<BattleSummary> {
        let active: Vec<(ExperimentId, Holder)> = self
            .active
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        let mut summaries: Vec<BattleSummary> = active
            .into_iter()
            .map(|(id, holder)| {
                let mut holder = lock(&holder);
                let status = holder.get_status();
                BattleSummary {
                    id,
                    dataset_id: holder.dataset_id(),
                    finished: false,
                    error: status.as_ref().err().map(ToString::to_string),
                    status: status.ok(),
                }
            })
            .collect();
        summaries.extend(self.finished.iter().map(|entry| BattleSummary {
            id: *entry.key(),
            dataset_id: entry.value().dataset_id(),
            finished: true,
            status: Some(Status::new(StatusCode::Completed)),
            error: None,
        }));
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    /// Terminates an active battle or forgets a finished one.
    pub fn remove_or_terminate(&self, id: ExperimentId) -> Result<(), RegistryError> {
        if let Some((_, holder)) = self.active.remove(&id) {
            lock(&holder).terminate();
            tracing::info!(experiment_id = %id, "Active battle removed");
            return Ok(());
        }
        if self.finished.remove(&id).is_some() {
            tracing::info!(experiment_id = %id, "Finished battle removed");
            return Ok(());
        }
        Err(RegistryError::NotFound(id))
    }

    /// Removes a battle from memory and from `store`.
    pub async fn delete(&self, id: ExperimentId, store: &dyn BattleStore) -> Result<(), RegistryError> {
        let in_memory = self.remove_or_terminate(id);
        match store.delete(id).await {
            Ok(()) => Ok(()),
            Err(PersistenceError::NotFound(_)) => in_memory,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn persist(&self, id: ExperimentId, store: &dyn BattleStore) -> Result<(), RegistryError> {
        let analyzer = self.get_or_create_finished(id)?;
        store.store(id, &StoredBattle::from(&*analyzer)).await?;
        Ok(())
    }

    /// Loads every stored battle into the finished table and moves the id
    /// counter past them. Battles that fail to load are skipped but still
    /// reserve their id.
    pub async fn restore(&self, store: &dyn BattleStore) -> Result<usize, RegistryError> {
        let ids = store.restore().await?;
        let mut loaded = 0;
        for &id in &ids {
            match store.load(id).await {
                Ok(stored) => {
                    self.finished.insert(id, Arc::new(BattleAnalyzer::from(stored)));
                    loaded += 1;
                }
                Err(e) => tracing::warn!(experiment_id = %id, error = %e, "Skipping stored battle"),
            }
        }
        if let Some(highest) = ids.last() {
            self.next_id.fetch_max(highest.0 + 1, Ordering::SeqCst);
        }
        tracing::info!(loaded, next_id = self.id_counter(), "Restored battles");
        Ok(loaded)
    }

    /// Terminates every active battle.
    pub fn shutdown(&self) {
        let holders: Vec<Holder> = self
            .active
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.active.clear();
        for holder in holders {
            lock(&holder).terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::pending;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::battle::FileBattleStore;
    use crate::battle::experiment::tests::small_dataset;
    use crate::battle::side::{InProcessExperimentSpawner, SideProcess, SpawnedSide};
    use crate::bridge::protocol::{ExperimentEvent, ExperimentInit};
    use crate::config::ExperimentConfig;
    use crate::dataset::{InMemorySampleStore, fixtures};
    use crate::engine::{ModelKind, QueryStrategyConfig};
    use crate::spawn::SpawnError;

    /// Sides that finish setup and then train forever.
    struct IdleSpawner;

    impl ExperimentSpawner for IdleSpawner {
        fn spawn(&self, _init: ExperimentInit) -> Result<SpawnedSide, SpawnError> {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(ExperimentEvent::SetupCompleted);
            let task = tokio::spawn(async move {
                let _tx = tx;
                pending::<()>().await
            });
            Ok(SpawnedSide {
                process: SideProcess::Task {
                    cancelled: Arc::new(AtomicBool::new(false)),
                    task,
                },
                events: rx,
            })
        }
    }

    fn registry(spawner: Arc<dyn ExperimentSpawner>) -> BattleRegistry {
        let samples = Arc::new(InMemorySampleStore::new());
        samples.insert(small_dataset());
        samples.insert(fixtures::clustered(3, 3, 5, true));
        BattleRegistry::new(samples, spawner)
    }

    fn config() -> AlBattleConfig {
        AlBattleConfig::new(ExperimentConfig::default(), ExperimentConfig::default())
    }

    async fn run_to_completion(registry: &BattleRegistry, id: ExperimentId) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while registry.get_status(id).unwrap().code != StatusCode::Completed {
            assert!(tokio::time::Instant::now() < deadline, "battle {id} did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completed_battle_moves_to_finished() {
        let registry = registry(Arc::new(InProcessExperimentSpawner));
        let id = registry.create_and_start(DatasetId(1), config()).await.unwrap();
        assert_eq!(id, ExperimentId(0));
        assert!(registry.has_active(id));

        run_to_completion(&registry, id).await;
        let analyzer = registry.get_or_create_finished(id).unwrap();
        assert!(!registry.has_active(id));
        assert!(registry.has_finished(id));
        assert!(Arc::ptr_eq(&analyzer, &registry.get_or_create_finished(id).unwrap()));
        assert_eq!(registry.get_status(id).unwrap().code, StatusCode::Completed);
    }

    #[tokio::test]
    async fn rejected_config_consumes_no_id() {
        let registry = registry(Arc::new(IdleSpawner));
        let bmdr = AlBattleConfig::new(
            ExperimentConfig::default(),
            ExperimentConfig {
                query_strategy: QueryStrategyConfig::Bmdr { beta: 1.0 },
                model: ModelKind::GaussianNaiveBayes,
            },
        );

        let err = registry.create_and_start(DatasetId(3), bmdr).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Config(ConfigError::UnsupportedClassCount { actual: 3, .. })
        ));
        assert_eq!(registry.id_counter(), 0);
        assert!(registry.get_all().is_empty());

        let err = registry.create_and_start(DatasetId(42), config()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Store(StoreError::DatasetNotFound(_))));
        assert_eq!(registry.id_counter(), 0);
    }

    #[tokio::test]
    async fn running_battle_is_not_finished() {
        let registry = registry(Arc::new(IdleSpawner));
        let id = registry.create_and_start(DatasetId(1), config()).await.unwrap();

        assert!(matches!(
            registry.get_or_create_finished(id),
            Err(RegistryError::NotFinished(_))
        ));
        assert!(matches!(
            registry.get_or_create_finished(ExperimentId(99)),
            Err(RegistryError::NotFound(ExperimentId(99)))
        ));
        assert!(matches!(
            registry.get_status(ExperimentId(99)),
            Err(RegistryError::NotFound(_))
        ));
        registry.shutdown();
        assert!(!registry.has_active(id));
    }

    #[tokio::test]
    async fn remove_or_terminate_needs_a_known_id() {
        let registry = registry(Arc::new(IdleSpawner));
        let id = registry.create_and_start(DatasetId(1), config()).await.unwrap();

        registry.remove_or_terminate(id).unwrap();
        assert!(!registry.has_active(id));
        assert!(matches!(
            registry.remove_or_terminate(id),
            Err(RegistryError::NotFound(_))
        ));

        let next = registry.create_and_start(DatasetId(1), config()).await.unwrap();
        assert_eq!(next, ExperimentId(1));
    }

    #[tokio::test]
    async fn get_all_lists_every_battle() {
        let registry = registry(Arc::new(IdleSpawner));
        let first = registry.create_and_start(DatasetId(1), config()).await.unwrap();
        let second = registry.create_and_start(DatasetId(3), config()).await.unwrap();

        let all = registry.get_all();
        assert_eq!(all.iter().map(|s| s.id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(all[1].dataset_id, DatasetId(3));
        assert!(all.iter().all(|s| !s.finished && s.error.is_none()));
        registry.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn persisted_battles_are_restored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBattleStore::new(dir.path());

        let registry = registry(Arc::new(InProcessExperimentSpawner));
        for _ in 0..3 {
            registry.create_and_start(DatasetId(1), config()).await.unwrap();
        }
        let id = ExperimentId(2);
        assert!(matches!(
            registry.persist(ExperimentId(7), &store).await,
            Err(RegistryError::NotFound(_))
        ));
        run_to_completion(&registry, id).await;
        registry.persist(id, &store).await.unwrap();
        let expected = registry.get_or_create_finished(id).unwrap();
        registry.shutdown();

        let restored = self::registry(Arc::new(IdleSpawner));
        assert_eq!(restored.restore(&store).await.unwrap(), 1);
        assert_eq!(restored.id_counter(), 3);
        assert!(restored.has_finished(id));
        let analyzer = restored.get_or_create_finished(id).unwrap();
        assert_eq!(analyzer.metrics(), expected.metrics());

        let next = restored.create_and_start(DatasetId(1), config()).await.unwrap();
        assert_eq!(next, ExperimentId(3));
        restored.shutdown();

        restored.delete(id, &store).await.unwrap();
        assert!(!restored.has_finished(id));
        assert!(store.restore().await.unwrap().is_empty());
    }
}
