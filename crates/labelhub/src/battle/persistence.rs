//! Durable storage of finished battles.
//!
//! Only finished battles are stored. The registry writes on explicit request
//! and reads once at startup.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use super::ExperimentId;
use super::analyzer::BattleAnalyzer;
use super::results::ExperimentResults;
use crate::bridge::protocol::Side;
use crate::config::AlBattleConfig;
use crate::dataset::DatasetId;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("experiment {0} is not stored")]
    NotFound(ExperimentId),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything needed to rebuild a finished battle.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBattle {
    pub config: AlBattleConfig,
    pub dataset_id: DatasetId,
    pub cb_sample: Vec<Vec<f64>>,
    pub results: [ExperimentResults; 2],
}

impl From<&BattleAnalyzer> for StoredBattle {
    fn from(analyzer: &BattleAnalyzer) -> Self {
        Self {
            config: analyzer.config().clone(),
            dataset_id: analyzer.dataset_id(),
            cb_sample: analyzer.cb_sample().to_vec(),
            results: Side::BOTH.map(|side| analyzer.results(side).clone()),
        }
    }
}

impl From<StoredBattle> for BattleAnalyzer {
    fn from(stored: StoredBattle) -> Self {
        BattleAnalyzer::new(
            stored.config,
            stored.dataset_id,
            stored.cb_sample,
            stored.results,
        )
    }
}

#[async_trait]
pub trait BattleStore: Send + Sync {
    async fn store(&self, id: ExperimentId, battle: &StoredBattle) -> Result<(), PersistenceError>;

    async fn load(&self, id: ExperimentId) -> Result<StoredBattle, PersistenceError>;

    async fn delete(&self, id: ExperimentId) -> Result<(), PersistenceError>;

    /// Every stored id, ascending.
    async fn restore(&self) -> Result<Vec<ExperimentId>, PersistenceError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    id: ExperimentId,
    dataset_id: DatasetId,
    config: AlBattleConfig,
    stored_at: DateTime<Utc>,
}

const META: &str = "meta.json";
const CB_SAMPLE: &str = "cb_sample.json";

fn result_file(side: Side) -> String {
    format!("result_{side}.json")
}

/// One directory per battle under `<data_dir>/experiments/<id>/`.
#[derive(Debug, Clone)]
pub struct FileBattleStore {
    root: PathBuf,
}

impl FileBattleStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join("experiments"),
        }
    }

    fn dir(&self, id: ExperimentId) -> PathBuf {
        self.root.join(id.to_string())
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec(value).map_err(|source| PersistenceError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    tokio::fs::write(path, bytes).await.map_err(io_error(path))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    let bytes = tokio::fs::read(path).await.map_err(io_error(path))?;
    serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Format {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl BattleStore for FileBattleStore {
    async fn store(&self, id: ExperimentId, battle: &StoredBattle) -> Result<(), PersistenceError> {
        // Write next to the final directory and swap it in, so a crash never
        // leaves a half-written battle behind under its real id.
        let dir = self.dir(id);
        let staging = self.root.join(format!(".{id}.tmp"));
        if tokio::fs::try_exists(&staging).await.map_err(io_error(&staging))? {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(io_error(&staging))?;
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(io_error(&staging))?;

        let meta = Meta {
            id,
            dataset_id: battle.dataset_id,
            config: battle.config.clone(),
            stored_at: Utc::now(),
        };
        write_json(&staging.join(META), &meta).await?;
        write_json(&staging.join(CB_SAMPLE), &battle.cb_sample).await?;
        for side in Side::BOTH {
            write_json(&staging.join(result_file(side)), &battle.results[side.index()]).await?;
        }

        if tokio::fs::try_exists(&dir).await.map_err(io_error(&dir))? {
            tokio::fs::remove_dir_all(&dir).await.map_err(io_error(&dir))?;
        }
        tokio::fs::rename(&staging, &dir)
            .await
            .map_err(io_error(&dir))?;
        tracing::info!(experiment_id = %id, path = %dir.display(), "Stored battle");
        Ok(())
    }

    async fn load(&self, id: ExperimentId) -> Result<StoredBattle, PersistenceError> {
        let dir = self.dir(id);
        if !tokio::fs::try_exists(dir.join(META))
            .await
            .map_err(io_error(&dir))?
        {
            return Err(PersistenceError::NotFound(id));
        }
        let meta: Meta = read_json(&dir.join(META)).await?;
        let cb_sample = read_json(&dir.join(CB_SAMPLE)).await?;
        let one = read_json(&dir.join(result_file(Side::One))).await?;
        let two = read_json(&dir.join(result_file(Side::Two))).await?;
        Ok(StoredBattle {
            config: meta.config,
            dataset_id: meta.dataset_id,
            cb_sample,
            results: [one, two],
        })
    }

    async fn delete(&self, id: ExperimentId) -> Result<(), PersistenceError> {
        let dir = self.dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(PersistenceError::NotFound(id)),
            Err(e) => Err(io_error(&dir)(e)),
        }
    }

    async fn restore(&self) -> Result<Vec<ExperimentId>, PersistenceError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.root)(e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.root))? {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            else {
                continue;
            };
            if tokio::fs::try_exists(entry.path().join(META))
                .await
                .unwrap_or(false)
            {
                ids.push(ExperimentId(id));
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}
