//! Battle holder - one running battle from preparation to completion.
//!
//! Lifecycle:
//! 1. `start` spawns a starter task: dataset preparation on the blocking pool,
//!    then both experiment sides. The sides are handed over through a oneshot.
//! 2. `get_status` never waits. It takes whatever the sides reported so far
//!    and folds it into one [`SideRecord`] per side.
//! 3. When both sides completed, the [`BattleAnalyzer`] is built right away.
//!
//! A failure on either side is sticky: the holder terminates the other side
//! and reports the error on every later call.

use std::sync::Arc;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::analyzer::BattleAnalyzer;
use super::preparation::prepare_battle;
use super::side::{ExperimentSpawner, SpawnedSide};
use super::status::{SideRecord, Status, StatusCode, most_significant};
use crate::bridge::protocol::{ExperimentEvent, ExperimentInit, Side};
use crate::config::AlBattleConfig;
use crate::dataset::{Dataset, DatasetId};

pub const TERMINATED: &str = "Battle was terminated";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BattleError {
    #[error("battle failed: {error}")]
    Failed { error: String },
}

struct Started {
    sides: [SpawnedSide; 2],
    cb_sample: Vec<Vec<f64>>,
}

pub struct BattleHolder {
    config: AlBattleConfig,
    dataset_id: DatasetId,
    cancel: CancellationToken,
    starter: JoinHandle<()>,
    startup: Option<oneshot::Receiver<Result<Started, String>>>,
    sides: Option<[SpawnedSide; 2]>,
    cb_sample: Vec<Vec<f64>>,
    records: [SideRecord; 2],
    seq: u64,
    failure: Option<String>,
    analyzer: Option<Arc<BattleAnalyzer>>,
    terminated: bool,
}

impl BattleHolder {
    /// Must be called inside a tokio runtime.
    pub fn start(config: AlBattleConfig, dataset: Dataset, spawner: Arc<dyn ExperimentSpawner>) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let dataset_id = dataset.id;

        let token = cancel.clone();
        let starter_config = config.clone();
        let starter = tokio::spawn(async move {
            let prep_config = starter_config.clone();
            let prepared = tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(%dataset_id, "Battle preparation cancelled");
                    return;
                }
                prepared = tokio::task::spawn_blocking(move || prepare_battle(&prep_config, &dataset)) => prepared,
            };
            let started = match prepared {
                Ok(prepared) => start_sides(&*spawner, &starter_config, prepared.dataset, &prepared.cb_sample)
                    .map(|sides| Started {
                        sides,
                        cb_sample: prepared.cb_sample,
                    }),
                Err(e) => Err(format!("battle preparation failed: {e}")),
            };
            if token.is_cancelled() {
                // Dropping the sides kills them.
                return;
            }
            let _ = tx.send(started);
        });

        Self {
            config,
            dataset_id,
            cancel,
            starter,
            startup: Some(rx),
            sides: None,
            cb_sample: Vec::new(),
            records: Default::default(),
            seq: 0,
            failure: None,
            analyzer: None,
            terminated: false,
        }
    }

    pub fn config(&self) -> &AlBattleConfig {
        &self.config
    }

    pub fn dataset_id(&self) -> DatasetId {
        self.dataset_id
    }

    /// Point-in-time status. Never blocks.
    pub fn get_status(&mut self) -> Result<Status, BattleError> {
        if let Some(error) = &self.failure {
            return Err(BattleError::Failed {
                error: error.clone(),
            });
        }
        self.poll_startup();
        self.drain();

        if self.failure.is_none() && self.analyzer.is_some() {
            return Ok(Status::new(StatusCode::Completed));
        }
        let status = match &self.failure {
            Some(error) => Err(error.clone()),
            None => most_significant(&self.records, self.sides.is_none()),
        };
        match status {
            Ok(status) => {
                if status.code == StatusCode::Completed {
                    self.complete();
                }
                Ok(status)
            }
            Err(error) => {
                tracing::warn!(dataset_id = %self.dataset_id, %error, "Battle failed");
                self.failure = Some(error.clone());
                self.kill_sides();
                Err(BattleError::Failed { error })
            }
        }
    }

    /// The analyzer, once both sides completed.
    pub fn analyzer(&mut self) -> Option<Arc<BattleAnalyzer>> {
        if self.analyzer.is_none() {
            let _ = self.get_status();
        }
        self.analyzer.clone()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Cancels preparation, kills unfinished sides and closes both event
    /// queues. Idempotent.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.cancel.cancel();
        self.startup = None;
        self.kill_sides();
        if let Some(sides) = self.sides.as_mut() {
            for side in sides.iter_mut() {
                side.events.close();
            }
        }
        if self.analyzer.is_none() && self.failure.is_none() {
            self.failure = Some(TERMINATED.to_string());
        }
        tracing::info!(dataset_id = %self.dataset_id, "Battle terminated");
    }

    fn poll_startup(&mut self) {
        let Some(rx) = self.startup.as_mut() else {
            return;
        };
        match rx.try_recv() {
            Ok(Ok(started)) => {
                tracing::info!(dataset_id = %self.dataset_id, "Battle sides started");
                self.sides = Some(started.sides);
                self.cb_sample = started.cb_sample;
                self.startup = None;
            }
            Ok(Err(error)) => {
                self.failure = Some(error);
                self.startup = None;
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
            Err(oneshot::error::TryRecvError::Closed) => {
                self.failure = Some("battle preparation aborted".to_string());
                self.startup = None;
            }
        }
    }

    fn drain(&mut self) {
        let Some(sides) = self.sides.as_mut() else {
            return;
        };
        for (side, record) in sides.iter_mut().zip(self.records.iter_mut()) {
            loop {
                match side.events.try_recv() {
                    Ok(event) => {
                        self.seq += 1;
                        record.apply(event, self.seq);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if record.outcome.is_none() {
                            self.seq += 1;
                            record.apply(
                                ExperimentEvent::Failed("experiment exited without a result".to_string()),
                                self.seq,
                            );
                        }
                        break;
                    }
                }
            }
        }
    }

    fn complete(&mut self) {
        if self.analyzer.is_some() {
            return;
        }
        let [Some(one), Some(two)] = self.records.each_ref().map(SideRecord::results) else {
            return;
        };
        let results = [one.clone(), two.clone()];
        tracing::info!(dataset_id = %self.dataset_id, "Battle completed");
        self.analyzer = Some(Arc::new(BattleAnalyzer::new(
            self.config.clone(),
            self.dataset_id,
            std::mem::take(&mut self.cb_sample),
            results,
        )));
    }

    fn kill_sides(&mut self) {
        if let Some(sides) = self.sides.as_mut() {
            for side in sides.iter_mut() {
                side.process.kill();
            }
        }
    }
}

impl Drop for BattleHolder {
    fn drop(&mut self) {
        self.terminate();
        self.starter.abort();
    }
}

fn start_sides(
    spawner: &dyn ExperimentSpawner,
    config: &AlBattleConfig,
    dataset: Dataset,
    cb_sample: &[Vec<f64>],
) -> Result<[SpawnedSide; 2], String> {
    let spawn = |side: Side, dataset: Dataset| {
        spawner
            .spawn(ExperimentInit {
                side,
                config: config.clone(),
                dataset,
                cb_sample: cb_sample.to_vec(),
            })
            .map_err(|e| format!("failed to start experiment {side}: {e}"))
    };
    let one = spawn(Side::One, dataset.clone())?;
    let two = spawn(Side::Two, dataset)?;
    Ok([one, two])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::battle::experiment::tests::{battle_config, small_dataset};
    use crate::battle::side::InProcessExperimentSpawner;
    use crate::config::{ExperimentConfig, StoppingCriterion};
    use crate::spawn::SpawnError;

    /// Polls until the battle leaves TRAINING or the deadline passes.
    async fn wait_for_end(holder: &mut BattleHolder) -> Result<Status, BattleError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let status = holder.get_status();
            if !matches!(&status, Ok(s) if s.code != StatusCode::Completed)
                || tokio::time::Instant::now() > deadline
            {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn random_battle() -> AlBattleConfig {
        AlBattleConfig::new(ExperimentConfig::default(), ExperimentConfig::default())
            .with_stopping(StoppingCriterion::AllLabeled, None)
    }

    struct BrokenSpawner;

    impl ExperimentSpawner for BrokenSpawner {
        fn spawn(&self, _init: ExperimentInit) -> Result<SpawnedSide, SpawnError> {
            Err(SpawnError::Other("no slots".to_string()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn identical_random_sides_label_everything() {
        let mut holder = BattleHolder::start(
            random_battle(),
            small_dataset(),
            Arc::new(InProcessExperimentSpawner),
        );

        let status = wait_for_end(&mut holder).await.unwrap();
        assert_eq!(status.code, StatusCode::Completed);

        let analyzer = holder.analyzer().unwrap();
        for side in Side::BOTH {
            let last = analyzer.results(side).meta_data.last().unwrap();
            assert!((last.percentage_labeled - 1.0).abs() < 0.001);
        }
        let metrics = analyzer.metrics();
        assert_eq!(
            metrics.percentage_similar.len(),
            analyzer.results(Side::One).iterations()
        );
        assert!(metrics.percentage_similar.iter().all(|p| (0.0..=1.0).contains(p)));
        // Same seed, same strategy: both sides query the same samples.
        assert!(metrics.percentage_similar.iter().all(|p| *p == 1.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_is_monotonic() {
        let mut holder = BattleHolder::start(
            battle_config(),
            small_dataset(),
            Arc::new(InProcessExperimentSpawner),
        );

        let mut last = StatusCode::InSetup;
        loop {
            let code = holder.get_status().unwrap().code;
            assert!(code >= last, "{code:?} observed after {last:?}");
            last = code;
            if code == StatusCode::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for _ in 0..3 {
            assert_eq!(holder.get_status().unwrap().code, StatusCode::Completed);
        }
        let first = holder.analyzer().unwrap();
        assert!(Arc::ptr_eq(&first, &holder.analyzer().unwrap()));
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let mut holder = BattleHolder::start(
            battle_config(),
            small_dataset(),
            Arc::new(InProcessExperimentSpawner),
        );
        holder.terminate();
        holder.terminate();

        assert!(holder.is_terminated());
        assert_eq!(
            holder.get_status().unwrap_err(),
            BattleError::Failed {
                error: TERMINATED.to_string()
            }
        );
        assert!(holder.analyzer().is_none());
        if let Some(sides) = holder.sides.as_mut() {
            for side in sides.iter_mut() {
                assert!(matches!(side.events.try_recv(), Err(TryRecvError::Disconnected)));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_closes_started_side_queues() {
        let mut holder = BattleHolder::start(
            battle_config(),
            small_dataset(),
            Arc::new(InProcessExperimentSpawner),
        );
        tokio::time::timeout(Duration::from_secs(30), async {
            while holder.sides.is_none() {
                let _ = holder.get_status();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        holder.terminate();
        holder.terminate();
        assert!(holder.is_terminated());

        let sides = holder.sides.as_mut().unwrap();
        for side in sides.iter_mut() {
            loop {
                match side.events.try_recv() {
                    Ok(_) => continue,
                    Err(e) => {
                        assert_eq!(e, TryRecvError::Disconnected);
                        break;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let mut holder = BattleHolder::start(random_battle(), small_dataset(), Arc::new(BrokenSpawner));

        let error = wait_for_end(&mut holder).await.unwrap_err();
        assert!(matches!(
            &error,
            BattleError::Failed { error } if error.contains("no slots")
        ));
        // Sticky.
        assert_eq!(holder.get_status().unwrap_err(), error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_side_fails_the_battle() {
        let mut dataset = small_dataset();
        // A single class survives preparation.
        for sample in &mut dataset.samples {
            sample.label = dataset.labels.first().copied();
        }
        let mut holder = BattleHolder::start(random_battle(), dataset, Arc::new(InProcessExperimentSpawner));

        let error = wait_for_end(&mut holder).await.unwrap_err();
        assert!(matches!(
            error,
            BattleError::Failed { error } if error.contains("two classes")
        ));
    }
}
