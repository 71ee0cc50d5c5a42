//! Label worker - the child side of the worker channel.
//!
//! One process per dataset. The worker owns the model and the query strategy,
//! retrains on label changes and answers REQUEST with a batch of sample ids.
//! The parent side lives in worker_handle.rs.
//!
//! Loop contract:
//! - first frame must be INIT, anything else is a protocol error
//! - REQUEST (no ids) -> REQUEST with `min(batch_size, unlabeled)` ids
//! - ADD/REMOVE update the pools, no reply
//! - STOP or EOF ends the loop

use std::io;

use futures::{SinkExt, StreamExt};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::WorkerEvent;
use crate::config::ActiveLearningConfig;
use crate::dataset::{Dataset, DatasetId, IdMapping, LabelId, SampleId};
use crate::engine::{Model, QueryStrategy, SelectContext};

#[derive(Debug, thiserror::Error)]
pub enum LabelWorkerError {
    #[error("expected INIT as first frame, got {0}")]
    MissingInit(&'static str),
    #[error("unexpected {0} from parent")]
    Unexpected(&'static str),
    #[error("sample {0} is not part of the dataset")]
    UnknownSample(SampleId),
    #[error("channel error: {0}")]
    Io(#[from] io::Error),
}

/// Pools, model and strategy of one worker. Pure and synchronous; the frame
/// loop in [`run_label_worker`] drives it.
pub struct LabelWorkerState {
    dataset_id: DatasetId,
    config: ActiveLearningConfig,
    mapping: IdMapping,
    features: Vec<Vec<f64>>,
    /// Class index per internal id.
    labels: Vec<Option<usize>>,
    classes: Vec<LabelId>,
    labeled: Vec<usize>,
    unlabeled: Vec<usize>,
    model: Box<dyn Model>,
    strategy: Box<dyn QueryStrategy>,
    rng: StdRng,
    updates_until_retrain: usize,
    fits: usize,
}

impl LabelWorkerState {
    pub fn new(config: ActiveLearningConfig, dataset: &Dataset) -> Self {
        let classes = dataset.vocabulary();
        let mapping = IdMapping::new(dataset.samples.iter().map(|s| s.id));
        let features = dataset.samples.iter().map(|s| s.features.clone()).collect();
        let labels: Vec<Option<usize>> = dataset
            .samples
            .iter()
            .map(|s| s.label.and_then(|l| classes.iter().position(|c| *c == l)))
            .collect();
        let (labeled, unlabeled): (Vec<usize>, Vec<usize>) =
            (0..labels.len()).partition(|&idx| labels[idx].is_some());

        let mut rng = StdRng::from_os_rng();
        let strategy = config.query_strategy.build(rng.random());
        let model = config.model.build(classes.len());

        let mut state = Self {
            dataset_id: dataset.id,
            updates_until_retrain: config.counter_until_next_model_update,
            config,
            mapping,
            features,
            labels,
            classes,
            labeled,
            unlabeled,
            model,
            strategy,
            rng,
            fits: 0,
        };
        state.retrain();
        state
    }

    pub fn labeled_count(&self) -> usize {
        self.labeled.len()
    }

    pub fn unlabeled_count(&self) -> usize {
        self.unlabeled.len()
    }

    /// Number of successful model fits so far.
    pub fn fits(&self) -> usize {
        self.fits
    }

    /// Next batch of suggestions. A failing strategy falls back to a random
    /// batch so the parent always gets an answer.
    pub fn select(&mut self) -> Vec<SampleId> {
        let batch_size = self.config.batch_size;
        let ctx = SelectContext {
            features: &self.features,
            labels: &self.labels,
            labeled: &self.labeled,
            unlabeled: &self.unlabeled,
            model: self.model.as_ref(),
        };
        let selected = match self.strategy.select(&ctx, batch_size) {
            Ok(selected) => selected,
            Err(e) => {
                tracing::warn!(
                    dataset_id = %self.dataset_id,
                    strategy = self.strategy.name(),
                    error = %e,
                    "Query strategy failed, answering with a random batch"
                );
                self.unlabeled
                    .choose_multiple(&mut self.rng, batch_size)
                    .copied()
                    .collect()
            }
        };
        selected
            .into_iter()
            .filter_map(|idx| self.mapping.external(idx))
            .collect()
    }

    pub fn add(&mut self, sample_id: SampleId, label_id: LabelId) -> Result<(), LabelWorkerError> {
        let idx = self.internal(sample_id)?;
        let class = self.class_index(label_id);

        self.labels[idx] = Some(class);
        if let Some(pos) = self.unlabeled.iter().position(|&i| i == idx) {
            self.unlabeled.swap_remove(pos);
            self.labeled.push(idx);
        }

        self.updates_until_retrain = self.updates_until_retrain.saturating_sub(1);
        if self.updates_until_retrain == 0 {
            self.retrain();
            self.updates_until_retrain = self.config.counter_until_next_model_update;
        }
        Ok(())
    }

    pub fn remove(
        &mut self,
        sample_id: SampleId,
        label_id: LabelId,
    ) -> Result<(), LabelWorkerError> {
        let idx = self.internal(sample_id)?;
        let previous = self.labels[idx].take();
        if previous.map(|c| self.classes[c]) != Some(label_id) {
            tracing::debug!(
                dataset_id = %self.dataset_id,
                %sample_id,
                %label_id,
                "REMOVE for a label the sample did not carry"
            );
        }
        if let Some(pos) = self.labeled.iter().position(|&i| i == idx) {
            self.labeled.swap_remove(pos);
            self.unlabeled.push(idx);
        }
        self.retrain();
        Ok(())
    }

    fn internal(&self, sample_id: SampleId) -> Result<usize, LabelWorkerError> {
        self.mapping
            .internal(sample_id)
            .ok_or(LabelWorkerError::UnknownSample(sample_id))
    }

    /// Labels created after INIT extend the vocabulary and reset the model.
    fn class_index(&mut self, label_id: LabelId) -> usize {
        if let Some(pos) = self.classes.iter().position(|c| *c == label_id) {
            return pos;
        }
        tracing::info!(dataset_id = %self.dataset_id, %label_id, "New label, rebuilding model");
        self.classes.push(label_id);
        self.model = self.config.model.build(self.classes.len());
        self.classes.len() - 1
    }

    /// Fit errors are logged and the previous model is kept.
    fn retrain(&mut self) {
        if self.labeled.is_empty() {
            tracing::trace!(dataset_id = %self.dataset_id, "Nothing labeled yet, skipping fit");
            return;
        }
        let (x, y): (Vec<Vec<f64>>, Vec<usize>) = self
            .labeled
            .iter()
            .filter_map(|&idx| self.labels[idx].map(|c| (self.features[idx].clone(), c)))
            .unzip();

        let started = std::time::Instant::now();
        match self.model.fit(&x, &y) {
            Ok(()) => {
                self.fits += 1;
                tracing::debug!(
                    dataset_id = %self.dataset_id,
                    labeled = x.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model retrained"
                );
            }
            Err(e) => {
                tracing::warn!(dataset_id = %self.dataset_id, error = %e, "Model fit failed, keeping previous model");
            }
        }
    }
}

/// Runs the worker loop over any byte stream pair.
pub async fn run_label_worker<R, W>(reader: R, writer: W) -> Result<(), LabelWorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(reader, JsonCodec::<WorkerEvent>::new());
    let mut writer = FramedWrite::new(writer, JsonCodec::<WorkerEvent>::new());

    let mut state = match reader.next().await {
        Some(Ok(WorkerEvent::Init { config, dataset })) => {
            tracing::info!(
                dataset_id = %dataset.id,
                samples = dataset.samples.len(),
                strategy = config.query_strategy.name(),
                "Label worker starting"
            );
            LabelWorkerState::new(config, &dataset)
        }
        Some(Ok(other)) => return Err(LabelWorkerError::MissingInit(other.kind())),
        Some(Err(e)) => return Err(e.into()),
        None => {
            tracing::info!("Channel closed before INIT, exiting");
            return Ok(());
        }
    };

    loop {
        match reader.next().await {
            Some(Ok(WorkerEvent::Request { sample_ids: None })) => {
                let ids = state.select();
                tracing::trace!(count = ids.len(), "Answering REQUEST");
                writer
                    .send(WorkerEvent::Request {
                        sample_ids: Some(ids),
                    })
                    .await?;
            }
            Some(Ok(WorkerEvent::Add {
                sample_id,
                label_id,
            })) => state.add(sample_id, label_id)?,
            Some(Ok(WorkerEvent::Remove {
                sample_id,
                label_id,
            })) => state.remove(sample_id, label_id)?,
            Some(Ok(WorkerEvent::Stop)) => {
                tracing::info!("Stop requested");
                break;
            }
            Some(Ok(other)) => return Err(LabelWorkerError::Unexpected(other.kind())),
            Some(Err(e)) => return Err(e.into()),
            None => {
                tracing::warn!("Worker channel closed (parent died?), exiting");
                break;
            }
        }
    }

    tracing::info!(
        labeled = state.labeled_count(),
        unlabeled = state.unlabeled_count(),
        "Label worker exiting"
    );
    Ok(())
}

/// Entry point of `labelhub worker`.
pub async fn run_stdio() -> Result<(), LabelWorkerError> {
    let frames = crate::spawn::reserve_stdout_for_frames()?;
    run_label_worker(tokio::io::stdin(), frames).await
}
