//! One side of a battle: an active-learning run on a fixed train/test split
//! where every training label is known up front and "querying" a sample just
//! reveals it.
//!
//! Both sides of a battle derive their split from the same seed, so they
//! start from identical labeled, unlabeled and test sets and differ only in
//! the model and query strategy.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::results::{ExperimentResults, MetaData, MetricScores};
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ExperimentEvent, ExperimentInit, Side, TrainingInfo};
use crate::config::{AlBattleConfig, ExperimentConfig, StoppingCriterion};
use crate::dataset::{LabelId, SampleId};
use crate::engine::{EngineError, Model, QueryStrategy, SelectContext, argmax, euclidean, metrics};

#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("need labeled samples of at least two classes, found {samples} samples in {classes} classes")]
    InsufficientData { samples: usize, classes: usize },
    #[error("experiment cancelled")]
    Cancelled,
}

/// Widens the test ratio and the initially labeled ratio until every class
/// can be represented in the initially labeled training set.
pub fn adjust_split(samples: usize, classes: usize, train_test_split: f64, initially_labeled: f64) -> (f64, f64) {
    let n = samples as f64;
    let k = classes as f64;
    let mut tts = train_test_split;
    let mut il = initially_labeled;
    if ((1.0 - tts) * n).round() < k {
        tts = 1.0 - k / n;
    }
    if ((1.0 - tts) * il * n).round() < k {
        il = (1.0 + k) / ((1.0 - tts) * n);
    }
    (tts, il.min(1.0))
}

/// Splits `pool` per class. `take(len)` decides how many of a class's
/// shuffled members go to the first half.
fn stratified_split(
    pool: &[usize],
    targets: &[usize],
    rng: &mut StdRng,
    take: impl Fn(usize) -> usize,
) -> (Vec<usize>, Vec<usize>) {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &idx in pool {
        by_class.entry(targets[idx]).or_default().push(idx);
    }
    let mut picked = Vec::new();
    let mut rest = Vec::new();
    for (_, mut members) in by_class {
        members.shuffle(rng);
        let n = take(members.len()).min(members.len());
        rest.extend(members.split_off(n));
        picked.extend(members);
    }
    picked.sort_unstable();
    rest.sort_unstable();
    (picked, rest)
}

/// Linear extrapolation of fit times over the iterations still to come.
#[derive(Debug)]
pub struct RemainingTimeEstimate {
    criterion: StoppingCriterion,
    value: f64,
    total_iterations: usize,
    times: Vec<u64>,
}

impl RemainingTimeEstimate {
    pub fn new(criterion: StoppingCriterion, value: Option<f64>, unlabeled: usize, batch_size: usize) -> Self {
        let value = value.unwrap_or(0.0);
        let batch_size = batch_size.max(1);
        let total_iterations = match criterion {
            StoppingCriterion::PercentOfUnlabel => {
                let absolute = (unlabeled as f64 * value).ceil() as usize;
                absolute.div_ceil(batch_size)
            }
            StoppingCriterion::NumOfQueries => value as usize,
            StoppingCriterion::AllLabeled
            | StoppingCriterion::CostLimit
            | StoppingCriterion::TimeLimit => unlabeled.div_ceil(batch_size),
        };
        Self {
            criterion,
            value,
            total_iterations,
            times: Vec::new(),
        }
    }

    /// Records one fit and returns the estimated seconds left.
    pub fn record(&mut self, fit_ns: u64, elapsed: Duration) -> f64 {
        self.times.push(fit_ns);
        if self.criterion == StoppingCriterion::TimeLimit {
            return (self.value - elapsed.as_secs_f64()).max(0.0);
        }

        let it = self.times.len();
        let incr = self
            .times
            .windows(2)
            .map(|w| w[1] as f64 - w[0] as f64)
            .sum::<f64>()
            / (it - 1).max(1) as f64;
        let remaining_ns: f64 = (0..self.total_iterations.saturating_sub(it))
            .map(|i| fit_ns as f64 + incr * i as f64)
            .sum();
        remaining_ns * 1e-9
    }

    pub fn iterations_recorded(&self) -> usize {
        self.times.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct Stopping {
    criterion: StoppingCriterion,
    value: f64,
    initial_unlabeled: usize,
}

impl Stopping {
    fn reached(&self, unlabeled: usize, iterations: usize, queried: usize, elapsed: Duration) -> bool {
        if unlabeled == 0 {
            return true;
        }
        match self.criterion {
            StoppingCriterion::AllLabeled => false,
            StoppingCriterion::NumOfQueries => iterations as f64 >= self.value,
            StoppingCriterion::CostLimit => queried as f64 >= self.value,
            StoppingCriterion::PercentOfUnlabel => {
                queried as f64 / self.initial_unlabeled.max(1) as f64 >= self.value
            }
            StoppingCriterion::TimeLimit => elapsed.as_secs_f64() >= self.value,
        }
    }
}

/// Mean of all pairwise distances between `pool` and `batch`.
fn average_distance(features: &[Vec<f64>], pool: &[usize], batch: &[usize]) -> f64 {
    if pool.is_empty() || batch.is_empty() {
        return 0.0;
    }
    let total: f64 = pool
        .iter()
        .flat_map(|&p| batch.iter().map(move |&b| euclidean(&features[p], &features[b])))
        .sum();
    total / (pool.len() * batch.len()) as f64
}

/// Set up experiment, ready to train.
pub struct Experiment {
    side: Side,
    exp_config: ExperimentConfig,
    batch_size: usize,
    seed: u64,
    stopping: Stopping,
    classes: Vec<LabelId>,
    train_ids: Vec<SampleId>,
    train_features: Vec<Vec<f64>>,
    train_targets: Vec<usize>,
    labels: Vec<Option<usize>>,
    labeled: Vec<usize>,
    unlabeled: Vec<usize>,
    test_ids: Vec<SampleId>,
    test_features: Vec<Vec<f64>>,
    test_targets: Vec<usize>,
    cb_sample: Vec<Vec<f64>>,
}

impl Experiment {
    pub fn new(init: ExperimentInit) -> Result<Self, ExperimentError> {
        let ExperimentInit {
            side,
            config,
            dataset,
            cb_sample,
        } = init;
        let AlBattleConfig {
            exp_configs,
            stopping_criteria,
            stopping_criteria_value,
            batch_size,
            random_seed,
            train_test_split,
            initially_labeled,
            ..
        } = config;

        let classes = dataset.classes();
        let class_index: BTreeMap<LabelId, usize> =
            classes.iter().enumerate().map(|(i, c)| (*c, i)).collect();
        let mut ids = Vec::new();
        let mut features = Vec::new();
        let mut targets = Vec::new();
        for sample in &dataset.samples {
            let Some(label) = sample.label else { continue };
            ids.push(sample.id);
            features.push(sample.features.clone());
            targets.push(class_index[&label]);
        }
        if ids.len() < 2 || classes.len() < 2 {
            return Err(ExperimentError::InsufficientData {
                samples: ids.len(),
                classes: classes.len(),
            });
        }

        let (tts, il) = adjust_split(ids.len(), classes.len(), train_test_split, initially_labeled);
        tracing::debug!(%side, train_test_split = tts, initially_labeled = il, "Split ratios");

        let mut rng = StdRng::seed_from_u64(random_seed);
        let all: Vec<usize> = (0..ids.len()).collect();
        // Every class keeps at least one training sample.
        let (test, train) = stratified_split(&all, &targets, &mut rng, |len| {
            ((len as f64 * tts).round() as usize).min(len.saturating_sub(1))
        });
        let (initial, rest) = stratified_split(&train, &targets, &mut rng, |len| {
            ((len as f64 * il).round() as usize).max(1)
        });

        let local: BTreeMap<usize, usize> = train.iter().enumerate().map(|(i, g)| (*g, i)).collect();
        let labeled: Vec<usize> = initial.iter().map(|g| local[g]).collect();
        let unlabeled: Vec<usize> = rest.iter().map(|g| local[g]).collect();
        let train_targets: Vec<usize> = train.iter().map(|&g| targets[g]).collect();
        let mut labels = vec![None; train.len()];
        for &i in &labeled {
            labels[i] = Some(train_targets[i]);
        }

        Ok(Self {
            side,
            exp_config: exp_configs[side.index()].clone(),
            batch_size,
            seed: random_seed,
            stopping: Stopping {
                criterion: stopping_criteria,
                value: stopping_criteria_value.unwrap_or(0.0),
                initial_unlabeled: unlabeled.len(),
            },
            classes,
            train_ids: train.iter().map(|&g| ids[g]).collect(),
            train_features: train.iter().map(|&g| features[g].clone()).collect(),
            train_targets,
            labels,
            labeled,
            unlabeled,
            test_ids: test.iter().map(|&g| ids[g]).collect(),
            test_features: test.iter().map(|&g| features[g].clone()).collect(),
            test_targets: test.iter().map(|&g| targets[g]).collect(),
            cb_sample,
        })
    }

    pub fn labeled_count(&self) -> usize {
        self.labeled.len()
    }

    pub fn unlabeled_count(&self) -> usize {
        self.unlabeled.len()
    }

    pub fn test_count(&self) -> usize {
        self.test_ids.len()
    }

    fn fit(&self, model: &mut dyn Model) -> Result<u64, EngineError> {
        let x: Vec<Vec<f64>> = self
            .labeled
            .iter()
            .map(|&i| self.train_features[i].clone())
            .collect();
        let y: Vec<usize> = self.labeled.iter().map(|&i| self.train_targets[i]).collect();
        let start = Instant::now();
        model.fit(&x, &y)?;
        Ok(start.elapsed().as_nanos() as u64)
    }

    /// Runs the query loop to its stopping criterion. INFO events go to
    /// `events`; the caller sends the terminal event.
    pub fn train(
        mut self,
        events: &mpsc::UnboundedSender<ExperimentEvent>,
        cancelled: &AtomicBool,
    ) -> Result<ExperimentResults, ExperimentError> {
        let side = self.side;
        let mut model = self.exp_config.model.build(self.classes.len());
        let mut strategy: Box<dyn QueryStrategy> = self.exp_config.query_strategy.build(self.seed);
        let mut estimate = RemainingTimeEstimate::new(
            self.stopping.criterion,
            Some(self.stopping.value),
            self.unlabeled.len(),
            self.batch_size,
        );
        let initially_labeled: Vec<SampleId> =
            self.labeled.iter().map(|&i| self.train_ids[i]).collect();

        self.fit(model.as_mut())?;

        let mut raw_predictions = Vec::new();
        let mut cb_predictions = Vec::new();
        let mut meta_data = Vec::new();
        let mut scores: Vec<MetricScores> = Vec::new();
        let mut queried = 0;
        let started = Instant::now();

        while !self.stopping.reached(
            self.unlabeled.len(),
            meta_data.len(),
            queried,
            started.elapsed(),
        ) {
            if cancelled.load(Ordering::Relaxed) {
                return Err(ExperimentError::Cancelled);
            }

            let selected = strategy.select(
                &SelectContext {
                    features: &self.train_features,
                    labels: &self.labels,
                    labeled: &self.labeled,
                    unlabeled: &self.unlabeled,
                    model: model.as_ref(),
                },
                self.batch_size,
            )?;

            let avg_distance_labeled = average_distance(&self.train_features, &self.labeled, &selected);
            let avg_distance_unlabeled =
                average_distance(&self.train_features, &self.unlabeled, &selected);
            for &i in &selected {
                self.labels[i] = Some(self.train_targets[i]);
            }
            self.labeled.extend(&selected);
            self.unlabeled.retain(|i| !selected.contains(i));
            queried += selected.len();

            let fit_ns = self.fit(model.as_mut())?;
            let remaining = estimate.record(fit_ns, started.elapsed());
            let _ = events.send(ExperimentEvent::Info(TrainingInfo {
                training_time_ns: fit_ns,
                // The first estimates extrapolate from too few fits.
                remaining_secs: (estimate.iterations_recorded() > 2 && remaining >= 0.0)
                    .then_some(remaining),
            }));

            let proba = model.predict_proba(&self.test_features)?;
            let y_pred: Vec<usize> = proba.iter().map(|row| argmax(row)).collect();
            scores.push(MetricScores {
                accuracy: metrics::accuracy(&self.test_targets, &y_pred),
                f1: metrics::f1_macro(&self.test_targets, &y_pred),
                recall: metrics::recall_macro(&self.test_targets, &y_pred),
                precision: metrics::precision_macro(&self.test_targets, &y_pred),
                f1_auc: 0.0,
                avg_distance_labeled,
                avg_distance_unlabeled,
            });
            raw_predictions.push(proba);
            cb_predictions.push(model.predict_proba(&self.cb_sample)?);
            meta_data.push(MetaData {
                time: (fit_ns as f64 * 1e-9 * 1e4).round() / 1e4,
                percentage_labeled: self.labeled.len() as f64
                    / (self.labeled.len() + self.unlabeled.len()) as f64,
                sample_ids: selected.iter().map(|&i| self.train_ids[i]).collect(),
            });
            tracing::trace!(%side, iteration = meta_data.len(), fit_ns, "Iteration done");
        }

        let f1_history: Vec<f64> = scores.iter().map(|s| s.f1).collect();
        for (idx, score) in scores.iter_mut().enumerate() {
            score.f1_auc = metrics::normalized_f1_auc(&f1_history, idx);
        }
        tracing::info!(
            %side,
            iterations = meta_data.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Experiment finished"
        );

        Ok(ExperimentResults {
            raw_predictions,
            cb_predictions,
            metric_scores: scores,
            initially_labeled,
            test_sample_ids: self.test_ids,
            correct_label_as_idx: self.test_targets,
            meta_data,
            classes: self.classes,
        })
    }
}

/// Runs one experiment start to finish, blocking. Emits SETUP_COMPLETED after
/// setup and always exactly one terminal event.
pub fn run_experiment(
    init: ExperimentInit,
    events: &mpsc::UnboundedSender<ExperimentEvent>,
    cancelled: &AtomicBool,
) {
    let side = init.side;
    let outcome = Experiment::new(init).and_then(|experiment| {
        tracing::info!(
            %side,
            labeled = experiment.labeled_count(),
            unlabeled = experiment.unlabeled_count(),
            test = experiment.test_count(),
            "Experiment setup completed"
        );
        let _ = events.send(ExperimentEvent::SetupCompleted);
        experiment.train(events, cancelled)
    });
    let terminal = match outcome {
        Ok(results) => ExperimentEvent::Result(Box::new(results)),
        Err(e) => {
            tracing::warn!(%side, error = %e, "Experiment failed");
            ExperimentEvent::Failed(e.to_string())
        }
    };
    let _ = events.send(terminal);
}

/// Experiment process loop: one INIT frame in, the event stream out.
pub async fn run_experiment_process<R, W>(reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(reader, JsonCodec::<ExperimentInit>::new());
    let mut writer = FramedWrite::new(writer, JsonCodec::<ExperimentEvent>::new());

    let init = match reader.next().await {
        Some(init) => init?,
        None => {
            tracing::info!("Channel closed before INIT, exiting");
            return Ok(());
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker = tokio::task::spawn_blocking(move || {
        run_experiment(init, &tx, &AtomicBool::new(false));
    });
    while let Some(event) = rx.recv().await {
        writer.send(event).await?;
    }
    worker.await.map_err(std::io::Error::other)?;
    Ok(())
}

pub async fn run_stdio() -> std::io::Result<()> {
    let frames = crate::spawn::reserve_stdout_for_frames()?;
    run_experiment_process(tokio::io::stdin(), frames).await
}
