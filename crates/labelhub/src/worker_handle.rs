//! Label worker handle - the parent side of the worker channel.
//!
//! Gives callers a synchronous-looking API over an asynchronous worker:
//! `get_next_sample_id` never waits on the worker longer than
//! `response_wait` and falls back to a random unlabeled sample instead.
//!
//! Flow:
//! 1. Spawn worker, send INIT with a dataset snapshot, send the first REQUEST
//! 2. Writer task forwards outgoing events, reader task forwards answers
//! 3. Suggestions are buffered (LIFO) and leased to callers
//! 4. Restart = STOP + wait + fresh worker; the only way to change config

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::WorkerEvent;
use crate::config::{ActiveLearningConfig, ConfigError};
use crate::dataset::{DatasetId, LabelId, SampleId, SampleStore, StoreError};
use crate::label_worker::run_label_worker;
use crate::spawn::{ChildCommand, SpawnError};

/// Prefetch threshold: below this many buffered ids a new REQUEST goes out.
const MIN_BUFFERED: usize = 2;

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker for dataset {0} exited unexpectedly")]
    ProcessExited(DatasetId),
    #[error("worker for dataset {0} is stopped")]
    NotRunning(DatasetId),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("dataset {0} has no unlabeled samples left")]
    NoUnlabeledSamples(DatasetId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Launched, no answer yet.
    Starting,
    /// No buffered suggestions; random fallback is in use.
    Training,
    /// Suggestions are buffered.
    Waiting,
}

/// A running worker: an OS process or an in-process task.
pub enum WorkerProcess {
    Child(Child),
    Task(Option<JoinHandle<()>>),
}

impl WorkerProcess {
    pub fn task(handle: JoinHandle<()>) -> Self {
        Self::Task(Some(handle))
    }

    pub fn is_alive(&mut self) -> bool {
        match self {
            Self::Child(child) => matches!(child.try_wait(), Ok(None)),
            Self::Task(handle) => handle.as_ref().is_some_and(|h| !h.is_finished()),
        }
    }

    pub async fn wait(&mut self) {
        match self {
            Self::Child(child) => {
                if let Err(e) = child.wait().await {
                    tracing::warn!(error = %e, "Failed to wait for worker process");
                }
            }
            Self::Task(handle) => {
                if let Some(h) = handle.as_mut() {
                    let _ = h.await;
                    *handle = None;
                }
            }
        }
    }

    /// Polite termination: SIGTERM for processes, abort for tasks.
    fn terminate(&mut self) -> bool {
        match self {
            Self::Child(child) => crate::spawn::terminate(child),
            Self::Task(handle) => {
                if let Some(h) = handle.take() {
                    h.abort();
                }
                true
            }
        }
    }

    pub async fn kill(&mut self) {
        match self {
            Self::Child(child) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill worker process");
                }
            }
            Self::Task(handle) => {
                if let Some(h) = handle.take() {
                    h.abort();
                }
            }
        }
    }
}

pub struct SpawnedWorker {
    pub process: WorkerProcess,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, dataset_id: DatasetId) -> Result<SpawnedWorker, SpawnError>;
}

/// Re-executes the running binary as `labelhub worker`.
#[derive(Default)]
pub struct ProcessSpawner {
    command: Option<ChildCommand>,
}

impl ProcessSpawner {
    pub fn with_command(command: ChildCommand) -> Self {
        Self {
            command: Some(command),
        }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, dataset_id: DatasetId) -> Result<SpawnedWorker, SpawnError> {
        let command = match &self.command {
            Some(command) => command.clone(),
            None => ChildCommand::current_exe("worker")?,
        };
        let (child, stdin, stdout) = command.spawn()?;
        tracing::info!(%dataset_id, pid = ?child.id(), "Spawned label worker process");
        Ok(SpawnedWorker {
            process: WorkerProcess::Child(child),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }
}

/// Runs the worker loop as a tokio task over an in-memory duplex stream.
pub struct InProcessSpawner;

impl InProcessSpawner {
    const BUFFER: usize = 1 << 20;
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, dataset_id: DatasetId) -> Result<SpawnedWorker, SpawnError> {
        let (parent, child) = tokio::io::duplex(Self::BUFFER);
        let (child_read, child_write) = tokio::io::split(child);
        let task = tokio::spawn(async move {
            if let Err(e) = run_label_worker(child_read, child_write).await {
                tracing::error!(%dataset_id, error = %e, "In-process label worker failed");
            }
        });
        let (stdout, stdin) = tokio::io::split(parent);
        Ok(SpawnedWorker {
            process: WorkerProcess::task(task),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }
}

#[derive(Clone)]
pub struct WorkerHandleConfig {
    /// How long a handed out suggestion is held back from other callers.
    pub lease_timeout: Duration,
    /// How long `get_next_sample_id` may wait for an outstanding answer.
    /// Zero means only check what already arrived.
    pub response_wait: Duration,
    /// How long STOP may take before the worker is killed.
    pub stop_timeout: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for WorkerHandleConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(30),
            response_wait: Duration::ZERO,
            stop_timeout: Duration::from_secs(10),
            spawner: Arc::new(ProcessSpawner::default()),
        }
    }
}

impl WorkerHandleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_response_wait(mut self, wait: Duration) -> Self {
        self.response_wait = wait;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// One live channel pair to one worker.
struct Connection {
    instance: Uuid,
    process: WorkerProcess,
    outgoing: mpsc::UnboundedSender<WorkerEvent>,
    incoming: mpsc::UnboundedReceiver<Result<WorkerEvent, String>>,
    reader_task: JoinHandle<()>,
}

impl Connection {
    async fn open(
        config: &WorkerHandleConfig,
        dataset_id: DatasetId,
        al_config: &ActiveLearningConfig,
        store: &dyn SampleStore,
    ) -> Result<Self, WorkerError> {
        let dataset = store.dataset(dataset_id).await?;
        let spawned = config.spawner.spawn(dataset_id)?;
        let instance = Uuid::new_v4();

        let mut writer = FramedWrite::new(spawned.stdin, JsonCodec::<WorkerEvent>::new());
        let mut reader = FramedRead::new(spawned.stdout, JsonCodec::<WorkerEvent>::new());

        tracing::debug!(%dataset_id, %instance, samples = dataset.samples.len(), "Sending INIT to worker");
        writer
            .send(WorkerEvent::Init {
                config: al_config.clone(),
                dataset,
            })
            .await
            .map_err(|e| WorkerError::Protocol(format!("failed to send INIT: {}", e)))?;

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        tokio::spawn(async move {
            while let Some(event) = outgoing_rx.recv().await {
                let kind = event.kind();
                let stop = matches!(event, WorkerEvent::Stop);
                if let Err(e) = writer.send(event).await {
                    tracing::warn!(%dataset_id, %instance, kind, error = %e, "Failed to write to worker");
                    break;
                }
                if stop {
                    break;
                }
            }
            tracing::trace!(%dataset_id, %instance, "Worker writer exiting");
        });

        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(event)) => {
                        if incoming_tx.send(Ok(event)).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(%dataset_id, %instance, error = %e, "Worker channel error");
                        let _ = incoming_tx.send(Err(e.to_string()));
                        break;
                    }
                    None => {
                        tracing::trace!(%dataset_id, %instance, "Worker closed its channel");
                        break;
                    }
                }
            }
        });

        tracing::info!(%dataset_id, %instance, strategy = al_config.query_strategy.name(), "Label worker started");
        Ok(Self {
            instance,
            process: spawned.process,
            outgoing,
            incoming,
            reader_task,
        })
    }

    fn send(&self, event: WorkerEvent) -> Result<(), WorkerError> {
        let kind = event.kind();
        self.outgoing
            .send(event)
            .map_err(|_| WorkerError::Protocol(format!("worker channel closed while sending {}", kind)))
    }

    /// STOP, bounded wait, then SIGTERM and finally kill.
    async fn shutdown(mut self, dataset_id: DatasetId, timeout: Duration) {
        let _ = self.outgoing.send(WorkerEvent::Stop);
        match tokio::time::timeout(timeout, self.process.wait()).await {
            Ok(()) => {
                tracing::info!(%dataset_id, instance = %self.instance, "Label worker stopped");
            }
            Err(_) => {
                tracing::warn!(%dataset_id, instance = %self.instance, "Label worker ignored STOP, terminating");
                let terminated = self.process.terminate()
                    && tokio::time::timeout(TERM_GRACE, self.process.wait())
                        .await
                        .is_ok();
                if !terminated {
                    self.process.kill().await;
                }
            }
        }
        self.reader_task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Child processes are kill_on_drop; tasks need an explicit abort.
        if let WorkerProcess::Task(Some(handle)) = &self.process {
            handle.abort();
        }
        self.reader_task.abort();
    }
}

struct HandleState {
    al_config: ActiveLearningConfig,
    connection: Option<Connection>,
    state: WorkerState,
    pending_request: bool,
    /// Worker suggestions not handed out yet. Popped from the back.
    suggestions: Vec<SampleId>,
    leases: HashMap<SampleId, Instant>,
    /// Labeled through this handle; never suggested again unless removed.
    confirmed: HashSet<SampleId>,
    served: u64,
    rng: StdRng,
}

impl HandleState {
    fn is_held(&self, id: &SampleId) -> bool {
        self.leases.contains_key(id) || self.confirmed.contains(id)
    }

    fn take_expired(&mut self, lease_timeout: Duration) -> Vec<SampleId> {
        let now = Instant::now();
        let expired: Vec<SampleId> = self
            .leases
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= lease_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.leases.remove(id);
        }
        expired
    }

    /// Released samples go back to the bottom of the buffer.
    fn requeue(&mut self, dataset_id: DatasetId, released: impl IntoIterator<Item = SampleId>) {
        for id in released {
            tracing::debug!(%dataset_id, sample_id = %id, "Lease expired, releasing sample");
            if !self.is_held(&id) && !self.suggestions.contains(&id) {
                self.suggestions.insert(0, id);
            }
        }
    }

    fn pop_suggestion(&mut self) -> Option<SampleId> {
        while let Some(id) = self.suggestions.pop() {
            if !self.is_held(&id) {
                return Some(id);
            }
        }
        None
    }

    fn request(&mut self, dataset_id: DatasetId) -> Result<(), WorkerError> {
        if self.pending_request {
            return Ok(());
        }
        let connection = self
            .connection
            .as_ref()
            .ok_or(WorkerError::NotRunning(dataset_id))?;
        connection.send(WorkerEvent::Request { sample_ids: None })?;
        self.pending_request = true;
        tracing::trace!(%dataset_id, "REQUEST sent");
        Ok(())
    }

    fn accept(&mut self, dataset_id: DatasetId, event: Result<WorkerEvent, String>) -> Result<(), WorkerError> {
        match event {
            Ok(WorkerEvent::Request {
                sample_ids: Some(ids),
            }) => {
                tracing::debug!(%dataset_id, count = ids.len(), "Received suggestions");
                self.pending_request = false;
                self.state = WorkerState::Waiting;
                for id in ids {
                    if !self.is_held(&id) && !self.suggestions.contains(&id) {
                        self.suggestions.push(id);
                    }
                }
                Ok(())
            }
            Ok(other) => Err(WorkerError::Protocol(format!(
                "unexpected {} from worker",
                other.kind()
            ))),
            Err(e) => Err(WorkerError::Protocol(e)),
        }
    }

    /// Folds in whatever the worker has answered, waiting up to `wait`.
    /// Answers that arrived before the worker exited are still used.
    async fn receive(&mut self, dataset_id: DatasetId, wait: Duration) -> Result<(), WorkerError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(WorkerError::NotRunning(dataset_id))?;

        let mut received = Vec::new();
        while let Ok(event) = connection.incoming.try_recv() {
            received.push(event);
        }
        let alive = connection.process.is_alive();
        if alive
            && received.is_empty()
            && self.pending_request
            && !wait.is_zero()
            && let Ok(Some(event)) = tokio::time::timeout(wait, connection.incoming.recv()).await
        {
            received.push(event);
        }

        for event in received {
            self.accept(dataset_id, event)?;
        }
        if !alive && self.suggestions.is_empty() {
            return Err(WorkerError::ProcessExited(dataset_id));
        }
        Ok(())
    }

    async fn random_unlabeled(
        &mut self,
        dataset_id: DatasetId,
        store: &dyn SampleStore,
    ) -> Result<SampleId, WorkerError> {
        let candidates: Vec<SampleId> = store
            .unlabeled_sample_ids(dataset_id)
            .await?
            .into_iter()
            .filter(|id| !self.is_held(id))
            .collect();
        candidates
            .choose(&mut self.rng)
            .copied()
            .ok_or(WorkerError::NoUnlabeledSamples(dataset_id))
    }
}

/// Orchestrator-side proxy for one dataset's label worker.
pub struct WorkerHandle {
    dataset_id: DatasetId,
    store: Arc<dyn SampleStore>,
    config: WorkerHandleConfig,
    inner: Mutex<HandleState>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("dataset_id", &self.dataset_id)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Spawns the worker and sends the first REQUEST.
    pub async fn start(
        dataset_id: DatasetId,
        store: Arc<dyn SampleStore>,
        al_config: ActiveLearningConfig,
        config: WorkerHandleConfig,
    ) -> Result<Self, WorkerError> {
        al_config.validate()?;
        let connection = Connection::open(&config, dataset_id, &al_config, store.as_ref()).await?;

        let mut state = HandleState {
            al_config,
            connection: Some(connection),
            state: WorkerState::Starting,
            pending_request: false,
            suggestions: Vec::new(),
            leases: HashMap::new(),
            confirmed: HashSet::new(),
            served: 0,
            rng: StdRng::from_os_rng(),
        };
        state.request(dataset_id)?;

        Ok(Self {
            dataset_id,
            store,
            config,
            inner: Mutex::new(state),
        })
    }

    pub fn dataset_id(&self) -> DatasetId {
        self.dataset_id
    }

    /// Next sample to show. Never blocks on the worker beyond `response_wait`.
    pub async fn get_next_sample_id(&self) -> Result<SampleId, WorkerError> {
        let mut s = self.inner.lock().await;
        if s.connection.is_none() {
            return Err(WorkerError::NotRunning(self.dataset_id));
        }

        let expired = s.take_expired(self.config.lease_timeout);
        if !expired.is_empty() {
            // Samples labeled elsewhere while leased stay out of the buffer.
            let unlabeled: HashSet<SampleId> = self
                .store
                .unlabeled_sample_ids(self.dataset_id)
                .await?
                .into_iter()
                .collect();
            s.requeue(
                self.dataset_id,
                expired.into_iter().filter(|id| unlabeled.contains(id)),
            );
        }

        let every = s.al_config.random_sample_every as u64;
        let id = if every > 0 && (s.served + 1) % every == 0 {
            tracing::trace!(dataset_id = %self.dataset_id, "Serving scheduled random sample");
            s.random_unlabeled(self.dataset_id, self.store.as_ref()).await?
        } else if let Some(id) = s.pop_suggestion() {
            id
        } else {
            s.receive(self.dataset_id, self.config.response_wait).await?;
            match s.pop_suggestion() {
                Some(id) => id,
                None => {
                    tracing::debug!(dataset_id = %self.dataset_id, "No suggestion available, falling back to random");
                    s.random_unlabeled(self.dataset_id, self.store.as_ref()).await?
                }
            }
        };

        s.suggestions.retain(|other| *other != id);
        if s.suggestions.is_empty() && s.state == WorkerState::Waiting {
            s.state = WorkerState::Training;
        }
        if s.suggestions.len() < MIN_BUFFERED
            && let Err(e) = s.request(self.dataset_id)
        {
            // The id in hand is still valid; a dead worker surfaces on the next call.
            tracing::warn!(dataset_id = %self.dataset_id, error = %e, "Failed to request more suggestions");
        }
        s.leases.insert(id, Instant::now());
        s.served += 1;
        Ok(id)
    }

    /// Number of ids handed out so far.
    pub async fn served(&self) -> u64 {
        self.inner.lock().await.served
    }

    /// Confirms a label. Fire-and-forget towards the worker.
    pub async fn add_sample_label(
        &self,
        sample_id: SampleId,
        label_id: LabelId,
    ) -> Result<(), WorkerError> {
        let mut s = self.inner.lock().await;
        if s.leases.remove(&sample_id).is_none() {
            tracing::warn!(dataset_id = %self.dataset_id, %sample_id, "Labeled sample was never suggested");
        }
        s.suggestions.retain(|id| *id != sample_id);
        s.confirmed.insert(sample_id);
        self.connection(&s)?.send(WorkerEvent::Add {
            sample_id,
            label_id,
        })
    }

    /// Withdraws a label; the sample becomes eligible again.
    pub async fn remove_sample_label(
        &self,
        sample_id: SampleId,
        label_id: LabelId,
    ) -> Result<(), WorkerError> {
        let mut s = self.inner.lock().await;
        if !s.confirmed.remove(&sample_id) {
            tracing::warn!(dataset_id = %self.dataset_id, %sample_id, "Removed label was not added through this worker");
        }
        s.leases.remove(&sample_id);
        self.connection(&s)?.send(WorkerEvent::Remove {
            sample_id,
            label_id,
        })
    }

    /// Stops the current worker and starts a fresh one with a new snapshot,
    /// optionally with a new configuration.
    pub async fn restart_process(
        &self,
        al_config: Option<ActiveLearningConfig>,
    ) -> Result<(), WorkerError> {
        if let Some(config) = &al_config {
            config.validate()?;
        }
        let mut s = self.inner.lock().await;
        if let Some(config) = al_config {
            s.al_config = config;
        }
        if let Some(connection) = s.connection.take() {
            connection
                .shutdown(self.dataset_id, self.config.stop_timeout)
                .await;
        }

        tracing::info!(dataset_id = %self.dataset_id, "Restarting label worker");
        let connection = Connection::open(
            &self.config,
            self.dataset_id,
            &s.al_config,
            self.store.as_ref(),
        )
        .await?;
        s.connection = Some(connection);
        s.state = WorkerState::Starting;
        s.pending_request = false;
        s.suggestions.clear();
        // The fresh snapshot carries every label confirmed so far.
        s.confirmed.clear();
        s.request(self.dataset_id)
    }

    /// STOP and wait; the handle is unusable afterwards until restarted.
    pub async fn stop(&self) {
        let mut s = self.inner.lock().await;
        if let Some(connection) = s.connection.take() {
            connection
                .shutdown(self.dataset_id, self.config.stop_timeout)
                .await;
        }
        s.pending_request = false;
        s.suggestions.clear();
    }

    pub async fn is_alive(&self) -> bool {
        let mut s = self.inner.lock().await;
        s.connection
            .as_mut()
            .is_some_and(|c| c.process.is_alive())
    }

    pub async fn state(&self) -> WorkerState {
        self.inner.lock().await.state
    }

    pub async fn pending_request(&self) -> bool {
        self.inner.lock().await.pending_request
    }

    pub async fn buffered(&self) -> usize {
        self.inner.lock().await.suggestions.len()
    }

    pub async fn config(&self) -> ActiveLearningConfig {
        self.inner.lock().await.al_config.clone()
    }

    fn connection<'a>(&self, s: &'a HandleState) -> Result<&'a Connection, WorkerError> {
        s.connection
            .as_ref()
            .ok_or(WorkerError::NotRunning(self.dataset_id))
    }
}
