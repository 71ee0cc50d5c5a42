//! Starting the two experiment processes of a battle.
//!
//! Each side yields an event receiver. Whatever the transport, the receiver
//! delivers SETUP_COMPLETED, INFO*, and exactly one terminal event; a side
//! that dies without reporting gets a synthesized FAILED.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::experiment::run_experiment;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ExperimentEvent, ExperimentInit, Side};
use crate::spawn::{ChildCommand, SpawnError};

/// A running experiment: an OS process or a blocking task.
pub enum SideProcess {
    Child(Child),
    Task {
        cancelled: Arc<AtomicBool>,
        task: JoinHandle<()>,
    },
}

impl SideProcess {
    pub fn is_finished(&mut self) -> bool {
        match self {
            Self::Child(child) => !matches!(child.try_wait(), Ok(None)),
            Self::Task { task, .. } => task.is_finished(),
        }
    }

    /// Non-blocking kill. Safe to call repeatedly.
    pub fn kill(&mut self) {
        match self {
            Self::Child(child) => {
                if matches!(child.try_wait(), Ok(None))
                    && let Err(e) = child.start_kill()
                {
                    tracing::warn!(error = %e, "Failed to kill experiment process");
                }
            }
            // Blocking tasks cannot be aborted; the loop checks the flag
            // once per iteration.
            Self::Task { cancelled, .. } => cancelled.store(true, Ordering::Relaxed),
        }
    }
}

impl Drop for SideProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

pub struct SpawnedSide {
    pub process: SideProcess,
    pub events: mpsc::UnboundedReceiver<ExperimentEvent>,
}

pub trait ExperimentSpawner: Send + Sync {
    fn spawn(&self, init: ExperimentInit) -> Result<SpawnedSide, SpawnError>;
}

/// Re-executes the running binary as `labelhub experiment`.
#[derive(Default)]
pub struct ProcessExperimentSpawner {
    command: Option<ChildCommand>,
}

impl ProcessExperimentSpawner {
    pub fn with_command(command: ChildCommand) -> Self {
        Self {
            command: Some(command),
        }
    }
}

impl ExperimentSpawner for ProcessExperimentSpawner {
    fn spawn(&self, init: ExperimentInit) -> Result<SpawnedSide, SpawnError> {
        let command = match &self.command {
            Some(command) => command.clone(),
            None => ChildCommand::current_exe("experiment")?,
        };
        let side = init.side;
        let (child, stdin, stdout) = command.spawn()?;
        tracing::info!(%side, pid = ?child.id(), "Spawned experiment process");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut writer = FramedWrite::new(stdin, JsonCodec::<ExperimentInit>::new());
            if let Err(e) = writer.send(init).await {
                let _ = tx.send(ExperimentEvent::Failed(format!(
                    "failed to send INIT to experiment {side}: {e}"
                )));
                return;
            }
            // Closing stdin tells the child no more input follows.
            drop(writer);

            let mut reader = FramedRead::new(stdout, JsonCodec::<ExperimentEvent>::new());
            forward_events(side, &mut reader, &tx).await;
        });

        Ok(SpawnedSide {
            process: SideProcess::Child(child),
            events: rx,
        })
    }
}

async fn forward_events<S>(side: Side, frames: &mut S, tx: &mpsc::UnboundedSender<ExperimentEvent>)
where
    S: futures::Stream<Item = std::io::Result<ExperimentEvent>> + Unpin,
{
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(event) => {
                let terminal = event.is_terminal();
                if tx.send(event).is_err() || terminal {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(%side, error = %e, "Experiment channel error");
                let _ = tx.send(ExperimentEvent::Failed(format!(
                    "experiment {side} channel error: {e}"
                )));
                return;
            }
        }
    }
    let _ = tx.send(ExperimentEvent::Failed(format!(
        "experiment {side} exited without a result"
    )));
}

/// Runs experiments on the blocking thread pool of the current runtime.
pub struct InProcessExperimentSpawner;

impl ExperimentSpawner for InProcessExperimentSpawner {
    fn spawn(&self, init: ExperimentInit) -> Result<SpawnedSide, SpawnError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let task = tokio::task::spawn_blocking(move || run_experiment(init, &tx, &flag));
        Ok(SpawnedSide {
            process: SideProcess::Task { cancelled, task },
            events: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::experiment::tests::{battle_config, init, small_dataset};

    #[tokio::test]
    async fn in_process_side_reports_to_the_end() {
        let mut side = InProcessExperimentSpawner
            .spawn(init(Side::One, battle_config(), &small_dataset()))
            .unwrap();

        let mut terminal = 0;
        let mut first = None;
        while let Some(event) = side.events.recv().await {
            first.get_or_insert_with(|| matches!(event, ExperimentEvent::SetupCompleted));
            terminal += usize::from(event.is_terminal());
        }
        assert_eq!(first, Some(true));
        assert_eq!(terminal, 1);
        if let SideProcess::Task { task, .. } = &mut side.process {
            task.await.unwrap();
        }
        assert!(side.process.is_finished());
    }

    #[tokio::test]
    async fn truncated_stream_yields_failed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut frames = futures::stream::iter(vec![Ok(ExperimentEvent::SetupCompleted)]);
        forward_events(Side::Two, &mut frames, &tx).await;

        assert!(matches!(rx.recv().await, Some(ExperimentEvent::SetupCompleted)));
        assert!(matches!(
            rx.recv().await,
            Some(ExperimentEvent::Failed(e)) if e == "experiment 2 exited without a result"
        ));
    }

    #[tokio::test]
    async fn forwarding_stops_at_the_terminal_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut frames = futures::stream::iter(vec![
            Ok(ExperimentEvent::Failed("boom".to_string())),
            Ok(ExperimentEvent::SetupCompleted),
        ]);
        forward_events(Side::One, &mut frames, &tx).await;
        drop(tx);

        assert!(matches!(rx.recv().await, Some(ExperimentEvent::Failed(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let spawner = ProcessExperimentSpawner::with_command(ChildCommand::new(
            "/nonexistent/labelhub",
            ["experiment"],
        ));
        let result = spawner.spawn(init(Side::One, battle_config(), &small_dataset()));
        assert!(matches!(result, Err(SpawnError::Spawn(_))));
    }
}
