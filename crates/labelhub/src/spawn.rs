//! Child process plumbing shared by label workers and experiment sides.
//!
//! Children are re-executions of the running binary with a subcommand
//! (`labelhub worker`, `labelhub experiment`). Frames travel over the child's
//! stdin/stdout; stderr is inherited so child logs end up next to the parent's.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWrite;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Program plus arguments used to start a child.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ChildCommand {
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The running executable invoked with `subcommand`.
    pub fn current_exe(subcommand: &str) -> Result<Self, SpawnError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, [subcommand]))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Spawns with piped stdin/stdout and inherited stderr. The child is killed
    /// if the returned [`Child`] is dropped without being waited on.
    pub fn spawn(&self) -> Result<(Child, ChildStdin, ChildStdout), SpawnError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        tracing::debug!(
            program = %self.program.display(),
            pid = ?child.id(),
            "Spawned child process"
        );
        Ok((child, stdin, stdout))
    }
}

/// Claims the original stdout for frames and points fd 1 at stderr.
///
/// Must run in the child before any engine code. Anything printed to stdout
/// afterwards lands in the log instead of corrupting the frame stream.
#[cfg(unix)]
pub fn reserve_stdout_for_frames() -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
    use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};

    use nix::unistd::{dup, dup2};

    // Safety: fds 1 and 2 are open for the whole lifetime of the process.
    let frames = unsafe { dup(BorrowedFd::borrow_raw(1)) }
        .map_err(|e| io::Error::other(format!("dup(1) failed: {}", e)))?;

    let stderr = unsafe { BorrowedFd::borrow_raw(2) };
    let mut fd1 = unsafe { OwnedFd::from_raw_fd(1) };
    dup2(stderr, &mut fd1).map_err(|e| io::Error::other(format!("dup2(stdout) failed: {}", e)))?;
    std::mem::forget(fd1); // fd 1 must stay open

    tracing::trace!("Moved frame channel off fd 1");
    Ok(Box::new(tokio::fs::File::from_std(std::fs::File::from(
        frames,
    ))))
}

#[cfg(not(unix))]
pub fn reserve_stdout_for_frames() -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
    Ok(Box::new(tokio::io::stdout()))
}

/// Sends SIGTERM. Returns false if the child is gone or signalling failed.
#[cfg(unix)]
pub fn terminate(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid, error = %e, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
pub fn terminate(_child: &Child) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::bridge::codec::JsonCodec;
    use crate::bridge::protocol::WorkerEvent;
    use crate::dataset::{LabelId, SampleId};

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = ChildCommand::new("/nonexistent/labelhub-child", ["worker"])
            .spawn()
            .unwrap_err();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }

    #[test]
    fn current_exe_uses_subcommand() {
        let cmd = ChildCommand::current_exe("experiment").unwrap();
        assert_eq!(cmd.args, vec![OsString::from("experiment")]);
        assert!(cmd.program().is_absolute());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn frames_survive_a_child_pipe() {
        let (mut child, stdin, stdout) = ChildCommand::new("cat", Vec::<String>::new())
            .spawn()
            .unwrap();

        let mut writer = FramedWrite::new(stdin, JsonCodec::<WorkerEvent>::new());
        let mut reader = FramedRead::new(stdout, JsonCodec::<WorkerEvent>::new());

        let event = WorkerEvent::Add {
            sample_id: SampleId(7),
            label_id: LabelId(1),
        };
        writer.send(event.clone()).await.unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap(), event);

        assert!(terminate(&child));
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
