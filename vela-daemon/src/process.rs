//! Process supervision (spec §4.2).
//!
//! Grounded on the original `common/process.py` (`_TrackStartStopProcessProtocol`:
//! a protocol with one-shot `started`/`stopped` signals and line sinks for
//! stdout/stderr) and on `tokio::process::Command`/`Child` idioms used across
//! the pack for spawning and reaping children.

use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, VelaError};

pub type LineSink = Box<dyn Fn(String) + Send + 'static>;

/// A spawned child process with one-shot start/stop notifications and a
/// `terminate()` that sends SIGTERM (spec §4.2).
pub struct Supervised {
    pub started: oneshot::Receiver<u32>,
    pub stopped: oneshot::Receiver<std::process::ExitStatus>,
    pid: u32,
}

impl Supervised {
    /// Spawns `argv[0]` with the remaining elements as arguments, named
    /// `name` for logging, optionally piping stdout/stderr lines to `out_sink`
    /// / `err_sink`.
    pub fn spawn(
        argv: &[String],
        name: &str,
        out_sink: Option<LineSink>,
        err_sink: Option<LineSink>,
    ) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| VelaError::ConfigInvalid("empty argv for child process".into()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(if out_sink.is_some() { Stdio::piped() } else { Stdio::null() })
            .stderr(if err_sink.is_some() { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(false);

        let mut child: Child = command.spawn().map_err(|e| VelaError::ChildSpawnFailed {
            program: program.clone(),
            source: e,
        })?;

        let pid = child.id().ok_or_else(|| VelaError::ChildSpawnFailed {
            program: program.clone(),
            source: std::io::Error::other("child exited before its pid could be read"),
        })?;

        if let (Some(stdout), Some(sink)) = (child.stdout.take(), out_sink) {
            spawn_line_pump(stdout, sink, name.to_string(), "stdout");
        }
        if let (Some(stderr), Some(sink)) = (child.stderr.take(), err_sink) {
            spawn_line_pump(stderr, sink, name.to_string(), "stderr");
        }

        let (started_tx, started_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let _ = started_tx.send(pid);

        let name = name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    debug!(name, pid, ?status, "child exited");
                    let _ = stopped_tx.send(status);
                }
                Err(e) => {
                    warn!(name, pid, error = %e, "failed to wait on child");
                }
            }
        });

        Ok(Self {
            started: started_rx,
            stopped: stopped_rx,
            pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Sends SIGTERM. A process that has already exited is not an error
    /// (spec §4.2).
    pub fn terminate(&self) -> Result<()> {
        match signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(VelaError::ChildSpawnFailed {
                program: format!("pid {}", self.pid),
                source: std::io::Error::from_raw_os_error(e as i32),
            }),
        }
    }
}

fn spawn_line_pump<R>(reader: R, sink: LineSink, name: String, stream: &'static str)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink(line),
                Ok(None) => break,
                Err(e) => {
                    warn!(name, stream, error = %e, "reading child output failed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn started_fires_with_pid() {
        let supervised = Supervised::spawn(&["true".to_string()], "test", None, None).unwrap();
        let pid = supervised.started.await.unwrap();
        assert_eq!(pid, supervised.pid());
    }

    #[tokio::test]
    async fn stopped_fires_with_exit_status() {
        let supervised = Supervised::spawn(
            &["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            "test",
            None,
            None,
        )
        .unwrap();
        let status = supervised.stopped.await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn terminate_on_already_exited_child_is_not_an_error() {
        let supervised = Supervised::spawn(&["true".to_string()], "test", None, None).unwrap();
        let _ = supervised.stopped.await;
        // give the kernel a moment to fully reap; terminate should still be Ok.
        supervised.terminate().unwrap();
    }

    #[tokio::test]
    async fn stdout_lines_reach_the_sink() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines2 = lines.clone();
        let sink: LineSink = Box::new(move |line| lines2.lock().unwrap().push(line));

        let supervised = Supervised::spawn(
            &[
                "sh".to_string(),
                "-c".to_string(),
                "echo one; echo two".to_string(),
            ],
            "test",
            Some(sink),
            None,
        )
        .unwrap();
        let _ = supervised.stopped.await;
        // allow the line pump task to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*lines.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn spawn_with_empty_argv_is_config_invalid() {
        let result = Supervised::spawn(&[], "test", None, None);
        assert!(matches!(result, Err(VelaError::ConfigInvalid(_))));
    }
}
