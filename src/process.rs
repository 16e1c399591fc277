//! Conductor process lifecycle: spawn, readiness, signalling, exit.
//!
//! The spawned child is owned by a monitor task. The [`ProcessHandle`]
//! talks to it through a signal channel and observes the exit status
//! through a watch cell, so any number of callers can await the exit.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{HarnessError, Result};

/// Signal delivered to a conductor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGINT, the polite shutdown request conductors expect.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGKILL, unconditional.
    Kill,
}

/// Exit status of a finished conductor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// OS exit code, `None` when the process died to a signal.
    pub code: Option<i32>,
}

/// Handle over one spawned conductor process.
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    exits: watch::Receiver<Option<ProcessExit>>,
    signals: mpsc::Sender<TermSignal>,
}

impl ProcessHandle {
    /// Spawn `program` with `args`: stdin null, stdout/stderr piped,
    /// kill-on-drop. Stderr is drained to the log immediately.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Startup`] when the process cannot be
    /// spawned or its pipes are missing.
    pub fn start<S: AsRef<OsStr>>(name: &str, program: &Path, args: &[S]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                HarnessError::Startup(format!("failed to spawn {}: {err}", program.display()))
            })?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Startup("conductor stdout pipe missing".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HarnessError::Startup("conductor stderr pipe missing".into()))?;

        let stderr_name = name.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(conductor = %stderr_name, "stderr: {line}");
            }
        });

        let (exit_tx, exits) = watch::channel(None);
        let (signals, signal_rx) = mpsc::channel(8);
        tokio::spawn(monitor(name.to_owned(), child, exit_tx, signal_rx));

        debug!(conductor = name, pid, "conductor process spawned");
        Ok(Self {
            name: name.to_owned(),
            pid,
            stdout: Some(BufReader::new(stdout).lines()),
            exits,
            signals,
        })
    }

    /// Name this process was spawned under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS pid assigned at spawn.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the exit status has already been observed.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exits.borrow().is_some()
    }

    /// Scan stdout until a line containing `marker` appears, then hand
    /// the rest of the stream to a background drain.
    ///
    /// Stdout EOF without the marker is not itself fatal; the scan keeps
    /// waiting for the exit status or the deadline, whichever comes
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::ExitedEarly`] when the process terminates
    /// before the marker, [`HarnessError::ReadyTimeout`] when `timeout`
    /// elapses, and [`HarnessError::Startup`] when stdout was already
    /// consumed or cannot be read.
    pub async fn await_ready(&mut self, marker: &str, timeout: Duration) -> Result<()> {
        let mut lines = self
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Startup("conductor stdout already consumed".into()))?;
        let deadline = Instant::now() + timeout;
        let mut exits = self.exits.clone();
        let mut stdout_open = true;

        let outcome = loop {
            tokio::select! {
                biased;

                exit = exited(&mut exits) => {
                    break Err(HarnessError::ExitedEarly { code: exit.code });
                }

                () = tokio::time::sleep_until(deadline) => {
                    break Err(HarnessError::ReadyTimeout { waited: timeout });
                }

                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) if line.contains(marker) => break Ok(()),
                    Ok(Some(line)) => debug!(conductor = %self.name, "stdout: {line}"),
                    Ok(None) => stdout_open = false,
                    Err(err) => {
                        break Err(HarnessError::Startup(format!(
                            "failed to read conductor stdout: {err}"
                        )));
                    }
                },
            }
        };

        if outcome.is_ok() {
            debug!(conductor = %self.name, "readiness marker seen");
            let name = self.name.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(conductor = %name, "stdout: {line}");
                }
            });
        }
        outcome
    }

    /// Deliver `signal` without waiting for the process to react.
    pub fn signal(&self, signal: TermSignal) {
        debug!(conductor = %self.name, ?signal, "signalling conductor");
        if self.signals.try_send(signal).is_err() {
            debug!(conductor = %self.name, "conductor already exited, signal dropped");
        }
    }

    /// Resolve with the exit status once the process terminates.
    ///
    /// Resolves immediately when the process has already exited; any
    /// number of waiters may hold this concurrently.
    pub async fn wait(&self) -> ProcessExit {
        let mut exits = self.exits.clone();
        exited(&mut exits).await
    }
}

/// Await the exit report. The monitor task always publishes one before
/// finishing, so a dead channel without a report means the runtime is
/// tearing down and there is nothing left to observe.
async fn exited(exits: &mut watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    match exits.wait_for(Option::is_some).await {
        Ok(exit) => (*exit).unwrap_or(ProcessExit { code: None }),
        Err(_) => std::future::pending().await,
    }
}

async fn monitor(
    name: String,
    mut child: Child,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    mut signals: mpsc::Receiver<TermSignal>,
) {
    let mut signals_open = true;
    loop {
        tokio::select! {
            status = child.wait() => {
                let exit = match status {
                    Ok(status) => {
                        debug!(conductor = %name, %status, "conductor process exited");
                        ProcessExit { code: status.code() }
                    }
                    Err(err) => {
                        warn!(conductor = %name, error = %err, "failed to reap conductor process");
                        ProcessExit { code: None }
                    }
                };
                let _ = exit_tx.send(Some(exit));
                break;
            }

            signal = signals.recv(), if signals_open => match signal {
                Some(signal) => deliver_signal(&name, &mut child, signal),
                None => signals_open = false,
            },
        }
    }
}

#[cfg(unix)]
fn deliver_signal(name: &str, child: &mut Child, signal: TermSignal) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        debug!(conductor = %name, "conductor already reaped, signal skipped");
        return;
    };
    let Ok(pid) = i32::try_from(pid) else {
        warn!(conductor = %name, pid, "pid out of signalling range");
        return;
    };
    let signal = match signal {
        TermSignal::Interrupt => Signal::SIGINT,
        TermSignal::Terminate => Signal::SIGTERM,
        TermSignal::Kill => Signal::SIGKILL,
    };
    if let Err(err) = signal::kill(Pid::from_raw(pid), signal) {
        warn!(conductor = %name, %signal, error = %err, "failed to signal conductor");
    }
}

#[cfg(not(unix))]
fn deliver_signal(name: &str, child: &mut Child, signal: TermSignal) {
    // No per-signal delivery off unix; every request escalates to a kill.
    debug!(conductor = %name, ?signal, "delivering signal as hard kill");
    if let Err(err) = child.start_kill() {
        warn!(conductor = %name, error = %err, "failed to kill conductor");
    }
}
