// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge worker processes.

use crate::SupervisorError;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when killed by a signal.
    pub code: Option<i32>,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// A running worker.
pub trait WorkerHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> Result<Option<WorkerExit>, SupervisorError>;

    /// Ask the worker to stop, killing it after `timeout`.
    fn stop(&mut self, timeout: Duration) -> impl Future<Output = Result<WorkerExit, SupervisorError>> + Send;
}

/// Starts workers against a rendered configuration file.
pub trait WorkerLauncher: Send + Sync {
    type Handle: WorkerHandle;

    fn launch(&self, config_path: &Path) -> Result<Self::Handle, SupervisorError>;
}

/// Bookkeeping for the current worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: Option<u32>,
    /// Identity of the configuration the worker was started with.
    pub config_id: u64,
    pub started_at: Instant,
    pub last_health_check: Instant,
    /// Crash restarts since the supervisor started.
    pub restart_count: u32,
}

/// Launches the bridge executable as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Handle = ProcessHandle;

    fn launch(&self, config_path: &Path) -> Result<ProcessHandle, SupervisorError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("--config")
            .arg(config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {}", self.program.display(), e)))?;
        Ok(ProcessHandle { child })
    }
}

/// Child process handle.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
}

impl ProcessHandle {
    #[cfg(unix)]
    fn terminate(&mut self) -> bool {
        let Some(pid) = self.child.id() else {
            return false;
        };
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: kill(2) has no memory-safety preconditions; pid is our child.
        unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> bool {
        self.child.start_kill().is_ok()
    }

    async fn shutdown(&mut self, timeout: Duration) -> io::Result<WorkerExit> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(WorkerExit { code: status.code() });
        }

        if self.terminate() {
            match tokio::time::timeout(timeout, self.child.wait()).await {
                Ok(status) => return Ok(WorkerExit { code: status?.code() }),
                Err(_) => {
                    tracing::warn!(pid = ?self.child.id(), "Worker ignored SIGTERM for {:?}, killing", timeout);
                }
            }
        }

        self.child.kill().await?;
        let status = self.child.wait().await?;
        Ok(WorkerExit { code: status.code() })
    }
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<WorkerExit>, SupervisorError> {
        let status = self.child.try_wait()?;
        Ok(status.map(|s| WorkerExit { code: s.code() }))
    }

    fn stop(&mut self, timeout: Duration) -> impl Future<Output = Result<WorkerExit, SupervisorError>> + Send {
        async move {
            self.shutdown(timeout)
                .await
                .map_err(|e| SupervisorError::Stop(e.to_string()))
        }
    }
}
