/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Local OS process launcher.
//!
//! Used in single-host multi-process mode, and by the worker agent to
//! start the workers it is asked for. A launch writes the worker's
//! environment descriptor under the run directory and starts the
//! worker program pointed at it:
//!
//! ```text
//! <run_dir>/log_<rank>/env_proto_<rank>.proto
//! <program> <args..> --env_proto=<run_dir>/log_<rank>/env_proto_<rank>.proto
//! ```
//!
//! Launches are fire-and-forget. The worker reports its own startup
//! failures through its logs and exit status; the returned
//! [`LocalWorker`] is only used to observe that exit status (or kill
//! the worker) at teardown.

use std::fmt;
use std::io;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Child;
use tokio::process::Command;

use super::LaunchTarget;
use super::LauncherKind;
use super::RankLaunchError;
use super::WorkerHandle;
use super::WorkerLauncher;

/// Environment variable carrying the host a worker was requested on.
pub const WORKER_HOST_ENV: &str = "CLUSTER_WORKER_HOST";
/// Environment variable carrying the worker's rank.
pub const WORKER_RANK_ENV: &str = "CLUSTER_WORKER_RANK";

/// Local filesystem or process-spawn failures. When any of these is
/// returned, no process was started for the rank.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("rank {rank}: failed to write environment descriptor: {source}")]
    WriteEnv {
        rank: usize,
        #[source]
        source: io::Error,
    },

    #[error("rank {rank}: failed to create log directory {}: {source}", .path.display())]
    CreateDir {
        rank: usize,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("rank {rank}: failed to copy environment descriptor to {}: {source}", .path.display())]
    CopyEnv {
        rank: usize,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("rank {rank}: failed to spawn {program}: {source}")]
    Spawn {
        rank: usize,
        program: String,
        #[source]
        source: io::Error,
    },
}

/// The per-rank log directory under `run_dir`.
pub fn rank_log_dir(run_dir: &Path, rank: usize) -> PathBuf {
    run_dir.join(format!("log_{}", rank))
}

/// Where the environment descriptor for `rank` is kept.
pub fn rank_env_path(run_dir: &Path, rank: usize) -> PathBuf {
    rank_log_dir(run_dir, rank).join(format!("env_proto_{}.proto", rank))
}

/// Starts workers as detached local processes.
#[derive(Debug, Clone)]
pub struct LocalProcessLauncher {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl LocalProcessLauncher {
    /// Workers are started as `program args.. --env_proto=<path>`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// Build a launcher from a shell-style command line, e.g.
    /// `"python3 -m worker --start_worker"`.
    pub fn from_command_line(command: &str) -> Result<Self, shell_words::ParseError> {
        let mut words = shell_words::split(command)?.into_iter();
        let program = words.next().unwrap_or_default();
        Ok(Self::new(program, words.collect()))
    }

    /// Set an extra environment variable on every launched worker.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Launch the worker for `rank` from `serialized_env`.
    ///
    /// The environment is first written to a uniquely named temporary
    /// file, which is copied into the rank's log directory (created if
    /// absent) for post-mortem inspection and then removed. Any
    /// filesystem failure aborts the launch before a process is
    /// spawned.
    pub async fn launch(
        &self,
        rank: usize,
        serialized_env: &str,
        run_dir: &Path,
    ) -> Result<LocalWorker, LaunchError> {
        let mut env_file = tempfile::Builder::new()
            .prefix(&format!("env_proto_{}_", rank))
            .tempfile()
            .map_err(|source| LaunchError::WriteEnv { rank, source })?;
        env_file
            .write_all(serialized_env.as_bytes())
            .and_then(|()| env_file.flush())
            .map_err(|source| LaunchError::WriteEnv { rank, source })?;

        let log_dir = rank_log_dir(run_dir, rank);
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|source| LaunchError::CreateDir {
                rank,
                path: log_dir.clone(),
                source,
            })?;

        let env_path = rank_env_path(run_dir, rank);
        tokio::fs::copy(env_file.path(), &env_path)
            .await
            .map_err(|source| LaunchError::CopyEnv {
                rank,
                path: env_path.clone(),
                source,
            })?;
        if let Err(e) = env_file.close() {
            tracing::warn!(rank, "failed to remove temporary environment file: {}", e);
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(format!("--env_proto={}", env_path.display()))
            .env(WORKER_RANK_ENV, rank.to_string())
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Detach from our process group so that signals aimed at
            // the orchestrator do not reach the workers.
            .process_group(0)
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            rank,
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(rank, pid, env = %env_path.display(), "launched local worker");

        Ok(LocalWorker {
            rank,
            pid,
            env_path,
            child,
        })
    }
}

/// Why a local worker stopped, as observed at teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStopReason {
    /// Exited with status 0.
    Stopped,
    /// Exited with the provided non-zero code.
    Exited(i32),
    /// Killed by the given signal; the flag tells whether core was dumped.
    Killed(i32, bool),
    /// Still running at teardown and killed by us.
    Reaped,
    Unknown,
}

impl fmt::Display for WorkerStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Killed(signal, dumped) => {
                write!(f, "killed with signal {} (core dumped={})", signal, dumped)
            }
            Self::Reaped => write!(f, "killed at teardown"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

fn exit_status_to_reason(status: ExitStatus) -> WorkerStopReason {
    if status.success() {
        WorkerStopReason::Stopped
    } else if let Some(signal) = status.signal() {
        WorkerStopReason::Killed(signal, status.core_dumped())
    } else if let Some(code) = status.code() {
        WorkerStopReason::Exited(code)
    } else {
        WorkerStopReason::Unknown
    }
}

/// A worker process started by [`LocalProcessLauncher`].
#[derive(Debug)]
pub struct LocalWorker {
    rank: usize,
    pid: Option<u32>,
    env_path: PathBuf,
    child: Child,
}

impl LocalWorker {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The persisted environment descriptor the worker was started from.
    pub fn env_path(&self) -> &Path {
        &self.env_path
    }

    /// Observe how the worker ended, killing it first if it is still
    /// running.
    pub async fn reap(mut self) -> WorkerStopReason {
        match self.child.try_wait() {
            Ok(Some(status)) => return exit_status_to_reason(status),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(rank = self.rank, "error polling worker: {}", e);
                return WorkerStopReason::Unknown;
            }
        }
        if let Err(e) = self.child.start_kill() {
            tracing::error!(rank = self.rank, "error killing worker: {}", e);
            return WorkerStopReason::Unknown;
        }
        match self.child.wait().await {
            Ok(_) => WorkerStopReason::Reaped,
            Err(e) => {
                tracing::error!(rank = self.rank, "error waiting for worker: {}", e);
                WorkerStopReason::Unknown
            }
        }
    }

    /// How the worker ended, if it already has. Never blocks. A worker
    /// that cannot be polled is reported as [`WorkerStopReason::Unknown`].
    pub fn try_stopped(&mut self) -> Option<WorkerStopReason> {
        match self.child.try_wait() {
            Ok(status) => status.map(exit_status_to_reason),
            Err(e) => {
                tracing::error!(rank = self.rank, "error polling worker: {}", e);
                Some(WorkerStopReason::Unknown)
            }
        }
    }

    /// Send a kill signal without waiting for the worker to exit.
    pub fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    /// Wait for the worker to exit on its own.
    pub async fn wait(&mut self) -> WorkerStopReason {
        match self.child.wait().await {
            Ok(status) => exit_status_to_reason(status),
            Err(e) => {
                tracing::error!(rank = self.rank, "error waiting for worker: {}", e);
                WorkerStopReason::Unknown
            }
        }
    }
}

/// [`WorkerLauncher`] backend for single-host mode: every rank becomes
/// a local process whose artifacts live under `run_dir`.
#[derive(Debug)]
pub struct LocalLauncher {
    launcher: LocalProcessLauncher,
    run_dir: PathBuf,
}

impl LocalLauncher {
    pub fn new(launcher: LocalProcessLauncher, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            launcher,
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    fn kind(&self) -> LauncherKind {
        LauncherKind::Local
    }

    async fn launch(&self, target: &LaunchTarget) -> Result<WorkerHandle, RankLaunchError> {
        let env = target
            .env
            .clone()
            .with_log_dir(rank_log_dir(&self.run_dir, target.rank));
        let text = env.to_text().map_err(|e| RankLaunchError::Encode {
            rank: target.rank,
            reason: e.to_string(),
        })?;
        let worker = self.launcher.launch(target.rank, &text, &self.run_dir).await?;
        Ok(WorkerHandle::Local(worker))
    }
}
