/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bringing a cluster up, once.
//!
//! A [`ClusterSession`] moves through
//!
//! ```text
//! Uninitialized -> EnvironmentReady -> WorkersLaunched -> TornDown
//! ```
//!
//! [`ClusterSession::ensure_ready`] performs the first two transitions:
//! it resolves and freezes the configuration, computes every rank's
//! environment and launches the worker for each non-master rank, in
//! rank order. Rank 0 is the calling process. Calling it again is a
//! no-op, so test fixtures can call it unconditionally.
//!
//! The session methods take `&mut self`, which makes `ensure_ready`
//! the critical section. Callers sharing a session across tasks wrap
//! it in a mutex.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use crate::bootstrap::BootstrapDescriptor;
use crate::bootstrap::compute_descriptors;
use crate::config::BootstrapMode;
use crate::config::ConfigError;
use crate::config::EnvironmentConfig;
use crate::config::ResolvedConfig;
use crate::env_desc::EnvDescriptor;
use crate::launcher::LaunchTarget;
use crate::launcher::LocalLauncher;
use crate::launcher::RankLaunchError;
use crate::launcher::RemoteLauncher;
use crate::launcher::WorkerHandle;
use crate::launcher::WorkerLauncher;
use crate::launcher::local::WorkerStopReason;
use crate::runner_env::RunnerEnv;

/// Lifecycle of a [`ClusterSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    /// Configuration is frozen and descriptors are computed; some
    /// workers may not have launched yet.
    EnvironmentReady,
    /// Every non-master rank's worker was launched.
    WorkersLaunched,
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::EnvironmentReady => write!(f, "environment ready"),
            Self::WorkersLaunched => write!(f, "workers launched"),
            Self::TornDown => write!(f, "torn down"),
        }
    }
}

/// A rank whose worker failed to launch.
#[derive(Debug)]
pub struct RankFailure {
    pub rank: usize,
    pub host: String,
    pub error: RankLaunchError,
}

impl fmt::Display for RankFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {} on {}: {}", self.rank, self.host, self.error)
    }
}

/// One or more workers failed to launch. Every rank was attempted; the
/// failures are listed in rank order.
#[derive(Debug, thiserror::Error)]
#[error("{} worker(s) failed to launch: {}", .failures.len(), display_failures(.failures))]
pub struct ClusterStartupError {
    pub failures: Vec<RankFailure>,
}

fn display_failures(failures: &[RankFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ClusterStartupError {
    pub fn failed_ranks(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.rank).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Invalid configuration; nothing was launched.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Startup(#[from] ClusterStartupError),

    #[error("operation not valid while the session is {0}")]
    InvalidState(SessionState),
}

type TeardownCallback = Box<dyn FnOnce() + Send>;

/// Owns the bring-up of one cluster.
pub struct ClusterSession {
    state: SessionState,
    agent: Option<Box<dyn WorkerLauncher>>,
    local: Box<dyn WorkerLauncher>,
    /// Removed at teardown if any local worker was launched.
    run_dir: Option<PathBuf>,
    run_dir_cleanup_registered: bool,
    descriptors: Vec<BootstrapDescriptor>,
    targets: Vec<LaunchTarget>,
    /// Indices into `targets` not yet launched.
    pending: Vec<usize>,
    launched: Vec<WorkerHandle>,
    teardown_callbacks: Vec<TeardownCallback>,
}

impl fmt::Debug for ClusterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSession")
            .field("state", &self.state)
            .field("run_dir", &self.run_dir)
            .field("launched", &self.launched_ranks())
            .field("pending", &self.failed_ranks())
            .finish_non_exhaustive()
    }
}

impl ClusterSession {
    /// Workers are launched through `agent` when one is given, and
    /// through `local` otherwise. Without an agent only single-host
    /// runs (no machine list) can launch workers.
    pub fn new(agent: Option<Box<dyn WorkerLauncher>>, local: Box<dyn WorkerLauncher>) -> Self {
        Self {
            state: SessionState::Uninitialized,
            agent,
            local,
            run_dir: None,
            run_dir_cleanup_registered: false,
            descriptors: Vec::new(),
            targets: Vec::new(),
            pending: Vec::new(),
            launched: Vec::new(),
            teardown_callbacks: Vec::new(),
        }
    }

    /// The directory holding local workers' artifacts. It is removed
    /// at teardown, but only if a local worker was launched.
    pub fn with_run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = Some(run_dir.into());
        self
    }

    /// A session wired from the runner's environment: the agent
    /// endpoint if one is configured, and a local launcher writing
    /// under a fresh run directory.
    pub fn from_runner_env(env: &RunnerEnv) -> Result<Self, ConfigError> {
        let agent = match env.agent_endpoint()? {
            Some(endpoint) => Some(Box::new(
                RemoteLauncher::new(endpoint).with_call_timeout(env.call_timeout()?),
            ) as Box<dyn WorkerLauncher>),
            None => None,
        };
        let run_dir = env.new_run_dir();
        let local = LocalLauncher::new(env.worker_command()?, run_dir.clone());
        Ok(Self::new(agent, Box::new(local)).with_run_dir(run_dir))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bootstrap descriptors for every rank, master included. Empty
    /// before the environment is ready and in host-list mode.
    pub fn descriptors(&self) -> &[BootstrapDescriptor] {
        &self.descriptors
    }

    /// Ranks whose workers were launched, in launch order.
    pub fn launched_ranks(&self) -> Vec<usize> {
        self.launched.iter().map(WorkerHandle::rank).collect()
    }

    /// Ranks still waiting for a successful launch.
    pub fn failed_ranks(&self) -> Vec<usize> {
        self.pending.iter().map(|&i| self.targets[i].rank).collect()
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    /// Bring the cluster up if it is not up yet.
    ///
    /// Configuration errors leave the session `Uninitialized` with
    /// nothing launched. Otherwise `config` is frozen, the session is
    /// `EnvironmentReady`, and every non-master rank is attempted; it
    /// becomes `WorkersLaunched` only if all of them succeed.
    pub async fn ensure_ready(&mut self, config: &mut EnvironmentConfig) -> Result<(), SessionError> {
        if self.state != SessionState::Uninitialized {
            return Ok(());
        }

        let resolved = config.resolve();
        let (descriptors, targets) = plan(&resolved)?;
        // The local launcher only serves single-host runs; ranks placed
        // on listed machines need an agent to get there.
        if self.agent.is_none() && !resolved.machines.is_empty() && !targets.is_empty() {
            return Err(ConfigError::Topology(
                "multi-node runs require a worker agent".to_string(),
            )
            .into());
        }
        config.freeze();
        tracing::info!(%resolved, mode = ?resolved.bootstrap_mode, "cluster environment ready");

        self.descriptors = descriptors;
        self.pending = (0..targets.len()).collect();
        self.targets = targets;
        self.state = SessionState::EnvironmentReady;

        self.launch_pending().await
    }

    /// Launch again the workers that failed in the previous attempt.
    /// A no-op once all workers are launched.
    pub async fn retry_failed(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::EnvironmentReady => self.launch_pending().await,
            SessionState::WorkersLaunched => Ok(()),
            state => Err(SessionError::InvalidState(state)),
        }
    }

    async fn launch_pending(&mut self) -> Result<(), SessionError> {
        let mut failures = Vec::new();
        for index in std::mem::take(&mut self.pending) {
            let target = self.targets[index].clone();
            let launcher = self.agent.as_deref().unwrap_or(self.local.as_ref());
            tracing::info!(
                rank = target.rank,
                host = %target.host,
                launcher = %launcher.kind(),
                "launching worker"
            );
            match launcher.launch(&target).await {
                Ok(handle) => {
                    if matches!(handle, WorkerHandle::Local(_)) {
                        self.register_run_dir_cleanup();
                    }
                    self.launched.push(handle);
                }
                Err(error) => {
                    tracing::error!(rank = target.rank, host = %target.host, "worker launch failed: {}", error);
                    self.pending.push(index);
                    failures.push(RankFailure {
                        rank: target.rank,
                        host: target.host,
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            self.state = SessionState::WorkersLaunched;
            tracing::info!(workers = self.launched.len(), "all workers launched");
            Ok(())
        } else {
            Err(ClusterStartupError { failures }.into())
        }
    }

    fn register_run_dir_cleanup(&mut self) {
        if self.run_dir_cleanup_registered {
            return;
        }
        let Some(run_dir) = self.run_dir.clone() else {
            return;
        };
        self.run_dir_cleanup_registered = true;
        self.register_teardown(move || {
            if let Err(e) = std::fs::remove_dir_all(&run_dir) {
                tracing::warn!("failed to remove run directory {}: {}", run_dir.display(), e);
            }
        });
    }

    /// Run `callback` at teardown. Callbacks run once, most recently
    /// registered first.
    pub fn register_teardown(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.teardown_callbacks.push(Box::new(callback));
    }

    /// Stop local workers (killing those still running), then run the
    /// teardown callbacks. Returns how each local worker ended.
    /// Idempotent.
    pub async fn teardown(&mut self) -> Vec<(usize, WorkerStopReason)> {
        if self.state == SessionState::TornDown {
            return Vec::new();
        }
        let mut stopped = Vec::new();
        for handle in std::mem::take(&mut self.launched) {
            if let WorkerHandle::Local(worker) = handle {
                let rank = worker.rank();
                let reason = worker.reap().await;
                tracing::info!(rank, "local worker {}", reason);
                stopped.push((rank, reason));
            }
        }
        self.run_teardown_callbacks();
        self.state = SessionState::TornDown;
        stopped
    }

    fn run_teardown_callbacks(&mut self) {
        while let Some(callback) = self.teardown_callbacks.pop() {
            callback();
        }
    }
}

impl Drop for ClusterSession {
    fn drop(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }
        for handle in self.launched.iter_mut() {
            if let WorkerHandle::Local(worker) = handle {
                if let Err(e) = worker.start_kill() {
                    tracing::debug!(rank = worker.rank(), "failed to kill worker: {}", e);
                }
            }
        }
        self.run_teardown_callbacks();
    }
}

/// Compute descriptors and the launch targets for every non-master
/// rank, in rank order.
fn plan(
    resolved: &ResolvedConfig,
) -> Result<(Vec<BootstrapDescriptor>, Vec<LaunchTarget>), ConfigError> {
    let base = EnvDescriptor::from_config(resolved);
    match resolved.bootstrap_mode {
        BootstrapMode::Negotiated => {
            let addresses = resolved.addresses();
            let descriptors = compute_descriptors(
                Some(addresses.as_slice()),
                resolved.control_port,
                resolved.world_size,
                resolved.rank_control_port,
                resolved.node_size,
            )?;
            let targets = descriptors
                .iter()
                .filter(|d| !d.is_master())
                .map(|d| LaunchTarget {
                    rank: d.rank,
                    host: d.host.clone(),
                    env: base.for_rank(d),
                })
                .collect();
            Ok((descriptors, targets))
        }
        BootstrapMode::HostList => {
            if resolved.machines.is_empty() {
                return Err(ConfigError::Topology(
                    "host-list bootstrap requires a machine list".to_string(),
                ));
            }
            let targets = resolved
                .machines
                .iter()
                .enumerate()
                .skip(1)
                .map(|(rank, machine)| LaunchTarget {
                    rank,
                    host: machine.address.clone(),
                    env: base.clone(),
                })
                .collect();
            Ok((Vec::new(), targets))
        }
    }
}
