/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Strategies for getting a rank's worker process started.
//!
//! The session does not care how a worker comes to exist, only that
//! the launch succeeded. Two backends exist: [`remote::RemoteLauncher`]
//! asks a worker agent to do it, [`local::LocalLauncher`] spawns a
//! local process.

pub mod local;
pub mod remote;

use std::fmt;

use async_trait::async_trait;

pub use self::local::LaunchError;
pub use self::local::LocalLauncher;
pub use self::local::LocalProcessLauncher;
pub use self::local::LocalWorker;
pub use self::remote::AgentEndpoint;
pub use self::remote::RemoteLauncher;
use crate::agent::AgentError;
use crate::env_desc::EnvDescriptor;

/// Which kind of backend a launcher is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    /// Workers are started by a worker agent.
    Remote,
    /// Workers are local child processes.
    Local,
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// One rank to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub rank: usize,
    /// The machine the worker should run on.
    pub host: String,
    /// The environment to hand the worker.
    pub env: EnvDescriptor,
}

/// A launched worker.
#[derive(Debug)]
pub enum WorkerHandle {
    /// Started by an agent; its lifecycle belongs to the agent.
    Remote { rank: usize, host: String },
    /// A local child process, reaped at teardown.
    Local(LocalWorker),
}

impl WorkerHandle {
    pub fn rank(&self) -> usize {
        match self {
            Self::Remote { rank, .. } => *rank,
            Self::Local(worker) => worker.rank(),
        }
    }
}

/// Why a single rank failed to launch.
#[derive(Debug, thiserror::Error)]
pub enum RankLaunchError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Local(#[from] LaunchError),

    /// The environment could not be serialized.
    #[error("rank {rank}: failed to encode environment: {reason}")]
    Encode { rank: usize, reason: String },
}

/// Starts the worker for one rank.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch `target`. Returns once the launch request has been
    /// accepted; the worker itself may still fail later.
    async fn launch(&self, target: &LaunchTarget) -> Result<WorkerHandle, RankLaunchError>;

    fn kind(&self) -> LauncherKind;
}
