/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Launching workers through a worker agent.

use std::time::Duration;

use async_trait::async_trait;

use super::LaunchTarget;
use super::LauncherKind;
use super::RankLaunchError;
use super::WorkerHandle;
use super::WorkerLauncher;
use crate::agent::AuthKey;
use crate::agent::DEFAULT_CALL_TIMEOUT;
use crate::agent::WorkerAgentClient;

/// Where to find the worker agent and how to authenticate with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    /// `host:port`.
    pub addr: String,
    pub authkey: AuthKey,
}

impl AgentEndpoint {
    /// The agent on this machine, listening on `port`.
    pub fn localhost(port: u16, authkey: AuthKey) -> Self {
        Self {
            addr: format!("localhost:{}", port),
            authkey,
        }
    }
}

/// [`WorkerLauncher`] that delegates every launch to a worker agent,
/// over a fresh connection per launch.
#[derive(Debug, Clone)]
pub struct RemoteLauncher {
    endpoint: AgentEndpoint,
    call_timeout: Duration,
}

impl RemoteLauncher {
    pub fn new(endpoint: AgentEndpoint) -> Self {
        Self {
            endpoint,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound the wait for the agent's reply to `start_worker`.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn endpoint(&self) -> &AgentEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl WorkerLauncher for RemoteLauncher {
    fn kind(&self) -> LauncherKind {
        LauncherKind::Remote
    }

    async fn launch(&self, target: &LaunchTarget) -> Result<WorkerHandle, RankLaunchError> {
        let env = target.env.to_text().map_err(|e| RankLaunchError::Encode {
            rank: target.rank,
            reason: e.to_string(),
        })?;
        let client = WorkerAgentClient::connect(
            &self.endpoint.addr,
            &self.endpoint.authkey,
            self.call_timeout,
        )
        .await?;
        client.launch_worker(&target.host, &env).await?;
        Ok(WorkerHandle::Remote {
            rank: target.rank,
            host: target.host.clone(),
        })
    }
}
