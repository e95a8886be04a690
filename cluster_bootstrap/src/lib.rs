/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cluster bootstrap: bring up the worker processes of a distributed
//! run with consistent network configuration, or fail cleanly.
//!
//! The calling process is rank 0. A [`ClusterSession`] resolves the
//! [`EnvironmentConfig`], assigns every rank its host and control port
//! ([`bootstrap::compute_descriptors`]), and launches one worker per
//! non-master rank, either through a [`WorkerAgent`] daemon or as
//! local processes.

pub mod agent;
pub mod bootstrap;
pub mod config;
pub mod env_desc;
pub mod launcher;
pub mod runner_env;
pub mod session;

pub use agent::AgentError;
pub use agent::AuthKey;
pub use agent::WorkerAgent;
pub use agent::WorkerAgentClient;
pub use bootstrap::BootstrapDescriptor;
pub use bootstrap::compute_descriptors;
pub use config::ConfigError;
pub use config::EnvironmentConfig;
pub use config::MachineSpec;
pub use env_desc::EnvDescriptor;
pub use launcher::WorkerLauncher;
pub use runner_env::RunnerEnv;
pub use session::ClusterSession;
pub use session::ClusterStartupError;
pub use session::SessionError;
pub use session::SessionState;
