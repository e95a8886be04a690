/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The environment-variable surface of a cluster run.
//!
//! Runners (CI jobs, test harnesses, schedulers) describe the cluster
//! through the variables in [`ENV_KEYS`]. [`RunnerEnv`] snapshots them
//! once and turns them into an [`EnvironmentConfig`], an optional agent
//! endpoint and the local launch settings.
//!
//! Topology is selected in this order:
//!
//! 1. A node list with more than one node: multi-node. The master
//!    control port is required.
//! 2. More than one device with multi-process enabled: one host,
//!    one process per device, on a free loopback port.
//! 3. Otherwise: a single process.

use std::collections::HashMap;
use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::AuthKey;
use crate::agent::DEFAULT_CALL_TIMEOUT;
use crate::config::BootstrapMode;
use crate::config::ConfigError;
use crate::config::EnvironmentConfig;
use crate::launcher::AgentEndpoint;
use crate::launcher::LocalProcessLauncher;

pub const WORKER_NODE_LIST: &str = "WORKER_NODE_LIST";
pub const MASTER_CONTROL_PORT: &str = "MASTER_CONTROL_PORT";
pub const DATA_PORT: &str = "DATA_PORT";
pub const CTRL_PORT: &str = "CTRL_PORT";
pub const WORLD_SIZE: &str = "WORLD_SIZE";
pub const NODE_SIZE: &str = "NODE_SIZE";
pub const DEVICE_NUM: &str = "DEVICE_NUM";
pub const MULTI_PROCESS_ENABLE: &str = "MULTI_PROCESS_ENABLE";
pub const INIT_BY_HOST_LIST: &str = "INIT_BY_HOST_LIST";
pub const WORKER_AGENT_PORT: &str = "WORKER_AGENT_PORT";
pub const WORKER_AGENT_AUTHKEY: &str = "WORKER_AGENT_AUTHKEY";
pub const LOG_DIR: &str = "LOG_DIR";
pub const WORKER_COMMAND: &str = "WORKER_COMMAND";
pub const WORKER_RUN_ROOT: &str = "WORKER_RUN_ROOT";
pub const WORKER_AGENT_CALL_TIMEOUT_SECS: &str = "WORKER_AGENT_CALL_TIMEOUT_SECS";

/// The command local workers are started with when `WORKER_COMMAND` is
/// not set.
pub const DEFAULT_WORKER_COMMAND: &str = "cluster_worker --start_worker";

/// A recognized environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvKey {
    pub name: &'static str,
    pub doc: &'static str,
}

/// Every variable [`RunnerEnv`] reads.
pub static ENV_KEYS: &[EnvKey] = &[
    EnvKey {
        name: WORKER_NODE_LIST,
        doc: "Comma-separated machine addresses; rank i runs on entry i. Default: single node.",
    },
    EnvKey {
        name: MASTER_CONTROL_PORT,
        doc: "Master control port. Required with a node list.",
    },
    EnvKey {
        name: DATA_PORT,
        doc: "Data-plane port. Default: unset.",
    },
    EnvKey {
        name: CTRL_PORT,
        doc: "Control port advertised by non-master ranks. Default: the master port.",
    },
    EnvKey {
        name: WORLD_SIZE,
        doc: "Number of ranks. Default: inferred from the node list.",
    },
    EnvKey {
        name: NODE_SIZE,
        doc: "Node-size hint carried in bootstrap descriptors. Default: unset.",
    },
    EnvKey {
        name: DEVICE_NUM,
        doc: "Devices per node. Default: 1.",
    },
    EnvKey {
        name: MULTI_PROCESS_ENABLE,
        doc: "Run one local process per device when set to 1. Default: 0.",
    },
    EnvKey {
        name: INIT_BY_HOST_LIST,
        doc: "Initialize workers from the host list without negotiation when set to 1. Default: 0.",
    },
    EnvKey {
        name: WORKER_AGENT_PORT,
        doc: "Port of the worker agent on localhost. Default: no agent.",
    },
    EnvKey {
        name: WORKER_AGENT_AUTHKEY,
        doc: "Pre-shared agent key. Required with an agent port.",
    },
    EnvKey {
        name: LOG_DIR,
        doc: "Log directory for this process. Default: unset.",
    },
    EnvKey {
        name: WORKER_COMMAND,
        doc: "Command line local workers are started with.",
    },
    EnvKey {
        name: WORKER_RUN_ROOT,
        doc: "Directory under which per-run directories are created. Default: $HOME/cluster_bootstrap_temp.",
    },
    EnvKey {
        name: WORKER_AGENT_CALL_TIMEOUT_SECS,
        doc: "Seconds to wait for an agent's reply to a call. Default: 120.",
    },
];

/// A snapshot of the runner's environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerEnv {
    vars: HashMap<&'static str, String>,
}

impl RunnerEnv {
    /// Snapshot the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Snapshot the variables in [`ENV_KEYS`] through `lookup`. Empty
    /// values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = ENV_KEYS
            .iter()
            .filter_map(|key| {
                lookup(key.name)
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .map(|value| (key.name, value))
            })
            .collect();
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn flag(&self, key: &'static str) -> Result<bool, ConfigError> {
        match self.get(key) {
            None | Some("0") => Ok(false),
            Some("1") => Ok(true),
            Some(value) => Err(ConfigError::InvalidValue {
                key,
                value: value.to_string(),
                reason: "expected 0 or 1".to_string(),
            }),
        }
    }

    /// The node list, in rank order.
    pub fn node_list(&self) -> Vec<String> {
        self.get(WORKER_NODE_LIST)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|node| !node.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_node_list(&self) -> bool {
        !self.node_list().is_empty()
    }

    /// Number of nodes: the node-list length, or 1 without a list.
    pub fn node_size(&self) -> usize {
        self.node_list().len().max(1)
    }

    pub fn device_num(&self) -> Result<usize, ConfigError> {
        Ok(self.parse(DEVICE_NUM)?.unwrap_or(1))
    }

    /// Whether this run has exactly `nodes` nodes with `devices`
    /// devices each. Topology-specific suites use this to decide
    /// whether they apply.
    pub fn matches_topology(&self, nodes: usize, devices: usize) -> Result<bool, ConfigError> {
        Ok(self.node_size() == nodes && self.device_num()? == devices)
    }

    /// Build the cluster configuration for this run.
    pub fn environment_config(&self) -> Result<EnvironmentConfig, ConfigError> {
        let mut config = EnvironmentConfig::new();

        if self.has_node_list() {
            let nodes = self.node_list();
            if nodes.len() < 2 {
                return Err(ConfigError::Topology(format!(
                    "{} lists a single node; use a single-node run instead",
                    WORKER_NODE_LIST
                )));
            }
            let master_port: u16 = self
                .parse(MASTER_CONTROL_PORT)?
                .ok_or(ConfigError::Missing(MASTER_CONTROL_PORT))?;
            config.set_control_port(master_port)?;
            config.set_machines(nodes)?;
            if let Some(port) = self.parse(DATA_PORT)? {
                config.set_data_port(port)?;
            }
            if self.flag(INIT_BY_HOST_LIST)? {
                config.set_bootstrap_mode(BootstrapMode::HostList)?;
            } else {
                if let Some(port) = self.parse(CTRL_PORT)? {
                    config.set_rank_control_port(port)?;
                }
                if let Some(size) = self.parse(WORLD_SIZE)? {
                    config.set_world_size(size)?;
                }
                if let Some(size) = self.parse(NODE_SIZE)? {
                    config.set_node_size(size)?;
                }
            }
        } else if self.device_num()? > 1 && self.flag(MULTI_PROCESS_ENABLE)? {
            let port = find_free_port().map_err(|e| {
                ConfigError::Topology(format!("no free port for the master: {}", e))
            })?;
            config.set_control_port(port)?;
            config.set_world_size(self.device_num()?)?;
        } else {
            config.set_world_size(1)?;
        }

        if let Some(dir) = self.get(LOG_DIR) {
            config.set_log_directory(dir)?;
        }
        Ok(config)
    }

    /// The worker agent on this machine, if one is configured.
    pub fn agent_endpoint(&self) -> Result<Option<AgentEndpoint>, ConfigError> {
        let Some(port) = self.parse::<u16>(WORKER_AGENT_PORT)? else {
            return Ok(None);
        };
        let authkey = self
            .get(WORKER_AGENT_AUTHKEY)
            .ok_or(ConfigError::Missing(WORKER_AGENT_AUTHKEY))?;
        Ok(Some(AgentEndpoint::localhost(port, AuthKey::from(authkey))))
    }

    pub fn call_timeout(&self) -> Result<Duration, ConfigError> {
        Ok(self
            .parse(WORKER_AGENT_CALL_TIMEOUT_SECS)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CALL_TIMEOUT))
    }

    /// The launcher for local workers.
    pub fn worker_command(&self) -> Result<LocalProcessLauncher, ConfigError> {
        let command = self.get(WORKER_COMMAND).unwrap_or(DEFAULT_WORKER_COMMAND);
        LocalProcessLauncher::from_command_line(command).map_err(|e| ConfigError::InvalidValue {
            key: WORKER_COMMAND,
            value: command.to_string(),
            reason: e.to_string(),
        })
    }

    /// The directory per-run directories are created under.
    pub fn run_root(&self) -> PathBuf {
        if let Some(root) = self.get(WORKER_RUN_ROOT) {
            return PathBuf::from(root);
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join("cluster_bootstrap_temp"),
            None => std::env::temp_dir().join("cluster_bootstrap_temp"),
        }
    }

    /// A fresh, uniquely named run directory under [`Self::run_root`].
    /// The directory is not created.
    pub fn new_run_dir(&self) -> PathBuf {
        self.run_root().join(uuid::Uuid::new_v4().to_string())
    }
}

/// Ask the OS for a currently unused loopback TCP port.
pub fn find_free_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineSpec;

    fn env(pairs: &[(&str, &str)]) -> RunnerEnv {
        let pairs: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunnerEnv::from_lookup(|key| pairs.get(key).cloned())
    }

    #[test]
    fn test_defaults_are_single_process() {
        let env = env(&[]);
        assert_eq!(env.node_size(), 1);
        assert_eq!(env.device_num().unwrap(), 1);
        assert!(env.matches_topology(1, 1).unwrap());
        assert_eq!(env.agent_endpoint().unwrap(), None);
        assert_eq!(env.call_timeout().unwrap(), DEFAULT_CALL_TIMEOUT);

        let resolved = env.environment_config().unwrap().resolve();
        assert_eq!(resolved.world_size, 1);
        assert!(resolved.machines.is_empty());
    }

    #[test]
    fn test_node_list_selects_multi_node() {
        let env = env(&[
            (WORKER_NODE_LIST, "10.0.0.1, 10.0.0.2,10.0.0.3"),
            (MASTER_CONTROL_PORT, "2017"),
            (DATA_PORT, "3000"),
            (CTRL_PORT, "2018"),
            (NODE_SIZE, "3"),
            (LOG_DIR, "/tmp/logs"),
        ]);
        assert_eq!(env.node_size(), 3);
        assert!(env.matches_topology(3, 1).unwrap());

        let resolved = env.environment_config().unwrap().resolve();
        assert_eq!(
            resolved.machines,
            vec![
                MachineSpec::new("10.0.0.1"),
                MachineSpec::new("10.0.0.2"),
                MachineSpec::new("10.0.0.3"),
            ]
        );
        assert_eq!(resolved.control_port, 2017);
        assert_eq!(resolved.data_port, Some(3000));
        assert_eq!(resolved.rank_control_port, Some(2018));
        assert_eq!(resolved.node_size, Some(3));
        assert_eq!(resolved.world_size, 3);
        assert!(!resolved.explicit_world_size);
        assert_eq!(resolved.bootstrap_mode, BootstrapMode::Negotiated);
        assert_eq!(resolved.log_directory, Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn test_host_list_mode() {
        let env = env(&[
            (WORKER_NODE_LIST, "a,b"),
            (MASTER_CONTROL_PORT, "2017"),
            (INIT_BY_HOST_LIST, "1"),
        ]);
        let resolved = env.environment_config().unwrap().resolve();
        assert_eq!(resolved.bootstrap_mode, BootstrapMode::HostList);
    }

    #[test]
    fn test_node_list_requires_master_port_and_two_nodes() {
        assert_eq!(
            env(&[(WORKER_NODE_LIST, "a,b")]).environment_config(),
            Err(ConfigError::Missing(MASTER_CONTROL_PORT))
        );
        assert!(matches!(
            env(&[(WORKER_NODE_LIST, "a"), (MASTER_CONTROL_PORT, "2017")]).environment_config(),
            Err(ConfigError::Topology(_))
        ));
    }

    #[test]
    fn test_multi_process_uses_device_count() {
        let multi = env(&[(DEVICE_NUM, "4"), (MULTI_PROCESS_ENABLE, "1")]);
        let resolved = multi.environment_config().unwrap().resolve();
        assert!(resolved.machines.is_empty());
        assert_eq!(resolved.world_size, 4);
        assert_ne!(resolved.control_port, 0);

        // Without the flag, several devices still mean one process.
        let single = env(&[(DEVICE_NUM, "4")]);
        assert_eq!(single.environment_config().unwrap().resolve().world_size, 1);
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = env(&[(DEVICE_NUM, "many")]).device_num().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: DEVICE_NUM, .. }));

        let err = env(&[(MULTI_PROCESS_ENABLE, "yes"), (DEVICE_NUM, "2")])
            .environment_config()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: MULTI_PROCESS_ENABLE,
                ..
            }
        ));
    }

    #[test]
    fn test_agent_endpoint_requires_authkey() {
        assert_eq!(
            env(&[(WORKER_AGENT_PORT, "9000")]).agent_endpoint(),
            Err(ConfigError::Missing(WORKER_AGENT_AUTHKEY))
        );
        let endpoint = env(&[(WORKER_AGENT_PORT, "9000"), (WORKER_AGENT_AUTHKEY, "k")])
            .agent_endpoint()
            .unwrap()
            .unwrap();
        assert_eq!(endpoint.addr, "localhost:9000");
        assert_eq!(endpoint.authkey, AuthKey::from("k"));
    }

    #[test]
    fn test_worker_command_and_run_dirs() {
        let env = env(&[
            (WORKER_COMMAND, "python3 -m worker --start_worker"),
            (WORKER_RUN_ROOT, "/scratch/runs"),
            (WORKER_AGENT_CALL_TIMEOUT_SECS, "5"),
        ]);
        assert_eq!(env.worker_command().unwrap().program(), "python3");
        assert_eq!(env.call_timeout().unwrap(), Duration::from_secs(5));

        let a = env.new_run_dir();
        let b = env.new_run_dir();
        assert_eq!(a.parent(), Some(std::path::Path::new("/scratch/runs")));
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_values_are_unset() {
        let env = env(&[(WORKER_NODE_LIST, "  "), (LOG_DIR, "")]);
        assert!(!env.has_node_list());
        assert_eq!(env.get(LOG_DIR), None);
    }

    #[test]
    fn test_find_free_port() {
        assert_ne!(find_free_port().unwrap(), 0);
    }
}
