/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cluster topology configuration.
//!
//! [`EnvironmentConfig`] is the single, validated description of the
//! cluster a session brings up: the machine list, the well-known
//! control port, and the desired world size. It is assembled from the
//! process environment (see [`crate::runner_env`]) and/or explicit
//! setter calls, and is frozen by the
//! [`ClusterSession`](crate::session::ClusterSession) once the
//! environment has been initialized. Every mutation goes through
//! [`EnvironmentConfig::apply`], which validates the option and
//! rejects it once the config is frozen.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// The control port used when none is configured.
pub const DEFAULT_CONTROL_PORT: u16 = 2017;

/// Errors raised by invalid or contradictory configuration. These are
/// always fatal and surface before any worker is launched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate machine address {0}")]
    DuplicateAddress(String),

    #[error("machine address must not be empty")]
    EmptyAddress,

    #[error("configuration is frozen; cannot set {0} after the environment is initialized")]
    Frozen(&'static str),

    #[error("invalid world size {0}; must be at least 1")]
    InvalidWorldSize(usize),

    #[error("machine list has {machines} entries but world size is {world_size}")]
    WorldSizeMismatch { machines: usize, world_size: usize },

    #[error("required setting {0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Topology(String),
}

/// One cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// The node's address; unique across the cluster.
    pub address: String,
    /// Control port of an agent on this node, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port_agent: Option<u16>,
    /// Data port of an agent on this node, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_port_agent: Option<u16>,
}

impl MachineSpec {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            control_port_agent: None,
            data_port_agent: None,
        }
    }
}

/// A machine as accepted by [`EnvironmentConfig::set_machines`]: either
/// a bare address or a structured record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEntry {
    Address(String),
    Spec(MachineSpec),
}

impl From<&str> for MachineEntry {
    fn from(address: &str) -> Self {
        Self::Address(address.to_string())
    }
}

impl From<String> for MachineEntry {
    fn from(address: String) -> Self {
        Self::Address(address)
    }
}

impl From<MachineSpec> for MachineEntry {
    fn from(spec: MachineSpec) -> Self {
        Self::Spec(spec)
    }
}

impl MachineEntry {
    fn into_spec(self) -> MachineSpec {
        match self {
            Self::Address(address) => MachineSpec::new(address),
            Self::Spec(spec) => spec,
        }
    }
}

/// How worker environments are derived from the machine list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapMode {
    /// Each worker receives its own bootstrap descriptor computed by
    /// [`crate::bootstrap::compute_descriptors`].
    #[default]
    Negotiated,
    /// Workers are started once per listed machine and receive the
    /// full environment without a per-rank bootstrap descriptor; ranks
    /// are implied by machine order.
    HostList,
}

/// A single configuration change. All setters funnel through
/// [`EnvironmentConfig::apply`] so that validation and the frozen
/// check live in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOption {
    Machines(Vec<MachineEntry>),
    ControlPort(u16),
    DataPort(u16),
    WorldSize(usize),
    LogDirectory(PathBuf),
    RankControlPort(u16),
    NodeSize(usize),
    BootstrapMode(BootstrapMode),
}

impl ConfigOption {
    /// The option's name, as reported in errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Machines(_) => "machines",
            Self::ControlPort(_) => "control_port",
            Self::DataPort(_) => "data_port",
            Self::WorldSize(_) => "world_size",
            Self::LogDirectory(_) => "log_directory",
            Self::RankControlPort(_) => "rank_control_port",
            Self::NodeSize(_) => "node_size",
            Self::BootstrapMode(_) => "bootstrap_mode",
        }
    }
}

/// The process-wide cluster configuration, mutable until frozen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    machines: Vec<MachineSpec>,
    control_port: u16,
    data_port: Option<u16>,
    world_size: usize,
    log_directory: Option<PathBuf>,
    rank_control_port: Option<u16>,
    node_size: Option<usize>,
    bootstrap_mode: BootstrapMode,
    frozen: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            machines: Vec::new(),
            control_port: DEFAULT_CONTROL_PORT,
            data_port: None,
            world_size: 0,
            log_directory: None,
            rank_control_port: None,
            node_size: None,
            bootstrap_mode: BootstrapMode::default(),
            frozen: false,
        }
    }
}

impl EnvironmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a single option, validating it first. Fails with
    /// [`ConfigError::Frozen`] once the config has been frozen.
    pub fn apply(&mut self, option: ConfigOption) -> Result<(), ConfigError> {
        if self.frozen {
            return Err(ConfigError::Frozen(option.name()));
        }
        match option {
            ConfigOption::Machines(entries) => {
                self.machines = normalize_machines(entries)?;
            }
            ConfigOption::ControlPort(port) => self.control_port = port,
            ConfigOption::DataPort(port) => self.data_port = Some(port),
            ConfigOption::WorldSize(size) => self.world_size = size,
            ConfigOption::LogDirectory(dir) => self.log_directory = Some(dir),
            ConfigOption::RankControlPort(port) => self.rank_control_port = Some(port),
            ConfigOption::NodeSize(size) => {
                if size == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "node_size",
                        value: size.to_string(),
                        reason: "must be at least 1".to_string(),
                    });
                }
                self.node_size = Some(size);
            }
            ConfigOption::BootstrapMode(mode) => self.bootstrap_mode = mode,
        }
        Ok(())
    }

    /// Replace the machine list. Bare addresses and structured records
    /// may be mixed; addresses must be unique.
    pub fn set_machines<I, E>(&mut self, machines: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = E>,
        E: Into<MachineEntry>,
    {
        self.apply(ConfigOption::Machines(
            machines.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn set_control_port(&mut self, port: u16) -> Result<(), ConfigError> {
        self.apply(ConfigOption::ControlPort(port))
    }

    pub fn set_data_port(&mut self, port: u16) -> Result<(), ConfigError> {
        self.apply(ConfigOption::DataPort(port))
    }

    /// Set the world size; 0 means "infer from the machine list".
    pub fn set_world_size(&mut self, size: usize) -> Result<(), ConfigError> {
        self.apply(ConfigOption::WorldSize(size))
    }

    pub fn set_log_directory(&mut self, dir: impl Into<PathBuf>) -> Result<(), ConfigError> {
        self.apply(ConfigOption::LogDirectory(dir.into()))
    }

    /// Override the inbound control port advertised to non-master ranks.
    pub fn set_rank_control_port(&mut self, port: u16) -> Result<(), ConfigError> {
        self.apply(ConfigOption::RankControlPort(port))
    }

    pub fn set_node_size(&mut self, size: usize) -> Result<(), ConfigError> {
        self.apply(ConfigOption::NodeSize(size))
    }

    pub fn set_bootstrap_mode(&mut self, mode: BootstrapMode) -> Result<(), ConfigError> {
        self.apply(ConfigOption::BootstrapMode(mode))
    }

    pub fn machines(&self) -> &[MachineSpec] {
        &self.machines
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Prevent further mutation. Idempotent.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Produce the finalized configuration. An unspecified world size
    /// defaults to the number of machines, or 1 without machines.
    pub fn resolve(&self) -> ResolvedConfig {
        let world_size = match (self.world_size, self.machines.len()) {
            (0, 0) => 1,
            (0, n) => n,
            (n, _) => n,
        };
        ResolvedConfig {
            machines: self.machines.clone(),
            control_port: self.control_port,
            data_port: self.data_port,
            world_size,
            explicit_world_size: self.world_size != 0,
            log_directory: self.log_directory.clone(),
            rank_control_port: self.rank_control_port,
            node_size: self.node_size,
            bootstrap_mode: self.bootstrap_mode,
        }
    }
}

/// A finalized, read-only view of [`EnvironmentConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub machines: Vec<MachineSpec>,
    pub control_port: u16,
    pub data_port: Option<u16>,
    pub world_size: usize,
    /// Whether `world_size` was given explicitly rather than inferred.
    pub explicit_world_size: bool,
    pub log_directory: Option<PathBuf>,
    pub rank_control_port: Option<u16>,
    pub node_size: Option<usize>,
    pub bootstrap_mode: BootstrapMode,
}

impl ResolvedConfig {
    /// Machine addresses in rank order.
    pub fn addresses(&self) -> Vec<String> {
        self.machines.iter().map(|m| m.address.clone()).collect()
    }
}

impl fmt::Display for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "world_size={} machines=[{}] control_port={}",
            self.world_size,
            self.addresses().join(","),
            self.control_port
        )?;
        if let Some(port) = self.data_port {
            write!(f, " data_port={}", port)?;
        }
        Ok(())
    }
}

fn normalize_machines(entries: Vec<MachineEntry>) -> Result<Vec<MachineSpec>, ConfigError> {
    let mut seen = HashSet::new();
    let mut machines = Vec::with_capacity(entries.len());
    for entry in entries {
        let spec = entry.into_spec();
        if spec.address.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if !seen.insert(spec.address.clone()) {
            return Err(ConfigError::DuplicateAddress(spec.address));
        }
        machines.push(spec);
    }
    Ok(machines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_machines_normalizes_mixed_entries() {
        let mut config = EnvironmentConfig::new();
        config
            .set_machines(vec![
                MachineEntry::from("10.0.0.1"),
                MachineEntry::Spec(MachineSpec {
                    address: "10.0.0.2".to_string(),
                    control_port_agent: Some(5000),
                    data_port_agent: None,
                }),
            ])
            .unwrap();

        let machines = config.machines();
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0], MachineSpec::new("10.0.0.1"));
        assert_eq!(machines[1].control_port_agent, Some(5000));
    }

    #[test]
    fn test_set_machines_rejects_duplicates() {
        let mut config = EnvironmentConfig::new();
        let err = config
            .set_machines(["10.0.0.1", "10.0.0.1"])
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateAddress("10.0.0.1".to_string()));
        // A failed set leaves the previous list untouched.
        assert!(config.machines().is_empty());
    }

    #[test]
    fn test_set_machines_replaces_previous_list() {
        let mut config = EnvironmentConfig::new();
        config.set_machines(["a", "b"]).unwrap();
        config.set_machines(["b", "c", "d"]).unwrap();
        let addrs: Vec<_> = config.machines().iter().map(|m| &m.address).collect();
        assert_eq!(addrs, ["b", "c", "d"]);
    }

    #[test]
    fn test_empty_address_rejected() {
        let mut config = EnvironmentConfig::new();
        assert_eq!(
            config.set_machines([""]).unwrap_err(),
            ConfigError::EmptyAddress
        );
    }

    #[test]
    fn test_frozen_config_rejects_every_setter() {
        let mut config = EnvironmentConfig::new();
        config.set_control_port(4000).unwrap();
        config.freeze();

        assert_eq!(
            config.set_control_port(1).unwrap_err(),
            ConfigError::Frozen("control_port")
        );
        assert_eq!(
            config.set_data_port(1).unwrap_err(),
            ConfigError::Frozen("data_port")
        );
        assert_eq!(
            config.set_world_size(1).unwrap_err(),
            ConfigError::Frozen("world_size")
        );
        assert_eq!(
            config.set_machines(["x"]).unwrap_err(),
            ConfigError::Frozen("machines")
        );
        assert_eq!(config.control_port(), 4000);
    }

    #[test]
    fn test_resolve_infers_world_size() {
        let mut config = EnvironmentConfig::new();
        assert_eq!(config.resolve().world_size, 1);
        assert!(!config.resolve().explicit_world_size);

        config.set_machines(["a", "b", "c"]).unwrap();
        assert_eq!(config.resolve().world_size, 3);
        assert!(!config.resolve().explicit_world_size);

        config.set_world_size(5).unwrap();
        let resolved = config.resolve();
        assert_eq!(resolved.world_size, 5);
        assert!(resolved.explicit_world_size);
    }

    #[test]
    fn test_zero_node_size_rejected() {
        let mut config = EnvironmentConfig::new();
        assert!(matches!(
            config.set_node_size(0),
            Err(ConfigError::InvalidValue {
                key: "node_size",
                ..
            })
        ));
        config.set_node_size(2).unwrap();
        assert_eq!(config.resolve().node_size, Some(2));
    }
}
