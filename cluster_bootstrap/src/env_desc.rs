/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The serialized environment handed to each worker.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::bootstrap::BootstrapDescriptor;
use crate::config::MachineSpec;
use crate::config::ResolvedConfig;

/// The environment a worker starts from: the cluster topology plus,
/// in negotiated mode, the worker's own bootstrap descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvDescriptor {
    pub machines: Vec<MachineSpec>,
    pub control_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl EnvDescriptor {
    /// The shared part of every worker's environment.
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            machines: config.machines.clone(),
            control_port: config.control_port,
            data_port: config.data_port,
            bootstrap: None,
            log_dir: config.log_directory.clone(),
        }
    }

    /// A copy of this environment carrying `descriptor` as its
    /// bootstrap configuration.
    pub fn for_rank(&self, descriptor: &BootstrapDescriptor) -> Self {
        Self {
            bootstrap: Some(descriptor.clone()),
            ..self.clone()
        }
    }

    pub fn with_log_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.log_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// The rank encoded in the bootstrap descriptor, if any.
    pub fn rank(&self) -> Option<usize> {
        self.bootstrap.as_ref().map(|b| b.rank)
    }

    /// Render as the text form shipped to agents and written to disk.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::compute_descriptors;
    use crate::config::EnvironmentConfig;

    #[test]
    fn test_for_rank_keeps_topology() {
        let mut config = EnvironmentConfig::new();
        config.set_machines(["a", "b"]).unwrap();
        config.set_control_port(7000).unwrap();
        config.set_data_port(7001).unwrap();
        let resolved = config.resolve();

        let base = EnvDescriptor::from_config(&resolved);
        assert_eq!(base.rank(), None);

        let addrs = resolved.addresses();
        let descs = compute_descriptors(Some(addrs.as_slice()), 7000, 0, None, None).unwrap();
        let env = base.for_rank(&descs[1]).with_log_dir("/tmp/run/log_1");

        assert_eq!(env.rank(), Some(1));
        assert_eq!(env.machines, base.machines);
        assert_eq!(env.data_port, Some(7001));
        assert_eq!(env.log_dir.as_deref(), Some(Path::new("/tmp/run/log_1")));
    }

    #[test]
    fn test_text_form_is_readable_and_parses_back() {
        let env = EnvDescriptor {
            machines: vec![MachineSpec::new("127.0.0.1")],
            control_port: 2017,
            data_port: None,
            bootstrap: None,
            log_dir: None,
        };
        let text = env.to_text().unwrap();
        assert!(text.contains("\"control_port\": 2017"));
        assert!(!text.contains("data_port"));
        assert_eq!(EnvDescriptor::from_text(&text).unwrap(), env);
    }
}
