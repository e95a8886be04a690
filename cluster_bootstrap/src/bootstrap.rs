/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bootstrap negotiation: assigning every rank its host and control
//! port before any worker is launched.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::config::ConfigError;

/// The address every rank binds to in single-host mode.
pub const LOOPBACK_ADDR: &str = "127.0.0.1";

/// The master's well-known control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for MasterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything a rank needs to know before distributed communication
/// can start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BootstrapDescriptor {
    /// Zero-based, dense; 0 is the master.
    pub rank: usize,
    /// Address this rank runs on.
    pub host: String,
    /// Inbound control port advertised for this rank. For rank 0 this
    /// is always the master port.
    pub control_port: u16,
    pub master_addr: MasterAddr,
    pub world_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_size: Option<usize>,
}

impl BootstrapDescriptor {
    pub fn is_master(&self) -> bool {
        self.rank == 0
    }
}

impl fmt::Display for BootstrapDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rank {}/{} at {}:{} (master {})",
            self.rank, self.world_size, self.host, self.control_port, self.master_addr
        )
    }
}

/// Compute one descriptor per rank.
///
/// With a non-empty `machine_addresses`, rank `i` runs on entry `i`;
/// `world_size` 0 means "the length of the list", any other value must
/// equal it. Without a list (or with an empty one), `world_size` ranks
/// are placed on the loopback address.
///
/// Rank 0 is the master and advertises `master_port`. The other ranks
/// advertise `explicit_control_port` when given and `master_port`
/// otherwise.
///
/// The result is deterministic and ordered by rank.
pub fn compute_descriptors(
    machine_addresses: Option<&[String]>,
    master_port: u16,
    world_size: usize,
    explicit_control_port: Option<u16>,
    node_size_hint: Option<usize>,
) -> Result<Vec<BootstrapDescriptor>, ConfigError> {
    let machines = machine_addresses.filter(|addrs| !addrs.is_empty());

    let world_size = match machines {
        Some(addrs) if world_size == 0 => addrs.len(),
        Some(addrs) if world_size != addrs.len() => {
            return Err(ConfigError::WorldSizeMismatch {
                machines: addrs.len(),
                world_size,
            });
        }
        _ => world_size,
    };
    if world_size == 0 {
        return Err(ConfigError::InvalidWorldSize(world_size));
    }

    let host_of = |rank: usize| -> String {
        match machines {
            Some(addrs) => addrs[rank].clone(),
            None => LOOPBACK_ADDR.to_string(),
        }
    };
    let master_addr = MasterAddr {
        host: host_of(0),
        port: master_port,
    };

    let descriptors = (0..world_size)
        .map(|rank| BootstrapDescriptor {
            rank,
            host: host_of(rank),
            control_port: if rank == 0 {
                master_port
            } else {
                explicit_control_port.unwrap_or(master_port)
            },
            master_addr: master_addr.clone(),
            world_size,
            node_size: node_size_hint,
        })
        .collect();

    Ok(descriptors)
}
