/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The worker-agent protocol.
//!
//! A worker agent is a long-lived daemon that launches workers on
//! behalf of an orchestrator that cannot spawn them directly. The
//! orchestrator talks to it over an authenticated stream connection
//! (see [`auth`]) using length-prefixed frames (see [`framed`]).
//!
//! A request is two frames: `"<verb>/<command>"` and a payload (which
//! may be empty). `cast` requests are fire-and-forget and typically
//! deliver state the agent remembers for the next `call`. A `call`
//! produces exactly one reply frame before the next request may be
//! sent on the connection.
//!
//! Launching a worker is the fixed sequence
//! `cast/host`, `cast/env_proto`, `call/start_worker`, answered with
//! [`SUCCESS_REPLY`] on success and diagnostic text otherwise.

pub mod auth;
pub mod client;
pub mod framed;
pub mod server;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

pub use auth::AuthKey;
pub use client::WorkerAgentClient;
pub use server::WorkerAgent;

/// The reply the agent sends when a worker was started.
pub const SUCCESS_REPLY: &str = "ok";

/// Frames larger than this are a protocol violation.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// How long a `call` waits for its reply by default.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Commands understood by the agent.
pub mod command {
    /// Cast: the host the next worker should run on.
    pub const HOST: &str = "host";
    /// Cast: the serialized worker environment.
    pub const ENV_PROTO: &str = "env_proto";
    /// Call: start a worker from the remembered host and environment.
    pub const START_WORKER: &str = "start_worker";
}

/// Request verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Fire-and-forget.
    Cast,
    /// Expects exactly one reply.
    Call,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cast => "cast",
            Self::Call => "call",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cast" => Ok(Self::Cast),
            "call" => Ok(Self::Call),
            other => Err(AgentError::Protocol(format!("unknown verb {:?}", other))),
        }
    }
}

/// A request as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub verb: Verb,
    pub command: String,
    pub payload: String,
}

impl AgentRequest {
    pub fn cast(command: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            verb: Verb::Cast,
            command: command.into(),
            payload: payload.into(),
        }
    }

    pub fn call(command: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            verb: Verb::Call,
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// The first frame: `"<verb>/<command>"`.
    pub fn header(&self) -> String {
        format!("{}/{}", self.verb, self.command)
    }

    /// Reassemble a request from its two frames.
    pub fn from_frames(header: &[u8], payload: &[u8]) -> Result<Self, AgentError> {
        let header = std::str::from_utf8(header)
            .map_err(|e| AgentError::Protocol(format!("request header is not utf-8: {}", e)))?;
        let (verb, command) = header
            .split_once('/')
            .ok_or_else(|| AgentError::Protocol(format!("malformed request header {:?}", header)))?;
        let payload = String::from_utf8(payload.to_vec())
            .map_err(|e| AgentError::Protocol(format!("request payload is not utf-8: {}", e)))?;
        Ok(Self {
            verb: verb.parse()?,
            command: command.to_string(),
            payload,
        })
    }
}

/// Errors talking to a worker agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent rejected our key.
    #[error("agent at {addr} rejected the authentication key")]
    Auth { addr: String },

    /// Socket-level failure reaching or talking to the agent.
    #[error("connection to agent at {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Malformed exchange, or the connection closed before a reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A `call` did not receive its reply in time.
    #[error("no reply to call/{command} within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The agent accepted the request but failed to start the worker.
    #[error("agent failed to launch worker on {host}: {reply}")]
    WorkerLaunch { host: String, reply: String },
}
