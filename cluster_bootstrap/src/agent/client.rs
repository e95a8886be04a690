/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Client side of the worker-agent protocol.

use std::io;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;

use super::AgentError;
use super::AgentRequest;
use super::DEFAULT_MAX_FRAME_LENGTH;
use super::SUCCESS_REPLY;
use super::auth;
use super::auth::AuthKey;
use super::command;
use super::framed::FrameReader;
use super::framed::write_frame;

/// A connection to a worker agent.
///
/// Connections are not pooled: [`WorkerAgentClient::launch_worker`]
/// consumes the client and closes the connection when the launch
/// sequence is done, so every launch starts from a fresh connection
/// with no state left over from a previous one.
pub struct WorkerAgentClient<S = TcpStream> {
    addr: String,
    reader: FrameReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    call_timeout: Duration,
    max_frame_length: usize,
}

impl WorkerAgentClient<TcpStream> {
    /// Connect to the agent at `addr` and authenticate with `key`.
    /// Each `call` on the returned client waits at most `call_timeout`
    /// for its reply.
    pub async fn connect(
        addr: &str,
        key: &AuthKey,
        call_timeout: Duration,
    ) -> Result<Self, AgentError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| AgentError::Connection {
                addr: addr.to_string(),
                source,
            })?;
        // Requests are small and latency-bound.
        let _ = stream.set_nodelay(true);
        Self::handshake(addr, stream, key, call_timeout).await
    }
}

impl<S: AsyncRead + AsyncWrite> WorkerAgentClient<S> {
    /// Run the authentication handshake over an established stream.
    pub async fn handshake(
        addr: impl Into<String>,
        stream: S,
        key: &AuthKey,
        call_timeout: Duration,
    ) -> Result<Self, AgentError> {
        let (reader, writer) = tokio::io::split(stream);
        let mut client = Self {
            addr: addr.into(),
            reader: FrameReader::new(reader, DEFAULT_MAX_FRAME_LENGTH),
            writer,
            call_timeout,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        };

        let challenge = client.recv_reply("handshake").await?;
        let nonce = auth::parse_challenge(&challenge).ok_or_else(|| {
            AgentError::Protocol("agent did not open with an authentication challenge".to_string())
        })?;
        let response = key.digest(nonce);
        client.send_frame(&response).await?;

        let verdict = client.recv_reply("handshake").await?;
        if verdict.as_slice() == auth::WELCOME {
            tracing::debug!(addr = %client.addr, "authenticated with worker agent");
            Ok(client)
        } else if verdict.as_slice() == auth::FAILURE {
            Err(AgentError::Auth { addr: client.addr })
        } else {
            Err(AgentError::Protocol(
                "unexpected authentication verdict from agent".to_string(),
            ))
        }
    }

    /// The agent's address, as given when connecting.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send `cast/<command>` with `payload` and return without waiting
    /// for a reply.
    pub async fn send_cast(&mut self, command: &str, payload: &str) -> Result<(), AgentError> {
        let request = AgentRequest::cast(command, payload);
        tracing::debug!(addr = %self.addr, "[{}] {}", request.header(), payload);
        self.send_request(&request).await
    }

    /// Send `call/<command>` with `payload` and wait for the single
    /// reply frame.
    pub async fn send_call(&mut self, command: &str, payload: &str) -> Result<String, AgentError> {
        let request = AgentRequest::call(command, payload);
        tracing::debug!(addr = %self.addr, "[{}] {}", request.header(), payload);
        self.send_request(&request).await?;
        let reply = self.recv_reply(command).await?;
        String::from_utf8(reply)
            .map_err(|e| AgentError::Protocol(format!("reply to call/{} is not utf-8: {}", command, e)))
    }

    /// Ask the agent to start a worker on `host` from the serialized
    /// environment `env`. Succeeds only if the agent replies
    /// [`SUCCESS_REPLY`]. The connection is closed afterwards either
    /// way.
    pub async fn launch_worker(mut self, host: &str, env: &str) -> Result<(), AgentError> {
        tracing::info!(addr = %self.addr, host, "launching worker via agent");
        let result = self.launch_sequence(host, env).await;
        self.close().await;
        match &result {
            Ok(()) => tracing::info!(host, "worker launched via agent"),
            Err(e) => tracing::warn!(host, "worker launch via agent failed: {}", e),
        }
        result
    }

    async fn launch_sequence(&mut self, host: &str, env: &str) -> Result<(), AgentError> {
        self.send_cast(command::HOST, host).await?;
        self.send_cast(command::ENV_PROTO, env).await?;
        let reply = self.send_call(command::START_WORKER, "").await?;
        if reply == SUCCESS_REPLY {
            Ok(())
        } else {
            Err(AgentError::WorkerLaunch {
                host: host.to_string(),
                reply,
            })
        }
    }

    /// Shut down the write side, signalling the agent that no further
    /// requests follow.
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(addr = %self.addr, "error closing agent connection: {}", e);
        }
    }

    async fn send_request(&mut self, request: &AgentRequest) -> Result<(), AgentError> {
        self.send_frame(request.header().as_bytes()).await?;
        self.send_frame(request.payload.as_bytes()).await
    }

    async fn send_frame(&mut self, body: &[u8]) -> Result<(), AgentError> {
        write_frame(&mut self.writer, body, self.max_frame_length)
            .await
            .map_err(|source| self.io_error(source))
    }

    async fn recv_reply(&mut self, command: &str) -> Result<Vec<u8>, AgentError> {
        let timeout = self.call_timeout;
        let frame = tokio::time::timeout(timeout, self.reader.next())
            .await
            .map_err(|_| AgentError::Timeout {
                command: command.to_string(),
                timeout,
            })?;
        match frame {
            Ok(Some(frame)) => Ok(frame.to_vec()),
            Ok(None) => Err(AgentError::Protocol(format!(
                "agent closed the connection before replying to {}",
                command
            ))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(AgentError::Protocol(
                format!("agent closed the connection mid-reply to {}", command),
            )),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(AgentError::Protocol(e.to_string()))
            }
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: io::Error) -> AgentError {
        AgentError::Connection {
            addr: self.addr.clone(),
            source,
        }
    }
}
