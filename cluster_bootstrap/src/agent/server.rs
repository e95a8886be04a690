/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The worker agent daemon.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::AgentError;
use super::AgentRequest;
use super::DEFAULT_CALL_TIMEOUT;
use super::DEFAULT_MAX_FRAME_LENGTH;
use super::SUCCESS_REPLY;
use super::Verb;
use super::auth;
use super::auth::AuthKey;
use super::command;
use super::framed::FrameReader;
use super::framed::write_frame;
use crate::env_desc::EnvDescriptor;
use crate::launcher::local::LocalProcessLauncher;
use crate::launcher::local::LocalWorker;
use crate::launcher::local::WORKER_HOST_ENV;

/// A daemon that starts workers on request.
///
/// Every connection is authenticated with the pre-shared key and then
/// served independently. Per connection, the agent remembers the most
/// recent `host` and `env_proto` casts; `call/start_worker` launches a
/// worker from them through its [`LocalProcessLauncher`]. The worker is
/// told which host it was requested on through
/// [`WORKER_HOST_ENV`](crate::launcher::local::WORKER_HOST_ENV), so the
/// worker command may be a wrapper that forwards to that host.
///
/// Workers outlive the connection that requested them. They are reaped
/// when the agent stops.
pub struct WorkerAgent {
    key: AuthKey,
    launcher: LocalProcessLauncher,
    run_dir: PathBuf,
    handshake_timeout: Duration,
    cancel_token: CancellationToken,
    workers: Mutex<Vec<LocalWorker>>,
}

/// Per-connection state carried between requests.
#[derive(Default)]
struct PendingLaunch {
    host: Option<String>,
    env: Option<String>,
}

impl WorkerAgent {
    /// Create an agent that launches workers with `launcher`, keeping
    /// their artifacts under `run_dir`. It will not accept connections
    /// until [`WorkerAgent::serve`] is called.
    pub fn new(key: AuthKey, launcher: LocalProcessLauncher, run_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            key,
            launcher,
            run_dir: run_dir.into(),
            handshake_timeout: DEFAULT_CALL_TIMEOUT,
            cancel_token: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Stop serving. Running workers are reaped before
    /// [`WorkerAgent::serve`] returns.
    pub fn terminate(&self) {
        self.cancel_token.cancel();
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// The number of workers started and not yet reaped.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Accept and serve connections on `listener` until terminated.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => tracing::info!("worker agent listening on {}", addr),
            Err(e) => tracing::warn!("worker agent listening on unknown address: {}", e),
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let agent = Arc::clone(&self);
                            let peer = peer.to_string();
                            connections.spawn(async move {
                                if let Err(e) = agent.serve_connection(&peer, stream).await {
                                    tracing::warn!(peer, "connection ended with error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept failed: {}", e);
                            continue;
                        }
                    }
                }
                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = result {
                        tracing::error!("connection handler failed: {}", e);
                    }
                }
                _ = self.cancel_token.cancelled() => {
                    tracing::info!("worker agent cancelled");
                    break;
                }
            }
        }

        connections.shutdown().await;
        self.reap_workers().await;
    }

    /// Serve a single connection: authenticate the peer, then handle
    /// requests until it closes the stream.
    pub async fn serve_connection<S>(&self, peer: &str, stream: S) -> Result<(), AgentError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        // Until the peer is authenticated, accept nothing larger than
        // a challenge response.
        let mut reader = FrameReader::new(reader, auth::RESPONSE_LEN);
        let io_error = |source| AgentError::Connection {
            addr: peer.to_string(),
            source,
        };

        let (challenge, nonce) = auth::challenge();
        write_frame(&mut writer, &challenge, DEFAULT_MAX_FRAME_LENGTH)
            .await
            .map_err(io_error)?;
        let response = tokio::time::timeout(self.handshake_timeout, reader.next())
            .await
            .map_err(|_| AgentError::Timeout {
                command: "handshake".to_string(),
                timeout: self.handshake_timeout,
            })?
            .map_err(io_error)?
            .ok_or_else(|| AgentError::Protocol("peer closed during handshake".to_string()))?;
        if !self.key.verify(&nonce, &response) {
            tracing::warn!(peer, "rejecting connection: bad authentication key");
            // Best effort; the peer may already be gone.
            let _ = write_frame(&mut writer, auth::FAILURE, DEFAULT_MAX_FRAME_LENGTH).await;
            let _ = writer.shutdown().await;
            return Err(AgentError::Auth {
                addr: peer.to_string(),
            });
        }
        write_frame(&mut writer, auth::WELCOME, DEFAULT_MAX_FRAME_LENGTH)
            .await
            .map_err(io_error)?;
        reader.set_max_frame_length(DEFAULT_MAX_FRAME_LENGTH);
        tracing::debug!(peer, "authenticated connection");

        let mut pending = PendingLaunch::default();
        loop {
            let Some(header) = reader.next().await.map_err(io_error)? else {
                tracing::debug!(peer, "connection closed");
                return Ok(());
            };
            let payload = reader.next().await.map_err(io_error)?.ok_or_else(|| {
                AgentError::Protocol("connection closed between header and payload".to_string())
            })?;
            let request = AgentRequest::from_frames(&header, &payload)?;
            tracing::debug!(peer, "[{}] {}", request.header(), request.payload);

            match request.verb {
                Verb::Cast => match request.command.as_str() {
                    command::HOST => pending.host = Some(request.payload),
                    command::ENV_PROTO => pending.env = Some(request.payload),
                    other => tracing::warn!(peer, "ignoring unknown cast {:?}", other),
                },
                Verb::Call => {
                    let reply = match request.command.as_str() {
                        command::START_WORKER => self.start_worker(&pending).await,
                        other => format!("error: unknown command {}", other),
                    };
                    write_frame(&mut writer, reply.as_bytes(), DEFAULT_MAX_FRAME_LENGTH)
                        .await
                        .map_err(io_error)?;
                }
            }
        }
    }

    async fn start_worker(&self, pending: &PendingLaunch) -> String {
        match self.try_start_worker(pending).await {
            Ok(()) => SUCCESS_REPLY.to_string(),
            Err(reason) => {
                tracing::warn!("start_worker failed: {}", reason);
                format!("error: {}", reason)
            }
        }
    }

    async fn try_start_worker(&self, pending: &PendingLaunch) -> Result<(), String> {
        let host = pending
            .host
            .as_deref()
            .ok_or("start_worker called before a host was cast")?;
        let text = pending
            .env
            .as_deref()
            .ok_or("start_worker called before an env_proto was cast")?;
        let env = EnvDescriptor::from_text(text).map_err(|e| format!("invalid env_proto: {}", e))?;

        // Host-list environments carry no bootstrap descriptor; fall
        // back to the host's position in the machine list.
        let rank = env
            .rank()
            .or_else(|| env.machines.iter().position(|m| m.address == host))
            .unwrap_or(0);

        let worker = self
            .launcher
            .clone()
            .with_env(WORKER_HOST_ENV, host)
            .launch(rank, text, &self.run_dir)
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!(rank, host, "started worker");
        let mut workers = self.workers.lock().await;
        workers.retain_mut(|w| match w.try_stopped() {
            Some(reason) => {
                tracing::info!(rank = w.rank(), "worker {}", reason);
                false
            }
            None => true,
        });
        workers.push(worker);
        Ok(())
    }

    async fn reap_workers(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            let rank = worker.rank();
            let reason = worker.reap().await;
            tracing::info!(rank, "worker {}", reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::agent::WorkerAgentClient;
    use crate::bootstrap::compute_descriptors;
    use crate::config::MachineSpec;
    use crate::launcher::local::rank_env_path;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn env_for_rank(rank: usize) -> String {
        let descriptors = compute_descriptors(None, 2017, 4, None, None).unwrap();
        EnvDescriptor {
            machines: Vec::new(),
            control_port: 2017,
            data_port: None,
            bootstrap: Some(descriptors[rank].clone()),
            log_dir: None,
        }
        .to_text()
        .unwrap()
    }

    fn agent(program: &str, args: &[&str], run_dir: &TempDir) -> Arc<WorkerAgent> {
        WorkerAgent::new(
            AuthKey::from("secret"),
            LocalProcessLauncher::new(program, args.iter().map(|s| s.to_string()).collect()),
            run_dir.path(),
        )
    }

    /// Serve one in-memory connection and return an authenticated
    /// client for it, together with the server task.
    async fn connect(
        agent: &Arc<WorkerAgent>,
        key: &str,
    ) -> (
        Result<WorkerAgentClient<tokio::io::DuplexStream>, AgentError>,
        tokio::task::JoinHandle<Result<(), AgentError>>,
    ) {
        let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
        let server = {
            let agent = Arc::clone(agent);
            tokio::spawn(async move { agent.serve_connection("test", agent_side).await })
        };
        let client =
            WorkerAgentClient::handshake("agent", client_side, &AuthKey::from(key), TIMEOUT).await;
        (client, server)
    }

    #[tokio::test]
    async fn test_start_worker_launches_with_bootstrap_rank() {
        let run_dir = TempDir::new().unwrap();
        let agent = agent("/bin/sh", &["-c", "exit 0"], &run_dir);
        let (client, server) = connect(&agent, "secret").await;

        client
            .unwrap()
            .launch_worker("10.0.0.3", &env_for_rank(2))
            .await
            .unwrap();
        server.await.unwrap().unwrap();

        assert_eq!(agent.worker_count().await, 1);
        let persisted = std::fs::read_to_string(rank_env_path(run_dir.path(), 2)).unwrap();
        assert_eq!(EnvDescriptor::from_text(&persisted).unwrap().rank(), Some(2));
        agent.reap_workers().await;
        assert_eq!(agent.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_host_list_env_ranks_by_machine_position() {
        let run_dir = TempDir::new().unwrap();
        let agent = agent("/bin/sh", &["-c", "exit 0"], &run_dir);
        let (client, server) = connect(&agent, "secret").await;

        let env = EnvDescriptor {
            machines: vec![MachineSpec::new("10.0.0.1"), MachineSpec::new("10.0.0.2")],
            control_port: 2017,
            data_port: None,
            bootstrap: None,
            log_dir: None,
        }
        .to_text()
        .unwrap();
        client.unwrap().launch_worker("10.0.0.2", &env).await.unwrap();
        server.await.unwrap().unwrap();

        assert!(rank_env_path(run_dir.path(), 1).exists());
    }

    #[tokio::test]
    async fn test_start_worker_without_casts_is_an_error_reply() {
        let run_dir = TempDir::new().unwrap();
        let agent = agent("/bin/sh", &["-c", "exit 0"], &run_dir);
        let (client, server) = connect(&agent, "secret").await;
        let mut client = client.unwrap();

        let reply = client.send_call(command::START_WORKER, "").await.unwrap();
        assert!(reply.starts_with("error: "), "{}", reply);
        let reply = client.send_call("status", "").await.unwrap();
        assert_eq!(reply, "error: unknown command status");

        client.close().await;
        server.await.unwrap().unwrap();
        assert_eq!(agent.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_to_client() {
        let run_dir = TempDir::new().unwrap();
        let agent = agent("/nonexistent/worker", &[], &run_dir);
        let (client, server) = connect(&agent, "secret").await;

        let err = client
            .unwrap()
            .launch_worker("10.0.0.3", &env_for_rank(1))
            .await
            .unwrap_err();
        match err {
            AgentError::WorkerLaunch { host, reply } => {
                assert_eq!(host, "10.0.0.3");
                assert!(reply.starts_with("error: "), "{}", reply);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let run_dir = TempDir::new().unwrap();
        let agent = agent("/bin/sh", &["-c", "exit 0"], &run_dir);
        let (client, server) = connect(&agent, "wrong").await;

        assert!(matches!(client, Err(AgentError::Auth { .. })));
        assert!(matches!(
            server.await.unwrap(),
            Err(AgentError::Auth { .. })
        ));
    }

    #[tokio::test]
    async fn test_exited_workers_are_pruned_on_next_launch() {
        let run_dir = TempDir::new().unwrap();
        let agent = agent("/bin/sh", &["-c", "exit 0"], &run_dir);

        let (client, server) = connect(&agent, "secret").await;
        client
            .unwrap()
            .launch_worker("10.0.0.2", &env_for_rank(1))
            .await
            .unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(agent.worker_count().await, 1);

        // Let the first worker exit before asking for another.
        tokio::time::timeout(TIMEOUT, async {
            while agent.workers.lock().await[0].try_stopped().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (client, server) = connect(&agent, "secret").await;
        client
            .unwrap()
            .launch_worker("10.0.0.3", &env_for_rank(2))
            .await
            .unwrap();
        server.await.unwrap().unwrap();
        let workers = agent.workers.lock().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].rank(), 2);
    }

    #[tokio::test]
    async fn test_oversized_handshake_response_is_refused() {
        let run_dir = TempDir::new().unwrap();
        let agent = agent("/bin/sh", &["-c", "exit 0"], &run_dir);
        let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
        let server = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agent.serve_connection("test", agent_side).await })
        };

        let (reader, mut writer) = tokio::io::split(client_side);
        let mut reader = FrameReader::new(reader, DEFAULT_MAX_FRAME_LENGTH);
        let challenge = reader.next().await.unwrap().unwrap();
        assert!(challenge.starts_with(auth::CHALLENGE));
        // Declare a body far larger than any digest and never send it.
        writer.write_all(&(1u64 << 30).to_be_bytes()).await.unwrap();

        match tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap() {
            Err(AgentError::Connection { source, .. }) => {
                assert_eq!(source.kind(), std::io::ErrorKind::InvalidData);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_serve_stops_on_terminate() {
        let run_dir = TempDir::new().unwrap();
        let agent = agent("/bin/sh", &["-c", "sleep 60"], &run_dir);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let serving = tokio::spawn(Arc::clone(&agent).serve(listener));

        let client = WorkerAgentClient::connect(&addr, &AuthKey::from("secret"), TIMEOUT)
            .await
            .unwrap();
        client.launch_worker("10.0.0.3", &env_for_rank(1)).await.unwrap();
        assert_eq!(agent.worker_count().await, 1);

        agent.terminate();
        serving.await.unwrap();
        assert_eq!(agent.worker_count().await, 0);
    }
}
