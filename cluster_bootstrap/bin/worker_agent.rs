/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use cluster_bootstrap::AuthKey;
use cluster_bootstrap::WorkerAgent;
use cluster_bootstrap::launcher::LocalProcessLauncher;
use cluster_bootstrap::runner_env;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Runs a worker agent that starts cluster workers on request")]
struct Args {
    #[arg(
        long,
        default_value_t = 26700,
        help = "The port to listen on. Orchestrators on this host reach the agent at localhost:{port}"
    )]
    port: u16,

    #[arg(long, default_value = "127.0.0.1", help = "The address to bind to")]
    addr: String,

    #[arg(
        long,
        env = runner_env::WORKER_AGENT_AUTHKEY,
        hide_env_values = true,
        help = "Pre-shared key clients must authenticate with"
    )]
    authkey: String,

    #[arg(
        long,
        env = runner_env::WORKER_COMMAND,
        default_value = runner_env::DEFAULT_WORKER_COMMAND,
        help = "Command line started for each requested worker, followed by --env_proto=<path>"
    )]
    worker_command: String,

    #[arg(
        long,
        help = "Directory for worker environments and logs. Defaults to a fresh directory under the run root"
    )]
    run_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let launcher = LocalProcessLauncher::from_command_line(&args.worker_command)
        .context("invalid --worker-command")?;
    let run_dir = args
        .run_dir
        .unwrap_or_else(|| runner_env::RunnerEnv::from_env().new_run_dir());
    tracing::info!("worker artifacts under {}", run_dir.display());
    tracing::info!("program to spawn on start_worker: [{}]", &args.worker_command);

    let listener = TcpListener::bind((args.addr.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.addr, args.port))?;
    let agent = WorkerAgent::new(AuthKey::from(args.authkey), launcher, run_dir);

    let serving = tokio::spawn(agent.clone().serve(listener));
    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, stopping agent");
    agent.terminate();
    serving.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["worker_agent", "--authkey", "k"]);
        assert_eq!(args.port, 26700);
        assert_eq!(args.addr, "127.0.0.1");
        assert_eq!(args.authkey, "k");
        assert_eq!(args.run_dir, None);
    }
}
