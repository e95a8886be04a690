/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Brings up a cluster described by the runner environment and keeps
//! it up until interrupted.

use clap::Parser;
use cluster_bootstrap::ClusterSession;
use cluster_bootstrap::RunnerEnv;
use cluster_bootstrap::runner_env::ENV_KEYS;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Launches the workers of a cluster run; this process is rank 0")]
struct Args {
    #[arg(long, help = "List the environment variables that describe the cluster and exit")]
    list_env: bool,

    #[arg(long, help = "Tear down as soon as the workers are launched instead of waiting for ctrl-c")]
    no_wait: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    if args.list_env {
        for key in ENV_KEYS {
            println!("{:<32} {}", key.name, key.doc);
        }
        return Ok(());
    }

    let env = RunnerEnv::from_env();
    let mut config = env.environment_config()?;
    let mut session = ClusterSession::from_runner_env(&env)?;

    let result = session.ensure_ready(&mut config).await;
    for descriptor in session.descriptors() {
        tracing::info!("{}", descriptor);
    }
    if let Err(e) = result {
        session.teardown().await;
        return Err(e.into());
    }
    tracing::info!(ranks = ?session.launched_ranks(), "cluster is up");

    if !args.no_wait {
        tokio::signal::ctrl_c().await?;
        tracing::info!("interrupted, tearing down");
    }
    for (rank, reason) in session.teardown().await {
        tracing::info!(rank, "worker {}", reason);
    }
    Ok(())
}
