// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conveyor worker agent binary.

use clap::{Parser, Subcommand};

use conveyor_agent::{AgentConfig, JobPool};

#[derive(Parser)]
#[command(name = "conveyor-agent", about = "Conveyor worker agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the orchestrator and execute jobs.
    Start,
    /// Register this agent and persist its token.
    Register,
    /// Remove this agent's registration.
    Unregister,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::from_env()?;
    let pool = JobPool::new(config);

    match cli.command {
        Command::Start => pool.run().await?,
        Command::Register => pool.register().await?,
        Command::Unregister => pool.unregister().await?,
    }

    Ok(())
}
