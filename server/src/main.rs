use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sandbox_runner::{Limits, SandboxRunner};
use tracing::info;

use server::builder::SubmissionBuilder;
use server::logger::init_logger;
use server::server::{router, AppState};

/// Tournament judge server for a two-player Battleship contest.
#[derive(Parser, Debug)]
#[command(name = "server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:4239")]
    addr: String,

    /// Per-player memory limit in megabytes.
    #[arg(long, default_value_t = 70)]
    player_memory_mb: i64,

    /// Per-player CPU budget in virtual CPUs.
    #[arg(long, default_value_t = 1.0)]
    player_vcpus: f64,

    /// Directory submissions are fetched and compiled in.
    #[arg(long, default_value = "builds")]
    builds_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Args::parse();

    let git_token = std::env::var("GIT_AUTH_TOKEN").context("GIT_AUTH_TOKEN is not set")?;

    let limits = Limits {
        memory_bytes: args.player_memory_mb * 1024 * 1024,
        vcpus: args.player_vcpus,
        max_pids: 100,
    };
    let state = AppState::new(
        SubmissionBuilder::new(args.builds_dir, git_token),
        SandboxRunner::new(limits),
    );

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("could not bind {}", args.addr))?;
    info!(addr = %args.addr, "judge server listening");

    axum::serve(listener, router(state))
        .await
        .context("server error")?;
    Ok(())
}
