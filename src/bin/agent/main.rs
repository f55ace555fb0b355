mod brain;
mod face;
mod hands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::Parser;
use dotenvy::dotenv;
use pagepilot::skills::SkillMemory;
use pagepilot::{Copilot, EngineConfig, EngineEvent, JsonFileStore, VisitMemory};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drive a Chrome tab from natural-language requests.
#[derive(Parser, Debug)]
#[command(name = "agent", version)]
struct Args {
    /// First port to try for the web UI; the next nine are tried too.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Where skills, visits and the browser profile are kept.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Attach to a Chrome already listening on port 9222.
    #[arg(long)]
    attach: bool,

    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pagepilot=info,agent=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = EngineConfig::from_env();
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    info!(data_dir = %config.data_dir.display(), "starting agent");

    // Launch the browser in a blocking task (it can take a while)
    let options = hands::HostOptions {
        attach: args.attach,
        headless: args.headless,
        profile_dir: config.data_dir.join("profile"),
    };
    let host = tokio::task::spawn_blocking(move || hands::ChromeHost::launch(&options))
        .await
        .map_err(|e| anyhow!("Browser launch panicked: {}", e))??;

    let oracle = brain::OpenAiOracle::from_env()?;
    info!(model = oracle.model(), "oracle ready");

    let skills = SkillMemory::open(
        Arc::new(JsonFileStore::new(config.skills_path(), "skills")),
        config.skills,
    )
    .await?;
    let visits = VisitMemory::open(Arc::new(JsonFileStore::new(config.visits_path(), "visits"))).await?;
    info!(skills = skills.len().await, "memory loaded");

    let copilot = Arc::new(Copilot::new(
        Arc::new(host),
        Arc::new(oracle),
        Arc::new(skills),
        Arc::new(visits),
        config,
    ));

    let mut events = copilot.subscribe();
    let port = face::start_server(copilot.clone(), args.port).await?;
    info!("Waiting for commands at http://localhost:{}", port);

    // Mirror engine progress into the log until the process is stopped.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                copilot.stop();
                break;
            }
            event = events.recv() => match event {
                Ok(EngineEvent::Message { text }) => info!(%text, "message"),
                Ok(EngineEvent::Step { number, description }) => info!(number, %description, "step"),
                Ok(EngineEvent::StepError { message }) => info!(%message, "step error"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}
