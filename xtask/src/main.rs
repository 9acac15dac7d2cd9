use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use liftsync_core::api::types::{LoginRequest, UpdateProfileRequest};
use liftsync_core::persist::decode_snapshot;
use liftsync_core::{
    telemetry, ClientConfig, FileStore, LiftApi, LiftClient, MockLiftApi, SystemClock,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for liftsync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in, load and update data against the in-memory API, then restart
    /// from the persisted snapshot.
    Smoke,
    /// Start the client against the configured API and report what it
    /// restored from the data directory.
    Status,
    /// Decode a persisted query-cache snapshot and print its entries.
    InspectSnapshot {
        /// Path to the snapshot file.
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    telemetry::init_tracing(telemetry::default_filter("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
        Commands::Status => status(),
        Commands::InspectSnapshot { path } => inspect_snapshot(&path),
    }
}

async fn start_mock_client(config: &ClientConfig) -> Result<LiftClient> {
    let store = Arc::new(FileStore::new(config.data_dir.clone()));
    let client = LiftClient::start(config, store, Arc::new(SystemClock), |_, bus| {
        Ok(Arc::new(MockLiftApi::new(bus.clone())) as Arc<dyn LiftApi>)
    })
    .await?;
    Ok(client)
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let config = ClientConfig {
        data_dir: temp_dir.path().to_path_buf(),
        ..ClientConfig::load().map_err(|err| anyhow::anyhow!(err.user_message()))?
    };

    runtime.block_on(async {
        let client = start_mock_client(&config).await?;
        client
            .login(LoginRequest {
                identifier: "ada@example.com".into(),
                password: "smoke-test".into(),
            })
            .await?;
        let interests = client.fetch_interests().await?;
        client
            .update_profile(UpdateProfileRequest {
                interests: Some(interests.iter().take(2).map(|i| i.id.clone()).collect()),
                onboarding_complete: Some(true),
                ..UpdateProfileRequest::default()
            })
            .await?;
        let profile = client.fetch_profile().await?;
        info!(
            "username" = %profile.username,
            "interests" = profile.interests.len(),
            "smoke test profile updated"
        );
        client.shutdown().await;

        let restarted = start_mock_client(&config).await?;
        info!(
            "entries" = restarted.cache().len(),
            "authenticated" = restarted.session().is_authenticated(),
            "smoke test restored from disk"
        );
        anyhow::ensure!(
            restarted.session().is_authenticated(),
            "session was not restored"
        );
        restarted.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })
}

fn status() -> Result<()> {
    let config = ClientConfig::load().map_err(|err| anyhow::anyhow!(err.user_message()))?;
    let runtime = Runtime::new()?;
    runtime.block_on(async {
        let client = LiftClient::with_http(&config, Arc::new(SystemClock)).await?;
        println!("api        {}", config.api.base_url);
        println!("data dir   {}", config.data_dir.display());
        println!("session    {:?}", client.session().phase());
        println!("cached     {} queries", client.cache().len());
        client.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })
}

fn inspect_snapshot(path: &Path) -> Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let snapshot = decode_snapshot(&bytes)?;
    println!(
        "version {} written at {} ({} entries)",
        snapshot.version,
        snapshot.written_at,
        snapshot.entries.len()
    );
    for entry in &snapshot.entries {
        println!(
            "{}  fetched {}  {}",
            entry.key,
            entry.fetched_at,
            serde_json::to_string(&entry.data)?
        );
    }
    Ok(())
}
