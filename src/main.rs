use std::path::PathBuf;

use remcode_config::RemcodeConfig;
use remcode_index::IndexService;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("remcode_index=info,remcode=info")),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    // An explicit path wins; otherwise the layered lookup in remcode-config applies.
    let config_path = std::env::var_os("REMCODE_CONFIG").map(PathBuf::from);
    let config = RemcodeConfig::load(config_path.as_deref())?;

    let service = IndexService::from_config(&config)?;
    let stats = service.run_incremental().await?;

    info!(
        files_changed = stats.files_changed,
        chunks_failed = stats.chunks_failed,
        "Run finished with status {:?}",
        stats.status
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
