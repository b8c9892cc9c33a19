use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use mongofs::backend::{Connection, MongoBackend};
use mongofs::config::Settings;
use mongofs::fs::MongoFs;

async fn open_engine(config_path: &Path) -> Result<MongoFs> {
    let settings = Settings::from_file(config_path)?;
    let backend = MongoBackend::connect(&settings.mongo)
        .await
        .with_context(|| format!("Failed to connect to {}", settings.mongo.uri()))?;
    let conn = Arc::new(Connection::new(
        Arc::new(backend),
        settings.attempt_budget(),
        Some(settings.mount.path.clone()),
    ));
    let fs = MongoFs::new(conn, &settings.hostname())
        .await
        .context("Failed to open the filesystem")?;
    Ok(fs)
}

pub async fn status(config_path: &Path) -> Result<()> {
    let fs = open_engine(config_path).await?;
    let stats = fs.stats().await?;
    println!("entries: {}", stats.entries);
    println!("chunks:  {}", stats.chunks);
    Ok(())
}

pub async fn reset(config_path: &Path, yes: bool) -> Result<()> {
    if !yes {
        bail!("reset deletes every stored entry and chunk; pass --yes to confirm");
    }
    let fs = open_engine(config_path).await?;
    fs.purge().await?;
    println!("Database cleared.");
    Ok(())
}
