use anyhow::{Context, Result};
use shoal_worker::{WorkerConfig, init_tracing, open_database, run_worker};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = WorkerConfig::from_env().context("load worker config")?;
    let db = open_database(&config).await?;
    run_worker(&config, db, tokio::io::stdin(), tokio::io::stdout()).await
}
