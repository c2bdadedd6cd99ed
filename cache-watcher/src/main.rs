use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    cache_watcher::run().await?;
    Ok(())
}
