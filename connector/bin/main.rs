use anyhow::Result;
use ingot_connector::cli;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    cli::run().await
}
