use env_logger::Builder;
use log::LevelFilter;
use vcdb::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    log::info!(
        "configuration loaded: server={}, backend={:?}",
        config.server_address(),
        config.database.backend
    );

    vcdb::run_server(config).await
}
