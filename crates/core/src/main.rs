use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = lavs_core::cli::Cli::parse();

    // .env next to the binary is the fallback for service installs
    if dotenvy::dotenv().is_err() {
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let _ = dotenvy::from_path(dir.join(".env"));
            }
        }
    }
    init_tracing();

    match cli.command {
        None => lavs_core::run_gateway(lavs_core::config::AppConfig::load()?).await,
        Some(cmd) => lavs_core::cli::dispatch(cmd).await,
    }
}
