use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use map_insight::db::bootstrap;
use map_insight::{build_router, init_tracing, AppConfig, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "map-insight",
    version,
    about = "Describes map coordinates using geocoding, Wikipedia, web search and a generative model"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default).
    Serve {
        /// Address to bind the HTTP server to (host:port).
        #[arg(long, env = "BIND_ADDRESS")]
        bind: Option<String>,
    },
    /// Create the database schema and seed the interest catalogue, then exit.
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Command::Serve { bind: None }) {
        Command::InitDb => {
            let db = bootstrap(&config.data_dir, &config.database_file_name)
                .context("failed to initialize database")?;
            info!(path = %db.path.display(), "database initialized");
            Ok(())
        }
        Command::Serve { bind } => serve(config, bind).await,
    }
}

async fn serve(config: AppConfig, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.bind_address.clone());
    let state = AppState::initialize(config).context("failed to initialize service")?;
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(version = env!("CARGO_PKG_VERSION"), "listening on http://{bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    state.shutdown();
    Ok(())
}
