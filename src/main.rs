use clap::Parser;
use dialect_gateway::config::config_search_paths;
use dialect_gateway::{build_router, AppState, Dialect, ExchangeLog, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "dialect-gateway",
    about = "Route Anthropic and OpenAI clients to either backend, translating where needed",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Routing mode: transform, passthrough, auto (alias: gateway)
    #[arg(short, long)]
    mode: Option<String>,

    /// Exchange journal path (JSONL)
    #[arg(long, default_value = "dialect-gateway.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dialect_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;
    config.apply_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ref mode) = cli.mode {
        config.mode = mode.parse()?;
    }
    config.validate()?;

    let journal = ExchangeLog::open(&cli.log_file)?;
    let state = Arc::new(AppState::with_journal(config.clone(), journal)?);

    info!("dialect-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("  Mode:      {}", config.mode);
    for dialect in [Dialect::Anthropic, Dialect::OpenAi] {
        match state.routes.backend(dialect) {
            Some(backend) => info!(
                "  {:<10} {} ({})",
                format!("{dialect}:"),
                backend.endpoint(),
                if backend.api_key.is_some() {
                    "configured key"
                } else {
                    "client key forwarded"
                }
            ),
            None => info!("  {:<10} not configured", format!("{dialect}:")),
        }
    }
    info!("  Models:    {} mapped", config.models.len());
    info!("  Journal:   {}", cli.log_file.display());

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  Anthropic clients: ANTHROPIC_BASE_URL=http://localhost:{}", config.port);
    info!("  OpenAI clients:    OPENAI_BASE_URL=http://localhost:{}/v1", config.port);

    axum::serve(listener, build_router(state)).await?;

    Ok(())
}
