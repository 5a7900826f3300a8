//! Start a gateway programmatically in auto mode.
//!
//! Usage:
//!   export ANTHROPIC_API_KEY=sk-ant-...
//!   export OPENAI_API_KEY=sk-...
//!   cargo run --example basic_gateway

use dialect_gateway::{build_router, AppState, GatewayConfig, RoutingMode};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = GatewayConfig::find_and_load(None)?;
    config.apply_env()?;
    config.mode = RoutingMode::Auto;
    config.validate()?;

    let port = config.port;
    let state = Arc::new(AppState::new(config)?);
    for dialect in [dialect_gateway::Dialect::Anthropic, dialect_gateway::Dialect::OpenAi] {
        if let Some(backend) = state.routes.backend(dialect) {
            println!("{dialect:>9} backend: {}", backend.endpoint());
        }
    }

    let app = build_router(state);
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("Listening on http://{}", addr);
    println!("  Anthropic clients: ANTHROPIC_BASE_URL=http://{addr}");
    println!("  OpenAI clients:    OPENAI_BASE_URL=http://{addr}/v1");

    axum::serve(listener, app).await?;
    Ok(())
}
