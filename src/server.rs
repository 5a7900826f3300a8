use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::logging::{ExchangeLog, ExchangeRecord};
use crate::proxy::{self, GatewayReply};
use crate::router::RouteTable;
use crate::translate::{self, Dialect, SseFrame};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub config: GatewayConfig,
    pub routes: RouteTable,
    pub client: reqwest::Client,
    pub journal: ExchangeLog,
}

impl AppState {
    /// State with an in-memory journal.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::with_journal(config, ExchangeLog::in_memory())
    }

    pub fn with_journal(config: GatewayConfig, journal: ExchangeLog) -> Result<Self> {
        let routes = RouteTable::from_config(&config)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            config,
            routes,
            client,
            journal,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_inbound(state, Dialect::Anthropic, headers, body).await
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_inbound(state, Dialect::OpenAi, headers, body).await
}

async fn handle_inbound(
    state: Arc<AppState>,
    dialect: Dialect,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let mut record = ExchangeRecord::new(dialect);

    let result = proxy::handle(
        &state.routes,
        &state.client,
        dialect,
        &headers,
        body,
        &mut record,
    )
    .await;

    let response = match result {
        Ok(reply) => {
            record.status = reply.status();
            reply_response(reply)
        }
        Err(e) => {
            tracing::warn!(
                request_id = %record.request_id,
                kind = e.kind().as_str(),
                error = %e,
                "Request failed"
            );
            record.failed(&e);
            error_response(dialect, &e)
        }
    };

    record.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    state.journal.record(record);
    response
}

fn reply_response(reply: GatewayReply) -> Response {
    match reply {
        GatewayReply::Json { status, body } => Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        GatewayReply::Stream(frames) => {
            let events = frames.map(|frame| Ok::<Event, Infallible>(to_event(frame)));
            Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        GatewayReply::Relay {
            status,
            content_type,
            body,
        } => Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
    }
}

fn to_event(frame: SseFrame) -> Event {
    let event = Event::default().data(frame.data);
    match frame.event {
        Some(name) => event.event(name),
        None => event,
    }
}

fn error_response(dialect: Dialect, err: &GatewayError) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(err.status()).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(translate::encode_error(dialect, err)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let backends: Vec<&str> = [Dialect::Anthropic, Dialect::OpenAi]
        .into_iter()
        .filter(|d| state.routes.backend(*d).is_some())
        .map(Dialect::as_str)
        .collect();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.routes.mode().as_str(),
        "backends": backends,
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut names: Vec<&String> = state.config.models.keys().collect();
    names.sort();
    let models: Vec<serde_json::Value> = names
        .into_iter()
        .map(|name| {
            let target = &state.config.models[name];
            let owner = state
                .routes
                .classify(target)
                .map_or("dialect-gateway", Dialect::as_str);
            serde_json::json!({
                "id": name,
                "object": "model",
                "owned_by": owner,
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}
