//! Gateway orchestration: decode, route, dispatch, translate back.
//!
//! Each inbound request makes exactly one upstream call. Errors found before
//! that call are returned as [`GatewayError`]s for the server to encode in the
//! client's dialect; errors found while streaming become terminal frames.

use crate::error::{ErrorKind, GatewayError, Result};
use crate::logging::ExchangeRecord;
use crate::router::{Backend, RouteTable};
use crate::schema::{Reasoning, StreamEvent};
use crate::translate::openai::split_effort_suffix;
use crate::translate::streaming::{reframe_stream, Reframer};
use crate::translate::{self, Dialect, SseFrame};

use axum::http::HeaderMap;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;

pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

pub type FrameStream = Pin<Box<dyn Stream<Item = SseFrame> + Send>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send>>;

/// What to send back to the client.
pub enum GatewayReply {
    /// A complete JSON body.
    Json { status: u16, body: Bytes },
    /// Re-framed SSE frames in the client's dialect.
    Stream(FrameStream),
    /// Upstream bytes relayed untouched.
    Relay {
        status: u16,
        content_type: String,
        body: ByteStream,
    },
}

impl GatewayReply {
    pub fn status(&self) -> u16 {
        match self {
            GatewayReply::Json { status, .. } | GatewayReply::Relay { status, .. } => *status,
            GatewayReply::Stream(_) => 200,
        }
    }
}

/// Handle one inbound request that arrived in `dialect`.
///
/// `record` is filled in as the request progresses so the caller can
/// journal it whatever the outcome.
pub async fn handle(
    routes: &RouteTable,
    client: &reqwest::Client,
    dialect: Dialect,
    headers: &HeaderMap,
    body: Bytes,
    record: &mut ExchangeRecord,
) -> Result<GatewayReply> {
    let req = translate::decode_request(dialect, &body)?;
    record.model = req.model.clone();
    record.stream = req.stream;

    let decision = routes.decide(dialect, &req.model, req.reasoning.is_some())?;
    record.routed(&decision);
    let backend = routes
        .backend(decision.backend)
        .ok_or_else(|| GatewayError::no_route(decision.model.clone()))?;

    let outbound = if decision.needs_transform {
        let mut out = req.clone();
        out.model = decision.model.clone();
        if decision.backend == Dialect::OpenAi {
            let (base, effort) = split_effort_suffix(&out.model);
            if let Some(effort) = effort {
                out.model = base;
                out.reasoning.get_or_insert(Reasoning::Effort(effort));
            }
        }
        translate::encode_request(decision.backend, &out)
    } else if decision.model != req.model {
        replace_model(&body, &decision.model)?
    } else {
        body
    };

    let url = backend.endpoint();
    tracing::info!(
        url = %url,
        inbound = %dialect,
        backend = %decision.backend,
        model = %decision.model,
        transform = decision.needs_transform,
        stream = req.stream,
        "Dispatching"
    );

    let response = authorize(client.post(&url), backend, headers)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(outbound)
        .send()
        .await
        .map_err(|e| GatewayError::disconnected(format!("request to {url} failed: {e}")))?;

    let status = response.status().as_u16();
    if !response.status().is_success() {
        let content_type = content_type(&response, "application/json");
        let body = response.bytes().await.unwrap_or_default();
        tracing::warn!(
            status,
            body = %translate::truncate(&String::from_utf8_lossy(&body), 300),
            "Backend returned an error"
        );
        if !decision.needs_transform {
            return Ok(GatewayReply::Relay {
                status,
                content_type,
                body: Box::pin(futures::stream::once(async move { Ok(body) })),
            });
        }
        return Err(GatewayError::upstream(
            status,
            translate::decode_error_message(decision.backend, &body),
        ));
    }

    // Clients see the model they asked for, or the override when they named none.
    let reported_model = if req.model.is_empty() {
        decision.model.clone()
    } else {
        req.model.clone()
    };

    match (req.stream, decision.needs_transform) {
        (true, true) => {
            let reframer = Reframer::new(decision.backend, dialect, Some(reported_model));
            Ok(GatewayReply::Stream(Box::pin(reframe_stream(
                response.bytes_stream(),
                reframer,
            ))))
        }
        (true, false) => Ok(GatewayReply::Relay {
            status,
            content_type: content_type(&response, "text/event-stream"),
            body: relay_stream(response.bytes_stream(), dialect),
        }),
        (false, true) => {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| GatewayError::disconnected(format!("reading backend response: {e}")))?;
            let mut resp = translate::decode_response(decision.backend, &bytes).map_err(|e| {
                GatewayError::upstream(502, format!("could not decode backend response: {e}"))
            })?;
            resp.model = reported_model;
            tracing::info!(
                input_tokens = resp.usage.input_tokens,
                output_tokens = resp.usage.output_tokens,
                warnings = resp.warnings.len(),
                "Completed"
            );
            Ok(GatewayReply::Json {
                status: 200,
                body: translate::encode_response(dialect, &resp),
            })
        }
        (false, false) => {
            let content_type = content_type(&response, "application/json");
            let bytes = response
                .bytes()
                .await
                .map_err(|e| GatewayError::disconnected(format!("reading backend response: {e}")))?;
            Ok(GatewayReply::Relay {
                status,
                content_type,
                body: Box::pin(futures::stream::once(async move { Ok(bytes) })),
            })
        }
    }
}

/// Credential and version headers for `backend`. Without a configured key the
/// client's own credential is forwarded.
fn authorize(
    builder: reqwest::RequestBuilder,
    backend: &Backend,
    headers: &HeaderMap,
) -> reqwest::RequestBuilder {
    let key = backend.api_key.clone().or_else(|| client_key(headers));
    match backend.dialect {
        Dialect::Anthropic => {
            let version = header_str(headers, "anthropic-version").unwrap_or(DEFAULT_ANTHROPIC_VERSION);
            let mut builder = builder.header("anthropic-version", version);
            if let Some(beta) = header_str(headers, "anthropic-beta") {
                builder = builder.header("anthropic-beta", beta);
            }
            match key {
                Some(key) => builder.header("x-api-key", key),
                None => builder,
            }
        }
        Dialect::OpenAi => match key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        },
    }
}

fn client_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = header_str(headers, "x-api-key") {
        return Some(key.to_string());
    }
    header_str(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(|v| v.trim().to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn content_type(response: &reqwest::Response, fallback: &str) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(fallback)
        .to_string()
}

/// Rewrite only the `model` field of a same-dialect request body.
fn replace_model(body: &[u8], model: &str) -> Result<Bytes> {
    let mut value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| GatewayError::decode_body(&e))?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "model".to_string(),
            serde_json::Value::String(model.to_string()),
        );
    }
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

/// Relay a same-dialect SSE stream byte for byte. A transport failure
/// appends one error frame in the client's dialect.
fn relay_stream(
    byte_stream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
    dialect: Dialect,
) -> ByteStream {
    Box::pin(async_stream::stream! {
        tokio::pin!(byte_stream);
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => yield Ok(bytes),
                Err(e) => {
                    tracing::error!(error = %e, "Relayed stream failed");
                    let event = StreamEvent::error(
                        ErrorKind::UpstreamDisconnected,
                        format!("upstream connection lost: {e}"),
                    );
                    let mut encoder = translate::stream_encoder(dialect);
                    for frame in encoder.encode(&event) {
                        yield Ok(frame.to_bytes());
                    }
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_key_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers), None);
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-abc"));
        assert_eq!(client_key(&headers).as_deref(), Some("sk-abc"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant"));
        assert_eq!(client_key(&headers).as_deref(), Some("sk-ant"));
    }

    #[test]
    fn test_replace_model_keeps_other_fields() {
        let body = br#"{"model":"anthropic/claude-3-opus","max_tokens":5,"messages":[]}"#;
        let out = replace_model(body, "claude-3-opus").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "claude-3-opus");
        assert_eq!(value["max_tokens"], 5);
    }
}
