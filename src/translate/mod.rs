//! Translation between the Anthropic and `OpenAI` dialects.
//!
//! Each dialect has a codec module that converts its wire format to and from
//! the [`crate::schema`] model. Whole-body codec functions are pure; the
//! streaming halves are small state machines behind [`StreamDecoder`] and
//! [`StreamEncoder`], which [`streaming::Reframer`] chains together.

pub mod accumulate;
pub mod anthropic;
pub mod anthropic_types;
pub mod openai;
pub mod openai_types;
pub mod sse;
pub mod streaming;

use crate::error::{GatewayError, Result};
use crate::schema::{Request, Response, StreamEvent};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use sse::SseFrame;

/// One of the two wire protocols the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl Dialect {
    /// Inbound path on which clients of this dialect arrive.
    pub fn inbound_path(self) -> &'static str {
        match self {
            Dialect::Anthropic => "/v1/messages",
            Dialect::OpenAi => "/v1/chat/completions",
        }
    }

    /// Path appended to a backend's base URL.
    ///
    /// Anthropic base URLs are the bare host; `OpenAI`-compatible base URLs
    /// already include the version segment (`https://api.openai.com/v1`).
    pub fn upstream_path(self) -> &'static str {
        match self {
            Dialect::Anthropic => "/v1/messages",
            Dialect::OpenAi => "/chat/completions",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Anthropic => "anthropic",
            Dialect::OpenAi => "openai",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turns upstream SSE frames into schema stream events.
///
/// One frame can carry several events (an `OpenAI` chunk may open a block and
/// deliver its first delta at once), or none (keep-alives, pings).
pub trait StreamDecoder: Send {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>>;

    /// Called once the upstream byte stream has ended.
    fn finish(&mut self) -> Vec<StreamEvent>;
}

/// Turns schema stream events into client-facing SSE frames.
pub trait StreamEncoder: Send {
    fn encode(&mut self, event: &StreamEvent) -> Vec<SseFrame>;
}

pub fn decode_request(dialect: Dialect, body: &[u8]) -> Result<Request> {
    match dialect {
        Dialect::Anthropic => anthropic::decode_request(body),
        Dialect::OpenAi => openai::decode_request(body),
    }
}

pub fn encode_request(dialect: Dialect, req: &Request) -> Bytes {
    match dialect {
        Dialect::Anthropic => anthropic::encode_request(req),
        Dialect::OpenAi => openai::encode_request(req),
    }
}

pub fn decode_response(dialect: Dialect, body: &[u8]) -> Result<Response> {
    match dialect {
        Dialect::Anthropic => anthropic::decode_response(body),
        Dialect::OpenAi => openai::decode_response(body),
    }
}

pub fn encode_response(dialect: Dialect, resp: &Response) -> Bytes {
    match dialect {
        Dialect::Anthropic => anthropic::encode_response(resp),
        Dialect::OpenAi => openai::encode_response(resp),
    }
}

/// Error envelope for `err` in `dialect`.
pub fn encode_error(dialect: Dialect, err: &GatewayError) -> Bytes {
    match dialect {
        Dialect::Anthropic => anthropic::encode_error(err),
        Dialect::OpenAi => openai::encode_error(err),
    }
}

/// Message text from a backend's error body, falling back to the raw body.
pub fn decode_error_message(dialect: Dialect, body: &[u8]) -> String {
    let parsed = match dialect {
        Dialect::Anthropic => anthropic::decode_error_message(body),
        Dialect::OpenAi => openai::decode_error_message(body),
    };
    parsed.unwrap_or_else(|| truncate(&String::from_utf8_lossy(body), 500).to_string())
}

pub fn stream_decoder(dialect: Dialect) -> Box<dyn StreamDecoder> {
    match dialect {
        Dialect::Anthropic => Box::new(anthropic::AnthropicStreamDecoder::new()),
        Dialect::OpenAi => Box::new(openai::OpenAiStreamDecoder::new()),
    }
}

pub fn stream_encoder(dialect: Dialect) -> Box<dyn StreamEncoder> {
    match dialect {
        Dialect::Anthropic => Box::new(anthropic::AnthropicStreamEncoder::new()),
        Dialect::OpenAi => Box::new(openai::OpenAiStreamEncoder::new()),
    }
}

/// Serialize a wire value. The wire types only hold strings, numbers and
/// JSON values with string keys, for which serialization cannot fail.
pub(crate) fn to_json_bytes<T: Serialize>(value: &T) -> Bytes {
    serde_json::to_vec(value).map(Bytes::from).unwrap_or_default()
}

pub(crate) fn to_json_string<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Parse a body into a JSON object, reporting missing required keys by name.
pub(crate) fn parse_object(
    body: &[u8],
    required: &[&str],
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| GatewayError::decode_body(&e))?;
    let serde_json::Value::Object(map) = value else {
        return Err(GatewayError::decode("body", "expected a JSON object"));
    };
    for field in required {
        if !map.contains_key(*field) {
            return Err(GatewayError::missing(*field));
        }
    }
    Ok(map)
}

/// Canonical compact form of a tool input object, or `{}` when unparseable.
pub(crate) fn arguments_value(arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(arguments)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()))
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
