//! Error types for the gateway.
//!
//! Every failure a request can hit is one [`GatewayError`]. Errors found before
//! the upstream call are answered synchronously in the client's dialect; errors
//! found mid-stream are turned into a terminal stream event carrying an
//! [`ErrorKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// Inbound JSON is malformed or misses a required field.
    #[error("Could not decode `{field}`: {message}")]
    Decode { field: String, message: String },

    /// JSON is well formed but violates a schema invariant.
    #[error("Malformed payload: {invariant}")]
    MalformedPayload { invariant: String },

    #[error("Route not supported: {message}")]
    UnsupportedRoute { message: String },

    #[error("No backend configured for model '{model}'")]
    NoRouteForModel { model: String },

    #[error("Upstream disconnected: {message}")]
    UpstreamDisconnected { message: String },

    /// Backend answered with a non-success status.
    #[error("Upstream returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Stream ended with content block {index} still open")]
    UnexpectedStreamTermination { index: usize },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Dialect-neutral classification of an error, as carried by a terminal
/// stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DecodeError,
    MalformedPayload,
    UnsupportedRoute,
    NoRouteForModel,
    UpstreamDisconnected,
    UpstreamError,
    UnexpectedStreamTermination,
    Internal,
}

impl GatewayError {
    pub fn decode(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Decode {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// A JSON body that failed to parse at all.
    pub fn decode_body(err: &serde_json::Error) -> Self {
        Self::decode("body", err.to_string())
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::decode(field, "missing required field")
    }

    pub fn malformed(invariant: impl Into<String>) -> Self {
        Self::MalformedPayload {
            invariant: invariant.into(),
        }
    }

    pub fn unsupported_route(msg: impl Into<String>) -> Self {
        Self::UnsupportedRoute {
            message: msg.into(),
        }
    }

    pub fn no_route(model: impl Into<String>) -> Self {
        Self::NoRouteForModel {
            model: model.into(),
        }
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::UpstreamDisconnected {
            message: msg.into(),
        }
    }

    pub fn upstream(status: u16, msg: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode { .. } => ErrorKind::DecodeError,
            Self::MalformedPayload { .. } => ErrorKind::MalformedPayload,
            Self::UnsupportedRoute { .. } => ErrorKind::UnsupportedRoute,
            Self::NoRouteForModel { .. } => ErrorKind::NoRouteForModel,
            Self::UpstreamDisconnected { .. } | Self::Http(_) => ErrorKind::UpstreamDisconnected,
            Self::Upstream { .. } => ErrorKind::UpstreamError,
            Self::UnexpectedStreamTermination { .. } => ErrorKind::UnexpectedStreamTermination,
            Self::Config { .. } | Self::Io(_) | Self::Json(_) | Self::Toml(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Message shown to clients. Upstream errors keep the backend's own text.
    pub fn client_message(&self) -> String {
        match self {
            Self::Upstream { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// HTTP status used when the error is answered synchronously.
    pub fn status(&self) -> u16 {
        match self {
            Self::Upstream { status, .. } => *status,
            other => other.kind().status(),
        }
    }
}

impl ErrorKind {
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::DecodeError | ErrorKind::MalformedPayload => 400,
            ErrorKind::UnsupportedRoute | ErrorKind::NoRouteForModel => 404,
            ErrorKind::UpstreamDisconnected
            | ErrorKind::UpstreamError
            | ErrorKind::UnexpectedStreamTermination => 502,
            ErrorKind::Internal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::MalformedPayload => "malformed_payload",
            ErrorKind::UnsupportedRoute => "unsupported_route",
            ErrorKind::NoRouteForModel => "no_route_for_model",
            ErrorKind::UpstreamDisconnected => "upstream_disconnected",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::UnexpectedStreamTermination => "unexpected_stream_termination",
            ErrorKind::Internal => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
