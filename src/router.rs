//! Per-request routing.
//!
//! The [`RouteTable`] is built once from the configuration at startup and is
//! read-only afterwards; every request task shares it through the app state.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::translate::Dialect;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Anthropic clients, `OpenAI`-compatible backend.
    #[default]
    Transform,
    /// Each dialect goes to a backend of the same dialect, untouched.
    #[serde(alias = "anthropic")]
    Passthrough,
    /// The model id picks the backend; translate only when dialects differ.
    #[serde(alias = "gateway")]
    Auto,
}

impl RoutingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingMode::Transform => "transform",
            RoutingMode::Passthrough => "passthrough",
            RoutingMode::Auto => "auto",
        }
    }
}

impl FromStr for RoutingMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transform" => Ok(RoutingMode::Transform),
            "passthrough" | "anthropic" => Ok(RoutingMode::Passthrough),
            "auto" | "gateway" => Ok(RoutingMode::Auto),
            other => Err(GatewayError::config(format!(
                "unknown routing mode '{other}' (expected transform, passthrough, auto or gateway)"
            ))),
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub dialect: Dialect,
    pub base_url: String,
    /// `None` forwards the client's own credential.
    pub api_key: Option<String>,
}

impl Backend {
    pub fn endpoint(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.dialect.upstream_path()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub backend: Dialect,
    pub needs_transform: bool,
    /// Model id to send upstream.
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    mode: RoutingMode,
    anthropic: Option<Backend>,
    openai: Option<Backend>,
    anthropic_prefixes: Vec<String>,
    openai_prefixes: Vec<String>,
    generic_aliases: Vec<String>,
    reasoning_model: Option<String>,
    completion_model: Option<String>,
    models: HashMap<String, String>,
}

fn lowercase_all(items: &[String]) -> Vec<String> {
    items.iter().map(|s| s.to_ascii_lowercase()).collect()
}

impl RouteTable {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Ok(Self {
            mode: config.mode,
            anthropic: config.backend(Dialect::Anthropic)?,
            openai: config.backend(Dialect::OpenAi)?,
            anthropic_prefixes: lowercase_all(&config.routing.anthropic_prefixes),
            openai_prefixes: lowercase_all(&config.routing.openai_prefixes),
            generic_aliases: lowercase_all(&config.routing.generic_aliases),
            reasoning_model: config.routing.reasoning_model.clone(),
            completion_model: config.routing.completion_model.clone(),
            models: config.models.clone(),
        })
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn backend(&self, dialect: Dialect) -> Option<&Backend> {
        match dialect {
            Dialect::Anthropic => self.anthropic.as_ref(),
            Dialect::OpenAi => self.openai.as_ref(),
        }
    }

    /// Which backend dialect a model id belongs to, by prefix.
    pub fn classify(&self, model: &str) -> Option<Dialect> {
        let model = model.to_ascii_lowercase();
        if self.anthropic_prefixes.iter().any(|p| model.starts_with(p)) {
            Some(Dialect::Anthropic)
        } else if self.openai_prefixes.iter().any(|p| model.starts_with(p)) {
            Some(Dialect::OpenAi)
        } else {
            None
        }
    }

    /// Apply the reasoning/completion overrides and the `[models]` map.
    ///
    /// Overrides only replace an empty model or a generic alias; an explicit
    /// model id always wins.
    pub fn resolve_model(&self, model: &str, wants_reasoning: bool) -> String {
        let mut model = model.trim().to_string();
        let generic = model.is_empty()
            || self
                .generic_aliases
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&model));
        if generic {
            let over = if wants_reasoning {
                self.reasoning_model.as_ref().or(self.completion_model.as_ref())
            } else {
                self.completion_model.as_ref()
            };
            if let Some(over) = over {
                model = over.clone();
            }
        }
        match self.models.get(&model) {
            Some(mapped) => mapped.clone(),
            None => model,
        }
    }

    pub fn decide(
        &self,
        inbound: Dialect,
        model: &str,
        wants_reasoning: bool,
    ) -> Result<RouteDecision> {
        match self.mode {
            RoutingMode::Transform => {
                if inbound != Dialect::Anthropic {
                    return Err(GatewayError::unsupported_route(format!(
                        "{} is not served in transform mode; use {}",
                        inbound.inbound_path(),
                        Dialect::Anthropic.inbound_path()
                    )));
                }
                if self.openai.is_none() {
                    return Err(GatewayError::unsupported_route(
                        "transform mode has no OpenAI-compatible backend configured",
                    ));
                }
                Ok(RouteDecision {
                    backend: Dialect::OpenAi,
                    needs_transform: true,
                    model: self.resolve_model(model, wants_reasoning),
                })
            }
            RoutingMode::Passthrough => {
                if self.backend(inbound).is_none() {
                    return Err(GatewayError::unsupported_route(format!(
                        "passthrough mode has no {inbound} backend for {}",
                        inbound.inbound_path()
                    )));
                }
                Ok(RouteDecision {
                    backend: inbound,
                    needs_transform: false,
                    model: model.to_string(),
                })
            }
            RoutingMode::Auto => {
                let resolved = self.resolve_model(model, wants_reasoning);
                let target = self
                    .classify(&resolved)
                    .filter(|d| self.backend(*d).is_some())
                    .ok_or_else(|| GatewayError::no_route(resolved.clone()))?;
                Ok(RouteDecision {
                    backend: target,
                    needs_transform: target != inbound,
                    model: strip_namespace(&resolved, target),
                })
            }
        }
    }
}

/// `anthropic/claude-x` is sent to Anthropic as `claude-x`.
fn strip_namespace(model: &str, dialect: Dialect) -> String {
    let prefix = format!("{}/", dialect.as_str());
    match model.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(&prefix) => model[prefix.len()..].to_string(),
        _ => model.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn table(mode: RoutingMode, anthropic: bool, openai: bool) -> RouteTable {
        let mut config = GatewayConfig {
            mode,
            ..GatewayConfig::default()
        };
        let backend = |url: &str| BackendConfig {
            base_url: Some(url.to_string()),
            api_key: Some("k".to_string()),
            ..BackendConfig::default()
        };
        if anthropic {
            config.anthropic = Some(backend("http://anthropic.test"));
        }
        if openai {
            config.openai = Some(backend("http://openai.test/v1"));
        }
        config.routing.completion_model = Some("gpt-4o-mini".into());
        config.routing.reasoning_model = Some("o3-mini-high".into());
        config
            .models
            .insert("claude-3-haiku".into(), "gpt-4o-mini".into());
        RouteTable::from_config(&config).unwrap()
    }

    #[test]
    fn test_mode_parsing_and_aliases() {
        assert_eq!("gateway".parse::<RoutingMode>().unwrap(), RoutingMode::Auto);
        assert_eq!(
            "Anthropic".parse::<RoutingMode>().unwrap(),
            RoutingMode::Passthrough
        );
        assert!("sideways".parse::<RoutingMode>().is_err());
    }

    #[test]
    fn test_transform_rejects_openai_inbound() {
        let routes = table(RoutingMode::Transform, false, true);
        let err = routes.decide(Dialect::OpenAi, "gpt-4o", false).unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedRoute { .. }));

        let decision = routes
            .decide(Dialect::Anthropic, "claude-3-5-sonnet", false)
            .unwrap();
        assert_eq!(decision.backend, Dialect::OpenAi);
        assert!(decision.needs_transform);
        assert_eq!(decision.model, "claude-3-5-sonnet");
    }

    #[test]
    fn test_passthrough_requires_matching_backend() {
        let routes = table(RoutingMode::Passthrough, false, true);
        let err = routes
            .decide(Dialect::Anthropic, "claude-3-5-sonnet", false)
            .unwrap_err();
        assert_eq!(err.status(), 404);
        let ok = routes.decide(Dialect::OpenAi, "default", false).unwrap();
        assert!(!ok.needs_transform);
        assert_eq!(ok.model, "default");
    }

    #[test]
    fn test_auto_routes_by_prefix() {
        let routes = table(RoutingMode::Auto, true, true);
        let a = routes
            .decide(Dialect::OpenAi, "claude-3-5-sonnet", false)
            .unwrap();
        assert_eq!((a.backend, a.needs_transform), (Dialect::Anthropic, true));

        let b = routes.decide(Dialect::Anthropic, "gpt-4", false).unwrap();
        assert_eq!((b.backend, b.needs_transform), (Dialect::OpenAi, true));

        let c = routes.decide(Dialect::OpenAi, "GPT-4o", false).unwrap();
        assert!(!c.needs_transform);
    }

    #[test]
    fn test_auto_unknown_model_has_no_route() {
        let routes = table(RoutingMode::Auto, true, true);
        let err = routes.decide(Dialect::OpenAi, "llama-3-70b", false).unwrap_err();
        assert!(matches!(err, GatewayError::NoRouteForModel { ref model } if model == "llama-3-70b"));

        let only_openai = table(RoutingMode::Auto, false, true);
        assert!(only_openai
            .decide(Dialect::OpenAi, "claude-3-opus", false)
            .is_err());
    }

    #[test]
    fn test_overrides_only_replace_generic_models() {
        let routes = table(RoutingMode::Auto, true, true);
        assert_eq!(routes.resolve_model("", false), "gpt-4o-mini");
        assert_eq!(routes.resolve_model("default", true), "o3-mini-high");
        assert_eq!(routes.resolve_model("claude-3-opus", true), "claude-3-opus");
        assert_eq!(routes.resolve_model("claude-3-haiku", false), "gpt-4o-mini");
    }

    #[test]
    fn test_namespace_prefix_is_stripped() {
        let routes = table(RoutingMode::Auto, true, true);
        let d = routes
            .decide(Dialect::Anthropic, "anthropic/claude-3-opus", false)
            .unwrap();
        assert_eq!(d.model, "claude-3-opus");
        assert!(!d.needs_transform);
    }

    #[test]
    fn test_backend_endpoint() {
        let backend = Backend {
            dialect: Dialect::OpenAi,
            base_url: "https://api.openai.com/v1/".into(),
            api_key: None,
        };
        assert_eq!(backend.endpoint(), "https://api.openai.com/v1/chat/completions");
    }
}
