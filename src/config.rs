use crate::error::{GatewayError, Result};
use crate::providers::ProviderPreset;
use crate::router::{Backend, RoutingMode};
use crate::translate::Dialect;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: RoutingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic: Option<BackendConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai: Option<BackendConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Requested model id -> model id sent upstream.
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Preset name from [`crate::providers`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Literal key. Prefer `api_key_env`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_anthropic_prefixes")]
    pub anthropic_prefixes: Vec<String>,
    #[serde(default = "default_openai_prefixes")]
    pub openai_prefixes: Vec<String>,
    #[serde(default = "default_generic_aliases")]
    pub generic_aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_model: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            anthropic_prefixes: default_anthropic_prefixes(),
            openai_prefixes: default_openai_prefixes(),
            generic_aliases: default_generic_aliases(),
            reasoning_model: None,
            completion_model: None,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            mode: RoutingMode::default(),
            anthropic: None,
            openai: None,
            routing: RoutingConfig::default(),
            models: HashMap::new(),
            request_timeout_secs: default_timeout(),
        }
    }
}

fn default_port() -> u16 {
    8082
}

fn default_timeout() -> u64 {
    300
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn default_anthropic_prefixes() -> Vec<String> {
    strings(&["claude", "anthropic/"])
}

fn default_openai_prefixes() -> Vec<String> {
    strings(&[
        "gpt", "chatgpt", "o1", "o3", "o4", "openai/", "text-", "davinci",
    ])
}

fn default_generic_aliases() -> Vec<String> {
    strings(&["default", "auto"])
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir. No file at all is
    /// fine: the gateway can be configured from the environment alone.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults and environment");
        Ok(Self::default())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("PORT") {
            self.port = port
                .parse()
                .map_err(|_| GatewayError::config(format!("PORT is not a port number: {port}")))?;
        }
        if let Some(mode) = lookup("ROUTING_MODE") {
            self.mode = mode.parse()?;
        }

        let anthropic_url = lookup("ANTHROPIC_BASE_URL");
        let anthropic_key = lookup("ANTHROPIC_API_KEY");
        if anthropic_url.is_some() || anthropic_key.is_some() {
            let section = self.anthropic.get_or_insert_with(BackendConfig::default);
            section.base_url = anthropic_url.or(section.base_url.take());
            section.api_key = anthropic_key.or(section.api_key.take());
        }

        let openai_url = lookup("OPENAI_BASE_URL").or_else(|| lookup("UPSTREAM_BASE_URL"));
        let openai_key = lookup("OPENAI_API_KEY").or_else(|| lookup("UPSTREAM_API_KEY"));
        if openai_url.is_some() || openai_key.is_some() {
            let section = self.openai.get_or_insert_with(BackendConfig::default);
            section.base_url = openai_url.or(section.base_url.take());
            section.api_key = openai_key.or(section.api_key.take());
        }

        if let Some(model) = lookup("REASONING_MODEL") {
            self.routing.reasoning_model = Some(model);
        }
        if let Some(model) = lookup("COMPLETION_MODEL") {
            self.routing.completion_model = Some(model);
        }
        Ok(())
    }

    fn section(&self, dialect: Dialect) -> Option<&BackendConfig> {
        match dialect {
            Dialect::Anthropic => self.anthropic.as_ref(),
            Dialect::OpenAi => self.openai.as_ref(),
        }
    }

    /// Resolve a backend section into a [`Backend`], reading its key from
    /// the environment.
    pub fn backend(&self, dialect: Dialect) -> Result<Option<Backend>> {
        self.backend_with(dialect, |name| {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        })
    }

    pub fn backend_with(
        &self,
        dialect: Dialect,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Backend>> {
        let Some(section) = self.section(dialect) else {
            return Ok(None);
        };

        let preset = match section.provider {
            Some(ref name) => ProviderPreset::from_name(name).ok_or_else(|| {
                GatewayError::config(format!(
                    "Unknown provider '{}' in [{}]. Known providers: {}",
                    name,
                    dialect,
                    ProviderPreset::names()
                ))
            })?,
            None => ProviderPreset::default_for(dialect),
        };
        if preset.dialect != dialect {
            return Err(GatewayError::config(format!(
                "Provider '{}' speaks the {} dialect and cannot be used in [{}]",
                preset.name, preset.dialect, dialect
            )));
        }

        let key_env = section
            .api_key_env
            .as_deref()
            .unwrap_or(preset.default_api_key_env);
        let api_key = section.api_key.clone().or_else(|| lookup(key_env));

        Ok(Some(Backend {
            dialect,
            base_url: section
                .base_url
                .clone()
                .unwrap_or_else(|| preset.base_url.to_string()),
            api_key,
        }))
    }

    /// Check that the routing mode has the backends it needs.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            RoutingMode::Transform if self.openai.is_none() => Err(GatewayError::config(
                "transform mode needs an [openai] backend (set OPENAI_BASE_URL or OPENAI_API_KEY)",
            )),
            RoutingMode::Passthrough | RoutingMode::Auto
                if self.anthropic.is_none() && self.openai.is_none() =>
            {
                Err(GatewayError::config(format!(
                    "{} mode needs at least one backend",
                    self.mode
                )))
            }
            _ => Ok(()),
        }
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("dialect-gateway.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("dialect-gateway").join("config.toml"));
    }
    if let Some(home) = home_dir() {
        paths.push(home.join(".config").join("dialect-gateway").join("config.toml"));
        paths.push(home.join(".dialect-gateway.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio_test::{assert_err, assert_ok};

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 5000
mode = "gateway"

[anthropic]
api_key_env = "MY_ANTHROPIC_KEY"

[openai]
provider = "openrouter"

[routing]
anthropic_prefixes = ["claude", "sonnet"]

[models]
"claude-3-haiku" = "gpt-4o-mini"
"#
        )
        .unwrap();

        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.mode, RoutingMode::Auto);
        assert_eq!(config.routing.anthropic_prefixes, vec!["claude", "sonnet"]);
        assert_eq!(config.routing.generic_aliases, vec!["default", "auto"]);
        assert_eq!(
            config.models.get("claude-3-haiku"),
            Some(&"gpt-4o-mini".to_string())
        );
        assert_eq!(config.request_timeout_secs, 300);

        let openai = config
            .backend_with(Dialect::OpenAi, env(&[("OPENROUTER_API_KEY", "or-key")]))
            .unwrap()
            .unwrap();
        assert_eq!(openai.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(openai.api_key.as_deref(), Some("or-key"));

        let anthropic = config
            .backend_with(Dialect::Anthropic, env(&[]))
            .unwrap()
            .unwrap();
        assert_eq!(anthropic.base_url, "https://api.anthropic.com");
        assert_eq!(anthropic.api_key, None);
    }

    #[test]
    fn test_preset_dialect_mismatch() {
        let config = GatewayConfig {
            anthropic: Some(BackendConfig {
                provider: Some("groq".into()),
                ..BackendConfig::default()
            }),
            ..GatewayConfig::default()
        };
        let err = config.backend_with(Dialect::Anthropic, env(&[])).unwrap_err();
        assert!(err.to_string().contains("cannot be used in [anthropic]"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        config
            .apply_overrides(env(&[
                ("PORT", "9000"),
                ("ROUTING_MODE", "passthrough"),
                ("UPSTREAM_BASE_URL", "http://localhost:8000/v1"),
                ("UPSTREAM_API_KEY", "local"),
                ("COMPLETION_MODEL", "gpt-4o-mini"),
            ]))
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.mode, RoutingMode::Passthrough);
        assert!(config.anthropic.is_none());
        let openai = config.openai.as_ref().unwrap();
        assert_eq!(openai.base_url.as_deref(), Some("http://localhost:8000/v1"));
        assert_eq!(openai.api_key.as_deref(), Some("local"));
        assert_eq!(
            config.routing.completion_model.as_deref(),
            Some("gpt-4o-mini")
        );
    }

    #[test]
    fn test_bad_mode_is_config_error() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_overrides(env(&[("ROUTING_MODE", "sideways")]))
            .unwrap_err();
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_validate() {
        let config = GatewayConfig::default();
        assert_err!(config.validate());

        let config = GatewayConfig {
            mode: RoutingMode::Passthrough,
            anthropic: Some(BackendConfig::default()),
            ..GatewayConfig::default()
        };
        assert_ok!(config.validate());

        let config = GatewayConfig {
            mode: RoutingMode::Transform,
            anthropic: Some(BackendConfig::default()),
            ..GatewayConfig::default()
        };
        assert_err!(config.validate());
    }
}
