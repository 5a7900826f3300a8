//! Backend presets.
//!
//! A backend section in the config may name a preset instead of spelling out
//! its base URL and key variable. Each preset also fixes the dialect the
//! backend speaks, so `[anthropic] provider = "openrouter"` is rejected.

use crate::translate::Dialect;

#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub dialect: Dialect,
    pub default_api_key_env: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "anthropic",
        base_url: "https://api.anthropic.com",
        dialect: Dialect::Anthropic,
        default_api_key_env: "ANTHROPIC_API_KEY",
    },
    ProviderPreset {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "OPENAI_API_KEY",
    },
    ProviderPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "OPENROUTER_API_KEY",
    },
    ProviderPreset {
        name: "deepseek",
        base_url: "https://api.deepseek.com/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "DEEPSEEK_API_KEY",
    },
    ProviderPreset {
        name: "groq",
        base_url: "https://api.groq.com/openai/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "GROQ_API_KEY",
    },
    ProviderPreset {
        name: "together",
        base_url: "https://api.together.xyz/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "TOGETHER_API_KEY",
    },
    ProviderPreset {
        name: "ollama",
        base_url: "http://localhost:11434/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "OLLAMA_API_KEY",
    },
];

impl ProviderPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ProviderPreset> {
        let name = name.to_lowercase();
        PRESETS.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn all() -> &'static [ProviderPreset] {
        PRESETS
    }

    /// The preset used when a backend section names no provider.
    #[must_use]
    pub fn default_for(dialect: Dialect) -> &'static ProviderPreset {
        match dialect {
            Dialect::Anthropic => &PRESETS[0],
            Dialect::OpenAi => &PRESETS[1],
        }
    }

    pub fn names() -> String {
        PRESETS.iter().map(|p| p.name).collect::<Vec<_>>().join(", ")
    }
}
