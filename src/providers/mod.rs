// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Completion service implementations.
//!
//! - [`openai::OpenAIProvider`] - OpenAI, Ollama, and OpenAI-compatible APIs
//! - [`scripted::ScriptedProvider`] - deterministic canned turns for tests and dry runs
//!
//! ```rust,ignore
//! use sandforge::providers::create_provider_from_config;
//!
//! let provider = create_provider_from_config(&config)?;
//! ```

pub mod openai;
pub mod scripted;

pub use openai::OpenAIProvider;
pub use scripted::{ScriptedProvider, ScriptedTurn};

use std::sync::Arc;

use crate::config::ResolvedConfig;
use crate::error::ProviderError;
use crate::types::SharedProvider;

/// Supported provider types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    /// OpenAI GPT models
    OpenAI,
    /// Ollama local models
    Ollama,
    /// Any OpenAI-compatible API
    OpenAICompatible,
}

impl ProviderType {
    /// Get the default model for this provider.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAI | Self::OpenAICompatible => "gpt-4o",
            Self::Ollama => "qwen2.5-coder",
        }
    }

    /// Get the default base URL for this provider.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some(openai::OPENAI_BASE_URL),
            Self::Ollama => Some(openai::OLLAMA_BASE_URL),
            Self::OpenAICompatible => None,
        }
    }

    /// Environment variable consulted for the API key when the config names none.
    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::Ollama => None,
            Self::OpenAICompatible => Some("OPENAI_API_KEY"),
        }
    }

    /// Check if this provider requires an API key.
    pub fn requires_api_key(&self) -> bool {
        matches!(self, Self::OpenAI)
    }
}

impl std::str::FromStr for ProviderType {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "gpt" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            "openai-compatible" | "openai_compatible" | "compatible" => Ok(Self::OpenAICompatible),
            other => Err(ProviderError::NotConfigured(format!(
                "unknown provider: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAI => write!(f, "OpenAI"),
            Self::Ollama => write!(f, "Ollama"),
            Self::OpenAICompatible => write!(f, "OpenAI-Compatible"),
        }
    }
}

/// Create a provider instance from explicit settings.
///
/// # Errors
///
/// Returns [`ProviderError::NotConfigured`] when a required API key or base URL is missing.
pub fn create_provider(
    provider_type: ProviderType,
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
) -> Result<SharedProvider, ProviderError> {
    if provider_type.requires_api_key() && api_key.is_none() {
        return Err(ProviderError::NotConfigured(format!(
            "API key required for {}",
            provider_type
        )));
    }

    let model = model.unwrap_or_else(|| provider_type.default_model().to_string());
    let base_url = base_url
        .or_else(|| provider_type.default_base_url().map(String::from))
        .ok_or_else(|| {
            ProviderError::NotConfigured(format!("base_url required for {}", provider_type))
        })?;

    Ok(Arc::new(OpenAIProvider::new(api_key, model, base_url, None)))
}

/// Create the completion service named by a resolved configuration.
///
/// The API key is read from the environment variable named by `apiKeyEnv`,
/// falling back to the provider's conventional variable.
pub fn create_provider_from_config(config: &ResolvedConfig) -> Result<SharedProvider, ProviderError> {
    let provider_type: ProviderType = config.provider.parse()?;

    let key_env = config
        .api_key_env
        .as_deref()
        .or_else(|| provider_type.default_api_key_env());
    let api_key = key_env.and_then(|name| std::env::var(name).ok()).filter(|k| !k.is_empty());

    if provider_type.requires_api_key() && api_key.is_none() {
        return Err(ProviderError::NotConfigured(format!(
            "{} not set. Export it or use provider \"ollama\" for local models.",
            key_env.unwrap_or("API key")
        )));
    }

    create_provider(
        provider_type,
        api_key,
        config.model.clone(),
        config.base_url.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_parsing() {
        assert_eq!("openai".parse::<ProviderType>().unwrap(), ProviderType::OpenAI);
        assert_eq!("Ollama".parse::<ProviderType>().unwrap(), ProviderType::Ollama);
        assert_eq!(
            "openai-compatible".parse::<ProviderType>().unwrap(),
            ProviderType::OpenAICompatible
        );
        assert!("anthropic".parse::<ProviderType>().is_err());
    }

    #[test]
    fn test_create_provider_requires_key() {
        let result = create_provider(ProviderType::OpenAI, None, None, None);
        assert!(matches!(result, Err(ProviderError::NotConfigured(_))));
    }

    #[test]
    fn test_create_ollama_provider() {
        let provider = create_provider(ProviderType::Ollama, None, None, None).unwrap();
        assert_eq!(provider.name(), "Ollama");
        assert_eq!(provider.model(), "qwen2.5-coder");
    }

    #[test]
    fn test_compatible_requires_base_url() {
        let result = create_provider(ProviderType::OpenAICompatible, None, None, None);
        assert!(result.is_err());

        let provider = create_provider(
            ProviderType::OpenAICompatible,
            None,
            Some("local-model".to_string()),
            Some("http://127.0.0.1:8000/v1".to_string()),
        )
        .unwrap();
        assert_eq!(provider.model(), "local-model");
    }

    #[test]
    fn test_create_from_config_ollama() {
        let config = ResolvedConfig {
            provider: "ollama".to_string(),
            model: Some("llama3.2".to_string()),
            ..Default::default()
        };
        let provider = create_provider_from_config(&config).unwrap();
        assert_eq!(provider.model(), "llama3.2");
    }
}
