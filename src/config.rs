use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::guardrails::{default_product_rules, default_rule_sets, GuardrailRuleSet, ProductRule};

pub type Number = f32;

pub const EPSILON: f32 = 1e-6;

pub const DEFAULT_CHUNK_SIZE: usize = 700;
pub const DEFAULT_CHUNK_OVERLAP: usize = 150;
pub const DEFAULT_TOP_K: usize = 5;
/// Tuned for squared L2 over `text-embedding-3-small`; recalibrate when the
/// embedding model changes.
pub const DEFAULT_CONFIDENCE_THRESHOLD: Number = 1.2;
pub const DEFAULT_SNIPPET_CHARS: usize = 200;

#[derive(Deserialize, Default)]
pub struct BankragConfig {
    pub data_dir: Option<String>,
    pub index_dir: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub top_k: Option<usize>,
    pub confidence_threshold: Option<Number>,
    pub snippet_chars: Option<usize>,
    pub embedding_provider: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_dimensions: Option<usize>,
    pub hashing_dimensions: Option<usize>,
    pub openai_base_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub embedding_batch_size: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub max_retries: Option<usize>,
    pub chat_model: Option<String>,
    pub chat_temperature: Option<f32>,
    pub bind: Option<String>,
    pub guardrails: Option<Vec<GuardrailRuleSet>>,
    pub products: Option<Vec<ProductRule>>,
}

/// Reads `key`, treating an absent key as unset. A present but malformed
/// value is an error.
fn optional<T: DeserializeOwned>(config: &Config, key: &str) -> Result<Option<T>> {
    match config.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("invalid value for {}", key)),
    }
}

impl BankragConfig {
    pub fn try_from(config: &Config) -> Result<Self> {
        Ok(BankragConfig {
            data_dir: optional(config, "data_dir")?,
            index_dir: optional(config, "index_dir")?,
            chunk_size: optional(config, "chunk_size")?,
            chunk_overlap: optional(config, "chunk_overlap")?,
            top_k: optional(config, "top_k")?,
            confidence_threshold: optional(config, "confidence_threshold")?,
            snippet_chars: optional(config, "snippet_chars")?,
            embedding_provider: optional(config, "embedding_provider")?,
            embedding_model: optional(config, "embedding_model")?,
            embedding_dimensions: optional(config, "embedding_dimensions")?,
            hashing_dimensions: optional(config, "hashing_dimensions")?,
            openai_base_url: optional(config, "openai_base_url")?,
            openai_api_key: optional(config, "openai_api_key")?,
            embedding_batch_size: optional(config, "embedding_batch_size")?,
            request_timeout_secs: optional(config, "request_timeout_secs")?,
            max_retries: optional(config, "max_retries")?,
            chat_model: optional(config, "chat_model")?,
            chat_temperature: optional(config, "chat_temperature")?,
            bind: optional(config, "bind")?,
            guardrails: optional(config, "guardrails")?,
            products: optional(config, "products")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProviderKind {
    OpenAi,
    Hashing,
}

impl EmbeddingProviderKind {
    fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "hashing" => Ok(Self::Hashing),
            other => anyhow::bail!("unknown embedding_provider '{}'; use openai or hashing", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Hashing => "hashing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub index_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub confidence_threshold: Number,
    pub snippet_chars: usize,
    pub embedding_provider: EmbeddingProviderKind,
    pub embedding_model: String,
    pub embedding_dimensions: Option<usize>,
    pub hashing_dimensions: usize,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub embedding_batch_size: usize,
    pub request_timeout_secs: u64,
    pub max_retries: usize,
    pub chat_model: String,
    pub chat_temperature: Option<f32>,
    pub bind: String,
    pub guardrails: Vec<GuardrailRuleSet>,
    pub products: Vec<ProductRule>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            index_dir: PathBuf::from("index"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            top_k: DEFAULT_TOP_K,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            snippet_chars: DEFAULT_SNIPPET_CHARS,
            embedding_provider: EmbeddingProviderKind::OpenAi,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: None,
            hashing_dimensions: 512,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            embedding_batch_size: 64,
            request_timeout_secs: 60,
            max_retries: 3,
            chat_model: "gpt-4.1-mini".to_string(),
            chat_temperature: None,
            bind: "127.0.0.1:8000".to_string(),
            guardrails: default_rule_sets(),
            products: default_product_rules(),
        }
    }
}

impl Settings {
    /// Reads `bankrag_config.*` from the working directory, then `BANKRAG_*`
    /// environment variables.
    pub fn new() -> Result<Self> {
        let mut config = Config::default();
        #[allow(deprecated)]
        {
            config.merge(ConfigFile::with_name("bankrag_config").required(false))?;
            config.merge(Environment::with_prefix("BANKRAG"))?;
        }
        Self::from_config(&config)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let raw = BankragConfig::try_from(config).context("failed to read configuration")?;
        let defaults = Settings::default();

        let embedding_provider = match raw.embedding_provider {
            Some(value) => EmbeddingProviderKind::parse(&value)?,
            None => defaults.embedding_provider,
        };

        let openai_api_key = raw
            .openai_api_key
            .or_else(|| env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.trim().is_empty());

        let settings = Self {
            data_dir: raw.data_dir.map(PathBuf::from).unwrap_or(defaults.data_dir),
            index_dir: raw.index_dir.map(PathBuf::from).unwrap_or(defaults.index_dir),
            chunk_size: raw.chunk_size.unwrap_or(defaults.chunk_size),
            chunk_overlap: raw.chunk_overlap.unwrap_or(defaults.chunk_overlap),
            top_k: raw.top_k.unwrap_or(defaults.top_k),
            confidence_threshold: raw
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            snippet_chars: raw.snippet_chars.unwrap_or(defaults.snippet_chars),
            embedding_provider,
            embedding_model: raw.embedding_model.unwrap_or(defaults.embedding_model),
            embedding_dimensions: raw.embedding_dimensions,
            hashing_dimensions: raw.hashing_dimensions.unwrap_or(defaults.hashing_dimensions),
            openai_base_url: raw.openai_base_url.unwrap_or(defaults.openai_base_url),
            openai_api_key,
            embedding_batch_size: raw
                .embedding_batch_size
                .unwrap_or(defaults.embedding_batch_size),
            request_timeout_secs: raw
                .request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
            max_retries: raw.max_retries.unwrap_or(defaults.max_retries),
            chat_model: raw.chat_model.unwrap_or(defaults.chat_model),
            chat_temperature: raw.chat_temperature,
            bind: raw.bind.unwrap_or(defaults.bind),
            guardrails: raw.guardrails.unwrap_or(defaults.guardrails),
            products: raw.products.unwrap_or(defaults.products),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_overlap == 0 || self.chunk_overlap >= self.chunk_size {
            anyhow::bail!(
                "chunk_overlap ({}) must be greater than 0 and smaller than chunk_size ({}).",
                self.chunk_overlap,
                self.chunk_size
            );
        }
        if self.top_k == 0 {
            anyhow::bail!("top_k must be at least 1.");
        }
        if self.snippet_chars == 0 {
            anyhow::bail!("snippet_chars must be at least 1.");
        }
        if !self.confidence_threshold.is_finite() || self.confidence_threshold < 0.0 {
            anyhow::bail!(
                "confidence_threshold must be a finite, non-negative distance (got {}).",
                self.confidence_threshold
            );
        }
        if self.embedding_batch_size == 0 {
            anyhow::bail!("embedding_batch_size must be at least 1.");
        }
        if self.hashing_dimensions == 0 {
            anyhow::bail!("hashing_dimensions must be at least 1.");
        }
        Ok(())
    }

    /// Model name the index manifest must match.
    pub fn embedding_model_name(&self) -> String {
        match self.embedding_provider {
            EmbeddingProviderKind::OpenAi => self.embedding_model.clone(),
            EmbeddingProviderKind::Hashing => format!("hashing-{}", self.hashing_dimensions),
        }
    }

    pub fn print_config(&self) {
        println!("data_dir={}", self.data_dir.display());
        println!("index_dir={}", self.index_dir.display());
        println!("chunk_size={}", self.chunk_size);
        println!("chunk_overlap={}", self.chunk_overlap);
        println!("top_k={}", self.top_k);
        println!("confidence_threshold={}", self.confidence_threshold);
        println!("snippet_chars={}", self.snippet_chars);
        println!("embedding_provider={}", self.embedding_provider.as_str());
        println!("embedding_model={}", self.embedding_model_name());
        if let Some(dimensions) = self.embedding_dimensions {
            println!("embedding_dimensions={}", dimensions);
        }
        println!("openai_base_url={}", self.openai_base_url);
        println!(
            "openai_api_key={}",
            if self.openai_api_key.is_some() { "<set>" } else { "<unset>" }
        );
        println!("embedding_batch_size={}", self.embedding_batch_size);
        println!("request_timeout_secs={}", self.request_timeout_secs);
        println!("max_retries={}", self.max_retries);
        println!("chat_model={}", self.chat_model);
        if let Some(temperature) = self.chat_temperature {
            println!("chat_temperature={}", temperature);
        }
        println!("bind={}", self.bind);
        for rule in &self.guardrails {
            println!(
                "guardrail={} category={:?} phrases={}",
                rule.name,
                rule.category,
                rule.phrases.len()
            );
        }
        for product in &self.products {
            println!(
                "product={:?} keywords={}",
                product.category,
                product.keywords.len()
            );
        }
    }
}

pub fn verbose_enabled() -> bool {
    env::var("BANKRAG_VERBOSE").unwrap_or_else(|_| "false".to_string()) == "true"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrails::GuardrailCategory;

    #[test]
    fn defaults_match_the_reference_pipeline() {
        let settings = Settings::default();
        assert_eq!(settings.chunk_size, 700);
        assert_eq!(settings.chunk_overlap, 150);
        assert_eq!(settings.top_k, 5);
        assert_eq!(settings.confidence_threshold, 1.2);
        assert_eq!(settings.snippet_chars, 200);
        assert_eq!(settings.guardrails.len(), 3);
        settings.validate().unwrap();
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::builder()
            .set_override("top_k", 3)
            .unwrap()
            .set_override("embedding_provider", "hashing")
            .unwrap()
            .set_override("hashing_dimensions", 64)
            .unwrap()
            .build()
            .unwrap();
        let settings = Settings::from_config(&config).unwrap();
        assert_eq!(settings.top_k, 3);
        assert_eq!(settings.embedding_provider, EmbeddingProviderKind::Hashing);
        assert_eq!(settings.embedding_model_name(), "hashing-64");
    }

    #[test]
    fn invalid_overlap_is_rejected() {
        let config = Config::builder()
            .set_override("chunk_size", 100)
            .unwrap()
            .set_override("chunk_overlap", 100)
            .unwrap()
            .build()
            .unwrap();
        assert!(Settings::from_config(&config).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = Config::builder()
            .set_override("embedding_provider", "word2vec")
            .unwrap()
            .build()
            .unwrap();
        assert!(Settings::from_config(&config).is_err());
    }

    #[test]
    fn guardrails_can_be_configured() {
        let config = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [[guardrails]]
                name = "fraud"
                category = "unsafe"
                phrases = ["skimming"]
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let settings = Settings::from_config(&config).unwrap();
        assert_eq!(settings.guardrails.len(), 1);
        assert_eq!(settings.guardrails[0].category, GuardrailCategory::Unsafe);
        assert_eq!(settings.guardrails[0].phrases, vec!["skimming".to_string()]);
    }

    #[test]
    fn malformed_guardrails_are_rejected() {
        let config = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [[guardrails]]
                name = "fraud"
                category = "Unsafe"
                phrases = ["skimming"]
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let err = Settings::from_config(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("guardrails"));
    }

    #[test]
    fn malformed_scalar_is_rejected() {
        let config = Config::builder()
            .set_override("top_k", "five")
            .unwrap()
            .build()
            .unwrap();
        let err = Settings::from_config(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("top_k"));
    }
}
