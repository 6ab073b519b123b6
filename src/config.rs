//! TOML configuration.
//!
//! Every tuning weight in the pipeline is named here with a documented
//! default so it can be overridden per deployment. Only `[db]` and
//! `[server]` are required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/vrag.sqlite"
//!
//! [vault]
//! root = "./vault"
//!
//! [retrieval]
//! semantic_weight = 0.7
//! keyword_weight = 0.3
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use vault_rag_core::chunk::ChunkerConfig;
use vault_rag_core::rerank::{default_intents, IntentRule, IntentTable, RerankParams};
use vault_rag_core::retrieve::RetrievalParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    #[serde(default = "default_vault_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: default_vault_root(),
            include_globs: default_include_globs(),
            exclude_globs: default_exclude_globs(),
            follow_symlinks: false,
        }
    }
}

fn default_vault_root() -> PathBuf {
    PathBuf::from("./vault")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}
fn default_exclude_globs() -> Vec<String> {
    vec![
        "**/.obsidian/**".to_string(),
        "**/templates/**".to_string(),
        "**/Archive/**".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
            min_tokens: default_min_tokens(),
        }
    }
}

impl ChunkingConfig {
    pub fn chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens,
            min_tokens: self.min_tokens,
        }
    }
}

fn default_max_tokens() -> usize {
    800
}
fn default_overlap() -> usize {
    150
}
fn default_min_tokens() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Chunks kept after re-ranking.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_multiplier")]
    pub semantic_candidate_multiplier: f64,
    #[serde(default = "default_multiplier")]
    pub keyword_candidate_multiplier: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            semantic_candidate_multiplier: default_multiplier(),
            keyword_candidate_multiplier: default_multiplier(),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            semantic_weight: self.semantic_weight,
            keyword_weight: self.keyword_weight,
            semantic_candidate_multiplier: self.semantic_candidate_multiplier,
            keyword_candidate_multiplier: self.keyword_candidate_multiplier,
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_semantic_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_category_bonus")]
    pub category_bonus: f64,
    #[serde(default = "default_per_link_weight")]
    pub per_link_weight: f64,
    #[serde(default = "default_link_bonus_cap")]
    pub link_bonus_cap: f64,
    /// Replaces the built-in keyword → category table when set.
    #[serde(default)]
    pub intents: Option<Vec<IntentRule>>,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            category_bonus: default_category_bonus(),
            per_link_weight: default_per_link_weight(),
            link_bonus_cap: default_link_bonus_cap(),
            intents: None,
        }
    }
}

impl RerankConfig {
    pub fn params(&self) -> RerankParams {
        RerankParams {
            category_bonus: self.category_bonus,
            per_link_weight: self.per_link_weight,
            link_bonus_cap: self.link_bonus_cap,
        }
    }

    pub fn intent_table(&self) -> IntentTable {
        match &self.intents {
            Some(rules) => IntentTable::new(rules),
            None => IntentTable::new(&default_intents()),
        }
    }
}

fn default_category_bonus() -> f64 {
    0.1
}
fn default_per_link_weight() -> f64 {
    0.01
}
fn default_link_bonus_cap() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Most recent conversation messages included in the prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Overrides the built-in system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            history_turns: default_history_turns(),
            system_prompt: None,
        }
    }
}

fn default_token_budget() -> usize {
    2000
}
fn default_history_turns() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Overrides the provider's default endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_max_tokens")]
    pub max_tokens: u32,
    /// Models a chat request may pick besides `model`. Empty accepts any.
    #[serde(default)]
    pub models: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_generation_max_tokens(),
            models: Vec::new(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.models.is_empty()
            || self.model.as_deref() == Some(model)
            || self.models.iter().any(|m| m == model)
    }

    /// This config with a request's provider and model applied. Switching
    /// provider drops `base_url`, which belongs to the configured one.
    pub fn with_override(&self, provider: Option<&str>, model: Option<&str>) -> Self {
        let mut out = self.clone();
        if let Some(provider) = provider {
            if provider != self.provider {
                out.provider = provider.to_string();
                out.base_url = None;
            }
        }
        if let Some(model) = model {
            out.model = Some(model.to_string());
        }
        out
    }
}

fn default_temperature() -> f32 {
    0.7
}
fn default_generation_max_tokens() -> u32 {
    1000
}

/// Per-stage deadlines for one chat request.
#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    #[serde(default = "default_stage_timeout_ms")]
    pub embed_timeout_ms: u64,
    #[serde(default = "default_stage_timeout_ms")]
    pub retrieve_timeout_ms: u64,
    #[serde(default = "default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            embed_timeout_ms: default_stage_timeout_ms(),
            retrieve_timeout_ms: default_stage_timeout_ms(),
            generate_timeout_secs: default_generate_timeout_secs(),
        }
    }
}

fn default_stage_timeout_ms() -> u64 {
    10_000
}
fn default_generate_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    config.chunking.chunker().validate()?;
    config.retrieval.params().validate()?;
    config.rerank.params().validate()?;

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.context.token_budget == 0 {
        bail!("context.token_budget must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.model.is_none() {
        bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    let o = &config.orchestrator;
    if o.embed_timeout_ms == 0 || o.retrieve_timeout_ms == 0 || o.generate_timeout_secs == 0 {
        bail!("orchestrator timeouts must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/vrag.sqlite"

[server]
bind = "127.0.0.1:7341"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.chunking.max_tokens, 800);
        assert_eq!(config.chunking.overlap_tokens, 150);
        assert_eq!(config.retrieval.top_k, 10);
        assert_eq!(config.retrieval.semantic_weight, 0.7);
        assert_eq!(config.context.token_budget, 2000);
        assert!(!config.embedding.is_enabled());
        assert!(!config.generation.is_enabled());
        assert_eq!(config.vault.exclude_globs.len(), 3);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let text = format!("{MINIMAL}\n[retrieval]\nsemantic_weight = 0.5\nkeyword_weight = 0.3\n");
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("must equal 1.0"));
    }

    #[test]
    fn test_chunking_bounds_validated() {
        let text = format!("{MINIMAL}\n[chunking]\nmax_tokens = 100\nmin_tokens = 60\noverlap_tokens = 10\n");
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let text = format!("{MINIMAL}\n[embedding]\nprovider = \"ollama\"\n");
        assert!(parse_config(&text).is_err());
        let text = format!(
            "{MINIMAL}\n[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768\n"
        );
        assert!(parse_config(&text).is_ok());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let text = format!("{MINIMAL}\n[generation]\nprovider = \"mystery\"\nmodel = \"m\"\n");
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("Unknown generation provider"));
    }

    #[test]
    fn test_custom_intents_replace_defaults() {
        let text = format!(
            "{MINIMAL}\n[[rerank.intents]]\ncategory = \"Cooking\"\nkeywords = [\"recipe\"]\n"
        );
        let config = parse_config(&text).unwrap();
        let table = config.rerank.intent_table();
        assert_eq!(table.infer("a bread recipe"), vec!["cooking"]);
        assert!(table.infer("mindfulness").is_empty());
    }

    #[test]
    fn test_generation_override_and_model_list() {
        let text = format!(
            "{MINIMAL}\n[generation]\nprovider = \"ollama\"\nmodel = \"llama3.1\"\nbase_url = \"http://gpu:11434\"\nmodels = [\"mistral\"]\n"
        );
        let generation = parse_config(&text).unwrap().generation;
        assert!(generation.allows_model("llama3.1"));
        assert!(generation.allows_model("mistral"));
        assert!(!generation.allows_model("gpt-4o"));

        let same = generation.with_override(None, Some("mistral"));
        assert_eq!(same.model.as_deref(), Some("mistral"));
        assert_eq!(same.base_url.as_deref(), Some("http://gpu:11434"));

        let switched = generation.with_override(Some("openai"), Some("gpt-4o-mini"));
        assert_eq!(switched.provider, "openai");
        assert_eq!(switched.base_url, None);
    }
}
