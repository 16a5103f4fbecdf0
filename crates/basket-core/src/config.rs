//! Typed configuration and path helpers.
//!
//! Uses Figment to merge defaults + `config.toml` + `config.<env>.toml` +
//! `APP_*` env vars (nested keys separated by `__`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{AnswerStyle, BackendKind};

/// Every option the retrieval and answer pipeline recognizes.
///
/// Built once at startup and handed to each component by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub vector_backend_type: BackendKind,
    pub embedding_dimension: usize,
    pub top_k_documents: usize,
    pub min_similarity: f32,
    pub answer_style: AnswerStyle,
    pub include_citations: bool,
    /// Use the hybrid retriever instead of semantic search alone.
    pub hybrid_search: bool,
    pub semantic_weight: f32,
    pub vector_weight: f32,
    pub cache_ttl_seconds: u64,
    pub max_context_tokens: usize,
    pub max_cache_entries: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
    pub memory: MemoryConfig,
    pub relational: Option<RelationalConfig>,
    pub local_index: Option<LocalIndexConfig>,
    pub managed: Option<ManagedConfig>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            vector_backend_type: BackendKind::Memory,
            embedding_dimension: 384,
            top_k_documents: 5,
            min_similarity: 0.3,
            answer_style: AnswerStyle::Concise,
            include_citations: true,
            hybrid_search: false,
            semantic_weight: 0.7,
            vector_weight: 0.3,
            cache_ttl_seconds: 3600,
            max_context_tokens: 3000,
            max_cache_entries: 1000,
            max_tokens: 1000,
            temperature: 0.3,
            system_prompt: None,
            memory: MemoryConfig::default(),
            relational: None,
            local_index: None,
            managed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Above this many documents a search uses the flat matrix path.
    pub matrix_threshold: usize,
    /// Delete/update rebuilds above this size are logged as warnings.
    pub rebuild_warn_threshold: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { matrix_threshold: 64, rebuild_warn_threshold: 10_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalConfig {
    pub url: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_table() -> String {
    "basket_embeddings".to_string()
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalIndexKind {
    #[default]
    Flat,
    Ivf,
    Graph,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalIndexConfig {
    /// Directory holding `index.bin` and `index.meta.json`. In-process only when unset.
    pub path: Option<String>,
    pub kind: LocalIndexKind,
    pub metric: Metric,
    /// IVF: number of inverted lists and how many to scan per query.
    pub nlist: usize,
    pub nprobe: usize,
    /// Graph: neighbours kept per node and the search beam width.
    pub graph_degree: usize,
    pub ef_search: usize,
}

impl Default for LocalIndexConfig {
    fn default() -> Self {
        Self {
            path: None,
            kind: LocalIndexKind::Flat,
            metric: Metric::Cosine,
            nlist: 16,
            nprobe: 4,
            graph_degree: 16,
            ef_search: 64,
        }
    }
}

impl LocalIndexConfig {
    pub fn resolved_path(&self, base: &Path) -> Option<PathBuf> {
        self.path.as_deref().map(|p| resolve_with_base(base, p))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_timeout_secs() -> u64 {
    30
}

impl RagConfig {
    /// Load from the working directory using `RUST_ENV` (default `dev`).
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        Self::load_from(Path::new("."), &env_name)
    }

    /// Merge defaults, `config.toml`, `config.<env>.toml` and `APP_*` env vars.
    pub fn load_from(dir: &Path, env_name: &str) -> anyhow::Result<Self> {
        let config: Self = Self::figment(dir, env_name)
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration from {}: {}", dir.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(dir: &Path, env_name: &str) -> Figment {
        let mut figment =
            Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(dir.join("config.toml")));
        match env_name {
            "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
            _ => {}
        }
        figment.merge(Env::prefixed("APP_").split("__"))
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::InvalidConfig(msg));
        if self.embedding_dimension == 0 {
            return fail("embedding_dimension must be positive".into());
        }
        if self.top_k_documents == 0 || self.top_k_documents > crate::similarity::MAX_TOP_K {
            return fail(format!("top_k_documents must be in 1..={}", crate::similarity::MAX_TOP_K));
        }
        if !(-1.0..=1.0).contains(&self.min_similarity) {
            return fail(format!("min_similarity {} outside [-1, 1]", self.min_similarity));
        }
        if self.semantic_weight < 0.0 || self.vector_weight < 0.0 {
            return fail("fusion weights must be non-negative".into());
        }
        if self.cache_ttl_seconds == 0 || self.max_cache_entries == 0 {
            return fail("cache_ttl_seconds and max_cache_entries must be positive".into());
        }
        if self.max_context_tokens == 0 {
            return fail("max_context_tokens must be positive".into());
        }
        match self.vector_backend_type {
            BackendKind::Relational if self.relational.is_none() => {
                fail("backend 'relational' needs a [relational] section".into())
            }
            BackendKind::ManagedCloud if self.managed.is_none() => {
                fail("backend 'managed-cloud' needs a [managed] section".into())
            }
            _ => Ok(()),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
