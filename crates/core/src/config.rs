use crate::error::ConfigError;
use crate::models::IngestionOptions;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_CONFIG_FILE: &str = "config.env";

/// `Local` runs an ONNX sentence-embedding model in process; `Hash` is the
/// offline character-trigram embedder and carries no semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    Local,
    Hash,
    OpenAi,
    Ollama,
}

impl FromStr for EmbeddingProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "onnx" => Ok(Self::Local),
            "hash" => Ok(Self::Hash),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            _ => Err(invalid("EMBEDDING_PROVIDER", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

impl FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            _ => Err(invalid("LLM_PROVIDER", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Qdrant,
    Local,
}

impl FromStr for StoreKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "qdrant" => Ok(Self::Qdrant),
            "local" => Ok(Self::Local),
            _ => Err(invalid("VECTOR_STORE", value)),
        }
    }
}

/// Immutable runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub qdrant_host: String,
    pub qdrant_port: u16,
    pub collection_name: String,
    pub document_path: PathBuf,
    pub index_storage_path: PathBuf,
    pub qdrant_data_path: PathBuf,
    pub embedding_model: String,
    pub embedding_provider: EmbeddingProvider,
    pub embedding_dimension: usize,
    /// Directory holding `model.onnx` and `tokenizer.json` for the local provider.
    pub embedding_model_path: PathBuf,
    pub embedding_max_tokens: usize,
    /// Hugging Face compatible host the local model is downloaded from.
    pub model_download_url: String,
    pub llm_provider: LlmProvider,
    pub ollama_url: String,
    pub ollama_model: String,
    pub vector_store: StoreKind,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub required_keywords: Vec<String>,
    pub excluded_keywords: Vec<String>,
    pub archive_text_field: Option<String>,
    pub debug: bool,
    pub log_level: String,
    pub log_file: PathBuf,
    pub server_host: String,
    pub server_port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the environment without checking required keys, so `setup` can
    /// report what is missing.
    pub fn from_env_unchecked() -> Result<Self, ConfigError> {
        Self::parse(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Self::parse(lookup)?;
        settings.validate()?;
        Ok(settings)
    }

    fn parse<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let settings = Self {
            openai_api_key: get("OPENAI_API_KEY"),
            openai_model: text("OPENAI_MODEL", "gpt-4-turbo-preview"),
            openai_base_url: text("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            qdrant_host: text("QDRANT_HOST", "localhost"),
            qdrant_port: parse_or(get("QDRANT_PORT"), "QDRANT_PORT", 6333)?,
            collection_name: text("QDRANT_COLLECTION_NAME", "esg_documents"),
            document_path: PathBuf::from(text("DOCUMENT_PATH", "./data/pdf_esg")),
            index_storage_path: PathBuf::from(text("INDEX_STORAGE_PATH", "./storage")),
            qdrant_data_path: PathBuf::from(text("QDRANT_DATA_PATH", "./qdrant_data")),
            embedding_model: text("EMBEDDING_MODEL", "BAAI/bge-small-en-v1.5"),
            embedding_provider: get("EMBEDDING_PROVIDER")
                .map_or(Ok(EmbeddingProvider::Local), |value| value.parse())?,
            embedding_dimension: parse_or(get("EMBEDDING_DIMENSION"), "EMBEDDING_DIMENSION", 384)?,
            embedding_model_path: get("EMBEDDING_MODEL_PATH").map_or_else(
                || model_directory(&text("EMBEDDING_MODEL", "BAAI/bge-small-en-v1.5")),
                PathBuf::from,
            ),
            embedding_max_tokens: parse_or(get("EMBEDDING_MAX_TOKENS"), "EMBEDDING_MAX_TOKENS", 512)?,
            model_download_url: text("HF_ENDPOINT", "https://huggingface.co"),
            llm_provider: get("LLM_PROVIDER").map_or(Ok(LlmProvider::OpenAi), |value| value.parse())?,
            ollama_url: text("OLLAMA_URL", "http://localhost:11434"),
            ollama_model: text("OLLAMA_MODEL", "mistral"),
            vector_store: get("VECTOR_STORE").map_or(Ok(StoreKind::Qdrant), |value| value.parse())?,
            chunk_size: parse_or(get("CHUNK_SIZE"), "CHUNK_SIZE", 512)?,
            chunk_overlap: parse_or(get("CHUNK_OVERLAP"), "CHUNK_OVERLAP", 50)?,
            top_k: parse_or(get("TOP_K_RETRIEVAL"), "TOP_K_RETRIEVAL", 5)?,
            similarity_threshold: parse_or(get("SIMILARITY_THRESHOLD"), "SIMILARITY_THRESHOLD", 0.7)?,
            required_keywords: keyword_list(get("REQUIRED_KEYWORDS")),
            excluded_keywords: keyword_list(get("EXCLUDED_KEYWORDS")),
            archive_text_field: get("ARCHIVE_TEXT_FIELD"),
            debug: parse_bool(get("DEBUG"), "DEBUG", true)?,
            log_level: text("LOG_LEVEL", "INFO"),
            log_file: PathBuf::from(text("LOG_FILE", "logs/docchat.log")),
            server_host: text("SERVER_HOST", "127.0.0.1"),
            server_port: parse_or(get("SERVER_PORT"), "SERVER_PORT", 7860)?,
        };

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.needs_openai() && self.openai_api_key.is_none() {
            return Err(ConfigError::Missing("OPENAI_API_KEY".to_string()));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(invalid(
                "SIMILARITY_THRESHOLD",
                &self.similarity_threshold.to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(invalid("CHUNK_SIZE", "0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(invalid("CHUNK_OVERLAP", &self.chunk_overlap.to_string()));
        }
        if self.top_k == 0 {
            return Err(invalid("TOP_K_RETRIEVAL", "0"));
        }
        if self.embedding_dimension == 0 {
            return Err(invalid("EMBEDDING_DIMENSION", "0"));
        }
        if self.embedding_max_tokens == 0 {
            return Err(invalid("EMBEDDING_MAX_TOKENS", "0"));
        }
        Ok(())
    }

    pub fn needs_openai(&self) -> bool {
        self.llm_provider == LlmProvider::OpenAi
            || self.embedding_provider == EmbeddingProvider::OpenAi
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.index_storage_path.join("manifest.json")
    }

    pub fn ingestion_options(&self) -> IngestionOptions {
        IngestionOptions {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            archive_text_field: self.archive_text_field.clone(),
            ..IngestionOptions::default()
        }
    }

    /// Filter directive for the tracing subscriber when `RUST_LOG` is unset.
    pub fn log_directive(&self, level_explicit: bool) -> String {
        if self.debug && !level_explicit {
            "debug".to_string()
        } else {
            self.log_level.to_ascii_lowercase()
        }
    }
}

/// `./models/<org>--<name>` for a Hugging Face model id.
fn model_directory(model: &str) -> PathBuf {
    PathBuf::from("./models").join(model.replace('/', "--"))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, ConfigError> {
    match value {
        Some(raw) => raw.parse().map_err(|_| invalid(key, &raw)),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<String>, key: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = value else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, &raw)),
    }
}

fn keyword_list(value: Option<String>) -> Vec<String> {
    value
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|term| !term.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Settings::from_lookup(|key| values.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = settings(&[("OPENAI_API_KEY", "sk-test")]).expect("settings");

        assert_eq!(settings.openai_model, "gpt-4-turbo-preview");
        assert_eq!(settings.collection_name, "esg_documents");
        assert_eq!(settings.chunk_size, 512);
        assert_eq!(settings.chunk_overlap, 50);
        assert_eq!(settings.top_k, 5);
        assert!((settings.similarity_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(settings.qdrant_host, "localhost");
        assert_eq!(settings.qdrant_port, 6333);
        assert_eq!(settings.embedding_provider, EmbeddingProvider::Local);
        assert_eq!(
            settings.embedding_model_path,
            PathBuf::from("./models/BAAI--bge-small-en-v1.5")
        );
        assert_eq!(settings.embedding_max_tokens, 512);
        assert_eq!(settings.vector_store, StoreKind::Qdrant);
        assert!(settings.debug);
    }

    #[test]
    fn missing_api_key_is_reported_for_openai_provider() {
        let error = settings(&[]).unwrap_err();
        assert!(matches!(error, ConfigError::Missing(key) if key == "OPENAI_API_KEY"));
    }

    #[test]
    fn api_key_is_optional_for_local_models() {
        let settings = settings(&[("LLM_PROVIDER", "ollama"), ("OPENAI_API_KEY", "  ")])
            .expect("settings");
        assert!(settings.openai_api_key.is_none());
        assert_eq!(settings.ollama_model, "mistral");
    }

    #[test]
    fn threshold_outside_unit_interval_is_invalid() {
        let error = settings(&[("OPENAI_API_KEY", "k"), ("SIMILARITY_THRESHOLD", "1.5")]).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { key, .. } if key == "SIMILARITY_THRESHOLD"));
    }

    #[test]
    fn unparseable_numbers_and_providers_are_invalid() {
        assert!(matches!(
            settings(&[("OPENAI_API_KEY", "k"), ("CHUNK_SIZE", "big")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            settings(&[("OPENAI_API_KEY", "k"), ("VECTOR_STORE", "pinecone")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            settings(&[("OPENAI_API_KEY", "k"), ("CHUNK_OVERLAP", "600")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn model_path_follows_model_name_unless_set() {
        let named = settings(&[
            ("OPENAI_API_KEY", "k"),
            ("EMBEDDING_MODEL", "sentence-transformers/all-MiniLM-L6-v2"),
        ])
        .expect("settings");
        assert_eq!(
            named.embedding_model_path,
            PathBuf::from("./models/sentence-transformers--all-MiniLM-L6-v2")
        );

        let explicit = settings(&[
            ("OPENAI_API_KEY", "k"),
            ("EMBEDDING_PROVIDER", "hash"),
            ("EMBEDDING_MODEL_PATH", "/opt/models/bge"),
        ])
        .expect("settings");
        assert_eq!(explicit.embedding_provider, EmbeddingProvider::Hash);
        assert_eq!(explicit.embedding_model_path, PathBuf::from("/opt/models/bge"));
    }

    #[test]
    fn keyword_lists_are_split_and_trimmed() {
        let settings = settings(&[
            ("OPENAI_API_KEY", "k"),
            ("REQUIRED_KEYWORDS", "board, directors ,,"),
        ])
        .expect("settings");
        assert_eq!(settings.required_keywords, vec!["board", "directors"]);
        assert!(settings.excluded_keywords.is_empty());
    }

    #[test]
    fn debug_flag_only_raises_level_without_explicit_level() {
        let settings = settings(&[("OPENAI_API_KEY", "k"), ("LOG_LEVEL", "WARN")]).expect("settings");
        assert_eq!(settings.log_directive(true), "warn");
        assert_eq!(settings.log_directive(false), "debug");
    }
}
