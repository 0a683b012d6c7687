use crate::chunking::ChunkingConfig;
use crate::config::{EmbeddingProvider, LlmProvider, Settings, StoreKind};
use crate::embeddings::{CharacterNgramEmbedder, Embedder, OllamaEmbedder, OpenAiEmbedder};
use crate::error::{ConfigError, RagError, Result};
use crate::indexer::{IndexReport, IndexState, IndexStatus, Indexer};
use crate::llm::{LanguageModel, OllamaChat, OpenAiChat};
use crate::loader::{DocumentLoader, DocumentStats};
use crate::models::{Answer, QueryFilters, QueryResultItem};
use crate::onnx::OnnxEmbedder;
use crate::query::{QueryEngine, RetrievalConfig};
use crate::stores::{LocalStore, QdrantStore};
use crate::traits::VectorStore;
use std::sync::Arc;
use tracing::info;

/// The pipeline wired together: what the CLI and the HTTP server share.
pub struct RagService {
    settings: Settings,
    indexer: Indexer,
    engine: QueryEngine,
}

impl RagService {
    /// Builds every component named by the settings and recovers index state.
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let store: Arc<dyn VectorStore> = match settings.vector_store {
            StoreKind::Qdrant => Arc::new(QdrantStore::from_host(
                &settings.qdrant_host,
                settings.qdrant_port,
            )?),
            StoreKind::Local => Arc::new(LocalStore::open(&settings.qdrant_data_path).await?),
        };
        let embedder = build_embedder(&settings)?;
        let model = build_language_model(&settings)?;
        info!(
            store = store.backend(),
            embedder = embedder.model_name(),
            "pipeline components ready"
        );

        let service = Self::with_components(settings, store, embedder, model)?;
        match service.indexer.recover().await {
            Ok(state) => info!(state = ?state, "index state at startup"),
            Err(error) => tracing::warn!(error = %error, "could not recover index state"),
        }
        Ok(service)
    }

    pub fn with_components(
        settings: Settings,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        let options = settings.ingestion_options();
        let chunking = ChunkingConfig::try_from(&options)?;
        let loader = DocumentLoader::new(settings.document_path.clone(), options);

        let indexer = Indexer::new(
            store.clone(),
            embedder.clone(),
            loader,
            chunking,
            settings.collection_name.clone(),
            settings.index_storage_path.clone(),
        );
        let engine = QueryEngine::new(
            store,
            embedder,
            model,
            settings.collection_name.clone(),
            RetrievalConfig {
                top_k: settings.top_k,
                similarity_threshold: settings.similarity_threshold,
                required_keywords: settings.required_keywords.clone(),
                excluded_keywords: settings.excluded_keywords.clone(),
            },
        )?;

        Ok(Self {
            settings,
            indexer,
            engine,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub async fn ask(&self, question: &str, filters: &QueryFilters) -> Result<Answer> {
        let _gate = self.indexer.read_gate().await;
        self.ensure_queryable().await?;
        self.engine.ask(question, filters).await
    }

    pub async fn search_similar(
        &self,
        question: &str,
        top_k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<QueryResultItem>> {
        let _gate = self.indexer.read_gate().await;
        self.ensure_queryable().await?;
        self.engine.search_similar(question, top_k, filters).await
    }

    pub async fn rebuild(&self, force: bool) -> Result<IndexReport> {
        self.indexer.rebuild(force).await
    }

    pub async fn refresh(&self) -> Result<IndexReport> {
        self.indexer.refresh().await
    }

    pub async fn status(&self) -> Result<IndexStatus> {
        let mut status = self.indexer.status().await?;
        status.retrieval = Some(self.engine.config().clone());
        Ok(status)
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.indexer.cleanup().await
    }

    pub async fn document_stats(&self) -> Result<DocumentStats> {
        self.indexer.document_stats().await
    }

    /// Queries are answered whenever a live collection exists, including after
    /// a failed rebuild that left the previous one in place.
    async fn ensure_queryable(&self) -> Result<()> {
        if self.indexer.live_collection().await?.is_some() {
            return Ok(());
        }
        let reason = match self.indexer.state().await {
            IndexState::Indexing => "an index build is running".to_string(),
            IndexState::Failed { reason } => format!("the last build failed: {reason}"),
            IndexState::Empty | IndexState::Ready { .. } => "no index has been built".to_string(),
        };
        Err(RagError::NotReady(reason))
    }
}

pub fn build_embedder(settings: &Settings) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match settings.embedding_provider {
        EmbeddingProvider::Local => Arc::new(OnnxEmbedder::load(
            settings.embedding_model.clone(),
            &settings.embedding_model_path,
            settings.embedding_dimension,
            settings.embedding_max_tokens,
        )?),
        EmbeddingProvider::Hash => Arc::new(CharacterNgramEmbedder {
            dimensions: settings.embedding_dimension,
        }),
        EmbeddingProvider::OpenAi => Arc::new(OpenAiEmbedder::new(
            &settings.openai_base_url,
            openai_key(settings)?,
            settings.embedding_model.clone(),
            settings.embedding_dimension,
        )?),
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbedder::new(
            &settings.ollama_url,
            settings.embedding_model.clone(),
            settings.embedding_dimension,
        )?),
    };
    Ok(embedder)
}

pub fn build_language_model(settings: &Settings) -> Result<Arc<dyn LanguageModel>> {
    let model: Arc<dyn LanguageModel> = match settings.llm_provider {
        LlmProvider::OpenAi => Arc::new(OpenAiChat::new(
            &settings.openai_base_url,
            openai_key(settings)?,
            settings.openai_model.clone(),
        )?),
        LlmProvider::Ollama => Arc::new(OllamaChat::new(
            &settings.ollama_url,
            settings.ollama_model.clone(),
        )?),
    };
    Ok(model)
}

fn openai_key(settings: &Settings) -> Result<String> {
    settings
        .openai_api_key
        .clone()
        .ok_or_else(|| ConfigError::Missing("OPENAI_API_KEY".to_string()).into())
}
