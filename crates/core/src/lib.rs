pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod indexer;
pub mod llm;
pub mod loader;
pub mod models;
pub mod onnx;
pub mod query;
pub mod service;
pub mod store;
pub mod stores;
pub mod traits;

pub use chunking::{merge_chunks, normalize_whitespace, split_document, split_text, ChunkingConfig};
pub use config::{EmbeddingProvider, LlmProvider, Settings, StoreKind, DEFAULT_CONFIG_FILE};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, OllamaEmbedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ConfigError, IngestError, ModelError, RagError, StoreError};
pub use extractor::{extract_pdf_text, LopdfExtractor, PageText, PdfExtractor};
pub use indexer::{IndexManifest, IndexMode, IndexReport, IndexState, IndexStatus, Indexer};
pub use llm::{LanguageModel, OllamaChat, OpenAiChat};
pub use loader::{document_stats, DocumentLoader, DocumentStats, LoadEvent, LoadReport, SkippedFile};
pub use models::{
    Answer, CategoryTag, Chunk, DocumentType, IngestionOptions, QueryFilters, QueryResultItem,
    RawDocument, SourceCitation,
};
pub use onnx::{download_model, OnnxEmbedder, Pooling};
pub use query::{QueryEngine, RetrievalConfig, NO_CONTEXT_ANSWER};
pub use service::RagService;
pub use stores::{LocalStore, QdrantStore};
pub use traits::VectorStore;
