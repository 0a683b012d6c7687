//! Indexing orchestration: full rebuilds through a staging collection and an
//! alias swap, incremental refreshes driven by the manifest, status and cleanup.

use crate::chunking::{split_document, ChunkingConfig};
use crate::embeddings::Embedder;
use crate::error::{ModelError, RagError, Result};
use crate::loader::{digest_file, document_stats, DocumentLoader, DocumentStats, LoadReport, SkippedFile};
use crate::models::{source_file_of, Chunk, RawDocument};
use crate::query::RetrievalConfig;
use crate::traits::VectorStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

const UPSERT_BATCH_SIZE: usize = 256;
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IndexState {
    Empty,
    Indexing,
    Ready {
        chunk_count: usize,
        indexed_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub checksum: String,
    pub chunk_ids: Vec<String>,
}

/// What is live in the store, persisted next to the index storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub collection: String,
    pub dimensions: usize,
    pub embedding_model: String,
    pub indexed_at: DateTime<Utc>,
    pub sources: BTreeMap<String, SourceEntry>,
}

impl IndexManifest {
    pub fn chunk_count(&self) -> usize {
        self.sources.values().map(|entry| entry.chunk_ids.len()).sum()
    }

    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|error| {
                RagError::Io(io::Error::new(io::ErrorKind::InvalidData, error))
            }),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|error| RagError::Io(io::Error::new(io::ErrorKind::InvalidData, error)))?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Full,
    Incremental,
    Reused,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub mode: IndexMode,
    pub collection: String,
    pub documents: usize,
    pub chunks: usize,
    pub updated_sources: Vec<String>,
    pub removed_sources: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: String,
}

impl From<SkippedFile> for SkippedEntry {
    fn from(skipped: SkippedFile) -> Self {
        Self {
            path: skipped.path,
            reason: skipped.reason,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    #[serde(flatten)]
    pub state: IndexState,
    pub alias: String,
    pub live_collection: Option<String>,
    pub point_count: Option<usize>,
    pub last_indexed: Option<DateTime<Utc>>,
    pub embedding_model: String,
    pub document_path: PathBuf,
    pub document_files: usize,
    pub storage_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalConfig>,
}

/// A document split into chunks that already carry their embeddings.
struct EmbeddedSource {
    checksum: String,
    chunks: Vec<Chunk>,
}

pub struct Indexer {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    loader: DocumentLoader,
    chunking: ChunkingConfig,
    alias: String,
    storage_path: PathBuf,
    state: RwLock<IndexState>,
    rebuild_lock: Mutex<()>,
    query_gate: RwLock<()>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        loader: DocumentLoader,
        chunking: ChunkingConfig,
        alias: impl Into<String>,
        storage_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            embedder,
            loader,
            chunking,
            alias: alias.into(),
            storage_path: storage_path.into(),
            state: RwLock::new(IndexState::Empty),
            rebuild_lock: Mutex::new(()),
            query_gate: RwLock::new(()),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.storage_path.join(MANIFEST_FILE)
    }

    pub async fn state(&self) -> IndexState {
        self.state.read().await.clone()
    }

    /// Held by queries so they never observe a half-applied alias swap or refresh.
    pub async fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.query_gate.read().await
    }

    /// The physical collection queries currently read from, if any.
    pub async fn live_collection(&self) -> Result<Option<String>> {
        Ok(self.store.resolve_alias(&self.alias).await?)
    }

    /// Restores `Ready` from a manifest whose collection is still live.
    pub async fn recover(&self) -> Result<IndexState> {
        let Some(manifest) = IndexManifest::load(&self.manifest_path()).await? else {
            return Ok(self.state().await);
        };

        let live = self.live_collection().await?;
        if live.as_deref() != Some(manifest.collection.as_str()) {
            warn!(
                alias = %self.alias,
                manifest_collection = %manifest.collection,
                "manifest does not match the live collection; index needs a rebuild"
            );
            return Ok(self.state().await);
        }

        let chunk_count = self.store.count(&manifest.collection).await?;
        let recovered = IndexState::Ready {
            chunk_count,
            indexed_at: manifest.indexed_at,
        };
        *self.state.write().await = recovered.clone();
        info!(collection = %manifest.collection, chunk_count, "recovered index state");
        Ok(recovered)
    }

    /// Builds the index. Without `force`, an index that is already live is reused.
    pub async fn rebuild(&self, force: bool) -> Result<IndexReport> {
        let _serial = self
            .rebuild_lock
            .try_lock()
            .map_err(|_| RagError::RebuildInProgress)?;

        if !force {
            if let Some(report) = self.reusable_index().await? {
                return Ok(report);
            }
        }

        self.tracked(self.full_rebuild()).await
    }

    /// Re-embeds only sources whose checksum changed and drops removed ones.
    pub async fn refresh(&self) -> Result<IndexReport> {
        let _serial = self
            .rebuild_lock
            .try_lock()
            .map_err(|_| RagError::RebuildInProgress)?;

        let manifest = IndexManifest::load(&self.manifest_path()).await?;
        let live = self.live_collection().await?;
        match manifest {
            Some(manifest)
                if live.as_deref() == Some(manifest.collection.as_str())
                    && manifest.dimensions == self.embedder.dimensions()
                    && manifest.embedding_model == self.embedder.model_name() =>
            {
                self.tracked(self.incremental(manifest)).await
            }
            _ => {
                info!(alias = %self.alias, "no compatible live index; running a full rebuild");
                self.tracked(self.full_rebuild()).await
            }
        }
    }

    pub async fn status(&self) -> Result<IndexStatus> {
        let state = self.state().await;
        let live_collection = self.live_collection().await?;
        let point_count = match &live_collection {
            Some(collection) => Some(self.store.count(collection).await?),
            None => None,
        };
        let manifest = IndexManifest::load(&self.manifest_path()).await?;
        let document_files = self.loader.discover().map(|files| files.len()).unwrap_or(0);

        Ok(IndexStatus {
            state,
            alias: self.alias.clone(),
            live_collection,
            point_count,
            last_indexed: manifest.map(|manifest| manifest.indexed_at),
            embedding_model: self.embedder.model_name().to_string(),
            document_path: self.loader.root().to_path_buf(),
            document_files,
            storage_path: self.storage_path.clone(),
            retrieval: None,
        })
    }

    /// Loads the document folder and summarises it without touching the store.
    pub async fn document_stats(&self) -> Result<DocumentStats> {
        let report = self.load_documents().await?;
        Ok(document_stats(&report.documents))
    }

    /// Deletes the live collection, the alias and the manifest.
    pub async fn cleanup(&self) -> Result<()> {
        let _serial = self
            .rebuild_lock
            .try_lock()
            .map_err(|_| RagError::RebuildInProgress)?;
        let _exclusive = self.query_gate.write().await;

        if let Some(collection) = self.live_collection().await? {
            self.store.delete_alias(&self.alias).await?;
            self.store.delete_collection(&collection).await?;
            info!(alias = %self.alias, collection = %collection, "deleted live collection");
        }

        match tokio::fs::remove_file(self.manifest_path()).await {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        *self.state.write().await = IndexState::Empty;
        Ok(())
    }

    async fn reusable_index(&self) -> Result<Option<IndexReport>> {
        let IndexState::Ready { chunk_count, .. } = self.state().await else {
            return Ok(None);
        };
        let Some(collection) = self.live_collection().await? else {
            return Ok(None);
        };

        info!(collection = %collection, chunk_count, "index already built; reusing it");
        Ok(Some(IndexReport {
            mode: IndexMode::Reused,
            collection,
            documents: 0,
            chunks: chunk_count,
            updated_sources: Vec::new(),
            removed_sources: Vec::new(),
            skipped: Vec::new(),
        }))
    }

    /// Runs an indexing job with the state machine around it.
    async fn tracked<F>(&self, job: F) -> Result<IndexReport>
    where
        F: std::future::Future<Output = Result<(IndexReport, DateTime<Utc>, usize)>>,
    {
        *self.state.write().await = IndexState::Indexing;

        match job.await {
            Ok((report, indexed_at, chunk_count)) => {
                *self.state.write().await = IndexState::Ready {
                    chunk_count,
                    indexed_at,
                };
                Ok(report)
            }
            Err(error) => {
                warn!(alias = %self.alias, error = %error, "indexing failed");
                *self.state.write().await = IndexState::Failed {
                    reason: error.to_string(),
                };
                Err(error)
            }
        }
    }

    async fn full_rebuild(&self) -> Result<(IndexReport, DateTime<Utc>, usize)> {
        let report = self.load_documents().await?;
        if report.documents.is_empty() {
            return Err(RagError::NoDocuments(
                self.loader.root().display().to_string(),
            ));
        }

        let document_count = report.documents.len();
        let sources = self.embed_sources(&report.documents).await?;
        let chunks: Vec<&Chunk> = sources.values().flat_map(|source| &source.chunks).collect();
        let chunk_count = chunks.len();

        let indexed_at = Utc::now();
        let staging = format!("{}_{}", self.alias, indexed_at.format("%Y%m%d%H%M%S%3f"));
        info!(collection = %staging, documents = document_count, chunks = chunk_count, "staging rebuild");

        if let Err(error) = self.stage(&staging, &chunks).await {
            if let Err(cleanup_error) = self.store.delete_collection(&staging).await {
                warn!(collection = %staging, error = %cleanup_error, "could not remove staging collection");
            }
            return Err(error);
        }

        let previous = {
            let _exclusive = self.query_gate.write().await;
            let previous = self.store.resolve_alias(&self.alias).await?;
            if previous.is_none() && self.store.collection_exists(&self.alias).await? {
                warn!(collection = %self.alias, "replacing physical collection that shadows the alias");
                self.store.delete_collection(&self.alias).await?;
            }
            self.store.swap_alias(&self.alias, &staging).await?;
            previous
        };
        info!(alias = %self.alias, collection = %staging, "alias swapped");

        if let Some(old) = previous.filter(|old| old != &staging) {
            if let Err(error) = self.store.delete_collection(&old).await {
                warn!(collection = %old, error = %error, "could not delete previous collection");
            }
        }

        let manifest = IndexManifest {
            collection: staging.clone(),
            dimensions: self.embedder.dimensions(),
            embedding_model: self.embedder.model_name().to_string(),
            indexed_at,
            sources: sources
                .iter()
                .map(|(file, source)| {
                    (
                        file.clone(),
                        SourceEntry {
                            checksum: source.checksum.clone(),
                            chunk_ids: source.chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect(),
                        },
                    )
                })
                .collect(),
        };
        manifest.save(&self.manifest_path()).await?;

        Ok((
            IndexReport {
                mode: IndexMode::Full,
                collection: staging,
                documents: document_count,
                chunks: chunk_count,
                updated_sources: sources.keys().cloned().collect(),
                removed_sources: Vec::new(),
                skipped: report.skipped.into_iter().map(SkippedEntry::from).collect(),
            },
            indexed_at,
            chunk_count,
        ))
    }

    async fn incremental(
        &self,
        mut manifest: IndexManifest,
    ) -> Result<(IndexReport, DateTime<Utc>, usize)> {
        let report = self.load_documents().await?;
        let document_count = report.documents.len();

        let mut grouped: BTreeMap<String, Vec<RawDocument>> = BTreeMap::new();
        for document in report.documents {
            grouped
                .entry(source_file_of(&document.source_path).to_string())
                .or_default()
                .push(document);
        }

        let mut changed = Vec::new();
        for (file, documents) in grouped.iter() {
            let checksum = digest_file(Path::new(file))?;
            let unchanged = manifest
                .sources
                .get(file)
                .is_some_and(|entry| entry.checksum == checksum);
            if !unchanged {
                changed.extend(documents.iter().cloned());
            }
        }
        let current: BTreeSet<&String> = grouped.keys().collect();
        let removed: Vec<String> = manifest
            .sources
            .keys()
            .filter(|file| !current.contains(file))
            .cloned()
            .collect();

        let embedded = self.embed_sources(&changed).await?;
        debug!(changed = embedded.len(), removed = removed.len(), "refresh plan");

        let collection = manifest.collection.clone();
        {
            let fresh: Vec<&Chunk> = embedded.values().flat_map(|source| &source.chunks).collect();
            let fresh_ids: BTreeSet<&str> = fresh.iter().map(|chunk| chunk.chunk_id.as_str()).collect();
            let live_ids: BTreeSet<&str> = manifest
                .sources
                .values()
                .flat_map(|entry| entry.chunk_ids.iter().map(String::as_str))
                .collect();
            let stale: Vec<String> = embedded
                .keys()
                .chain(removed.iter())
                .filter_map(|file| manifest.sources.get(file))
                .flat_map(|entry| entry.chunk_ids.iter())
                .filter(|id| !fresh_ids.contains(id.as_str()))
                .cloned()
                .collect();

            let _exclusive = self.query_gate.write().await;

            // Fresh points land before stale ones are removed.
            if let Err(error) = self.upsert_batches(&collection, &fresh).await {
                let added: Vec<String> = fresh_ids
                    .difference(&live_ids)
                    .map(|id| id.to_string())
                    .collect();
                if let Err(rollback) = self.store.delete_points(&collection, &added).await {
                    warn!(collection = %collection, error = %rollback, "could not roll back partial refresh");
                }
                return Err(error);
            }
            self.store.delete_points(&collection, &stale).await?;
            self.store.flush().await?;
        }

        for file in &removed {
            manifest.sources.remove(file);
        }
        for (file, source) in &embedded {
            manifest.sources.insert(
                file.clone(),
                SourceEntry {
                    checksum: source.checksum.clone(),
                    chunk_ids: source.chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect(),
                },
            );
        }
        let indexed_at = Utc::now();
        manifest.indexed_at = indexed_at;
        manifest.save(&self.manifest_path()).await?;

        let chunk_count = self.store.count(&collection).await?;
        info!(
            collection = %collection,
            updated = embedded.len(),
            removed = removed.len(),
            chunk_count,
            "incremental refresh complete"
        );

        Ok((
            IndexReport {
                mode: IndexMode::Incremental,
                collection,
                documents: document_count,
                chunks: chunk_count,
                updated_sources: embedded.into_keys().collect(),
                removed_sources: removed,
                skipped: report.skipped.into_iter().map(SkippedEntry::from).collect(),
            },
            indexed_at,
            chunk_count,
        ))
    }

    async fn load_documents(&self) -> Result<LoadReport> {
        let loader = self.loader.clone();
        let report = tokio::task::spawn_blocking(move || loader.load_all())
            .await
            .map_err(|error| RagError::Io(io::Error::other(error)))??;

        info!(
            root = %self.loader.root().display(),
            documents = report.documents.len(),
            skipped = report.skipped.len(),
            "loaded documents"
        );
        Ok(report)
    }

    /// Splits and embeds every document, grouped by source file. A single
    /// embedding failure fails the whole batch.
    async fn embed_sources(
        &self,
        documents: &[RawDocument],
    ) -> Result<BTreeMap<String, EmbeddedSource>> {
        let mut sources: BTreeMap<String, EmbeddedSource> = BTreeMap::new();

        for document in documents {
            let file = source_file_of(&document.source_path).to_string();
            let mut chunks = split_document(document, self.chunking);
            let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != chunks.len() {
                return Err(ModelError::InvalidResponse {
                    backend: self.embedder.model_name().to_string(),
                    details: format!("expected {} embeddings, got {}", chunks.len(), vectors.len()),
                }
                .into());
            }
            for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                chunk.embedding_vector = vector;
            }

            if !sources.contains_key(&file) {
                let checksum = digest_file(Path::new(&file))?;
                sources.insert(
                    file.clone(),
                    EmbeddedSource {
                        checksum,
                        chunks: Vec::new(),
                    },
                );
            }
            if let Some(source) = sources.get_mut(&file) {
                source.chunks.extend(chunks);
            }
        }

        Ok(sources)
    }

    async fn stage(&self, collection: &str, chunks: &[&Chunk]) -> Result<()> {
        self.store
            .create_collection(collection, self.embedder.dimensions())
            .await?;
        self.upsert_batches(collection, chunks).await?;
        Ok(self.store.flush().await?)
    }

    async fn upsert_batches(&self, collection: &str, chunks: &[&Chunk]) -> Result<()> {
        for batch in chunks.chunks(UPSERT_BATCH_SIZE) {
            let owned: Vec<Chunk> = batch.iter().map(|chunk| (*chunk).clone()).collect();
            self.store.upsert(collection, &owned).await?;
        }
        Ok(())
    }
}
