use crate::error::StoreError;
use crate::models::{Chunk, QueryFilters, QueryResultItem};
use crate::store::{check_dimension, cosine_similarity, rank_hits, RankedHit};
use crate::traits::VectorStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

const SNAPSHOT_FILE: &str = "collections.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalState {
    collections: BTreeMap<String, LocalCollection>,
    aliases: BTreeMap<String, String>,
}

impl LocalState {
    fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    fn collection(&self, name: &str) -> Result<&LocalCollection, StoreError> {
        self.collections
            .get(self.resolve(name))
            .ok_or_else(|| StoreError::CollectionMissing(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut LocalCollection, StoreError> {
        let resolved = self.resolve(name).to_string();
        self.collections
            .get_mut(&resolved)
            .ok_or_else(|| StoreError::CollectionMissing(name.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LocalCollection {
    dimensions: usize,
    next_ordinal: u64,
    points: BTreeMap<String, StoredPoint>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPoint {
    ordinal: u64,
    chunk: Chunk,
}

/// In-process vector store with brute-force cosine search, optionally
/// snapshotted to a JSON file. Collection and alias changes are written
/// immediately; point writes are written on [`VectorStore::flush`].
pub struct LocalStore {
    state: RwLock<LocalState>,
    snapshot_path: Option<PathBuf>,
    available: AtomicBool,
    dirty: AtomicBool,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(LocalState::default()),
            snapshot_path: None,
            available: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
        }
    }

    /// Opens (or creates) a store persisted under `directory`.
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self, StoreError> {
        let directory = directory.as_ref();
        tokio::fs::create_dir_all(directory).await?;
        let snapshot_path = directory.join(SNAPSHOT_FILE);

        let state = match tokio::fs::read(&snapshot_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => LocalState::default(),
            Err(error) => return Err(error.into()),
        };

        debug!(path = %snapshot_path.display(), "opened local vector store");
        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(snapshot_path),
            available: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
        })
    }

    /// Simulates losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unreachable("local store is offline".to_string()))
        }
    }

    async fn persist(&self, state: &LocalState) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(state)?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, path).await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl VectorStore for LocalStore {
    fn backend(&self) -> &str {
        "local"
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state.collections.contains_key(state.resolve(collection)))
    }

    async fn collection_dimension(&self, collection: &str) -> Result<Option<usize>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state
            .collections
            .get(state.resolve(collection))
            .map(|found| found.dimensions))
    }

    async fn create_collection(
        &self,
        collection: &str,
        dimensions: usize,
    ) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        if let Some(existing) = state.collections.get(collection) {
            if existing.dimensions != dimensions {
                return Err(StoreError::DimensionMismatch {
                    expected: existing.dimensions,
                    actual: dimensions,
                });
            }
            return Ok(());
        }

        state.collections.insert(
            collection.to_string(),
            LocalCollection {
                dimensions,
                next_ordinal: 0,
                points: BTreeMap::new(),
            },
        );
        self.persist(&state).await
    }

    async fn upsert(&self, collection: &str, chunks: &[Chunk]) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let target = state.collection_mut(collection)?;

        for chunk in chunks {
            check_dimension(target.dimensions, &chunk.embedding_vector)?;
        }

        for chunk in chunks {
            match target.points.get_mut(&chunk.chunk_id) {
                Some(existing) => existing.chunk = chunk.clone(),
                None => {
                    let ordinal = target.next_ordinal;
                    target.next_ordinal += 1;
                    target.points.insert(
                        chunk.chunk_id.clone(),
                        StoredPoint {
                            ordinal,
                            chunk: chunk.clone(),
                        },
                    );
                }
            }
        }

        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<QueryResultItem>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let target = state.collection(collection)?;
        check_dimension(target.dimensions, query_vector)?;

        let hits = target
            .points
            .values()
            .filter(|point| filters.matches(&point.chunk))
            .map(|point| {
                let score = cosine_similarity(query_vector, &point.chunk.embedding_vector);
                RankedHit::new(point.ordinal, &point.chunk, score)
            })
            .collect();

        Ok(rank_hits(hits, top_k))
    }

    async fn delete_points(
        &self,
        collection: &str,
        chunk_ids: &[String],
    ) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let target = state.collection_mut(collection)?;
        for chunk_id in chunk_ids {
            target.points.remove(chunk_id);
        }
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state.collection(collection)?.points.len())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        if state.collections.remove(collection).is_none() {
            return Ok(());
        }
        state.aliases.retain(|_, target| target.as_str() != collection);
        self.persist(&state).await
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        Ok(self.state.read().await.aliases.get(alias).cloned())
    }

    async fn swap_alias(&self, alias: &str, collection: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        if !state.collections.contains_key(collection) {
            return Err(StoreError::CollectionMissing(collection.to_string()));
        }
        if state.collections.contains_key(alias) {
            return Err(StoreError::BackendResponse {
                backend: "local".to_string(),
                details: format!("alias {alias} clashes with an existing collection"),
            });
        }
        state
            .aliases
            .insert(alias.to_string(), collection.to_string());
        self.persist(&state).await
    }

    async fn delete_alias(&self, alias: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        if state.aliases.remove(alias).is_some() {
            self.persist(&state).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.ensure_available()?;
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        let state = self.state.read().await;
        self.persist(&state).await
    }
}
