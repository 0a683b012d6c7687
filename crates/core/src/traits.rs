use crate::error::StoreError;
use crate::models::{Chunk, QueryFilters, QueryResultItem};
use async_trait::async_trait;

/// Vector database adapter. Collection arguments may name an alias.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn backend(&self) -> &str;

    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError>;

    /// Vector size of an existing collection, `None` when it does not exist.
    async fn collection_dimension(&self, collection: &str) -> Result<Option<usize>, StoreError>;

    async fn create_collection(&self, collection: &str, dimensions: usize)
        -> Result<(), StoreError>;

    /// Inserts or replaces chunks by id. Every vector must match the collection's size.
    async fn upsert(&self, collection: &str, chunks: &[Chunk]) -> Result<(), StoreError>;

    /// Up to `top_k` items by descending cosine similarity, ties in insertion order.
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<QueryResultItem>, StoreError>;

    async fn delete_points(&self, collection: &str, chunk_ids: &[String])
        -> Result<(), StoreError>;

    async fn count(&self, collection: &str) -> Result<usize, StoreError>;

    /// Removes a physical collection; missing collections are not an error.
    async fn delete_collection(&self, collection: &str) -> Result<(), StoreError>;

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, StoreError>;

    /// Atomically points `alias` at `collection`, replacing any previous target.
    async fn swap_alias(&self, alias: &str, collection: &str) -> Result<(), StoreError>;

    async fn delete_alias(&self, alias: &str) -> Result<(), StoreError>;

    /// Makes preceding point writes durable. Called once per indexing phase.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
