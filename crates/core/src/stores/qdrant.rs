use crate::error::StoreError;
use crate::models::{CategoryTag, Chunk, QueryFilters, QueryResultItem};
use crate::store::{check_dimension, rank_hits, RankedHit};
use crate::traits::VectorStore;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

const ORDINAL_FIELD: &str = "ordinal";

pub struct QdrantStore {
    endpoint: String,
    client: Client,
}

impl QdrantStore {
    pub fn new(endpoint: &str) -> Result<Self, StoreError> {
        let parsed = Url::parse(endpoint)?;
        let endpoint = parsed.as_str().trim_end_matches('/').to_string();
        let client = Client::builder().user_agent("docchat/0.1").build()?;
        debug!(endpoint = %endpoint, "initialized qdrant client");
        Ok(Self { endpoint, client })
    }

    pub fn from_host(host: &str, port: u16) -> Result<Self, StoreError> {
        Self::new(&format!("http://{host}:{port}"))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.endpoint, path))
    }

    async fn collection_info(&self, collection: &str) -> Result<Option<Value>, StoreError> {
        let response = self
            .request(Method::GET, &format!("collections/{collection}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = ensure_success(response).await?;
        Ok(body.get("result").cloned())
    }

    /// Ordinals already assigned to any of `ids`.
    async fn existing_ordinals(
        &self,
        collection: &str,
        ids: &[&str],
    ) -> Result<HashMap<String, u64>, StoreError> {
        let response = self
            .request(Method::POST, &format!("collections/{collection}/points"))
            .json(&json!({ "ids": ids, "with_payload": [ORDINAL_FIELD], "with_vector": false }))
            .send()
            .await?;
        let parsed = ensure_success(response).await?;

        Ok(parsed
            .get("result")
            .and_then(Value::as_array)
            .map(|points| {
                points
                    .iter()
                    .filter_map(|point| {
                        let id = point_id(point.get("id")?)?;
                        let ordinal = point.pointer("/payload/ordinal").and_then(Value::as_u64)?;
                        Some((id, ordinal))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// One past the highest ordinal in the collection.
    async fn next_ordinal(&self, collection: &str) -> Result<u64, StoreError> {
        let response = self
            .request(Method::POST, &format!("collections/{collection}/points/scroll"))
            .json(&json!({
                "limit": 1,
                "with_payload": [ORDINAL_FIELD],
                "with_vector": false,
                "order_by": { "key": ORDINAL_FIELD, "direction": "desc" },
            }))
            .send()
            .await?;
        let parsed = ensure_success(response).await?;

        Ok(parsed
            .pointer("/result/points/0/payload/ordinal")
            .and_then(Value::as_u64)
            .map_or(0, |highest| highest + 1))
    }

    async fn search_page(
        &self,
        collection: &str,
        query_vector: &[f32],
        limit: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<RankedHit>, StoreError> {
        let mut body = json!({
            "vector": query_vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = build_filter(filters) {
            body["filter"] = filter;
        }

        let response = self
            .request(
                Method::POST,
                &format!("collections/{collection}/points/search"),
            )
            .json(&body)
            .send()
            .await?;
        let parsed = ensure_success(response).await?;

        Ok(parsed
            .get("result")
            .and_then(Value::as_array)
            .map(|hits| hits.iter().map(parse_hit).collect())
            .unwrap_or_default())
    }

    async fn update_aliases(&self, actions: Vec<Value>) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, "collections/aliases")
            .json(&json!({ "actions": actions }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

async fn ensure_success(response: Response) -> Result<Value, StoreError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::BackendResponse {
            backend: "qdrant".to_string(),
            details: format!("{status}: {body}"),
        });
    }
    Ok(response.json().await?)
}

fn vector_size(info: &Value) -> Option<usize> {
    info.pointer("/config/params/vectors/size")
        .and_then(Value::as_u64)
        .map(|size| size as usize)
}

fn build_filter(filters: &QueryFilters) -> Option<Value> {
    if filters.is_empty() {
        return None;
    }

    let mut must = Vec::new();
    if let Some(category) = filters.category_tag {
        must.push(json!({ "key": "category_tag", "match": { "value": category.as_str() } }));
    }
    if let Some(kind) = filters.document_type {
        must.push(json!({ "key": "document_type", "match": { "value": kind.as_str() } }));
    }
    if let Some(file) = &filters.source_file {
        must.push(json!({ "key": "source_file", "match": { "value": file } }));
    }
    Some(json!({ "must": must }))
}

fn point_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Whether hits past the `top_k`-th may still tie with it.
fn tie_may_continue(hits: &[RankedHit], top_k: usize, limit: usize) -> bool {
    if hits.len() < limit || top_k == 0 {
        return false;
    }
    let mut scores: Vec<f32> = hits.iter().map(|hit| hit.item.similarity_score).collect();
    scores.sort_by(|left, right| right.total_cmp(left));
    scores[top_k - 1] == scores[scores.len() - 1]
}

fn parse_category(value: Option<&str>) -> CategoryTag {
    value
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(CategoryTag::General)
}

fn parse_hit(hit: &Value) -> RankedHit {
    let text_at = |pointer: &str| {
        hit.pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    RankedHit {
        ordinal: hit
            .pointer("/payload/ordinal")
            .and_then(Value::as_u64)
            .unwrap_or(u64::MAX),
        item: QueryResultItem {
            chunk_id: text_at("/payload/chunk_id"),
            text: text_at("/payload/text"),
            similarity_score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
            source_path: text_at("/payload/source_path"),
            category_tag: parse_category(hit.pointer("/payload/category_tag").and_then(Value::as_str)),
        },
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend(&self) -> &str {
        "qdrant"
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        Ok(self.collection_info(collection).await?.is_some())
    }

    async fn collection_dimension(&self, collection: &str) -> Result<Option<usize>, StoreError> {
        Ok(self
            .collection_info(collection)
            .await?
            .as_ref()
            .and_then(vector_size))
    }

    async fn create_collection(
        &self,
        collection: &str,
        dimensions: usize,
    ) -> Result<(), StoreError> {
        if let Some(existing) = self.collection_dimension(collection).await? {
            if existing != dimensions {
                return Err(StoreError::DimensionMismatch {
                    expected: existing,
                    actual: dimensions,
                });
            }
            return Ok(());
        }

        debug!(collection, dimensions, "creating qdrant collection");
        let response = self
            .request(Method::PUT, &format!("collections/{collection}"))
            .json(&json!({
                "vectors": { "size": dimensions, "distance": "Cosine" }
            }))
            .send()
            .await?;
        ensure_success(response).await?;

        let response = self
            .request(
                Method::PUT,
                &format!("collections/{collection}/index?wait=true"),
            )
            .json(&json!({ "field_name": ORDINAL_FIELD, "field_schema": "integer" }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, chunks: &[Chunk]) -> Result<(), StoreError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let info = self
            .collection_info(collection)
            .await?
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;
        let dimensions = vector_size(&info).ok_or_else(|| StoreError::BackendResponse {
            backend: "qdrant".to_string(),
            details: format!("collection {collection} reports no vector size"),
        })?;
        for chunk in chunks {
            check_dimension(dimensions, &chunk.embedding_vector)?;
        }

        let ids: Vec<&str> = chunks.iter().map(|chunk| chunk.chunk_id.as_str()).collect();
        let mut ordinals = self.existing_ordinals(collection, &ids).await?;
        let mut next = self.next_ordinal(collection).await?;

        let points = chunks
            .iter()
            .map(|chunk| {
                let ordinal = *ordinals.entry(chunk.chunk_id.clone()).or_insert_with(|| {
                    next += 1;
                    next - 1
                });
                json!({
                    "id": chunk.chunk_id,
                    "vector": chunk.embedding_vector,
                    "payload": {
                        "chunk_id": chunk.chunk_id,
                        "source_path": chunk.parent_source_path,
                        "source_file": chunk.source_file(),
                        "text": chunk.text,
                        "sequence_index": chunk.sequence_index,
                        "category_tag": chunk.category_tag.as_str(),
                        "document_type": chunk.document_type.as_str(),
                        "ordinal": ordinal,
                    },
                })
            })
            .collect::<Vec<_>>();

        let response = self
            .request(
                Method::PUT,
                &format!("collections/{collection}/points?wait=true"),
            )
            .json(&json!({ "points": points }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<QueryResultItem>, StoreError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        // Qdrant cuts at `limit` in its own order, so widen the page until
        // the score at `top_k` is no longer tied with the last hit returned.
        let mut limit = top_k + 1;
        let hits = loop {
            let hits = self.search_page(collection, query_vector, limit, filters).await?;
            if !tie_may_continue(&hits, top_k, limit) {
                break hits;
            }
            debug!(collection, limit, "score tie at the cut; widening search");
            limit *= 2;
        };

        Ok(rank_hits(hits, top_k))
    }

    async fn delete_points(
        &self,
        collection: &str,
        chunk_ids: &[String],
    ) -> Result<(), StoreError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }

        let response = self
            .request(
                Method::POST,
                &format!("collections/{collection}/points/delete?wait=true"),
            )
            .json(&json!({ "points": chunk_ids }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let response = self
            .request(
                Method::POST,
                &format!("collections/{collection}/points/count"),
            )
            .json(&json!({ "exact": true }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::CollectionMissing(collection.to_string()));
        }
        let parsed = ensure_success(response).await?;
        Ok(parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), StoreError> {
        let response = self
            .request(Method::DELETE, &format!("collections/{collection}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response).await?;
        Ok(())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, StoreError> {
        let response = self.request(Method::GET, "aliases").send().await?;
        let parsed = ensure_success(response).await?;

        Ok(parsed
            .pointer("/result/aliases")
            .and_then(Value::as_array)
            .and_then(|aliases| {
                aliases.iter().find_map(|entry| {
                    let name = entry.get("alias_name").and_then(Value::as_str)?;
                    if name != alias {
                        return None;
                    }
                    entry
                        .get("collection_name")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
            }))
    }

    async fn swap_alias(&self, alias: &str, collection: &str) -> Result<(), StoreError> {
        let mut actions = Vec::new();
        if self.resolve_alias(alias).await?.is_some() {
            actions.push(json!({ "delete_alias": { "alias_name": alias } }));
        }
        actions.push(json!({
            "create_alias": { "collection_name": collection, "alias_name": alias }
        }));
        self.update_aliases(actions).await
    }

    async fn delete_alias(&self, alias: &str) -> Result<(), StoreError> {
        if self.resolve_alias(alias).await?.is_none() {
            return Ok(());
        }
        self.update_aliases(vec![json!({ "delete_alias": { "alias_name": alias } })])
            .await
    }
}
