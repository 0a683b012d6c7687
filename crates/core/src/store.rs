use crate::error::StoreError;
use crate::models::{Chunk, QueryResultItem};

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot = left.iter().zip(right).map(|(a, b)| a * b).sum::<f32>();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    let denom = left_norm * right_norm;
    if denom <= f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

pub fn check_dimension(expected: usize, vector: &[f32]) -> Result<(), StoreError> {
    if vector.len() != expected {
        return Err(StoreError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// A scored candidate carrying the position it was inserted at.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub ordinal: u64,
    pub item: QueryResultItem,
}

impl RankedHit {
    pub fn new(ordinal: u64, chunk: &Chunk, score: f32) -> Self {
        Self {
            ordinal,
            item: QueryResultItem {
                chunk_id: chunk.chunk_id.clone(),
                text: chunk.text.clone(),
                similarity_score: score,
                source_path: chunk.parent_source_path.clone(),
                category_tag: chunk.category_tag,
            },
        }
    }
}

/// Orders by descending score, breaking ties by insertion ordinal, and keeps `top_k`.
pub fn rank_hits(mut hits: Vec<RankedHit>, top_k: usize) -> Vec<QueryResultItem> {
    hits.sort_by(|left, right| {
        right
            .item
            .similarity_score
            .total_cmp(&left.item.similarity_score)
            .then(left.ordinal.cmp(&right.ordinal))
    });
    hits.into_iter().take(top_k).map(|hit| hit.item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CategoryTag, DocumentType};

    fn chunk(id: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            parent_source_path: format!("/docs/{id}.txt"),
            text: id.to_string(),
            sequence_index: 0,
            category_tag: CategoryTag::General,
            document_type: DocumentType::Text,
            embedding_vector: Vec::new(),
        }
    }

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        let score = cosine_similarity(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]);
        assert!((score - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let hits = vec![
            RankedHit::new(2, &chunk("c"), 0.5),
            RankedHit::new(0, &chunk("a"), 0.5),
            RankedHit::new(1, &chunk("b"), 0.9),
            RankedHit::new(3, &chunk("d"), 0.1),
        ];

        let ranked = rank_hits(hits, 3);
        let ids: Vec<_> = ranked.iter().map(|item| item.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn dimension_check_reports_both_sizes() {
        let error = check_dimension(3, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            error,
            StoreError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }
}
