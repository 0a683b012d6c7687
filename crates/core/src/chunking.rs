use crate::error::IngestError;
use crate::models::{source_file_of, CategoryTag, Chunk, IngestionOptions, RawDocument};
use std::path::Path;
use uuid::Uuid;

const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d0e_8a55_4b7e_9c1d_3e2f_a0b4_c5d6);

/// Character window settings for the splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, IngestError> {
        if chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {overlap} must be smaller than chunk size {chunk_size}"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

impl TryFrom<&IngestionOptions> for ChunkingConfig {
    type Error = IngestError;

    fn try_from(value: &IngestionOptions) -> Result<Self, Self::Error> {
        Self::new(value.chunk_size, value.chunk_overlap)
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Splits `text` into windows of `chunk_size` characters, each sharing `overlap`
/// characters with its predecessor. The last window may be shorter.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= config.chunk_size {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + config.chunk_size).min(chars.len());
        pieces.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += config.stride();
    }

    pieces
}

/// Inverse of [`split_text`]: drops the overlapped prefix of every chunk but the first.
pub fn merge_chunks<S: AsRef<str>>(chunks: &[S], overlap: usize) -> String {
    let mut merged = String::new();
    for (index, chunk) in chunks.iter().enumerate() {
        if index == 0 {
            merged.push_str(chunk.as_ref());
        } else {
            merged.extend(chunk.as_ref().chars().skip(overlap));
        }
    }
    merged
}

/// Splits a loaded document into chunks; embedding vectors are filled in later.
pub fn split_document(document: &RawDocument, config: ChunkingConfig) -> Vec<Chunk> {
    let category_tag = category_for(&document.source_path);

    split_text(&document.raw_text, config)
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let sequence_index = index as u64;
            Chunk {
                chunk_id: make_chunk_id(&document.source_path, sequence_index, &text),
                parent_source_path: document.source_path.clone(),
                text,
                sequence_index,
                category_tag,
                document_type: document.document_type,
                embedding_vector: Vec::new(),
            }
        })
        .collect()
}

fn category_for(source_path: &str) -> CategoryTag {
    let file_part = source_file_of(source_path);
    let name = Path::new(file_part)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(file_part);
    CategoryTag::from_file_name(name)
}

fn make_chunk_id(source_path: &str, index: u64, text: &str) -> String {
    let mut key = Vec::with_capacity(source_path.len() + text.len() + 10);
    key.extend_from_slice(source_path.as_bytes());
    key.push(0);
    key.extend_from_slice(&index.to_le_bytes());
    key.push(0);
    key.extend_from_slice(text.as_bytes());
    Uuid::new_v5(&CHUNK_NAMESPACE, &key).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentType;
    use serde_json::Map;

    fn document(path: &str, text: &str) -> RawDocument {
        RawDocument {
            source_path: path.to_string(),
            raw_text: text.to_string(),
            document_type: DocumentType::Text,
            extracted_at: chrono::Utc::now(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        let normalized = normalize_whitespace(input);
        assert_eq!(normalized, "A lot of spacing");
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(ChunkingConfig::new(0, 0).is_err());
        assert!(ChunkingConfig::new(10, 10).is_err());
        assert!(ChunkingConfig::new(10, 9).is_ok());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let config = ChunkingConfig::new(64, 8).unwrap();
        for text in ["", "tiny", "exactly sixty-four characters? no, but close enough here"] {
            assert_eq!(split_text(text, config), vec![text.to_string()]);
        }
    }

    #[test]
    fn consecutive_chunks_share_exactly_the_overlap() {
        let config = ChunkingConfig::new(10, 3).unwrap();
        let text = "abcdefghijklmnopqrstuvwxyz0123456789";
        let chunks = split_text(text, config);

        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().skip(pair[0].chars().count() - 3).collect();
            let head: String = pair[1].chars().take(3).collect();
            assert_eq!(tail, head);
        }
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 10));
    }

    #[test]
    fn merging_reconstructs_the_original_text() {
        let text = "Governance boards must include independent directors. \
                    Environmental policy reduces emissions by 20%. \
                    Ünïcödé text survives the round trip as well.";
        for (size, overlap) in [(7, 0), (7, 3), (16, 15), (50, 10), (1, 0)] {
            let config = ChunkingConfig::new(size, overlap).unwrap();
            let chunks = split_text(text, config);
            assert_eq!(merge_chunks(&chunks, overlap), text, "size={size} overlap={overlap}");
        }
    }

    #[test]
    fn last_chunk_may_be_shorter() {
        let config = ChunkingConfig::new(4, 1).unwrap();
        let chunks = split_text("abcdefghij", config);
        assert_eq!(chunks, vec!["abcd", "defg", "ghij"]);

        let chunks = split_text("abcdefghijk", config);
        assert_eq!(chunks, vec!["abcd", "defg", "ghij", "jk"]);
    }

    #[test]
    fn chunk_ids_are_deterministic_and_distinct() {
        let config = ChunkingConfig::new(8, 2).unwrap();
        let doc = document("/docs/board_minutes.txt", "one two three four five six");

        let first = split_document(&doc, config);
        let second = split_document(&doc, config);

        assert_eq!(first, second);
        assert_eq!(first[0].category_tag, CategoryTag::Governance);
        let mut ids: Vec<_> = first.iter().map(|chunk| chunk.chunk_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), first.len());
        assert!(first
            .iter()
            .enumerate()
            .all(|(index, chunk)| chunk.sequence_index == index as u64));
    }

    #[test]
    fn archive_records_are_categorized_by_their_file() {
        let config = ChunkingConfig::new(100, 0).unwrap();
        let doc = document("/exports/climate_tweets.json#3", "hot summer");
        assert_eq!(
            split_document(&doc, config)[0].category_tag,
            CategoryTag::Environmental
        );
    }

    #[test]
    fn hash_in_a_file_name_is_kept() {
        let config = ChunkingConfig::new(100, 0).unwrap();
        let doc = document("/docs/C#_board.txt", "Board minutes");
        let chunk = &split_document(&doc, config)[0];
        assert_eq!(chunk.category_tag, CategoryTag::Governance);
        assert_eq!(chunk.source_file(), "/docs/C#_board.txt");
    }
}
