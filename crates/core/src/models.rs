use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Pdf,
    Text,
    Markdown,
    ArchiveRecord,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::ArchiveRecord => "archive_record",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "text" | "txt" => Ok(Self::Text),
            "markdown" | "md" => Ok(Self::Markdown),
            "archive_record" | "archive" => Ok(Self::ArchiveRecord),
            other => Err(format!("unknown document type: {other}")),
        }
    }
}

/// Topical label inferred from a source file name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CategoryTag {
    Environmental,
    Social,
    Governance,
    General,
}

impl CategoryTag {
    pub fn from_file_name(name: &str) -> Self {
        const ENVIRONMENTAL: [&str; 3] = ["carbon", "climate", "emission"];
        const SOCIAL: [&str; 4] = ["social", "human", "labor", "community"];
        const GOVERNANCE: [&str; 4] = ["governance", "board", "compliance", "risk"];

        let lowered = name.to_lowercase();
        let matches = |keywords: &[&str]| keywords.iter().any(|keyword| lowered.contains(keyword));

        if matches(&ENVIRONMENTAL) {
            Self::Environmental
        } else if matches(&SOCIAL) {
            Self::Social
        } else if matches(&GOVERNANCE) {
            Self::Governance
        } else {
            Self::General
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Environmental => "environmental",
            Self::Social => "social",
            Self::Governance => "governance",
            Self::General => "general",
        }
    }
}

impl fmt::Display for CategoryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategoryTag {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "environmental" => Ok(Self::Environmental),
            "social" => Ok(Self::Social),
            "governance" => Ok(Self::Governance),
            "general" => Ok(Self::General),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    pub source_path: String,
    pub raw_text: String,
    pub document_type: DocumentType,
    pub extracted_at: DateTime<Utc>,
    /// Fields of an archive record other than its text; empty for files.
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub parent_source_path: String,
    pub text: String,
    pub sequence_index: u64,
    pub category_tag: CategoryTag,
    pub document_type: DocumentType,
    pub embedding_vector: Vec<f32>,
}

impl Chunk {
    /// The file a chunk came from, without an archive record suffix.
    pub fn source_file(&self) -> &str {
        source_file_of(&self.parent_source_path)
    }
}

/// Strips a trailing `#<record index>`; any other `#` belongs to the file name.
pub fn source_file_of(source_path: &str) -> &str {
    match source_path.rsplit_once('#') {
        Some((file, index))
            if !index.is_empty() && index.bytes().all(|byte| byte.is_ascii_digit()) =>
        {
            file
        }
        _ => source_path,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResultItem {
    pub chunk_id: String,
    pub text: String,
    pub similarity_score: f32,
    pub source_path: String,
    pub category_tag: CategoryTag,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct QueryFilters {
    pub category_tag: Option<CategoryTag>,
    pub document_type: Option<DocumentType>,
    /// Exact file path; matches every record of an archive file.
    pub source_file: Option<String>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.category_tag.is_none() && self.document_type.is_none() && self.source_file.is_none()
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.category_tag
            .map_or(true, |category| chunk.category_tag == category)
            && self
                .document_type
                .map_or(true, |kind| chunk.document_type == kind)
            && self
                .source_file
                .as_deref()
                .map_or(true, |file| chunk.source_file() == file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceCitation {
    pub source_path: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub question: String,
    pub answer: String,
    pub sources: Vec<SourceCitation>,
    /// False when nothing passed the retrieval filters and the model was not consulted.
    pub context_found: bool,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub extensions: Vec<String>,
    pub archive_text_field: Option<String>,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            extensions: ["pdf", "txt", "md", "markdown", "json"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            archive_text_field: None,
        }
    }
}
