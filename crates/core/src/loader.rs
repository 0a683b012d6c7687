use crate::error::IngestError;
use crate::extractor::extract_pdf_text;
use crate::models::{source_file_of, CategoryTag, DocumentType, IngestionOptions, RawDocument};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const DEFAULT_ARCHIVE_TEXT_FIELDS: [&str; 3] = ["full_text", "text", "content"];

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

/// One step of a directory load: either a document or something that was passed over.
#[derive(Debug, Clone)]
pub enum LoadEvent {
    Document(RawDocument),
    Skipped(SkippedFile),
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<RawDocument>,
    pub skipped: Vec<SkippedFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentStats {
    pub total_documents: usize,
    pub total_text_length: usize,
    pub document_types: BTreeMap<String, usize>,
    pub categories: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct DocumentLoader {
    root: PathBuf,
    options: IngestionOptions,
}

impl DocumentLoader {
    pub fn new(root: impl Into<PathBuf>, options: IngestionOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every regular file below the root, recursively, in sorted order.
    pub fn discover(&self) -> Result<Vec<PathBuf>, IngestError> {
        if !self.root.is_dir() {
            return Err(IngestError::InvalidArgument(format!(
                "document path {} does not exist or is not a directory",
                self.root.display()
            )));
        }

        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|item| item.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path().to_path_buf())
            .collect();

        files.sort_unstable();
        Ok(files)
    }

    /// Lazily loads every discovered file. Failures become [`LoadEvent::Skipped`]
    /// entries and are logged; they never end the iteration.
    pub fn iter(&self) -> Result<impl Iterator<Item = LoadEvent> + '_, IngestError> {
        let files = self.discover()?;
        Ok(files.into_iter().flat_map(move |path| self.load_events(&path)))
    }

    pub fn load_all(&self) -> Result<LoadReport, IngestError> {
        let mut report = LoadReport::default();
        for event in self.iter()? {
            match event {
                LoadEvent::Document(document) => report.documents.push(document),
                LoadEvent::Skipped(skipped) => report.skipped.push(skipped),
            }
        }
        Ok(report)
    }

    /// Loads a single file, turning any error into a logged skip.
    pub fn load_events(&self, path: &Path) -> Vec<LoadEvent> {
        match self.load_file(path) {
            Ok(events) => events,
            Err(error) => {
                warn!(path = %path.display(), reason = %error, "skipping file");
                vec![LoadEvent::Skipped(SkippedFile {
                    path: path.to_string_lossy().to_string(),
                    reason: error.to_string(),
                })]
            }
        }
    }

    pub fn load_file(&self, path: &Path) -> Result<Vec<LoadEvent>, IngestError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        let recognized = self
            .options
            .extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(&extension));
        if !recognized {
            return Err(IngestError::UnsupportedFormat(
                path.to_string_lossy().to_string(),
            ));
        }

        let source_path = path.to_string_lossy().to_string();
        let (raw_text, document_type) = match extension.as_str() {
            "pdf" => (extract_pdf_text(path)?, DocumentType::Pdf),
            "txt" => (fs::read_to_string(path)?, DocumentType::Text),
            "md" | "markdown" => (fs::read_to_string(path)?, DocumentType::Markdown),
            "json" => {
                let raw = fs::read_to_string(path)?;
                return load_archive(&source_path, &raw, self.options.archive_text_field.as_deref());
            }
            _ => return Err(IngestError::UnsupportedFormat(source_path)),
        };

        if raw_text.trim().is_empty() {
            return Err(IngestError::EmptyDocument(source_path));
        }

        debug!(path = %source_path, kind = %document_type, chars = raw_text.len(), "loaded document");
        Ok(vec![LoadEvent::Document(RawDocument {
            source_path,
            raw_text,
            document_type,
            extracted_at: Utc::now(),
            metadata: Map::new(),
        })])
    }
}

/// Parses a social-archive export: a JSON array whose records each become one document.
pub fn load_archive(
    source_path: &str,
    raw: &str,
    text_field: Option<&str>,
) -> Result<Vec<LoadEvent>, IngestError> {
    let parsed: Value = serde_json::from_str(raw)?;
    let records = parsed.as_array().ok_or_else(|| {
        IngestError::InvalidArchive(format!("{source_path}: top-level value is not an array"))
    })?;

    let extracted_at = Utc::now();
    let events = records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let record_path = format!("{source_path}#{index}");
            match record_text(record, text_field) {
                Some((text, metadata)) => LoadEvent::Document(RawDocument {
                    source_path: record_path,
                    raw_text: text,
                    document_type: DocumentType::ArchiveRecord,
                    extracted_at,
                    metadata,
                }),
                None => {
                    warn!(record = %record_path, "archive record has no text field");
                    LoadEvent::Skipped(SkippedFile {
                        path: record_path,
                        reason: "record has no text field".to_string(),
                    })
                }
            }
        })
        .collect();

    Ok(events)
}

fn record_text(record: &Value, text_field: Option<&str>) -> Option<(String, Map<String, Value>)> {
    if let Some(pointer) = text_field.filter(|field| field.starts_with('/')) {
        let text = record.pointer(pointer)?.as_str()?.trim();
        if text.is_empty() {
            return None;
        }
        let metadata = record.as_object().cloned().unwrap_or_default();
        return Some((text.to_string(), metadata));
    }

    let object = record.as_object()?;
    let fields: Vec<&str> = match text_field {
        Some(field) => vec![field],
        None => DEFAULT_ARCHIVE_TEXT_FIELDS.to_vec(),
    };

    // Exports such as `[{"tweet": {...}}]` wrap each record in a single key.
    let container = match object.values().next() {
        Some(Value::Object(inner)) if object.len() == 1 => inner,
        _ => object,
    };

    fields.iter().find_map(|field| {
        let text = container.get(*field)?.as_str()?.trim();
        if text.is_empty() {
            return None;
        }
        let mut metadata = container.clone();
        metadata.remove(*field);
        Some((text.to_string(), metadata))
    })
}

pub fn document_stats(documents: &[RawDocument]) -> DocumentStats {
    let mut stats = DocumentStats {
        total_documents: documents.len(),
        ..DocumentStats::default()
    };

    for document in documents {
        stats.total_text_length += document.raw_text.chars().count();
        *stats
            .document_types
            .entry(document.document_type.to_string())
            .or_default() += 1;

        let file_part = source_file_of(&document.source_path);
        let name = Path::new(file_part)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(file_part);
        *stats
            .categories
            .entry(CategoryTag::from_file_name(name).to_string())
            .or_default() += 1;
    }

    stats
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
