use crate::chunking::normalize_whitespace;
use crate::error::IngestError;
use lopdf::Document;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

/// Extracts the whole text of a PDF, one normalized paragraph per page.
pub fn extract_pdf_text(path: &Path) -> Result<String, IngestError> {
    let pages = LopdfExtractor.extract_pages(path)?;
    Ok(join_pages(&pages))
}

fn join_pages(pages: &[PageText]) -> String {
    pages
        .iter()
        .map(|page| normalize_whitespace(&page.text))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_joined_with_blank_lines() {
        let pages = vec![
            PageText {
                number: 1,
                text: "First   page\ntext".to_string(),
            },
            PageText {
                number: 2,
                text: "   ".to_string(),
            },
            PageText {
                number: 3,
                text: "Third".to_string(),
            },
        ];

        assert_eq!(join_pages(&pages), "First page text\n\nThird");
    }

    #[test]
    fn broken_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%broken")?;

        let result = extract_pdf_text(&path);
        assert!(matches!(result, Err(IngestError::PdfParse(_))));
        Ok(())
    }
}
