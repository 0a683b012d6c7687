use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::llm::LanguageModel;
use crate::models::{Answer, QueryFilters, QueryResultItem, SourceCitation};
use crate::traits::VectorStore;
use regex::Regex;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

/// Returned verbatim when retrieval leaves nothing to answer from.
pub const NO_CONTEXT_ANSWER: &str =
    "I could not find relevant information in the indexed documents to answer this question.";

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub required_keywords: Vec<String>,
    pub excluded_keywords: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.7,
            required_keywords: Vec::new(),
            excluded_keywords: Vec::new(),
        }
    }
}

/// Whole-word, case-insensitive term matchers.
#[derive(Debug, Clone)]
struct TermFilter {
    required: Vec<Regex>,
    excluded: Vec<Regex>,
}

impl TermFilter {
    fn new(required: &[String], excluded: &[String]) -> Result<Self> {
        Ok(Self {
            required: compile_terms(required)?,
            excluded: compile_terms(excluded)?,
        })
    }

    fn keeps(&self, text: &str) -> bool {
        term_check(text, &self.required) && !contains_any_term(text, &self.excluded)
    }
}

fn compile_terms(terms: &[String]) -> Result<Vec<Regex>> {
    terms
        .iter()
        .map(|term| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))).map_err(|error| {
                RagError::InvalidConfiguration(format!("keyword {term:?}: {error}"))
            })
        })
        .collect()
}

fn term_check(text: &str, required: &[Regex]) -> bool {
    required.iter().all(|term| term.is_match(text))
}

fn contains_any_term(text: &str, terms: &[Regex]) -> bool {
    terms.iter().any(|term| term.is_match(text))
}

pub struct QueryEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn LanguageModel>,
    collection: String,
    config: RetrievalConfig,
    terms: TermFilter,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
        collection: impl Into<String>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        let terms = TermFilter::new(&config.required_keywords, &config.excluded_keywords)?;
        Ok(Self {
            store,
            embedder,
            model,
            collection: collection.into(),
            config,
            terms,
        })
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Nearest chunks for a question, without threshold or keyword filtering.
    pub async fn search_similar(
        &self,
        question: &str,
        top_k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<QueryResultItem>> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::InvalidRequest("question is empty".to_string()));
        }
        if top_k == 0 {
            return Err(RagError::InvalidRequest("top_k must be positive".to_string()));
        }

        let query_vector = self.embedder.embed(question).await?;
        let hits = self
            .store
            .search(&self.collection, &query_vector, top_k, filters)
            .await?;
        debug!(collection = %self.collection, hits = hits.len(), "similarity search");
        Ok(hits)
    }

    /// Retrieval candidates that pass the similarity threshold and keyword rules.
    pub async fn retrieve(
        &self,
        question: &str,
        filters: &QueryFilters,
    ) -> Result<Vec<QueryResultItem>> {
        let hits = self
            .search_similar(question, self.config.top_k, filters)
            .await?;
        let total = hits.len();

        let kept: Vec<_> = hits
            .into_iter()
            .filter(|hit| hit.similarity_score >= self.config.similarity_threshold)
            .filter(|hit| self.terms.keeps(&hit.text))
            .collect();

        debug!(
            candidates = total,
            kept = kept.len(),
            threshold = self.config.similarity_threshold,
            "filtered retrieval candidates"
        );
        Ok(kept)
    }

    pub async fn ask(&self, question: &str, filters: &QueryFilters) -> Result<Answer> {
        let context = self.retrieve(question, filters).await?;
        let question = question.trim();

        if context.is_empty() {
            info!(question, "no relevant context; skipping generation");
            return Ok(Answer {
                question: question.to_string(),
                answer: NO_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
                context_found: false,
            });
        }

        let prompt = build_prompt(question, &context);
        let answer = self.model.complete(&prompt).await?;
        info!(
            question,
            sources = context.len(),
            model = self.model.model_name(),
            "answered question"
        );

        Ok(Answer {
            question: question.to_string(),
            answer: answer.trim().to_string(),
            sources: context
                .into_iter()
                .map(|item| SourceCitation {
                    source_path: item.source_path,
                    score: item.similarity_score,
                })
                .collect(),
            context_found: true,
        })
    }
}

pub fn build_prompt(question: &str, context: &[QueryResultItem]) -> String {
    let mut prompt = String::from(
        "Use the numbered context passages below to answer the question. \
Cite the passages you rely on by their source. \
If the context is insufficient, say so clearly.\n\nContext:\n",
    );
    for (position, item) in context.iter().enumerate() {
        let _ = write!(
            prompt,
            "\n[{}] (source: {}, category: {})\n{}\n",
            position + 1,
            item.source_path,
            item.category_tag,
            item.text
        );
    }
    let _ = write!(prompt, "\nQuestion: {question}\nAnswer:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::models::{CategoryTag, Chunk, DocumentType};
    use crate::stores::LocalStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Puts a text on the axis of the first keyword it mentions.
    struct AxisEmbedder;

    const AXES: [&str; 3] = ["governance", "emissions", "water"];

    fn axis_vector(text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        let mut vector = vec![0.0; AXES.len() + 1];
        match AXES.iter().position(|axis| lowered.contains(axis)) {
            Some(index) => vector[index] = 1.0,
            None => vector[AXES.len()] = 1.0,
        }
        vector
    }

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn dimensions(&self) -> usize {
            AXES.len() + 1
        }

        fn model_name(&self) -> &str {
            "axis"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            Ok(texts.iter().map(|text| axis_vector(text)).collect())
        }
    }

    #[derive(Default)]
    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for CountingModel {
        fn model_name(&self) -> &str {
            "counting"
        }

        async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("answered from {} bytes", prompt.len()))
        }
    }

    async fn seeded_store(texts: &[(&str, &str)]) -> Arc<LocalStore> {
        let store = Arc::new(LocalStore::in_memory());
        store.create_collection("docs", 4).await.expect("collection");
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(index, (path, text))| Chunk {
                chunk_id: format!("chunk-{index}"),
                parent_source_path: path.to_string(),
                text: text.to_string(),
                sequence_index: 0,
                category_tag: CategoryTag::from_file_name(path),
                document_type: DocumentType::Text,
                embedding_vector: axis_vector(text),
            })
            .collect();
        store.upsert("docs", &chunks).await.expect("upsert");
        store
    }

    fn engine(
        store: Arc<LocalStore>,
        model: Arc<CountingModel>,
        config: RetrievalConfig,
    ) -> QueryEngine {
        QueryEngine::new(store, Arc::new(AxisEmbedder), model, "docs", config).expect("engine")
    }

    #[tokio::test]
    async fn answers_with_sources_above_threshold() {
        let store = seeded_store(&[
            ("/docs/governance.txt", "Governance boards must include independent directors."),
            ("/docs/climate.txt", "Environmental policy reduces emissions by 20%."),
        ])
        .await;
        let model = Arc::new(CountingModel::default());
        let engine = engine(store, model.clone(), RetrievalConfig::default());

        let answer = engine
            .ask("What governance practices are recommended?", &QueryFilters::default())
            .await
            .expect("answer");

        assert!(answer.context_found);
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].source_path, "/docs/governance.txt");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn below_threshold_skips_the_model() {
        let store = seeded_store(&[("/docs/climate.txt", "Emissions fell sharply.")]).await;
        let model = Arc::new(CountingModel::default());
        let engine = engine(store, model.clone(), RetrievalConfig::default());

        let answer = engine
            .ask("How is water usage tracked?", &QueryFilters::default())
            .await
            .expect("answer");

        assert!(!answer.context_found);
        assert_eq!(answer.answer, NO_CONTEXT_ANSWER);
        assert!(answer.sources.is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn keyword_rules_use_whole_words() {
        let store = seeded_store(&[
            ("/docs/a.txt", "Governance of the boardroom is private."),
            ("/docs/b.txt", "Governance: the board meets quarterly."),
        ])
        .await;
        let model = Arc::new(CountingModel::default());
        let config = RetrievalConfig {
            required_keywords: vec!["BOARD".to_string()],
            ..RetrievalConfig::default()
        };
        let engine = engine(store, model, config);

        let kept = engine
            .retrieve("governance", &QueryFilters::default())
            .await
            .expect("retrieve");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_path, "/docs/b.txt");
    }

    #[tokio::test]
    async fn excluded_keywords_drop_candidates() {
        let store = seeded_store(&[
            ("/docs/a.txt", "Governance draft, confidential."),
            ("/docs/b.txt", "Governance summary."),
        ])
        .await;
        let config = RetrievalConfig {
            excluded_keywords: vec!["confidential".to_string()],
            ..RetrievalConfig::default()
        };
        let engine = engine(store, Arc::new(CountingModel::default()), config);

        let kept = engine
            .retrieve("governance", &QueryFilters::default())
            .await
            .expect("retrieve");
        let paths: Vec<_> = kept.iter().map(|item| item.source_path.as_str()).collect();
        assert_eq!(paths, vec!["/docs/b.txt"]);
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let store = seeded_store(&[]).await;
        let engine = engine(
            store,
            Arc::new(CountingModel::default()),
            RetrievalConfig::default(),
        );
        let result = engine.ask("   ", &QueryFilters::default()).await;
        assert!(matches!(result, Err(RagError::InvalidRequest(_))));
    }

    #[test]
    fn prompt_numbers_context_blocks() {
        let context = vec![QueryResultItem {
            chunk_id: "1".to_string(),
            text: "Boards meet quarterly.".to_string(),
            similarity_score: 0.9,
            source_path: "/docs/board.txt".to_string(),
            category_tag: CategoryTag::Governance,
        }];
        let prompt = build_prompt("How often do boards meet?", &context);
        assert!(prompt.contains("[1] (source: /docs/board.txt, category: governance)"));
        assert!(prompt.ends_with("Question: How often do boards meet?\nAnswer:"));
    }
}
