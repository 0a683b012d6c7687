//! One-shot CLI flows: first-time setup and the component self-check.

use anyhow::{bail, Context};
use docchat_core::{
    download_model, DocumentLoader, EmbeddingProvider, QueryFilters, RagError, RagService,
    Settings,
};
use std::path::{Path, PathBuf};

const PLACEHOLDER_KEY: &str = "your_openai_api_key_here";
const SMOKE_QUESTION: &str = "What topics do these documents cover?";

/// Creates the working directories, fetches the local embedding model and
/// reports whether the service can start.
pub async fn setup(settings: &Settings, config_file: &Path) -> anyhow::Result<()> {
    println!("docchat setup");

    let log_dir = settings
        .log_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("logs"));
    for directory in [
        settings.document_path.as_path(),
        settings.index_storage_path.as_path(),
        settings.qdrant_data_path.as_path(),
        log_dir.as_path(),
    ] {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("creating {}", directory.display()))?;
        println!("  created directory: {}", directory.display());
    }

    if !config_file.exists() {
        println!("  {} not found; settings come from the environment only", config_file.display());
    }

    let key_is_placeholder = settings.openai_api_key.as_deref() == Some(PLACEHOLDER_KEY);
    if settings.needs_openai() && key_is_placeholder {
        bail!("OPENAI_API_KEY in {} is still the placeholder value", config_file.display());
    }
    settings
        .validate()
        .map_err(RagError::from)
        .map_err(|error| anyhow::anyhow!(error.user_message()))?;
    println!("  configuration looks good");

    if settings.embedding_provider == EmbeddingProvider::Local {
        let written = download_model(
            &settings.model_download_url,
            &settings.embedding_model,
            &settings.embedding_model_path,
        )
        .await
        .with_context(|| format!("downloading {}", settings.embedding_model))?;
        println!(
            "  embedding model {} in {} ({} files fetched)",
            settings.embedding_model,
            settings.embedding_model_path.display(),
            written.len()
        );
    }

    let loader = DocumentLoader::new(&settings.document_path, settings.ingestion_options());
    let files = loader.discover()?.len();
    if files == 0 {
        println!(
            "  no documents in {} yet; add files before indexing",
            settings.document_path.display()
        );
    } else {
        println!("  found {files} files in {}", settings.document_path.display());
    }

    println!("setup completed. Next: `docchat test-system`, then `docchat serve`.");
    Ok(())
}

struct Check {
    name: &'static str,
    passed: bool,
}

/// Exercises each component against the configured backends and prints a summary.
pub async fn test_system(settings: Settings) -> anyhow::Result<()> {
    println!("docchat system test");
    let mut checks = Vec::new();

    println!("\nconfiguration");
    println!("  chat model: {:?} {}", settings.llm_provider, settings.openai_model);
    println!("  embedding: {:?} {}", settings.embedding_provider, settings.embedding_model);
    println!("  documents: {}", settings.document_path.display());
    println!("  collection: {}", settings.collection_name);
    println!("  manifest: {}", settings.manifest_path().display());
    checks.push(Check {
        name: "configuration",
        passed: true,
    });

    let service = match RagService::from_settings(settings).await {
        Ok(service) => service,
        Err(error) => {
            println!("  service could not start: {}", error.user_message());
            bail!("system test failed: {error}");
        }
    };

    println!("\ndocument loader");
    let loaded = match service.document_stats().await {
        Ok(stats) => {
            println!("  documents: {}", stats.total_documents);
            println!("  total text length: {}", stats.total_text_length);
            println!("  document types: {:?}", stats.document_types);
            println!("  categories: {:?}", stats.categories);
            stats.total_documents > 0
        }
        Err(error) => {
            println!("  failed: {error}");
            false
        }
    };
    checks.push(Check {
        name: "document loader",
        passed: loaded,
    });

    println!("\nindexing");
    let indexed = if loaded {
        match service.rebuild(false).await {
            Ok(report) => {
                println!("  {:?} index into {}", report.mode, report.collection);
                println!("  chunks: {}", report.chunks);
                true
            }
            Err(error) => {
                println!("  failed: {}", error.user_message());
                false
            }
        }
    } else {
        println!("  skipped: no documents to index");
        false
    };
    if let Ok(status) = service.status().await {
        println!("  state: {:?}", status.state);
        println!("  points: {:?}", status.point_count);
    }
    checks.push(Check {
        name: "index",
        passed: indexed,
    });

    println!("\nretrieval");
    let retrieved = if indexed {
        match service
            .search_similar(SMOKE_QUESTION, 3, &QueryFilters::default())
            .await
        {
            Ok(hits) => {
                for hit in &hits {
                    println!("  {:.4} {}", hit.similarity_score, hit.source_path);
                }
                !hits.is_empty()
            }
            Err(error) => {
                println!("  failed: {}", error.user_message());
                false
            }
        }
    } else {
        println!("  skipped: index unavailable");
        false
    };
    checks.push(Check {
        name: "retrieval",
        passed: retrieved,
    });

    println!("\nquery engine");
    let answered = if indexed {
        match service.ask(SMOKE_QUESTION, &QueryFilters::default()).await {
            Ok(answer) => {
                println!("  question: {}", answer.question);
                println!("  context found: {}", answer.context_found);
                println!("  sources: {}", answer.sources.len());
                println!("  answer: {}", answer.answer);
                true
            }
            Err(error) => {
                println!("  failed: {}", error.user_message());
                false
            }
        }
    } else {
        println!("  skipped: index unavailable");
        false
    };
    checks.push(Check {
        name: "query engine",
        passed: answered,
    });

    println!("\nsummary");
    for check in &checks {
        println!("  {:<18} {}", check.name, if check.passed { "PASS" } else { "FAIL" });
    }
    let passed = checks.iter().filter(|check| check.passed).count();
    println!("  {passed}/{} checks passed", checks.len());

    if passed != checks.len() {
        bail!("{} checks failed", checks.len() - passed);
    }
    Ok(())
}
