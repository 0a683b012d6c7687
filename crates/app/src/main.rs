mod commands;
mod logging;
mod server;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use docchat_core::{
    CategoryTag, DocumentType, IndexReport, QueryFilters, RagService, Settings, DEFAULT_CONFIG_FILE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "docchat", version, about = "Chat with a folder of documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Env file read before the process environment.
    #[arg(long, global = true, env = "DOCCHAT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Create the working directories and check the configuration.
    Setup,
    /// Check every pipeline component against the configured backends.
    TestSystem,
    /// Index the document folder.
    Index {
        /// Rebuild even when a live index already exists.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Only re-embed files whose content changed since the last run.
        #[arg(long, default_value_t = false, conflicts_with = "force")]
        incremental: bool,
    },
    /// Answer one question from the indexed documents.
    Ask {
        question: String,
        /// Rebuild the index before answering.
        #[arg(long, default_value_t = false)]
        rebuild: bool,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Print the nearest chunks for a query without generating an answer.
    Search {
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Show index state and document folder statistics.
    Status,
    /// Delete the live collection and the index manifest.
    Cleanup,
    /// Serve the chat interface over HTTP.
    Serve,
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Restrict to one category (environmental, social, governance, general).
    #[arg(long)]
    category: Option<CategoryTag>,
    /// Restrict to one document type (pdf, text, markdown, archive_record).
    #[arg(long)]
    document_type: Option<DocumentType>,
    /// Restrict to one source file.
    #[arg(long)]
    source_file: Option<String>,
}

impl From<FilterArgs> for QueryFilters {
    fn from(args: FilterArgs) -> Self {
        Self {
            category_tag: args.category,
            document_type: args.document_type,
            source_file: args.source_file,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_loaded = match dotenvy::from_path(&cli.config) {
        Ok(()) => true,
        Err(error) if error.not_found() => false,
        Err(error) => {
            return Err(error).with_context(|| format!("reading {}", cli.config.display()))
        }
    };

    let settings = Settings::from_env_unchecked()?;
    let level_explicit = std::env::var("LOG_LEVEL").is_ok();
    logging::init_tracing(
        &settings.log_directive(level_explicit),
        Some(settings.log_file.as_path()),
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        config = %cli.config.display(),
        config_loaded,
        "docchat boot"
    );

    if !matches!(cli.command, Command::Setup) {
        settings
            .validate()
            .map_err(docchat_core::RagError::from)
            .map_err(|error| anyhow::anyhow!(error.user_message()))?;
    }

    run(cli.command, settings, &cli.config).await
}

async fn run(command: Command, settings: Settings, config: &Path) -> anyhow::Result<()> {
    match command {
        Command::Setup => commands::setup(&settings, config).await?,
        Command::TestSystem => commands::test_system(settings).await?,
        Command::Index { force, incremental } => {
            let service = RagService::from_settings(settings).await?;
            let report = if incremental {
                service.refresh().await?
            } else {
                service.rebuild(force).await?
            };
            print_report(&report);
        }
        Command::Ask {
            question,
            rebuild,
            filters,
        } => {
            let service = RagService::from_settings(settings).await?;
            let report = service.rebuild(rebuild).await?;
            print_report(&report);

            let answer = service.ask(&question, &filters.into()).await?;
            println!("\nquestion: {}", answer.question);
            println!("answer:\n{}", answer.answer);
            for source in &answer.sources {
                println!("  source={} score={:.4}", source.source_path, source.score);
            }
        }
        Command::Search {
            query,
            top_k,
            filters,
        } => {
            let service = RagService::from_settings(settings).await?;
            let top_k = top_k.unwrap_or(service.settings().top_k);
            let hits = service.search_similar(&query, top_k, &filters.into()).await?;
            println!("query: {query}");
            for hit in hits {
                println!(
                    "[{}] score={:.4} chunk={}",
                    hit.category_tag, hit.similarity_score, hit.chunk_id
                );
                println!("  source={}", hit.source_path);
                println!("  chunk_text:\n{}", hit.text);
            }
        }
        Command::Status => {
            let service = RagService::from_settings(settings).await?;
            let status = service.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Cleanup => {
            let service = RagService::from_settings(settings).await?;
            service.cleanup().await?;
            println!("index cleaned up");
        }
        Command::Serve => serve(settings).await?,
    }

    Ok(())
}

fn print_report(report: &IndexReport) {
    for skipped in &report.skipped {
        warn!(path = %skipped.path, reason = %skipped.reason, "skipped file");
    }
    println!(
        "{:?} index into {}: {} documents, {} chunks, {} skipped",
        report.mode,
        report.collection,
        report.documents,
        report.chunks,
        report.skipped.len()
    );
    if !report.removed_sources.is_empty() {
        println!("removed sources: {}", report.removed_sources.join(", "));
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let address = format!("{}:{}", settings.server_host, settings.server_port);
    let service = Arc::new(RagService::from_settings(settings).await?);

    if service.indexer().live_collection().await?.is_none() {
        let background = service.clone();
        tokio::spawn(async move {
            match background.rebuild(false).await {
                Ok(report) => info!(chunks = report.chunks, "initial index built"),
                Err(error) => warn!(error = %error, "initial index build failed"),
            }
        });
    }

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!(address = %address, "chat server listening");

    axum::serve(listener, server::create_router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
