use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;

use bankrag::config::{self, Settings};
use bankrag::database;
use bankrag::embeddings;
use bankrag::guardrails::{GuardrailPolicy, ProductClassifier};
use bankrag::index::IndexHandle;
use bankrag::indexer;
use bankrag::logging::init_logging;
use bankrag::search::RetrievalEngine;
use bankrag::server;
use bankrag::{RagError, RagPipeline};

#[derive(Parser)]
#[command(name = "bankrag")]
#[command(version = "0.1")]
#[command(about = "Question answering over the bank's product documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index from the product PDFs
    Build,
    /// Answer one question (argument or stdin)
    Ask { query: Option<String> },
    /// Show raw retrieval with distances
    Search { query: Option<String> },
    /// Show the guardrail verdict and product tag
    Classify { query: Option<String> },
    /// List indexed chunks
    List,
    /// Interactive console
    Chat,
    /// Run the HTTP service
    Serve,
    /// Print the resolved configuration
    Config,
}

fn read_query(query: Option<String>) -> Result<String> {
    match query {
        Some(query) => Ok(query),
        None => {
            let mut input = String::new();
            io::stdin()
                .read_to_string(&mut input)
                .context("failed to read query from stdin")?;
            Ok(input.trim().to_string())
        }
    }
}

fn build_command(settings: &Settings) -> Result<()> {
    let embedder = embeddings::from_settings(settings)?;
    let manifest = indexer::build_index(settings, embedder.as_ref())?;
    let output = serde_json::json!({
        "index_dir": settings.index_dir.display().to_string(),
        "embedding_model": manifest.embedding_model,
        "dimension": manifest.dimension,
        "chunk_count": manifest.chunk_count,
        "documents": manifest.documents,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn ask_command(settings: &Settings, query: Option<String>) -> Result<()> {
    let query = read_query(query)?;
    let pipeline = RagPipeline::from_settings(settings)?;
    let answer = pipeline.answer(&query)?;
    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(())
}

fn search_command(settings: &Settings, query: Option<String>) -> Result<()> {
    let query = read_query(query)?;
    let embedder = embeddings::from_settings(settings)?;
    let index = IndexHandle::open_lazily(&settings.index_dir, embedder.model_name());
    let engine = RetrievalEngine::new(embedder, index);
    let snapshot = engine.snapshot()?;
    let result = engine.retrieve(&query, settings.top_k)?;

    let output = serde_json::json!({
        "query": query,
        "database_record_count": snapshot.len(),
        "results": result.hits.iter().map(|hit| {
            serde_json::json!({
                "id": hit.chunk.id,
                "doc_id": hit.chunk.doc_id,
                "page": hit.chunk.page,
                "distance": hit.distance,
                "text": hit.chunk.text,
            })
        }).collect::<Vec<_>>(),
        "actual_results_count": result.len(),
        "requested_results_count": settings.top_k
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn classify_command(settings: &Settings, query: Option<String>) -> Result<()> {
    let query = read_query(query)?;
    let policy = GuardrailPolicy::from_rule_sets(&settings.guardrails);
    let products = ProductClassifier::new(&settings.products);
    let output = serde_json::json!({
        "verdict": format!("{:?}", policy.classify(&query)),
        "product": format!("{:?}", products.tag(&query)),
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn list_command(settings: &Settings) -> Result<()> {
    let snapshot = database::load_index(&settings.index_dir, &settings.embedding_model_name())?;
    for chunk in snapshot.chunks().iter() {
        println!("{}\t{}\t{}", chunk.id, chunk.doc_id, chunk.page);
    }
    Ok(())
}

fn chat_command(settings: &Settings) -> Result<()> {
    let pipeline = RagPipeline::from_settings(settings)?;
    pipeline.warm_up()?;
    println!("Ask about credit cards, deposits or mortgage loans. Type 'exit' to quit.");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else { break };
        let line = line?;
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query.to_lowercase().as_str(), "exit" | "quit") {
            break;
        }
        match pipeline.answer(query) {
            Ok(answer) => {
                println!("\n{}\n", answer.answer);
                if answer.is_refusal() {
                    tracing::debug!(outcome = ?answer.outcome, "query refused");
                    continue;
                }
                for source in &answer.sources {
                    println!("  - {} (page {})", source.source_file, source.page);
                }
            }
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => eprintln!("error: {err}"),
        }
    }
    Ok(())
}

fn serve_command(settings: &Settings) -> Result<()> {
    let pipeline = Arc::new(RagPipeline::from_settings(settings)?);
    // missing or mismatched index stops the process before binding
    let snapshot = pipeline.warm_up()?;
    tracing::info!(chunks = snapshot.len(), "index ready");

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(server::serve(pipeline.clone(), &settings.bind))?;
    Ok(())
}

fn main() -> Result<()> {
    init_logging(config::verbose_enabled());
    let args = Cli::parse();
    let settings = Settings::new()?;

    let outcome = match args.command {
        Commands::Build => build_command(&settings),
        Commands::Ask { query } => ask_command(&settings, query),
        Commands::Search { query } => search_command(&settings, query),
        Commands::Classify { query } => classify_command(&settings, query),
        Commands::List => list_command(&settings),
        Commands::Chat => chat_command(&settings),
        Commands::Serve => serve_command(&settings),
        Commands::Config => {
            settings.print_config();
            Ok(())
        }
    };

    if let Err(err) = &outcome {
        if let Some(RagError::EmptyQuery) = err.downcast_ref::<RagError>() {
            eprintln!("Please provide a question.");
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn every_subcommand_has_help() {
        let cli = Cli::command();
        for sub in cli.get_subcommands() {
            assert!(sub.get_about().is_some(), "{} has no help line", sub.get_name());
        }
        let config = cli.find_subcommand("config").unwrap();
        assert_eq!(
            config.get_about().unwrap().to_string(),
            "Print the resolved configuration"
        );
    }
}
