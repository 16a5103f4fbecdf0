use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use basket_answer::RagPipeline;
use basket_cli::{index_documents, read_documents, ExtractiveCompleter};
use basket_core::config::RagConfig;
use basket_core::logging::init_tracing;
use basket_core::store::MemoryDocumentStore;
use basket_core::traits::{Embedder, VectorIndex};
use basket_embed::default_embedder;
use basket_hybrid::HybridRetriever;
use basket_search::{SearchOptions, SemanticSearchEngine};
use basket_vector::open_index;

#[derive(Parser)]
#[command(name = "basket", about = "Index, search and ask questions over document baskets")]
struct Cli {
    /// Directory holding config.toml and config.<env>.toml.
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,
    #[arg(long, env = "RUST_ENV", default_value = "dev")]
    env: String,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Embed a JSONL corpus into the configured backend.
    Index { file: PathBuf },
    /// Rank documents for a query.
    Search {
        query: String,
        /// JSONL corpus used to resolve hits (and to fill an empty index).
        #[arg(long)]
        docs: PathBuf,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        #[arg(long)]
        basket: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Answer a question from the retrieved documents.
    Ask {
        query: String,
        #[arg(long)]
        docs: PathBuf,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        #[arg(long)]
        basket: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print backend statistics.
    Stats,
}

struct Components {
    config: Arc<RagConfig>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl Components {
    async fn open(cli: &Cli) -> anyhow::Result<Self> {
        let config = RagConfig::load_from(&cli.config_dir, &cli.env).map_err(|e| {
            eprintln!("Error loading config: {e}");
            e
        })?;
        let index = open_index(&config, &cli.config_dir)?;
        index.initialize().await?;
        let embedder = default_embedder(config.embedding_dimension, config.max_cache_entries);
        Ok(Self { config: Arc::new(config), index, embedder })
    }

    async fn index(&self, documents: &[basket_core::Document]) -> anyhow::Result<usize> {
        let progress = ProgressBar::new(documents.len() as u64);
        progress.set_style(ProgressStyle::with_template("{bar:40} {pos}/{len} documents ({eta})")?);
        let indexed = index_documents(self.index.as_ref(), self.embedder.as_ref(), documents, &progress).await?;
        progress.finish_and_clear();
        Ok(indexed)
    }

    /// Load the corpus into a document store, indexing it first when the
    /// backend is empty.
    async fn engine(&self, docs: &Path) -> anyhow::Result<Arc<SemanticSearchEngine>> {
        let documents = read_documents(docs)?;
        if self.index.count().await? == 0 {
            let n = self.index(&documents).await?;
            tracing::info!(documents = n, "index was empty; indexed corpus");
        }
        let store = Arc::new(MemoryDocumentStore::from_documents(documents));
        Ok(Arc::new(SemanticSearchEngine::new(&self.config, self.index.clone(), self.embedder.clone(), store)))
    }
}

fn options(basket: Option<String>) -> SearchOptions {
    SearchOptions { basket_id: basket, ..SearchOptions::default() }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let components = Components::open(&cli).await?;

    match cli.command {
        Command::Index { ref file } => {
            let documents = read_documents(file)?;
            println!("Indexing {} documents from {}", documents.len(), file.display());
            let n = components.index(&documents).await?;
            println!("✅ Indexed {n} documents into {}", components.index.kind());
        }
        Command::Search { ref query, ref docs, top_k, ref basket, json } => {
            let engine = components.engine(docs).await?;
            let top_k = top_k.unwrap_or(components.config.top_k_documents);
            let hits = engine.search(query, top_k, &options(basket.clone())).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("No results.");
            } else {
                for h in &hits {
                    let d = &h.document;
                    println!("{:>2}. {:.3}  {}  [{}]\n    {}", h.rank, h.score, d.name, d.basket_id, d.preview);
                }
            }
        }
        Command::Ask { ref query, ref docs, top_k, ref basket, json } => {
            let engine = components.engine(docs).await?;
            let config = components.config.clone();
            let completer = Arc::new(ExtractiveCompleter::default());
            let mut pipeline = RagPipeline::new(config.clone(), engine.clone(), completer);
            if config.hybrid_search {
                let retriever = HybridRetriever::new(&config, engine, components.index.clone());
                pipeline = pipeline.with_hybrid(Arc::new(retriever));
            }
            let top_k = top_k.unwrap_or(components.config.top_k_documents);
            let answer = pipeline.answer_with(query, top_k, &options(basket.clone())).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                let ms = answer.processing_time.as_millis();
                println!("{}\n\nconfidence: {:.2}  ({ms} ms)", answer.answer, answer.confidence);
            }
        }
        Command::Stats => {
            let stats = components.index.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}
