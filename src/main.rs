//! # kb-engine CLI (`kbe`)
//!
//! The `kbe` binary manages knowledge bases, imports documents, runs
//! training and answers queries. It can also serve the same operations
//! over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! kbe --config ./config/kbe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbe init` | Create the SQLite database and run schema migrations |
//! | `kbe kb create <name>` | Create a knowledge base |
//! | `kbe kb list` | List knowledge bases |
//! | `kbe kb show <kb>` | Show a knowledge base's configuration |
//! | `kbe kb update <kb>` | Change chunking or retrieval defaults, or re-embed |
//! | `kbe add <kb> <path>` | Add a file or import a folder |
//! | `kbe remove <kb> <doc>` | Remove a document |
//! | `kbe train <kb>` | Run training (Ctrl-C cancels, run again to resume) |
//! | `kbe status <kb>` | Per-document training status |
//! | `kbe query <kb> "<text>"` | Ranked results with citations |
//! | `kbe serve` | Start the HTTP server |
//! | `kbe completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! kbe kb create handbook --strategy fixed --chunk-size 800
//! kbe add handbook ./docs --include '**/*.md'
//! kbe train handbook --progress human
//! kbe query handbook "how do I rotate keys" --mode hybrid --top-k 3
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use kb_engine::config::{self, Config};
use kb_engine::engine::{KnowledgeBaseUpdate, KnowledgeEngine, NewKnowledgeBase};
use kb_engine::import::{import_folder, ImportOptions};
use kb_engine::progress::ProgressMode;
use kb_engine::server;
use kb_engine_core::models::{
    ChunkStrategy, ChunkingPolicy, KnowledgeBaseConfig, QueryOptions, RerankStrategy,
    RetrievalDefaults, SearchMode, SourceType, TrainingOptions,
};

/// kb-engine: ingest documents into knowledge bases and query them.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kbe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kbe",
    about = "Knowledge-base ingestion and retrieval engine",
    version,
    long_about = "kbe extracts text from PDF, DOCX, XLSX, Markdown, HTML and plain text documents, \
    chunks and embeds it into per-knowledge-base vector and keyword indexes, and answers \
    semantic, keyword and hybrid queries with source citations."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Add a file, or every supported file of a folder, as pending documents.
    Add {
        /// Knowledge base id or name.
        kb: String,
        /// File or directory.
        path: PathBuf,
        /// Declared type for a single file (`pdf`, `md`, a MIME type, ...).
        /// Inferred from the extension when omitted.
        #[arg(long = "type")]
        declared_type: Option<String>,
        /// Document name for a single file. Defaults to the file name.
        #[arg(long)]
        name: Option<String>,
        /// Include glob for folder imports (repeatable).
        #[arg(long = "include")]
        include: Vec<String>,
        /// Exclude glob for folder imports (repeatable).
        #[arg(long = "exclude")]
        exclude: Vec<String>,
    },

    /// Remove a document and purge its vectors.
    Remove {
        kb: String,
        /// Document id.
        doc: String,
    },

    /// Train a knowledge base. Ctrl-C cancels; running again resumes.
    Train {
        kb: String,
        /// Re-process documents that are already ready.
        #[arg(long)]
        force: bool,
        /// Restrict the run to these document ids (repeatable).
        #[arg(long = "doc")]
        documents: Vec<String>,
        /// Progress output: auto, off, human or json.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Show per-document training status.
    Status {
        kb: String,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Query a knowledge base.
    Query {
        kb: String,
        query: String,
        #[arg(long)]
        top_k: Option<i64>,
        /// semantic, keyword or hybrid.
        #[arg(long)]
        mode: Option<SearchMode>,
        /// Semantic share of the hybrid score, in [0, 1].
        #[arg(long)]
        hybrid_weight: Option<f64>,
        /// none, rrf, lexical or cross-encoder.
        #[arg(long)]
        rerank: Option<RerankStrategy>,
        /// Restrict results to these document ids (repeatable).
        #[arg(long = "doc")]
        documents: Vec<String>,
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve {
        /// Override the bind address.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Print shell completions to stdout.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum KbAction {
    /// Create a knowledge base. Unset options take the `[chunking]` and
    /// `[retrieval]` defaults of the config file.
    Create {
        name: String,
        #[command(flatten)]
        settings: KbSettings,
    },
    /// List knowledge bases.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one knowledge base as JSON.
    Show { kb: String },
    /// Update a knowledge base. Changing chunking resets its documents to pending.
    Update {
        kb: String,
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        settings: KbSettings,
        /// Move onto the configured embedding provider and vector backend,
        /// dropping existing vectors.
        #[arg(long)]
        reembed: bool,
    },
}

#[derive(clap::Args)]
struct KbSettings {
    /// fixed, recursive or semantic.
    #[arg(long)]
    strategy: Option<ChunkStrategy>,
    /// Chunk size in characters.
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long)]
    chunk_overlap: Option<usize>,
    #[arg(long)]
    semantic_threshold: Option<f32>,
    #[arg(long)]
    top_k: Option<i64>,
    #[arg(long)]
    mode: Option<SearchMode>,
    #[arg(long)]
    hybrid_weight: Option<f64>,
    #[arg(long)]
    rerank: Option<RerankStrategy>,
}

impl KbSettings {
    fn chunking(&self, base: &ChunkingPolicy) -> Option<ChunkingPolicy> {
        if self.strategy.is_none()
            && self.chunk_size.is_none()
            && self.chunk_overlap.is_none()
            && self.semantic_threshold.is_none()
        {
            return None;
        }
        Some(ChunkingPolicy {
            strategy: self.strategy.unwrap_or(base.strategy),
            chunk_size: self.chunk_size.unwrap_or(base.chunk_size),
            chunk_overlap: self.chunk_overlap.unwrap_or(base.chunk_overlap),
            semantic_threshold: self.semantic_threshold.unwrap_or(base.semantic_threshold),
        })
    }

    fn retrieval(&self, base: &RetrievalDefaults) -> Option<RetrievalDefaults> {
        if self.top_k.is_none()
            && self.mode.is_none()
            && self.hybrid_weight.is_none()
            && self.rerank.is_none()
        {
            return None;
        }
        Some(RetrievalDefaults {
            top_k: self.top_k.unwrap_or(base.top_k),
            mode: self.mode.unwrap_or(base.mode),
            hybrid_weight: self.hybrid_weight.unwrap_or(base.hybrid_weight),
            candidate_k: base.candidate_k,
            rerank: self.rerank.unwrap_or(base.rerank),
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kb_engine=info,kbe=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "kbe", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;
    let engine = KnowledgeEngine::open(cfg.clone()).await?;

    if let Commands::Serve { bind } = cli.command {
        let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
        return server::run_server(Arc::new(engine), &bind).await;
    }

    let result = run(&engine, &cfg, cli.command).await;
    engine.shutdown().await;
    result
}

async fn run(engine: &KnowledgeEngine, cfg: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Kb { action } => run_kb(engine, cfg, action).await?,
        Commands::Add {
            kb,
            path,
            declared_type,
            name,
            include,
            exclude,
        } => {
            let kb = engine.knowledge_base(&kb).await?;
            if path.is_dir() {
                let mut options = ImportOptions {
                    exclude_globs: exclude,
                    ..Default::default()
                };
                if !include.is_empty() {
                    options.include_globs = include;
                }
                let summary = import_folder(engine, &kb.id, &path, &options).await?;
                for doc in &summary.added {
                    println!("added {}  {}  ({})", doc.id, doc.name, doc.source_type);
                }
                println!(
                    "{} added, {} unchanged, {} unsupported",
                    summary.added.len(),
                    summary.unchanged.len(),
                    summary.unsupported.len()
                );
            } else {
                let doc = add_file(engine, &kb, &path, declared_type, name).await?;
                println!("added {}  {}  ({})", doc.0, doc.1, doc.2);
            }
        }
        Commands::Remove { kb, doc } => {
            engine.remove_document(&kb, &doc).await?;
            println!("removed {}", doc);
        }
        Commands::Train {
            kb,
            force,
            documents,
            progress,
        } => {
            let mode = ProgressMode::parse(&progress)
                .with_context(|| format!("unknown progress mode '{}'", progress))?;
            let kb = engine.knowledge_base(&kb).await?;
            let options = TrainingOptions {
                force,
                document_ids: (!documents.is_empty()).then_some(documents),
            };
            engine
                .start_training(&kb.id, options, mode.reporter())
                .await?;
            let report = tokio::select! {
                r = engine.wait_for_training(&kb.id) => r?,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("cancelling: in-flight batches finish, run again to resume");
                    engine.cancel_training(&kb.id);
                    engine.wait_for_training(&kb.id).await?
                }
            };
            if let Some(report) = report {
                if mode == ProgressMode::Off {
                    println!(
                        "{} ready, {} failed, {} skipped{}",
                        report.ready,
                        report.failed,
                        report.skipped,
                        if report.cancelled { " (cancelled)" } else { "" }
                    );
                    for w in &report.warnings {
                        eprintln!("warning: {}", w);
                    }
                }
            }
        }
        Commands::Status { kb, json } => {
            let status = engine.training_status(&kb).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "{}  {} pending, {} in progress, {} ready, {} failed{}",
                    status.kb_id,
                    status.counts.pending,
                    status.counts.in_progress,
                    status.counts.ready,
                    status.counts.failed,
                    if status.running { "  (training)" } else { "" }
                );
                for doc in &status.documents {
                    print!(
                        "  {}  {:<12} {:>5} chunks  {}",
                        doc.document_id,
                        doc.status.to_string(),
                        doc.chunk_count,
                        doc.name
                    );
                    match &doc.failure_reason {
                        Some(reason) => println!("  ({})", reason),
                        None => println!(),
                    }
                }
            }
        }
        Commands::Query {
            kb,
            query,
            top_k,
            mode,
            hybrid_weight,
            rerank,
            documents,
            json,
        } => {
            let options = QueryOptions {
                top_k,
                mode,
                hybrid_weight,
                candidate_k: None,
                rerank,
                document_ids: (!documents.is_empty()).then_some(documents),
            };
            let response = engine.query(&kb, &query, &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else if response.results.is_empty() {
                println!("No results.");
            } else {
                for hit in &response.results {
                    let c = &hit.citation;
                    let mut location = format!("{} #{}", c.document_name, c.ordinal);
                    if let Some(section) = &c.section_title {
                        location.push_str(&format!(", {}", section));
                    }
                    if let Some(page) = c.page_number {
                        location.push_str(&format!(", p.{}", page));
                    }
                    println!("{}. [{:.4}] {}", hit.rank, hit.score, location);
                    println!("   {}", snippet(&hit.text, 240));
                }
            }
        }
        Commands::Serve { .. } | Commands::Completions { .. } => {}
    }
    Ok(())
}

async fn run_kb(engine: &KnowledgeEngine, cfg: &Config, action: KbAction) -> Result<()> {
    match action {
        KbAction::Create { name, settings } => {
            let kb = engine
                .create_knowledge_base(NewKnowledgeBase {
                    name,
                    chunking: settings.chunking(&cfg.chunking.policy()),
                    retrieval: settings.retrieval(&cfg.retrieval.defaults()),
                })
                .await?;
            println!("created {}  {}", kb.id, kb.name);
        }
        KbAction::List { json } => {
            let kbs = engine.list_knowledge_bases().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&kbs)?);
            } else if kbs.is_empty() {
                println!("No knowledge bases.");
            } else {
                for kb in &kbs {
                    print_kb_line(kb);
                }
            }
        }
        KbAction::Show { kb } => {
            let kb = engine.knowledge_base(&kb).await?;
            println!("{}", serde_json::to_string_pretty(&kb)?);
        }
        KbAction::Update {
            kb,
            name,
            settings,
            reembed,
        } => {
            let current = engine.knowledge_base(&kb).await?;
            let updated = engine
                .update_knowledge_base_config(
                    &current.id,
                    KnowledgeBaseUpdate {
                        name,
                        chunking: settings.chunking(&current.chunking),
                        retrieval: settings.retrieval(&current.retrieval),
                        reembed,
                    },
                )
                .await?;
            println!("updated {}  {}", updated.id, updated.name);
        }
    }
    Ok(())
}

fn print_kb_line(kb: &KnowledgeBaseConfig) {
    println!(
        "{}  {:<24} {:?} {}/{}  {}  {}",
        kb.id,
        kb.name,
        kb.chunking.strategy,
        kb.chunking.chunk_size,
        kb.chunking.chunk_overlap,
        kb.embedding_model,
        kb.vector_backend
    );
}

async fn add_file(
    engine: &KnowledgeEngine,
    kb: &KnowledgeBaseConfig,
    path: &Path,
    declared_type: Option<String>,
    name: Option<String>,
) -> Result<(String, String, SourceType)> {
    let declared = match declared_type {
        Some(t) => t,
        None => {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            match SourceType::from_extension(ext) {
                Some(t) => t.as_str().to_string(),
                None => bail!(
                    "cannot infer the type of {}; pass --type",
                    path.display()
                ),
            }
        }
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = match name {
        Some(n) => n,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string()),
    };
    let doc = engine
        .add_document(
            &kb.id,
            &name,
            &declared,
            &bytes,
            Some(path.display().to_string()),
        )
        .await?;
    Ok((doc.id, doc.name, doc.source_type))
}

/// First `max` characters on one line.
fn snippet(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max).collect();
    format!("{}...", cut)
}
