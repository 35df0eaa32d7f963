//! # Session RAG CLI (`srag`)
//!
//! The `srag` binary drives sessions from the command line: create a
//! session, ingest documents into it, ask questions, and run the HTTP
//! server or the benchmark.
//!
//! ## Usage
//!
//! ```bash
//! srag --config ./config/srag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `srag session new` | Create a session and print its id |
//! | `srag session status <id>` | Show a session's state |
//! | `srag session reset <id>` | Drop a session's documents and vectors |
//! | `srag session destroy <id>` | Delete a session |
//! | `srag ingest <id> [FILES…]` | Ingest documents into a session |
//! | `srag ask <id> "<query>"` | Ask a question |
//! | `srag models` | List the model catalog |
//! | `srag serve` | Start the HTTP API |
//! | `srag bench <DOC> --questions <FILE>` | Benchmark one document |
//!
//! ## Logging
//!
//! Logs go to stderr. `-v` raises the level (info, debug, trace), `-q` shows
//! errors only, and `SRAG_LOG` overrides both with an `EnvFilter` directive.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use session_rag::bench;
use session_rag::config;
use session_rag::generation::ModelId;
use session_rag::models::SessionId;
use session_rag::orchestrator::QueryOrchestrator;
use session_rag::server;

/// Session RAG CLI: session-scoped question answering over your documents.
#[derive(Parser)]
#[command(
    name = "srag",
    about = "Session RAG: ask questions about the documents you upload to a session",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/srag.toml`. When the file does not exist the
    /// built-in defaults are used.
    #[arg(long, global = true, default_value = "./config/srag.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Ingest documents into a session.
    ///
    /// Files are copied into the session file area first. Without FILES,
    /// every file already in the session file area is ingested again.
    Ingest {
        /// Session id.
        id: String,
        /// PDF, DOCX, TXT or Markdown files.
        files: Vec<PathBuf>,
    },

    /// Ask a question about a session's documents.
    Ask {
        /// Session id.
        id: String,
        /// The question.
        query: String,
        /// Model id from `srag models` (default: generation.default_model).
        #[arg(long)]
        model: Option<String>,
        /// Also print the best matching chunks with their scores.
        #[arg(long)]
        sources: bool,
        /// Number of sources to print with --sources.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List the models that can answer questions.
    Models,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Benchmark retrieval and answers over one document.
    Bench {
        /// Document to ingest.
        document: PathBuf,
        /// JSON question file.
        #[arg(long)]
        questions: PathBuf,
        /// Model id (default: generation.default_model).
        #[arg(long)]
        model: Option<String>,
        /// Report path.
        #[arg(long, default_value = bench::DEFAULT_REPORT_FILE)]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a new empty session and print its id.
    New,
    /// Show a session's state.
    Status { id: String },
    /// Drop every document and vector of a session.
    Reset { id: String },
    /// Delete a session and all its data.
    Destroy { id: String },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("SRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn parse_id(raw: &str) -> Result<SessionId> {
    raw.parse::<SessionId>()
        .with_context(|| format!("'{}' is not a session id", raw))
}

fn parse_model(raw: Option<&str>) -> Result<Option<ModelId>> {
    raw.map(|m| {
        m.parse::<ModelId>()
            .with_context(|| "run `srag models` to list the available models")
    })
    .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Models => {
            for model in ModelId::all() {
                let marker = if model.as_str() == cfg.generation.default_model {
                    " (default)"
                } else {
                    ""
                };
                println!("{:<45} {}{}", model.as_str(), model.label(), marker);
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Session { action } => {
            let orch = QueryOrchestrator::from_config(cfg)?;
            match action {
                SessionAction::New => {
                    let status = orch.create_session()?;
                    println!("{}", status.id);
                }
                SessionAction::Status { id } => {
                    let status = orch.session_status(&parse_id(&id)?)?;
                    println!("session: {}", status.id);
                    println!("state:   {}", status.state);
                    if let Some(err) = status.last_error {
                        println!("error:   {}", err);
                    }
                }
                SessionAction::Reset { id } => {
                    let status = orch.reset(&parse_id(&id)?).await?;
                    println!("Session {} reset (state: {}).", status.id, status.state);
                }
                SessionAction::Destroy { id } => {
                    let id = parse_id(&id)?;
                    orch.destroy(&id).await?;
                    println!("Session {} destroyed.", id);
                }
            }
        }
        Commands::Ingest { id, files } => {
            let orch = QueryOrchestrator::from_config(cfg)?;
            let id = parse_id(&id)?;
            let summary = orch.ingest(&id, &files).await?;
            for w in &summary.warnings {
                eprintln!("warning: {}", w);
            }
            println!(
                "Ingested {} documents into session {}: {} chunks ({} new), collection size {}.",
                summary.documents,
                summary.session_id,
                summary.chunks,
                summary.new_chunks,
                summary.collection_size
            );
        }
        Commands::Ask {
            id,
            query,
            model,
            sources,
            top_k,
        } => {
            if top_k == Some(0) {
                bail!("--top-k must be >= 1");
            }
            let orch = QueryOrchestrator::from_config(cfg)?;
            let id = parse_id(&id)?;
            let model = parse_model(model.as_deref())?;
            if sources {
                let answer = orch.query_with_sources(&id, &query, model, top_k).await?;
                println!("{}", answer.answer);
                println!();
                println!(
                    "Sources (model {}, top score {:.4}):",
                    answer.model, answer.top_similarity_score
                );
                for (i, s) in answer.sources.iter().enumerate() {
                    println!("{}. [{:.4}] {}", i + 1, s.score, s.source);
                    println!("   {}", s.snippet);
                }
            } else {
                let answer = orch.query(&id, &query, model).await?;
                println!("{}", answer.answer);
            }
        }
        Commands::Bench {
            document,
            questions,
            model,
            output,
        } => {
            let model = parse_model(model.as_deref())?.unwrap_or_else(|| {
                cfg.generation.default_model.parse().unwrap_or_default()
            });
            let question_set = bench::load_questions(&questions)?;
            let orch = QueryOrchestrator::from_config(cfg)?;
            let report = bench::run_benchmark(&orch, &document, &question_set, model).await?;
            let path = bench::write_report(&report, &output)?;
            println!("{}", report.executive_summary);
            println!("Results written to {}", path.display());
        }
    }

    Ok(())
}
