//! # shelfdex CLI (`sdx`)
//!
//! Commands for building content-addressed vector indices over document
//! collections, serving them over HTTP, querying many per-file indices in
//! parallel, and reclaiming orphaned index directories.
//!
//! ## Usage
//!
//! ```bash
//! sdx --config ./config/sdx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sdx build <dir>` | Build per-file indices (or `--merged` for one merged index) |
//! | `sdx serve` | Start the HTTP query service |
//! | `sdx query "<question>"` | Fan a question out over per-file indices |
//! | `sdx reclaim <dir>` | Remove orphaned fingerprint directories |
//! | `sdx manifest <dir>` | Print the fingerprint → filename mapping |
//!
//! ## Examples
//!
//! ```bash
//! # Train every book in a collection into per-file indices
//! sdx build ~/books
//!
//! # Build one merged index over the whole collection
//! sdx build ~/books --merged
//!
//! # Serve with the configured preload collection warm
//! sdx serve
//!
//! # Ask three indices a question, four workers at a time
//! sdx query "what is ownership?" --hash <fp1> --hash <fp2> --hash <fp3>
//!
//! # Preview orphan cleanup without deleting
//! sdx reclaim ~/books --dry-run
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use shelfdex::cache::IndexCache;
use shelfdex::config;
use shelfdex::fanout::{self, FanoutOptions, MultiQueryRequest};
use shelfdex::{build, embedding, fingerprint, reclaim, server};

/// shelfdex — content-addressed passage retrieval over PDF-derived
/// document collections.
#[derive(Parser)]
#[command(
    name = "sdx",
    about = "Content-addressed passage retrieval over document collections",
    version,
    long_about = "shelfdex fingerprints source files by content, builds per-fingerprint \
    vector indices, keeps them resident in a long-running query service, and fans \
    questions out over many per-document indices in parallel."
)]
struct Cli {
    /// Path to configuration file (TOML). Missing file falls back to
    /// built-in defaults.
    #[arg(long, global = true, default_value = "./config/sdx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build vector indices for a collection.
    ///
    /// By default every source file gets its own index under a directory
    /// named by the file's content fingerprint; already-built fingerprints
    /// are skipped. `--merged` instead builds one index over the whole
    /// collection.
    Build {
        /// Collection directory containing the source files.
        dir: PathBuf,

        /// Rebuild even when a fresh index already exists.
        #[arg(long)]
        force: bool,

        /// Build one merged index for the collection instead of per-file
        /// indices.
        #[arg(long)]
        merged: bool,

        /// Remove orphaned fingerprint directories after building.
        #[arg(long)]
        cleanup: bool,
    },

    /// Start the HTTP query service.
    ///
    /// Binds the address in `[server].bind` and optionally preloads the
    /// `[store].preload` collection so the first query is already warm.
    Serve,

    /// Fan questions out over per-file indices and print aggregated,
    /// deduplicated passages as JSON.
    Query {
        /// Questions to ask (at most 3 per invocation).
        #[arg(required = true)]
        questions: Vec<String>,

        /// Restrict to specific index fingerprints (repeatable). Without
        /// this, every index under the store root is queried.
        #[arg(long = "hash")]
        hashes: Vec<String>,

        /// Additional collection paths outside the store root (repeatable).
        #[arg(long = "source")]
        sources: Vec<PathBuf>,

        /// Passages per shard.
        #[arg(long)]
        top_k: Option<usize>,

        /// Concurrent shard workers.
        #[arg(long)]
        max_workers: Option<usize>,

        /// Per-shard timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Remove index directories whose source files no longer exist.
    Reclaim {
        /// Collection directory to clean.
        dir: PathBuf,

        /// Report orphans without deleting anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the fingerprint → filename mapping of a collection.
    Manifest {
        /// Collection directory to scan.
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Build {
            dir,
            force,
            merged,
            cleanup,
        } => {
            let embedder = embedding::shared(&cfg.embedding).await?;

            if merged {
                let report = build::build_collection_index(&cfg, &embedder, &dir, force).await?;
                if report.built {
                    println!(
                        "built merged index: {} sources, {} chunks in {:.2}s",
                        report.sources, report.total_chunks, report.elapsed_secs
                    );
                } else {
                    println!(
                        "merged index up to date: {} sources, {} chunks",
                        report.sources, report.total_chunks
                    );
                }
                for warning in &report.warnings {
                    println!("  skipped: {}", warning);
                }
            } else {
                let (statuses, warnings) =
                    build::build_all_file_indices(&cfg, &embedder, &dir, force).await?;
                let built = statuses.iter().filter(|s| s.built).count();
                let cached = statuses.len() - built;
                for status in &statuses {
                    let label = if status.built { "built" } else { "cached" };
                    println!(
                        "  {} {} ({} chunks, {:.2}s)",
                        label, status.fingerprint, status.chunks, status.elapsed_secs
                    );
                }
                for warning in &warnings {
                    println!("  skipped: {}", warning);
                }
                println!(
                    "done: {} built, {} cached, {} skipped",
                    built,
                    cached,
                    warnings.len()
                );
            }

            if cleanup {
                let report = reclaim::reclaim(&dir, false)?;
                println!(
                    "cleanup: {} orphans removed, {} kept, {} bytes freed",
                    report.removed.len(),
                    report.kept,
                    report.bytes_freed
                );
            }
        }

        Commands::Serve => {
            let embedder = embedding::shared(&cfg.embedding).await?;
            let cache = Arc::new(IndexCache::new());
            server::run_server(cfg, cache, embedder).await?;
        }

        Commands::Query {
            questions,
            hashes,
            sources,
            top_k,
            max_workers,
            timeout,
        } => {
            let embedder = embedding::shared(&cfg.embedding).await?;
            let cache = Arc::new(IndexCache::new());

            let options = FanoutOptions {
                top_k_per_shard: top_k.unwrap_or(cfg.retrieval.top_k_per_shard),
                max_workers: max_workers.unwrap_or(cfg.retrieval.max_workers),
                shard_timeout: Duration::from_secs(
                    timeout.unwrap_or(cfg.retrieval.shard_timeout_secs),
                ),
            };
            let request = MultiQueryRequest {
                queries: questions,
                source_hashes: (!hashes.is_empty()).then_some(hashes),
                external_sources: sources,
                options,
            };

            let response =
                fanout::run_multi(cache, embedder, &cfg.store.root, request).await?;

            let per_query: Vec<serde_json::Value> = response
                .runs
                .iter()
                .map(|run| {
                    serde_json::json!({
                        "query": run.question,
                        "sources": {
                            "total": run.shards.len(),
                            "successful": run.successful_shards(),
                            "failed": run.failed_shards().iter().map(|s| serde_json::json!({
                                "shard": s.shard,
                                "error": s.error,
                                "kind": s.error_kind,
                            })).collect::<Vec<_>>(),
                        },
                        "results": {
                            "total_found": run.passages.len(),
                            "duplicates_removed": run.duplicates_removed(),
                            "data": run.passages.iter().map(|p| serde_json::json!({
                                "source": p.source,
                                "page": p.page,
                                "score": p.score,
                                "content": p.text,
                            })).collect::<Vec<_>>(),
                        },
                        "execution": {
                            "total_time_seconds": run.elapsed_secs,
                        },
                    })
                })
                .collect();

            let output = serde_json::json!({
                "queries": per_query,
                "stats": response.stats,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Reclaim { dir, dry_run } => {
            let report = reclaim::reclaim(&dir, dry_run)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Manifest { dir } => {
            let manifest = fingerprint::directory_manifest(&dir)?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
    }

    Ok(())
}
