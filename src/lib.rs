//! # shelfdex
//!
//! **Content-addressed passage retrieval over PDF-derived document
//! collections.**
//!
//! shelfdex fingerprints source files by content, builds per-fingerprint
//! vector indices that survive renames and process restarts, keeps loaded
//! indices resident in a long-running query service, and fans single
//! questions out over many per-document indices in parallel. Answers are
//! ranked, source-attributed passages — retrieval only, no generation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────────┐
//! │ Sources   │──▶│   Builder     │──▶│  Index Store       │
//! │ pdf/txt  │   │ chunk+embed  │   │ <fingerprint>/ dirs │
//! └──────────┘   └──────────────┘   └─────────┬─────────┘
//!                                             │
//!                       ┌─────────────────────┤
//!                       ▼                     ▼
//!                ┌────────────┐       ┌──────────────┐
//!                │  In-memory │◀──────│  Fan-out      │
//!                │   cache    │       │  engine       │
//!                └─────┬──────┘       └──────┬───────┘
//!                      ▼                     ▼
//!                ┌────────────┐       ┌──────────────┐
//!                │ HTTP serve │       │  CLI query    │
//!                └────────────┘       └──────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **fingerprinter** ([`fingerprint`]) hashes each source's raw
//!    bytes; the hash names the index directory, so renaming a file never
//!    invalidates its index.
//! 2. The **builder** ([`build`]) extracts text ([`extract`]), chunks it
//!    ([`chunk`]), embeds the chunks ([`embedding`]), and persists a
//!    [`index::VectorIndex`] plus build manifest ([`store`]).
//! 3. The **cache** ([`cache`]) holds loaded indices resident with
//!    per-path load exclusion and read-copy-update reload.
//! 4. The **query service** ([`server`]) answers HTTP queries against one
//!    collection; the **fan-out engine** ([`fanout`]) spreads a question
//!    over many per-file indices and deduplicates via the
//!    **aggregator** ([`aggregate`]).
//! 5. The **reclaimer** ([`reclaim`]) deletes index directories whose
//!    source files are gone.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Domain error taxonomy |
//! | [`models`] | Core data types: `StoredChunk`, `Passage` |
//! | [`fingerprint`] | Content hashing and directory manifests |
//! | [`extract`] | Plain-text production from pdf/txt sources |
//! | [`chunk`] | Recursive-separator chunker with overlap |
//! | [`embedding`] | Provider trait, hashed + OpenAI backends, process singleton |
//! | [`index`] | Vector index: build, save, load, cosine search |
//! | [`store`] | Content-addressed on-disk layout and manifests |
//! | [`build`] | Per-file and merged-collection index builds |
//! | [`cache`] | In-memory index cache with per-path load locks |
//! | [`server`] | HTTP query service (Axum) with CORS |
//! | [`fanout`] | Bounded-parallel multi-shard query engine |
//! | [`aggregate`] | Cross-shard deduplication and stable ordering |
//! | [`reclaim`] | Orphaned index directory cleanup |

pub mod aggregate;
pub mod build;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fanout;
pub mod fingerprint;
pub mod index;
pub mod models;
pub mod reclaim;
pub mod server;
pub mod store;
