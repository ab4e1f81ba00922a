//! # Ledger Ingest
//!
//! Schema-inferring, idempotent ingestion of JSON record batches into SQLite.
//!
//! An upstream exporter writes one JSON array per accounting entity into
//! timestamped session directories. This crate infers a relational schema
//! for each file, compiles it to DDL, and upserts the records into prefixed
//! tables, remembering which sessions and files it has already ingested.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌──────────┐   ┌─────────────┐
//! │  Sessions   │──▶│  Infer   │──▶│ Compile  │──▶│   Ingest    │
//! │ raw/*.json  │   │ sampling │   │   DDL    │   │ filter+batch│
//! └─────────────┘   └──────────┘   └──────────┘   └──────┬──────┘
//!                                                        │
//!                         ┌──────────────┐               ▼
//!                         │   Tracker    │◀──────▶  ┌──────────┐
//!                         │ sessions/files│          │  SQLite  │
//!                         └──────────────┘          └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ledger init                          # create database and tracker tables
//! ledger infer raw/2024-06-10_12-00-00/invoices.json
//! ledger ingest --since 2024-05-01     # ingest the newest session
//! ledger sessions                      # list ingested sessions
//! ledger stats                         # row counts and date ranges
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Ingestion error taxonomy |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`classify`] | Name-based column classification |
//! | [`infer`] | Schema inference from JSON samples |
//! | [`compile`] | DDL generation and schema evolution |
//! | [`source`] | Session discovery and file loading |
//! | [`filter`] | Incremental date filtering |
//! | [`transform`] | Record → row mapping |
//! | [`ingest`] | Per-table ingestion engine |
//! | [`tracker`] | Session and file idempotency |
//! | [`pipeline`] | Run orchestration and summary |
//! | [`progress`] | Progress reporting on stderr |
//! | [`stats`] | Table row counts and date ranges |
//! | [`db`] | Database connection |
//! | [`migrate`] | Tracker schema |

pub mod classify;
pub mod compile;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod infer;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod source;
pub mod stats;
pub mod tracker;
pub mod transform;
