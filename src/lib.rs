//! # Job Registry Indexer
//!
//! Ledger-to-relational event indexer for the job registry contract, built on
//! [Alloy](https://github.com/alloy-rs/alloy) and SQLite.
//!
//! The indexer follows the contract's append-only event log and keeps a
//! relational projection of it (workers, jobs, reputation history)
//! consistent and idempotent across restarts, node hiccups and replays.
//!
//! ## Features
//!
//! - **Type-safe event decoding** using Alloy's `sol!` macro
//! - **Natural-key deduplication** on `(transaction_hash, event_index)`
//! - **One transaction per event**: raw insert, projection and `processed`
//!   flag commit together
//! - **Chunked polling** with a durable checkpoint and fixed-delay backoff
//! - **Exhaustive projection** over a closed set of event kinds, with an
//!   explicit store-only branch for unknown ones
//!
//! ## Architecture
//!
//! ```text
//! Indexer ──► ChainClient (fetch, decode, hydrate)
//!         ──► Repository / UnitOfWork (dedupe + persist)
//!         ──► projection::apply (workers, jobs, reputation)
//!         ──► UnitOfWork (mark processed, commit)
//! ```
//!
//! 1. **Config** ([`config`]) - environment variable loading
//! 2. **Chain** ([`chain`]) - `ChainClient` trait and the alloy implementation
//! 3. **Storage** ([`db`]) - SQLite pool, migrations, repository, unit of work
//! 4. **Projection** ([`projection`]) - event kind → entity mutations
//! 5. **Indexer** ([`indexer`]) - recovery, polling, backoff, lifecycle
//!
//! ## Quick Start
//!
//! ```bash
//! # Follow the chain until ctrl-c
//! cargo run --release -- run
//!
//! # Catch up once and exit
//! cargo run --release -- sync
//!
//! # Show checkpoint and projection counts
//! cargo run --release -- status
//! ```
//!
//! ## Environment Setup
//!
//! ```text
//! RPC_URL=http://localhost:8545
//! CONTRACT_ADDRESS=0x5fbdb2315678afecb367f032d93f642f64180aa3
//! DATABASE_URL=sqlite:./indexer.db
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`error::IndexerResult<T>`](error::IndexerResult):
//!
//! ```rust
//! use job_registry_indexer::error::{IndexerError, IndexerResult};
//!
//! fn example() -> IndexerResult<()> {
//!     Ok(())
//! }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! # All tests
//! cargo test
//!
//! # Unit tests only
//! cargo test --lib
//!
//! # Integration tests
//! cargo test --test '*'
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod chain;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod indexer;
pub mod observability;
pub mod projection;
