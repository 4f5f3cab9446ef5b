//! Replicated lending store for books and loans.
//!
//! One logical store is backed by a primary and a secondary
//! [`store::StorageEngine`]. Writes land on the primary and are replayed on
//! the secondary by a background replication lane; when the primary stops
//! answering, the coordinator fails over to the secondary for good.
//! Operations that could not be applied are written to crash-safe retry
//! queues and replayed later.
//!
//! # Architecture
//!
//! - **Line server** (Tokio): accepts TCP connections, one request per line.
//! - **Dispatcher** (Tokio): stamps each request with a Lamport clock and
//!   routes it. Grants go through a bounded pool and the caller waits for the
//!   result with a timeout. Returns and renewals are acknowledged at once and
//!   handled by a second pool.
//! - **Replication lane** (OS thread): replays primary writes on the
//!   secondary, fed by a crossbeam channel.
//! - **Background task**: drains the retry queues and logs metrics on a
//!   fixed interval.
//!
//! Engine calls are blocking (one mutex per engine, fsynced JSON tables) and
//! run on Tokio's blocking pool.
//!
//! # Modules
//!
//! - [`model`]: books, loans and the demo catalogue
//! - [`tables`]: atomic JSON table files
//! - [`store`]: single-node storage engine with availability and fault plan
//! - [`command`]: writes replayed on the secondary
//! - [`replication`]: primary/secondary coordinator and failover
//! - [`retry_queue`]: durable per-category retry queues
//! - [`clock`]: Lamport clock
//! - [`protocol`]: request/response text grammar
//! - [`dispatcher`]: worker pools, timeouts, retry drain
//! - [`metrics`]: dispatcher counters and snapshots
//! - [`node`]: wiring for one site
//! - [`server`], [`client`], [`cli`]: TCP front end and command line

pub mod cli;
pub mod client;
pub mod clock;
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod model;
pub mod node;
pub mod protocol;
pub mod replication;
pub mod retry_queue;
pub mod server;
pub mod store;
pub mod tables;
