//! Execution control core for the Nebula serverless function platform
//! for the sandbox pool, synchronous executor, async queue worker
//! pool, and workflow engine, plus the collaborators they're built
//! against (backend driver, log sink, store, notifier, admission policy,
//! metrics, scheduler).
//!
//! HTTP surfaces, auth, concrete sandbox drivers, and schema are
//! explicitly out of scope — this crate exposes the
//! interfaces those collaborators implement and a reference in-memory
//! `Store`/`Backend` pair for tests and the demo binary in `server.rs`.

pub mod admission;
pub mod asyncworker;
pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod logsink;
pub mod metrics;
pub mod mock_backend;
pub mod model;
pub mod notifier;
pub mod pool;
pub mod scheduler;
pub mod store;
pub mod workflow;

#[cfg(test)]
test_r::enable!();

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
