//! # Tether
//!
//! Asynchronous request/response IPC with one supervised worker process.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Callers (async tasks, blocking threads)           │
//! └─────────────────────────────────────────────────────────┘
//!                          │ call / call_timeout / call_blocking
//!                          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │   WorkerClient: send queue, pending table, install gate  │
//! └─────────────────────────────────────────────────────────┘
//!                          │ `<header> <body>\n` over stdio
//!                          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Worker process (restarted on demand)            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Settings come from `tether.toml`; see [`config::Settings`].

pub mod config;
pub mod worker;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::config::{Settings, SettingsError};
    pub use crate::worker::{
        Completion, Continuation, InstallState, Reply, WorkerClient, WorkerError, WorkerEvent,
        WorkerResult,
    };
}
