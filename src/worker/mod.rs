//! Worker communication module.
//!
//! This module supervises one long-lived worker process and multiplexes
//! many concurrent requests over its stdin/stdout.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      WorkerClient (Async)                       │
//! │   call() / call_timeout() / call_blocking()                     │
//! │        │                                                        │
//! │        ▼ send queue (FIFO)                                      │
//! │  ┌──────────────┐   ensure_alive()   ┌──────────────────────┐   │
//! │  │  SenderLoop  │ ─────────────────► │ Supervisor           │   │
//! │  │ token+encode │                    │ Installer / gate     │   │
//! │  └──────┬───────┘                    └──────────────────────┘   │
//! │         │ insert                                                │
//! │         ▼                                                       │
//! │  ┌──────────────┐      remove        ┌──────────────────────┐   │
//! │  │ PendingTable │ ◄───────────────── │ ReceiverLoop         │   │
//! │  └──────────────┘                    │ decode+expand+notify │   │
//! │                                      └──────────▲───────────┘   │
//! │                                                 │ raw lines     │
//! └─────────────────────────────────────────────────┼───────────────┘
//!          stdin: `<header> <body>\n`               │ stdout: one JSON per line
//!                  ▼                                │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Worker (Long-Running Child Process)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests are written in submission order; replies are delivered in
//! arrival order, which need not match. If the worker dies, requests in
//! flight are abandoned and the next request starts a fresh process.

mod client;
pub mod codec;
mod error;
pub mod event;
pub mod install;
pub mod pending;
pub mod protocol;
pub mod provision;
mod receiver;
mod sender;
pub mod supervisor;

pub use client::{ClientOptions, WorkerClient};
pub use error::{WorkerError, WorkerResult};
pub use event::WorkerEvent;
pub use install::{format_report, sanity_report, InstallOutcome, Installer};
pub use pending::Completion;
pub use protocol::{Continuation, Reply};
pub use provision::{CommandProvisioner, InstallState, NoopProvisioner, ProvisionGate, Provisioner};
pub use sender::{new_token, TOKEN_PREFIX};
pub use supervisor::LaunchSpec;
