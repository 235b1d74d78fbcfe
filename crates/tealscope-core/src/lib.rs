//! tealscope-core: Core library for tealscope
//!
//! Host-independent engine for the background half of a Tealium `utag`
//! debugging extension: ordered capture of page console logs, per-session
//! storage under a quota, session lifecycle, collector delivery and
//! case-file export.
//!
//! # Architecture
//!
//! ```text
//! page / UI message → protocol::Message → relay::Relay
//!                                            ↓
//!          session ─→ reorder (per stream) ─→ log_store (per bucket writer)
//!                                            ↓
//!                         dispatch (collector)   casefile (export)
//! ```
//!
//! # Modules
//!
//! - `retry`, `dispatch`: retry schedule and collector client
//! - `reorder`: sequence reorder buffer with gap timers
//! - `kv`, `log_store`: key-value backends and the session log store
//! - `session`: recording session lifecycle
//! - `casefile`, `redact`: case-file export
//! - `protocol`, `browser`, `snapshots`, `relay`: message handling
//! - `config`, `logging`, `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod browser;
pub mod casefile;
pub mod config;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod kv;
pub mod log_store;
pub mod logging;
pub mod protocol;
pub mod redact;
pub mod relay;
pub mod reorder;
pub mod retry;
pub mod session;
pub mod snapshots;

pub use error::{Error, Result};

/// Version of the tealscope-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
