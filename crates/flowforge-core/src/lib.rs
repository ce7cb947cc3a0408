//! # flowforge-core
//!
//! Core library for FlowForge — a local-first execution-control plane
//! for long-running AI and automation jobs.
//!
//! This crate provides the supervision, decision, and evidence
//! subsystem: spawning and tearing down a child process tree, the
//! lifecycle state machine with idempotent control-plane semantics, the
//! threshold decision engine with its deterministic replay contract and
//! signal-baseline drift analysis, the monitor loop, and the append-only
//! SQLite evidence ledger.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use flowforge_core::crypto::EncryptionPolicy;
//! use flowforge_core::ledger::Ledger;
//! use flowforge_core::lifecycle::{LifecycleConfig, LifecycleManager, OpContext};
//! use flowforge_core::redact::Redactor;
//! use flowforge_core::state::ProcessStateHandle;
//! use flowforge_core::supervisor::ChildSpec;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Arc::new(Ledger::open(
//!     "flowforge.db",
//!     EncryptionPolicy::Plaintext,
//!     Redactor::new(),
//! )?);
//! let state = ProcessStateHandle::new();
//! let lifecycle =
//!     LifecycleManager::new(LifecycleConfig::default(), ledger, state, None).spawn();
//! lifecycle
//!     .register_spec(ChildSpec::new("python3", vec!["worker.py".into()]))
//!     .await;
//! lifecycle
//!     .request_start(OpContext::operator("boot", "", "cli"))
//!     .await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod crypto;
pub mod ledger;
pub mod lifecycle;
pub mod monitor;
pub mod policy;
pub mod procstat;
pub mod redact;
pub mod signals;
pub mod state;
pub mod supervisor;

pub use config::Config;
pub use ledger::Ledger;
pub use lifecycle::{LifecycleDecision, LifecycleHandle};
pub use state::{ProcessState, ProcessStateHandle};
pub use supervisor::{ChildSpec, Supervisor};
