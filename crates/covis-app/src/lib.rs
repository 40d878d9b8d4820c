#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! COVIS application wiring: task handlers, the operator dispatch pass, and
//! worker bootstrap.
//!
//! Layout: `tasks/` (relocation and processing handlers), `dispatch.rs`
//! (catalog scan to job submission), `bootstrap.rs` (service wiring),
//! `event_log.rs` (event sink), `runtime.rs` (external processing command).

/// Service wiring and the worker entry point.
pub mod bootstrap;
/// Operator dispatch pass.
pub mod dispatch;
/// Application error type.
pub mod error;
/// Background logging of task lifecycle events.
pub mod event_log;
/// Processing runtime backed by an external command.
pub mod runtime;
/// Task handlers registered with the worker.
pub mod tasks;

pub use bootstrap::{Services, run_app, run_worker_with};
pub use dispatch::{Dispatch, DispatchOptions, DispatchSummary};
pub use error::{AppError, AppResult};
pub use event_log::spawn_event_log;
