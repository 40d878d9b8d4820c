#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Task queue: routing, brokers, result storage, and the worker pool.
//!
//! # Design
//! - [`TaskDispatcher`] publishes jobs to the queue chosen by the
//!   [`RoutingTable`], or runs them in-process.
//! - Delivery is at-least-once; [`Worker`] acknowledges only after a task
//!   finishes and relies on per-task idempotence.
//! - Brokers and result backends sit behind traits so `PostgreSQL` and
//!   in-memory implementations are interchangeable.

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod results;
pub mod routing;
pub mod task;
pub mod worker;

pub use broker::{Broker, MemoryBroker};
pub use config::QueueConfig;
pub use dispatcher::TaskDispatcher;
pub use error::{QueueError, QueueResult};
pub use message::{Delivery, TaskHandle, TaskMessage, TaskOutcome, TaskResult, TaskStatus};
pub use results::{MemoryResultBackend, ResultBackend, expiry_cutoff};
pub use routing::{DEFAULT_QUEUE, RoutingTable};
pub use task::{TaskContext, TaskError, TaskHandler, TaskRegistry};
pub use worker::Worker;
