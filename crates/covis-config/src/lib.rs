#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]

//! Environment-driven configuration for the COVIS worker and operator tools.
//!
//! Layout: `defaults.rs` (key names and defaults), `source.rs` (key/value sources),
//! `model.rs` (typed settings), `loader.rs` (assembly and validation).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod source;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, settings_from};
pub use model::{Endpoint, LogSettings, QueueSettings, Settings};
pub use source::{ConfigSource, EnvSource, Layered, MapSource};
