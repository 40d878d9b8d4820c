#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Object-store and replica-host adapters backed by the filesystem or an
//! S3-compatible endpoint.

pub mod backend;
pub mod error;
pub mod hosts;
pub mod sigv4;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use hosts::HostStores;
pub use sigv4::Credentials;
