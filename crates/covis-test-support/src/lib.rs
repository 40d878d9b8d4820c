#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]

//! Shared test helpers used across the workspace's suites.
//! Layout: fixtures.rs (archive and run builders), docker.rs (daemon probe),
//! fakes.rs (in-memory catalog, stores, and runtime).

pub mod docker;
pub mod fakes;
pub mod fixtures;

pub use fakes::{FakeRuntime, MemoryCatalog, MemoryObjectStore, MemoryReplicaStore};
