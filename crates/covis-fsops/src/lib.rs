//! Archive handling and input materialisation for COVIS runs.
//!
//! Layout: `archive.rs` (sniff, extract, pack), `input.rs` (`InputResolver`),
//! `error.rs` (`FsOpsError`).
#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod error;
pub mod input;

pub use archive::{extract, extract_blocking, find_dataset_root, pack, pack_blocking, sniff_format};
pub use error::{FsOpsError, FsOpsResult};
pub use input::{InputResolver, ResolvedInput};
