//! Domain model and planning logic for COVIS run relocation.
//!
//! # Design
//! - Host names are validated once at the edge and carried as [`Host`] values.
//! - Replica choice and relocation planning are pure; collaborators sit behind the
//!   traits in [`service`].
//! - Planning is lazy so a catalog cursor can be drained without buffering it.
#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

pub mod error;
pub mod hosts;
pub mod location;
pub mod model;
pub mod router;
pub mod service;

pub use error::{CoreError, CoreResult};
pub use hosts::{DEFAULT_HOSTS, Host, HostRegistry};
pub use location::{LocationResolver, is_sole_source, needs_relocation};
pub use model::{
    ArchiveFormat, InputReference, Job, JobArgs, OutputTarget, RawLocation, Run, TaskKind,
};
pub use router::{DispatchMode, JobRouter, Plan, PlanStats, Planner, RouteDecision, RouterOptions};
pub use service::{Catalog, ObjectStore, ProcessingRuntime, ReplicaStore, RunStream};
