#![forbid(unsafe_code)]
#![deny(unused_must_use, clippy::all)]

//! Worker binary: consumes relocation and processing tasks until interrupted.

use covis_app::{AppResult, run_app};

/// Runs the COVIS worker until ctrl-c.
#[tokio::main]
async fn main() -> AppResult<()> {
    run_app().await
}
