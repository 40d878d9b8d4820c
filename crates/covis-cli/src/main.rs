#![forbid(unsafe_code)]
#![deny(unused_must_use, clippy::all)]

//! `covis` binary: queue relocations, submit processing, dump the catalog.

use std::process;

#[tokio::main]
async fn main() {
    let exit_code = covis_cli::run().await;
    if exit_code != 0 {
        process::exit(exit_code);
    }
}
