//! Command handlers, one module per subcommand.

pub(crate) mod dump;
pub(crate) mod process;
pub(crate) mod rezip;
