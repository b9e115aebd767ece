//! Command implementations.
//!
//! Each subcommand is implemented in its own module.

pub(crate) mod clock;
pub(crate) mod device;
pub(crate) mod monitor;
pub(crate) mod ports;
pub(crate) mod update;
