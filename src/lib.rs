//! This file is the root of the `plotpress_core` crate: the phase-3 table
//! compression engine of a disk-based proof-of-space plotter.
//!
//! Its responsibilities are strictly limited to:
//! 1.  Declaring the top-level modules of the library (`kernels`, `io`,
//!     `pipeline`, ...) so the compiler knows they exist.
//! 2.  Re-exporting the handful of types a plotter binary needs to drive a
//!     phase-3 run: the config, the context describing the earlier phases'
//!     artifacts, the queue, and the orchestrator.

//==================================================================================
// 0. Constants
//==================================================================================
/// The crate version, automatically set from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//==================================================================================
// 1. Module Declarations
//==================================================================================
#[macro_use]
mod observability; // Make macros available throughout the crate

pub mod config;
pub mod error;
pub mod io;
pub mod kernels;
pub mod pipeline;
pub mod types;

mod utils;

//==================================================================================
// 2. Public Re-exports
//==================================================================================
pub use config::PlotpressConfig;
pub use error::PlotpressError;
pub use io::queue::DiskQueue;
pub use io::vfs::{FsVfs, MemVfs};
pub use pipeline::orchestrator::{ParkSink, Phase3, Phase3Report};
pub use types::{PlotContext, TableId};
