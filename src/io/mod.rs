//! The asynchronous block-I/O layer: a fixed-budget buffer arena, monotonic
//! completion fences, a pluggable storage backend, and the command queue
//! whose agent thread executes reads and writes while the CPU workers run.

pub mod arena;
pub mod fence;
pub mod queue;
pub mod vfs;
