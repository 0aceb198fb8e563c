//! Pure, stateless transform kernels used by the phase-3 pipeline.
//!
//! Every kernel here is monomorphic for the engine's wire types (`u64` line
//! points / packed records, `u32` keys) and free of I/O: the pipeline steps
//! own all buffer traffic and call in with plain slices.

/// Triangular-number pair embedding and its inverse.
pub mod line_point;

/// Stable LSD radix sort of u64 keys with a co-permuted u32 satellite.
pub mod radix;

/// Read-only bitfield view over the phase-2 marked-entries words.
pub mod bitfield;
