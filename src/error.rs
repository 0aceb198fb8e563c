//! This module defines the single, unified error type for the entire
//! plotpress library. It uses the `thiserror` crate to provide ergonomic,
//! context-aware error handling.
//!
//! Phase 3 is all-or-nothing per run: no error defined here is recoverable
//! locally. The orchestrator propagates the first failure to the caller with
//! enough context (file id, bucket, operation) to identify the failing disk
//! command.

use thiserror::Error;

use crate::types::FileId;

#[derive(Error, Debug)]
pub enum PlotpressError {
    // =========================================================================
    // === High-Level, Semantic Errors (Specific to this engine's logic)
    // =========================================================================
    #[error("Invalid phase-3 configuration: {0}")]
    Config(String),

    #[error("Internal logic error (this is a bug): {0}")]
    Internal(String),

    /// An error from Serde JSON while rendering a run report.
    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    // =========================================================================
    // === I/O Queue Errors
    // =========================================================================
    /// A read, write, seek or delete against a bucket file failed. Fatal.
    #[error("I/O error during {op} on {file} bucket {bucket}: {source}")]
    Io {
        file: FileId,
        bucket: u32,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The I/O agent thread is gone; no further commands can be serviced.
    #[error("I/O queue is shut down; command channel closed")]
    QueueClosed,

    /// A blocking buffer allocation can never be satisfied: either the
    /// request exceeds the arena's total capacity, or nothing is outstanding
    /// that could be released to make room.
    #[error("I/O arena exhausted: requested {requested} bytes, {available} available of {capacity} total, {outstanding} buffers outstanding")]
    ArenaExhausted {
        requested: usize,
        available: usize,
        capacity: usize,
        outstanding: usize,
    },

    /// A read completion was claimed before the governing fence passed, or
    /// for a ticket the queue never issued.
    #[error("Claimed a read ticket with no completed buffer (ticket {0})")]
    MissingCompletion(u64),
}
