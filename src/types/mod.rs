//! Core vocabulary types shared across the engine: table identifiers, the
//! bucketed file-set identifiers with their stable on-disk names, seek
//! origins for the I/O queue, and the `PlotContext` carrying the earlier
//! phases' entry accounting into phase 3.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of logical tables in a plot.
pub const NUM_TABLES: usize = 7;

//==================================================================================
// 1. TableId
//==================================================================================

/// One of the seven plot tables. Phase 3 iterates the r-table over
/// `Table2..=Table7`, pairing each with its l-table (`r - 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TableId {
    Table1 = 1,
    Table2 = 2,
    Table3 = 3,
    Table4 = 4,
    Table5 = 5,
    Table6 = 6,
    Table7 = 7,
}

impl TableId {
    /// All tables, in order.
    pub const ALL: [TableId; NUM_TABLES] = [
        TableId::Table1,
        TableId::Table2,
        TableId::Table3,
        TableId::Table4,
        TableId::Table5,
        TableId::Table6,
        TableId::Table7,
    ];

    /// The r-tables phase 3 processes, in order.
    pub const R_TABLES: [TableId; 6] = [
        TableId::Table2,
        TableId::Table3,
        TableId::Table4,
        TableId::Table5,
        TableId::Table6,
        TableId::Table7,
    ];

    /// Table number, 1-based.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Zero-based index for per-table arrays.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    /// The l-table paired with this r-table. Undefined for `Table1`.
    pub fn prev(self) -> TableId {
        TableId::ALL[self.index() - 1]
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table {}", self.number())
    }
}

//==================================================================================
// 2. FileId & Naming
//==================================================================================

/// Identifier of a bucketed file set managed by the I/O queue.
///
/// `X`, `Marks`, `PairsL`, `PairsR` and `RMap` are produced by earlier
/// phases and consumed here; `Lp`, `LpKey` and `LpMap` are created by this
/// phase. Names are stable across runs so a crashed phase can be diagnosed
/// from the temp directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileId {
    /// First-table x values; the l-map of the first iteration.
    X,
    /// Phase-2 marked-entries bitfield for an r-table.
    Marks(TableId),
    /// Left back-pointer stream (u32) for an r-table.
    PairsL(TableId),
    /// Right back-pointer delta stream (u16) for an r-table.
    PairsR(TableId),
    /// Pre-sort origin key stream (u32) for an r-table.
    RMap(TableId),
    /// Line points, bucketed by LP high bits.
    Lp(TableId),
    /// Keys co-permuted with the line points.
    LpKey(TableId),
    /// Packed, then unpacked, reverse-lookup map, bucketed by origin key.
    LpMap(TableId),
}

impl FileId {
    /// Stable file-set name, e.g. `lp_4` or `pairs_r_6`.
    pub fn name(&self) -> String {
        match self {
            FileId::X => "x".to_string(),
            FileId::Marks(t) => format!("marks_{}", t.number()),
            FileId::PairsL(t) => format!("pairs_l_{}", t.number()),
            FileId::PairsR(t) => format!("pairs_r_{}", t.number()),
            FileId::RMap(t) => format!("map_{}", t.number()),
            FileId::Lp(t) => format!("lp_{}", t.number()),
            FileId::LpKey(t) => format!("lp_key_{}", t.number()),
            FileId::LpMap(t) => format!("lp_map_{}", t.number()),
        }
    }

    /// Physical file name of one bucket of this set.
    pub fn bucket_file_name(&self, bucket: u32) -> String {
        format!("{}.{}", self.name(), bucket)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

//==================================================================================
// 3. SeekOrigin
//==================================================================================

/// Where a seek offset is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Begin,
    Current,
    End,
}

//==================================================================================
// 4. PlotContext
//==================================================================================

/// Accounting handed over from the earlier phases: how many entries each
/// table holds and how they are distributed over buckets.
///
/// `entry_counts` is updated in place by the orchestrator as tables are
/// pruned, so after `Phase3::run` it holds the post-compression counts.
#[derive(Debug, Clone)]
pub struct PlotContext {
    /// Entries per table. For r-tables this is the pre-prune count on entry
    /// to phase 3.
    pub entry_counts: [u64; NUM_TABLES],
    /// Per-bucket x-value counts of table 1 (the first iteration's l-map
    /// chunk lengths). Length must equal the configured bucket count.
    pub x_bucket_counts: Vec<u32>,
    /// Per-bucket r-pair/r-map entry counts, per table. Indexed
    /// `[table.index()][bucket]`; table 1 is unused.
    pub ptr_bucket_counts: Vec<Vec<u32>>,
}

impl PlotContext {
    /// Size in bytes of the marks bitfield for `table`, rounded up to whole
    /// u64 words as persisted by phase 2.
    pub fn marks_len_bytes(&self, table: TableId) -> usize {
        let bits = self.entry_counts[table.index()];
        (bits.div_ceil(64) * 8) as usize
    }
}

//==================================================================================
// 5. Unit Tests
//==================================================================================
