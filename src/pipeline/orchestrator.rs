//! The phase-3 orchestrator.
//!
//! `Phase3` owns the engine heap carve, the I/O queue, the per-table
//! counters and the table loop. Each r-table is pushed through three steps
//! (prune + LP generation, LP sort + reverse map, map unpack) whose
//! implementations live in the sibling `step_one` / `step_two` /
//! `step_three` modules as further `impl Phase3` blocks. The orchestrator
//! acts as a coordinator only: buffer ownership, counter resets and
//! sequencing happen here, the per-bucket work happens in the steps.

use std::time::Instant;

use serde::Serialize;

use crate::config::PlotpressConfig;
use crate::error::PlotpressError;
use crate::io::arena::IoBuffer;
use crate::io::fence::Fence;
use crate::io::queue::DiskQueue;
use crate::pipeline::step_one::StepOneBufs;
use crate::types::{FileId, PlotContext, TableId};
use crate::utils::round_up_to;

//==================================================================================
// 1. Park Hook & Report
//==================================================================================

/// Out-of-band consumer of sorted line-point runs. After step 2 sorts an LP
/// bucket, the sink receives the run together with its global entry offset;
/// delta-encoding and parking into the final plot format happen beyond this
/// engine's boundary.
pub trait ParkSink: Send {
    fn park(&mut self, table: TableId, sorted_line_points: &[u64], global_offset: u64);
}

/// Per-table compression outcome.
#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub table: u8,
    pub entries_before: u64,
    pub entries_after: u64,
    pub elapsed_secs: f64,
}

/// Summary of a full phase-3 run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Phase3Report {
    pub tables: Vec<TableStats>,
}

impl Phase3Report {
    pub fn to_json(&self) -> Result<String, PlotpressError> {
        Ok(serde_json::to_string(self)?)
    }
}

//==================================================================================
// 2. Phase3
//==================================================================================

pub struct Phase3 {
    pub(crate) cfg: PlotpressConfig,
    pub(crate) ctx: PlotContext,
    pub(crate) queue: DiskQueue,
    pub(crate) read_fence: Fence,

    // Fixed carve: marks bitfield, two ping-pong bucket sets, pruned-key and
    // line-point scratch. Option slots hold buffers that shuttle through
    // read commands and come back via claim.
    pub(crate) marks: Option<IoBuffer>,
    pub(crate) free_sets: Vec<StepOneBufs>,
    pub(crate) pruned_keys: IoBuffer,
    pub(crate) lp_scratch: IoBuffer,
    pub(crate) carry: Vec<u32>,

    /// Largest bucket length (entries) any step has to hold, EXTRA_L included.
    pub(crate) max_bucket_len: usize,

    // Per-table counters, reset by `process_table`.
    pub(crate) pruned_entry_count: u64,
    pub(crate) lp_bucket_counts: Vec<u64>,
    pub(crate) l_map_bucket_counts: Vec<u64>,
    pub(crate) r_table_offset: u64,

    // The l-map stream layout consumed by step 1: chunk lengths per origin
    // bucket. Seeded from the x-file bucket counts, then replaced after each
    // step 3 with exactly the dense chunk lengths it wrote. This keeps the
    // l-map positionally aligned with the next table's pairs.
    pub(crate) l_chunk_lens: Vec<u32>,
    pub(crate) l_total: u64,

    pub(crate) park: Option<Box<dyn ParkSink>>,
}

impl Phase3 {
    /// Validates configuration and context, carves the fixed buffers from
    /// the queue's arena and declares this phase's file sets.
    pub fn new(
        cfg: PlotpressConfig,
        ctx: PlotContext,
        mut queue: DiskQueue,
    ) -> Result<Self, PlotpressError> {
        cfg.validate()?;

        let num_buckets = cfg.num_buckets as usize;
        if ctx.x_bucket_counts.len() != num_buckets {
            return Err(PlotpressError::Config(format!(
                "x_bucket_counts has {} buckets, config says {}",
                ctx.x_bucket_counts.len(),
                num_buckets
            )));
        }
        let x_sum: u64 = ctx.x_bucket_counts.iter().map(|&c| c as u64).sum();
        if x_sum != ctx.entry_counts[TableId::Table1.index()] {
            return Err(PlotpressError::Config(format!(
                "x bucket counts sum to {}, table 1 holds {}",
                x_sum,
                ctx.entry_counts[TableId::Table1.index()]
            )));
        }
        for table in TableId::R_TABLES {
            let counts = &ctx.ptr_bucket_counts[table.index()];
            if counts.len() != num_buckets {
                return Err(PlotpressError::Config(format!(
                    "{} pair counts have {} buckets, config says {}",
                    table,
                    counts.len(),
                    num_buckets
                )));
            }
            let sum: u64 = counts.iter().map(|&c| c as u64).sum();
            if sum != ctx.entry_counts[table.index()] {
                return Err(PlotpressError::Config(format!(
                    "{} pair counts sum to {}, entry count is {}",
                    table,
                    sum,
                    ctx.entry_counts[table.index()]
                )));
            }
        }
        for table in TableId::ALL {
            if ctx.entry_counts[table.index()] > cfg.max_entries() {
                return Err(PlotpressError::Config(format!(
                    "{} holds {} entries, limit for k={} is {}",
                    table,
                    ctx.entry_counts[table.index()],
                    cfg.k,
                    cfg.max_entries()
                )));
            }
        }

        // Largest bucket any step touches: l-map chunks (bounded by the
        // x buckets and the fixed dense chunk size), r-pair buckets, plus
        // the EXTRA_L carry.
        let mut max_len = cfg.fixed_bucket_size() as u64;
        for &c in &ctx.x_bucket_counts {
            max_len = max_len.max(c as u64);
        }
        for table in TableId::R_TABLES {
            for &c in &ctx.ptr_bucket_counts[table.index()] {
                max_len = max_len.max(c as u64);
            }
        }
        // Line points only populate the lower half of the 2K-bit space
        // (triangle(max) < 2^(2K-1)), so LP buckets run around twice the
        // mean; reserve four times the mean, capped at a whole table.
        let max_r_entries = TableId::R_TABLES
            .iter()
            .map(|&t| ctx.entry_counts[t.index()])
            .max()
            .unwrap_or(0);
        let lp_reserve = (max_r_entries / cfg.lp_buckets as u64 * 4).min(max_r_entries);
        max_len = max_len.max(lp_reserve);
        let max_bucket_len = max_len as usize + cfg.extra_l as usize;

        // Carve the fixed buffers.
        let arena = queue.arena();
        let block = queue.block_size();
        let carve = |bytes: usize| -> Result<IoBuffer, PlotpressError> {
            arena
                .alloc(round_up_to(bytes, block), true)?
                .ok_or_else(|| PlotpressError::Internal("blocking carve returned none".to_string()))
        };

        let marks_bytes = TableId::R_TABLES
            .iter()
            .map(|&t| ctx.marks_len_bytes(t))
            .max()
            .unwrap_or(0);
        let marks = carve(marks_bytes.max(8))?;

        let mut free_sets = Vec::with_capacity(2);
        for _ in 0..2 {
            free_sets.push(StepOneBufs {
                l_map: carve(max_bucket_len * 4)?,
                pairs_l: carve(max_bucket_len * 4)?,
                pairs_r: carve(max_bucket_len * 2)?,
                r_map: carve(max_bucket_len * 4)?,
            });
        }
        let pruned_keys = carve(max_bucket_len * 4)?;
        let lp_scratch = carve(max_bucket_len * 8)?;

        // The remainder is the transient-buffer arena. Step 2 is the peak:
        // two loaded (LP, key) bucket pairs plus the packed-map output.
        let transient_need = max_bucket_len * (2 * 12 + 8);
        let remainder = arena.capacity() - arena.in_use();
        if remainder < transient_need {
            return Err(PlotpressError::Config(format!(
                "heap_size {} too small: fixed buffers take {}, transient peak needs {}",
                cfg.heap_size,
                arena.in_use(),
                transient_need
            )));
        }

        // Declare this phase's output file sets; the input sets are single
        // sequential streams.
        for table in TableId::R_TABLES {
            queue.init_file_set(FileId::Lp(table), cfg.lp_buckets);
            queue.init_file_set(FileId::LpKey(table), cfg.lp_buckets);
            queue.init_file_set(FileId::LpMap(table), cfg.num_buckets);
            queue.init_file_set(FileId::Marks(table), 1);
            queue.init_file_set(FileId::PairsL(table), 1);
            queue.init_file_set(FileId::PairsR(table), 1);
            queue.init_file_set(FileId::RMap(table), 1);
        }
        queue.init_file_set(FileId::X, 1);
        queue.commit()?;

        let l_chunk_lens = ctx.x_bucket_counts.clone();
        let l_total = ctx.entry_counts[TableId::Table1.index()];
        let lp_buckets = cfg.lp_buckets as usize;

        Ok(Self {
            cfg,
            ctx,
            queue,
            read_fence: Fence::new(),
            marks: Some(marks),
            free_sets,
            pruned_keys,
            lp_scratch,
            carry: Vec::new(),
            max_bucket_len,
            pruned_entry_count: 0,
            lp_bucket_counts: vec![0; lp_buckets],
            l_map_bucket_counts: vec![0; num_buckets],
            r_table_offset: 0,
            l_chunk_lens,
            l_total,
            park: None,
        })
    }

    /// Registers the consumer of sorted line-point runs.
    pub fn with_park_sink(mut self, sink: Box<dyn ParkSink>) -> Self {
        self.park = Some(sink);
        self
    }

    /// Compresses tables 2..=7 and returns the per-table outcome. All
    /// queued writes have completed when this returns.
    pub fn run(mut self) -> Result<Phase3Report, PlotpressError> {
        let mut report = Phase3Report::default();

        for table in TableId::R_TABLES {
            log::info!(
                "Compressing tables {} and {}...",
                table.prev().number(),
                table.number()
            );
            let timer = Instant::now();

            let stats = self.process_table(table)?;
            let elapsed = timer.elapsed().as_secs_f64();

            log::info!("Finished compressing in {:.2} seconds.", elapsed);
            report.tables.push(TableStats {
                elapsed_secs: elapsed,
                ..stats
            });
        }

        self.queue.drain()?;
        Ok(report)
    }

    fn process_table(&mut self, table: TableId) -> Result<TableStats, PlotpressError> {
        // Reset table counters.
        self.pruned_entry_count = 0;
        self.r_table_offset = 0;
        self.lp_bucket_counts.iter_mut().for_each(|c| *c = 0);
        self.l_map_bucket_counts.iter_mut().for_each(|c| *c = 0);

        let entries_before = self.ctx.entry_counts[table.index()];

        // Prune the r-table pairs and key, convert pairs to line points,
        // then distribute them to LP buckets along with the key.
        self.table_first_step(table)?;

        // Load LP buckets and key, sort them, hand the sorted run to the
        // park sink, and write the reverse lookup map.
        self.table_second_step(table)?;

        // Unpack the map into the l-table of the next iteration.
        self.table_third_step(table)?;

        let entries_after = self.pruned_entry_count;
        log::info!(
            " Table {} now has {} / {} ({:.2}%) entries.",
            table.number(),
            entries_after,
            entries_before,
            if entries_before == 0 {
                0.0
            } else {
                entries_after as f64 / entries_before as f64 * 100.0
            }
        );
        plot_metric!(
            "event" = "table_compressed",
            "table" = &table.number(),
            "entries_before" = &entries_before,
            "entries_after" = &entries_after,
        );

        self.ctx.entry_counts[table.index()] = entries_after;

        Ok(TableStats {
            table: table.number(),
            entries_before,
            entries_after,
            elapsed_secs: 0.0,
        })
    }
}
