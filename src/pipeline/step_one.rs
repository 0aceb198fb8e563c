//! Step 1: prune the r-table against the marks bitfield and convert the
//! surviving back-pointer pairs into line points, distributed to LP buckets.
//!
//! The l-map, r-pairs and r-map are consumed bucket by bucket with one
//! bucket of read-ahead behind monotonically numbered fences. The l-map is
//! one sequential stream read in tracked chunk lengths; every bucket's
//! window additionally holds up to `EXTRA_L` entries of the next chunk so
//! that `left + right` lookups can cross the bucket boundary.
//!
//! Per bucket the workers make three passes over their slice of the
//! r-entries: count the survivors, pack the surviving `(left, left+right)`
//! pairs and keys into their exclusive output span, then overwrite each
//! packed pair in place with its line point. The packed pair and the line
//! point occupy the same eight bytes, so the passes must not be reordered.

use std::collections::VecDeque;

use crate::error::PlotpressError;
use crate::io::arena::IoBuffer;
use crate::io::queue::ReadTicket;
use crate::kernels::bitfield::MarksView;
use crate::kernels::line_point::square_to_line_point;
use crate::pipeline::distributor::distribute_pairs;
use crate::pipeline::orchestrator::Phase3;
use crate::types::{FileId, SeekOrigin, TableId};
use crate::utils::{split_by_lens, worker_ranges};

//==================================================================================
// 1. Buffers & Stream Plan
//==================================================================================

/// One ping-pong set of step-1 input buffers.
pub(crate) struct StepOneBufs {
    pub l_map: IoBuffer,
    pub pairs_l: IoBuffer,
    pub pairs_r: IoBuffer,
    pub r_map: IoBuffer,
}

struct PendingBucket {
    l_map: ReadTicket,
    pairs_l: ReadTicket,
    pairs_r: ReadTicket,
    r_map: ReadTicket,
}

struct StepOneFiles {
    l_map: FileId,
    marks: FileId,
    pairs_l: FileId,
    pairs_r: FileId,
    r_map: FileId,
}

/// Deterministic layout of the sequential l-map stream: how many entries
/// each bucket reads, how many carry entries it inherits from the previous
/// bucket's window, and the resulting window length.
///
/// Bucket 0 over-reads `extra` entries into the next chunk; later buckets
/// inherit those entries through the carry copy instead, so every window
/// starts exactly at its chunk and extends up to `extra` entries past it
/// (clamped at the end of the stream).
pub(crate) struct LStreamPlan {
    pub read_lens: Vec<u32>,
    pub carry_lens: Vec<u32>,
    pub window_lens: Vec<u32>,
}

impl LStreamPlan {
    pub fn build(chunk_lens: &[u32], total: u64, extra: u32) -> Self {
        let buckets = chunk_lens.len();
        let mut read_lens = Vec::with_capacity(buckets);
        let mut carry_lens = Vec::with_capacity(buckets);
        let mut window_lens = Vec::with_capacity(buckets);

        let mut cursor = 0u64;
        let mut carry = 0u32;
        for (i, &chunk) in chunk_lens.iter().enumerate() {
            let nominal = if i == 0 {
                chunk as u64 + extra as u64
            } else {
                chunk as u64
            };
            let read = nominal.min(total - cursor) as u32;
            let window = carry + read;

            read_lens.push(read);
            carry_lens.push(carry);
            window_lens.push(window);

            cursor += read as u64;
            carry = extra.min(window.saturating_sub(chunk));
        }

        Self {
            read_lens,
            carry_lens,
            window_lens,
        }
    }
}

//==================================================================================
// 2. Prune + LP Kernel (per bucket, parallel)
//==================================================================================

/// Prunes one bucket of r-entries against the marks and replaces the
/// survivors with line points computed from the l-window.
///
/// `lp_out` and `key_out` receive the survivors densely from index 0, in
/// bucket order; the return value gives each worker's contribution so the
/// caller can rebuild the per-worker slices for distribution.
pub(crate) fn prune_and_generate(
    workers: usize,
    marks: &MarksView<'_>,
    l_window: &[u32],
    pairs_l: &[u32],
    pairs_r: &[u16],
    r_map: &[u32],
    lp_out: &mut [u64],
    key_out: &mut [u32],
) -> Vec<usize> {
    let ranges = worker_ranges(r_map.len(), workers);

    // Pass A: count survivors per worker slice.
    let counts: Vec<usize> = std::thread::scope(|scope| {
        let handles: Vec<_> = ranges
            .iter()
            .cloned()
            .map(|range| scope.spawn(move || r_map[range].iter().filter(|&&k| marks.get(k)).count()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let total: usize = counts.iter().sum();

    // Each worker owns an exclusive span of the pruned output.
    let lp_parts = split_by_lens(&mut lp_out[..total], &counts);
    let key_parts = split_by_lens(&mut key_out[..total], &counts);

    std::thread::scope(|scope| {
        for ((range, lp_part), key_part) in ranges.into_iter().zip(lp_parts).zip(key_parts) {
            scope.spawn(move || {
                // Pass B: pack surviving (left, left + right) pairs and keys.
                let mut n = 0usize;
                for i in range {
                    let key = r_map[i];
                    if !marks.get(key) {
                        continue;
                    }
                    let left = pairs_l[i] as u64;
                    let right = left + pairs_r[i] as u64;
                    lp_part[n] = left | (right << 32);
                    key_part[n] = key;
                    n += 1;
                }

                // Pass C: overwrite each packed pair with its line point.
                // The pair and the line point share the same slot.
                for slot in lp_part.iter_mut() {
                    let pair = *slot;
                    let x = l_window[(pair & 0xFFFF_FFFF) as usize] as u64;
                    let y = l_window[(pair >> 32) as usize] as u64;
                    *slot = square_to_line_point(x, y);
                }
            });
        }
    });

    counts
}

//==================================================================================
// 3. The Step-1 Bucket Loop
//==================================================================================

impl Phase3 {
    pub(crate) fn table_first_step(&mut self, table: TableId) -> Result<(), PlotpressError> {
        let num_buckets = self.cfg.num_buckets as usize;
        let files = StepOneFiles {
            l_map: if table == TableId::Table2 {
                FileId::X
            } else {
                FileId::LpMap(table.prev())
            },
            marks: FileId::Marks(table),
            pairs_l: FileId::PairsL(table),
            pairs_r: FileId::PairsR(table),
            r_map: FileId::RMap(table),
        };

        self.read_fence.reset(0);

        // Rewind all inputs.
        self.queue.seek_bucket(files.marks, 0, SeekOrigin::Begin);
        self.queue.seek_file(files.l_map, 0, 0, SeekOrigin::Begin);
        self.queue.seek_file(files.pairs_l, 0, 0, SeekOrigin::Begin);
        self.queue.seek_file(files.pairs_r, 0, 0, SeekOrigin::Begin);
        self.queue.seek_file(files.r_map, 0, 0, SeekOrigin::Begin);
        self.queue.commit()?;

        let plan = LStreamPlan::build(&self.l_chunk_lens, self.l_total, self.cfg.extra_l);

        // Initial load: the full marks bitfield plus bucket 0, fence 1.
        let marks_len = self.ctx.marks_len_bytes(table);
        let marks_buf = self
            .marks
            .take()
            .ok_or_else(|| PlotpressError::Internal("marks buffer not at rest".to_string()))?;
        let mut marks_ticket = Some(self.queue.read_file(files.marks, 0, marks_buf, 0, marks_len));

        let first_set = self
            .free_sets
            .pop()
            .ok_or_else(|| PlotpressError::Internal("step-one buffer set missing".to_string()))?;
        let mut inflight = VecDeque::new();
        inflight.push_back(self.issue_bucket_reads(&files, table, 0, first_set, &plan)?);
        let mut free = self.free_sets.pop();

        self.carry.clear();

        for bucket in 0..num_buckets {
            // Read ahead one bucket into the inactive set.
            if bucket + 1 < num_buckets {
                let bufs = free
                    .take()
                    .ok_or_else(|| PlotpressError::Internal("free step-one set missing".to_string()))?;
                inflight.push_back(self.issue_bucket_reads(&files, table, bucket + 1, bufs, &plan)?);
            }

            // Wait for the current bucket, then take ownership back.
            self.queue.wait_fence(&self.read_fence, (bucket + 1) as u64)?;
            if let Some(ticket) = marks_ticket.take() {
                self.marks = Some(self.queue.claim(ticket)?);
            }
            let pending = inflight
                .pop_front()
                .ok_or_else(|| PlotpressError::Internal("no pending step-one bucket".to_string()))?;
            let mut bufs = self.claim_set(pending)?;

            // Splice the carry from the previous window in front of this
            // bucket's chunk.
            let carry_len = plan.carry_lens[bucket] as usize;
            bufs.l_map.as_u32s_mut()[..carry_len].copy_from_slice(&self.carry[..carry_len]);

            self.bucket_first_step(table, bucket, &plan, &bufs)?;

            // Stage the carry for the next bucket: the first EXTRA_L entries
            // past this bucket's chunk.
            if bucket + 1 < num_buckets {
                let next_carry = plan.carry_lens[bucket + 1] as usize;
                let chunk = self.l_chunk_lens[bucket] as usize;
                let window = &bufs.l_map.as_u32s()[..plan.window_lens[bucket] as usize];
                self.carry.clear();
                self.carry.extend_from_slice(&window[chunk..chunk + next_carry]);
            }

            if let Some(prev) = free.replace(bufs) {
                self.free_sets.push(prev);
            }
        }

        if let Some(last) = free.take() {
            self.free_sets.push(last);
        }

        log::debug!(
            "{}: scanned {} r-entries, {} survived",
            table,
            self.r_table_offset,
            self.pruned_entry_count
        );
        Ok(())
    }

    fn issue_bucket_reads(
        &mut self,
        files: &StepOneFiles,
        table: TableId,
        bucket: usize,
        bufs: StepOneBufs,
        plan: &LStreamPlan,
    ) -> Result<PendingBucket, PlotpressError> {
        let r_len = self.ctx.ptr_bucket_counts[table.index()][bucket] as usize;
        let l_off = plan.carry_lens[bucket] as usize * 4;
        let l_bytes = plan.read_lens[bucket] as usize * 4;

        let pending = PendingBucket {
            l_map: self.queue.read_file(files.l_map, 0, bufs.l_map, l_off, l_bytes),
            pairs_l: self.queue.read_file(files.pairs_l, 0, bufs.pairs_l, 0, r_len * 4),
            pairs_r: self.queue.read_file(files.pairs_r, 0, bufs.pairs_r, 0, r_len * 2),
            r_map: self.queue.read_file(files.r_map, 0, bufs.r_map, 0, r_len * 4),
        };
        self.queue.signal_fence(&self.read_fence, (bucket + 1) as u64);
        self.queue.commit()?;
        Ok(pending)
    }

    fn claim_set(&mut self, pending: PendingBucket) -> Result<StepOneBufs, PlotpressError> {
        Ok(StepOneBufs {
            l_map: self.queue.claim(pending.l_map)?,
            pairs_l: self.queue.claim(pending.pairs_l)?,
            pairs_r: self.queue.claim(pending.pairs_r)?,
            r_map: self.queue.claim(pending.r_map)?,
        })
    }

    /// Prunes and converts one bucket, then scatters the surviving
    /// `(line point, key)` pairs to the LP bucket files.
    fn bucket_first_step(
        &mut self,
        table: TableId,
        bucket: usize,
        plan: &LStreamPlan,
        bufs: &StepOneBufs,
    ) -> Result<(), PlotpressError> {
        let r_len = self.ctx.ptr_bucket_counts[table.index()][bucket] as usize;
        let window_len = plan.window_lens[bucket] as usize;

        let marks_words = self
            .marks
            .as_ref()
            .ok_or_else(|| PlotpressError::Internal("marks not loaded".to_string()))?
            .as_u64s();
        let marks = MarksView::new(marks_words, self.ctx.entry_counts[table.index()]);

        let counts = prune_and_generate(
            self.cfg.workers,
            &marks,
            &bufs.l_map.as_u32s()[..window_len],
            &bufs.pairs_l.as_u32s()[..r_len],
            &bufs.pairs_r.as_u16s()[..r_len],
            &bufs.r_map.as_u32s()[..r_len],
            self.lp_scratch.as_u64s_mut(),
            self.pruned_keys.as_u32s_mut(),
        );
        let total: usize = counts.iter().sum();

        // Rebuild the per-worker slices of the pruned output and scatter
        // them to LP buckets, keys riding along.
        let lp_all = &self.lp_scratch.as_u64s()[..total];
        let key_all = &self.pruned_keys.as_u32s()[..total];
        let mut slices = Vec::with_capacity(counts.len());
        let mut offset = 0usize;
        for &c in &counts {
            slices.push((&lp_all[offset..offset + c], &key_all[offset..offset + c]));
            offset += c;
        }

        let shift = self.cfg.lp_bucket_shift().min(63);
        let lp_buckets = self.cfg.lp_buckets as usize;
        let mut lp_out = self
            .queue
            .get_buffer(total * 8, true)?
            .ok_or_else(|| PlotpressError::Internal("blocking get_buffer returned none".to_string()))?;
        let mut key_out = self
            .queue
            .get_buffer(total * 4, true)?
            .ok_or_else(|| PlotpressError::Internal("blocking get_buffer returned none".to_string()))?;

        let totals = distribute_pairs(
            &slices,
            lp_buckets,
            |lp| (lp >> shift) as usize,
            &mut lp_out.as_u64s_mut()[..total],
            &mut key_out.as_u32s_mut()[..total],
        );

        let lp_sizes: Vec<u32> = totals.iter().map(|&c| c * 8).collect();
        let key_sizes: Vec<u32> = totals.iter().map(|&c| c * 4).collect();
        self.queue.write_buckets(FileId::Lp(table), lp_out, lp_sizes);
        self.queue.write_buckets(FileId::LpKey(table), key_out, key_sizes);
        self.queue.commit()?;

        for (acc, c) in self.lp_bucket_counts.iter_mut().zip(&totals) {
            *acc += *c as u64;
        }
        self.pruned_entry_count += total as u64;
        self.r_table_offset += r_len as u64;
        Ok(())
    }
}

//==================================================================================
// 4. Unit Tests
//==================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_plan_even_chunks() {
        // Four chunks of 16 with an over-read of 4: bucket 0 reads the
        // extra up front, the tail bucket comes up short by it.
        let plan = LStreamPlan::build(&[16, 16, 16, 16], 64, 4);
        assert_eq!(plan.read_lens, vec![20, 16, 16, 12]);
        assert_eq!(plan.carry_lens, vec![0, 4, 4, 4]);
        assert_eq!(plan.window_lens, vec![20, 20, 20, 16]);
    }

    #[test]
    fn test_stream_plan_short_tail() {
        let plan = LStreamPlan::build(&[16, 16, 16, 8], 56, 4);
        assert_eq!(plan.read_lens, vec![20, 16, 16, 4]);
        assert_eq!(plan.window_lens, vec![20, 20, 20, 8]);
    }

    #[test]
    fn test_stream_plan_empty_stream() {
        let plan = LStreamPlan::build(&[0, 0, 0, 0], 0, 4);
        assert_eq!(plan.read_lens, vec![0, 0, 0, 0]);
        assert_eq!(plan.carry_lens, vec![0, 0, 0, 0]);
        assert_eq!(plan.window_lens, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_stream_plan_single_bucket() {
        let plan = LStreamPlan::build(&[32], 32, 4);
        assert_eq!(plan.read_lens, vec![32]);
        assert_eq!(plan.window_lens, vec![32]);
    }

    #[test]
    fn test_prune_and_generate_counts_and_lps() {
        // Eight entries, odd origin keys marked.
        let mut marks_words = [0u64; 1];
        for i in (1..8).step_by(2) {
            marks_words[0] |= 1 << i;
        }
        let marks = MarksView::new(&marks_words, 8);

        let l_window: Vec<u32> = (0..16).map(|v| v * 10).collect();
        let pairs_l: Vec<u32> = (0..8).collect();
        let pairs_r: Vec<u16> = vec![3; 8];
        let r_map: Vec<u32> = (0..8).collect();

        let mut lp_out = vec![0u64; 8];
        let mut key_out = vec![0u32; 8];
        let counts = prune_and_generate(
            2,
            &marks,
            &l_window,
            &pairs_l,
            &pairs_r,
            &r_map,
            &mut lp_out,
            &mut key_out,
        );

        assert_eq!(counts, vec![2, 2]);
        assert_eq!(&key_out[..4], &[1, 3, 5, 7]);
        // Entry i survives iff i is odd; its parents are l[i] and l[i + 3].
        let expect: Vec<u64> = [1u64, 3, 5, 7]
            .iter()
            .map(|&i| {
                square_to_line_point(l_window[i as usize] as u64, l_window[i as usize + 3] as u64)
            })
            .collect();
        assert_eq!(&lp_out[..4], &expect[..]);
    }

    #[test]
    fn test_prune_and_generate_all_dropped() {
        let marks = MarksView::new(&[0u64], 4);
        let l_window = vec![0u32; 8];
        let pairs_l = vec![0u32; 4];
        let pairs_r = vec![0u16; 4];
        let r_map: Vec<u32> = (0..4).collect();
        let mut lp_out = vec![0u64; 4];
        let mut key_out = vec![0u32; 4];
        let counts = prune_and_generate(
            3, &marks, &l_window, &pairs_l, &pairs_r, &r_map, &mut lp_out, &mut key_out,
        );
        assert_eq!(counts.iter().sum::<usize>(), 0);
    }
}
