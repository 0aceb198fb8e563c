//! Step 2: load each LP bucket with its co-permuted key, sort by line
//! point, hand the sorted run to the park sink, and emit the reverse-lookup
//! map bucketed by origin key.
//!
//! Each bucket load signals two fence sub-values (LP loaded, key loaded);
//! the next bucket is read ahead while the current one sorts. The reverse
//! map packs `(global post-sort index << 32) | origin key` into one u64 per
//! surviving entry and scatters the records by the top `kExtra` bits of the
//! key, which are exactly the origin bucket the entry came from.

use std::collections::VecDeque;

use crate::error::PlotpressError;
use crate::io::queue::ReadTicket;
use crate::kernels::radix::sort_keyed;
use crate::pipeline::distributor::{distribute_records, even_slices};
use crate::pipeline::orchestrator::Phase3;
use crate::types::{FileId, SeekOrigin, TableId};
use crate::utils::{split_by_lens, worker_ranges};

impl Phase3 {
    pub(crate) fn table_second_step(&mut self, table: TableId) -> Result<(), PlotpressError> {
        let lp_id = FileId::Lp(table);
        let key_id = FileId::LpKey(table);
        let lp_buckets = self.cfg.lp_buckets as usize;

        self.read_fence.reset(0);

        // The LP files were just written; rewind every bucket.
        for bucket in 0..lp_buckets as u32 {
            self.queue.seek_bucket(lp_id, bucket, SeekOrigin::Begin);
            self.queue.seek_bucket(key_id, bucket, SeekOrigin::Begin);
        }
        self.queue.commit()?;

        let mut pending: VecDeque<(ReadTicket, ReadTicket)> = VecDeque::new();
        pending.push_back(self.issue_lp_bucket(lp_id, key_id, 0)?);

        let mut entry_offset = 0u64;
        for bucket in 0..lp_buckets {
            if bucket + 1 < lp_buckets {
                pending.push_back(self.issue_lp_bucket(lp_id, key_id, bucket + 1)?);
            }

            // Wait for the key-loaded sub-fence of this bucket.
            self.queue
                .wait_fence(&self.read_fence, (bucket * 2 + 2) as u64)?;
            let (lp_ticket, key_ticket) = pending
                .pop_front()
                .ok_or_else(|| PlotpressError::Internal("no pending LP bucket".to_string()))?;
            let mut lp_buf = self.queue.claim(lp_ticket)?;
            let mut key_buf = self.queue.claim(key_ticket)?;

            let len = self.lp_bucket_counts[bucket] as usize;
            if len > self.max_bucket_len {
                return Err(PlotpressError::Internal(format!(
                    "LP bucket {} holds {} entries, scratch holds {}",
                    bucket, len, self.max_bucket_len
                )));
            }
            debug_assert!(entry_offset + (len as u64) <= u32::MAX as u64 + 1);

            // Sort the line points, key riding along.
            sort_keyed(
                &mut lp_buf.as_u64s_mut()[..len],
                &mut key_buf.as_u32s_mut()[..len],
            );

            // Sorted runs leave the engine through the park hook.
            if len > 0 {
                if let Some(sink) = self.park.as_mut() {
                    sink.park(table, &lp_buf.as_u64s()[..len], entry_offset);
                }
            }

            self.write_reverse_map(table, &key_buf.as_u32s()[..len], entry_offset)?;

            // Release the loaded bucket back to the arena.
            drop(lp_buf);
            drop(key_buf);

            entry_offset += len as u64;
        }
        Ok(())
    }

    fn issue_lp_bucket(
        &mut self,
        lp_id: FileId,
        key_id: FileId,
        bucket: usize,
    ) -> Result<(ReadTicket, ReadTicket), PlotpressError> {
        let len = self.lp_bucket_counts[bucket] as usize;
        let lp_buf = self
            .queue
            .get_buffer(len * 8, true)?
            .ok_or_else(|| PlotpressError::Internal("blocking get_buffer returned none".to_string()))?;
        let key_buf = self
            .queue
            .get_buffer(len * 4, true)?
            .ok_or_else(|| PlotpressError::Internal("blocking get_buffer returned none".to_string()))?;

        let base = (bucket * 2) as u64;
        let lp_ticket = self.queue.read_file(lp_id, bucket as u32, lp_buf, 0, len * 8);
        self.queue.signal_fence(&self.read_fence, base + 1);
        let key_ticket = self.queue.read_file(key_id, bucket as u32, key_buf, 0, len * 4);
        self.queue.signal_fence(&self.read_fence, base + 2);
        self.queue.commit()?;
        Ok((lp_ticket, key_ticket))
    }

    /// Packs the sorted key of one LP bucket into reverse-map records and
    /// writes them to the map file, scattered by origin bucket.
    fn write_reverse_map(
        &mut self,
        table: TableId,
        sorted_keys: &[u32],
        entry_offset: u64,
    ) -> Result<(), PlotpressError> {
        let len = sorted_keys.len();
        let workers = self.cfg.workers;
        let num_buckets = self.cfg.num_buckets as usize;
        let shift = self.cfg.origin_bucket_shift();

        // Build the packed records in the LP scratch, each worker filling
        // its contiguous span.
        {
            let ranges = worker_ranges(len, workers);
            let lens: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
            let parts = split_by_lens(&mut self.lp_scratch.as_u64s_mut()[..len], &lens);
            std::thread::scope(|scope| {
                for (range, part) in ranges.into_iter().zip(parts) {
                    scope.spawn(move || {
                        for (j, slot) in part.iter_mut().enumerate() {
                            let i = range.start + j;
                            let post_sort_index = entry_offset + i as u64;
                            *slot = (post_sort_index << 32) | sorted_keys[i] as u64;
                        }
                    });
                }
            });
        }

        let records = &self.lp_scratch.as_u64s()[..len];
        let slices = even_slices(records, workers);

        let mut out = self
            .queue
            .get_buffer(len * 8, true)?
            .ok_or_else(|| PlotpressError::Internal("blocking get_buffer returned none".to_string()))?;
        let totals = distribute_records(
            &slices,
            num_buckets,
            |record| ((record & 0xFFFF_FFFF) >> shift) as usize,
            &mut out.as_u64s_mut()[..len],
        );

        let sizes: Vec<u32> = totals.iter().map(|&c| c * 8).collect();
        self.queue.write_buckets(FileId::LpMap(table), out, sizes);
        self.queue.commit()?;

        for (acc, c) in self.l_map_bucket_counts.iter_mut().zip(&totals) {
            *acc += *c as u64;
        }
        Ok(())
    }
}
