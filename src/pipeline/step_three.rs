//! Step 3: rewrite the bucketed packed reverse-map as one dense array of
//! post-sort indices, positionally aligned with the next r-table's pairs.
//!
//! Each packed bucket is loaded (with one bucket of read-ahead), its
//! records unpacked into a dense chunk indexed by `origin key - bucket
//! base`, and the chunk appended to bucket file 0 of the same set, which is
//! rewound on the first bucket and reused as the next iteration's l-map
//! stream. Bucket files past 0 are deleted once read.
//!
//! Workers split the packed records into disjoint slices; no prefix sum is
//! needed because a bucket's origin keys are unique, so every output index
//! is written at most once.

use std::collections::VecDeque;

use crate::error::PlotpressError;
use crate::io::queue::ReadTicket;
use crate::pipeline::distributor::{even_slices, SharedSliceMut};
use crate::pipeline::orchestrator::Phase3;
use crate::types::{FileId, SeekOrigin, TableId};

/// Scatters packed `(post-sort index << 32) | origin key` records into the
/// dense chunk of their origin bucket.
pub(crate) fn unpack_map(workers: usize, bucket_base: u64, records: &[u64], out: &mut [u32]) {
    let dense = SharedSliceMut::new(out);
    let slices = even_slices(records, workers);
    std::thread::scope(|scope| {
        for &slice in &slices {
            let dense = &dense;
            scope.spawn(move || {
                for &record in slice {
                    let index = ((record & 0xFFFF_FFFF) - bucket_base) as usize;
                    dense.write(index, (record >> 32) as u32);
                }
            });
        }
    });
}

impl Phase3 {
    pub(crate) fn table_third_step(&mut self, table: TableId) -> Result<(), PlotpressError> {
        let map_id = FileId::LpMap(table);
        let num_buckets = self.cfg.num_buckets as usize;
        let fixed = self.cfg.fixed_bucket_size() as u64;

        self.read_fence.reset(0);
        for bucket in 0..num_buckets as u32 {
            self.queue.seek_bucket(map_id, bucket, SeekOrigin::Begin);
        }
        self.queue.commit()?;

        // Dense chunk lengths. The origin-key space is the table's pre-prune
        // entry count, so every bucket past the first under-full one comes
        // up correspondingly short; a fully pruned table leaves no map.
        let origin_total = self.ctx.entry_counts[table.index()];
        let pruned_total = self.pruned_entry_count;
        let write_lens: Vec<u32> = (0..num_buckets as u64)
            .map(|bucket| {
                if pruned_total == 0 {
                    0
                } else {
                    origin_total.saturating_sub(bucket * fixed).min(fixed) as u32
                }
            })
            .collect();

        let mut pending: VecDeque<ReadTicket> = VecDeque::new();
        pending.push_back(self.issue_map_bucket(map_id, 0)?);

        for bucket in 0..num_buckets {
            if bucket + 1 < num_buckets {
                pending.push_back(self.issue_map_bucket(map_id, bucket + 1)?);
            }

            self.queue.wait_fence(&self.read_fence, (bucket + 1) as u64)?;
            let packed = self.queue.claim(
                pending
                    .pop_front()
                    .ok_or_else(|| PlotpressError::Internal("no pending map bucket".to_string()))?,
            )?;

            let records = self.l_map_bucket_counts[bucket] as usize;
            let write_len = write_lens[bucket] as usize;
            let mut out = self.queue.get_buffer(write_len * 4, true)?.ok_or_else(|| {
                PlotpressError::Internal("blocking get_buffer returned none".to_string())
            })?;

            unpack_map(
                self.cfg.workers,
                bucket as u64 * fixed,
                &packed.as_u64s()[..records],
                &mut out.as_u32s_mut()[..write_len],
            );
            drop(packed);

            // Append the dense chunk to the rewound bucket-0 stream.
            self.queue.write_file(map_id, 0, out, write_len * 4);
            self.queue.commit()?;
        }

        // The dense layout written here is exactly what the next table's
        // step 1 reads back as its l-map.
        self.l_chunk_lens = write_lens;
        self.l_total = self.l_chunk_lens.iter().map(|&c| c as u64).sum();
        Ok(())
    }

    fn issue_map_bucket(&mut self, map_id: FileId, bucket: usize) -> Result<ReadTicket, PlotpressError> {
        let records = self.l_map_bucket_counts[bucket] as usize;
        let buf = self
            .queue
            .get_buffer(records * 8, true)?
            .ok_or_else(|| PlotpressError::Internal("blocking get_buffer returned none".to_string()))?;
        let ticket = self.queue.read_file(map_id, bucket as u32, buf, 0, records * 8);
        self.queue.signal_fence(&self.read_fence, (bucket + 1) as u64);

        if bucket == 0 {
            // Rewind to reuse this file for the dense rewrite.
            self.queue.seek_file(map_id, 0, 0, SeekOrigin::Begin);
        } else {
            self.queue.delete_file(map_id, bucket as u32);
        }
        self.queue.commit()?;
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_map_scatters_by_origin_key() {
        // Bucket base 64; keys 64..68 permuted, post-sort indices 10..14.
        let records: Vec<u64> = vec![
            (12u64 << 32) | 66,
            (10u64 << 32) | 64,
            (13u64 << 32) | 67,
            (11u64 << 32) | 65,
        ];
        let mut out = vec![0u32; 4];
        unpack_map(2, 64, &records, &mut out);
        assert_eq!(out, vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_unpack_map_partial_bucket_leaves_holes() {
        // Only keys 2 and 5 survive pruning in a chunk of 8.
        let records: Vec<u64> = vec![(7u64 << 32) | 2, (3u64 << 32) | 5];
        let mut out = vec![u32::MAX; 8];
        unpack_map(1, 0, &records, &mut out);
        assert_eq!(out[2], 7);
        assert_eq!(out[5], 3);
        assert_eq!(out[0], u32::MAX); // untouched hole
    }
}
