//! The parallel distributor: a two-pass count / prefix-sum / scatter
//! primitive that partitions records into destination buckets while
//! preserving a deterministic order.
//!
//! Pass one has every worker count its records per destination bucket. The
//! control thread then turns the (workers x buckets) count matrix into a
//! write-offset matrix by a column-wise exclusive prefix sum. Pass two has
//! every worker scatter its records forward from its offsets. Within a
//! bucket, a worker's records keep their relative order and worker i's
//! records precede worker i+1's, so the output is reproducible regardless
//! of thread interleaving.
//!
//! The scatter writes are interleaved across workers but provably disjoint;
//! they go through a bounds-asserted shared-slice cell rather than `&mut`
//! aliasing.

use std::marker::PhantomData;

use crate::utils::worker_ranges;

//==================================================================================
// 1. Shared scatter target
//==================================================================================

/// A writable view of one output slice shared by the scatter workers.
/// Soundness rests on the caller's partitioning: every index is written by
/// exactly one worker (prefix-sum offsets here, unique origin keys in the
/// map unpack).
pub(crate) struct SharedSliceMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for SharedSliceMut<'_, T> {}
unsafe impl<T: Send> Sync for SharedSliceMut<'_, T> {}

impl<'a, T: Copy> SharedSliceMut<'a, T> {
    pub(crate) fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.len);
        unsafe { self.ptr.add(index).write(value) }
    }
}

//==================================================================================
// 2. Prefix-sum core
//==================================================================================

/// Turns the per-worker count matrix into per-worker exclusive write
/// offsets plus per-bucket totals. Worker w's region in bucket b starts at
/// `sum(totals[..b]) + sum(counts[..w][b])`.
pub fn exclusive_offsets(counts: &[Vec<u32>], num_buckets: usize) -> (Vec<Vec<u32>>, Vec<u32>) {
    let mut totals = vec![0u32; num_buckets];
    for worker in counts {
        for (b, &c) in worker.iter().enumerate() {
            totals[b] += c;
        }
    }

    let mut bucket_base = vec![0u32; num_buckets];
    let mut acc = 0u32;
    for b in 0..num_buckets {
        bucket_base[b] = acc;
        acc += totals[b];
    }

    let mut offsets = Vec::with_capacity(counts.len());
    let mut running = bucket_base;
    for worker in counts {
        offsets.push(running.clone());
        for (b, &c) in worker.iter().enumerate() {
            running[b] += c;
        }
    }

    (offsets, totals)
}

//==================================================================================
// 3. Monomorphic distributors
//==================================================================================

/// Scatters co-owned `(line point, key)` arrays into `num_buckets`
/// partitions of the output pair. `slices` carries one input slice pair per
/// worker, in worker order; outputs must hold exactly the summed input
/// length. Returns per-bucket record counts.
pub fn distribute_pairs(
    slices: &[(&[u64], &[u32])],
    num_buckets: usize,
    classify: impl Fn(u64) -> usize + Sync,
    out_keys: &mut [u64],
    out_vals: &mut [u32],
) -> Vec<u32> {
    let total: usize = slices.iter().map(|(k, _)| k.len()).sum();
    debug_assert_eq!(out_keys.len(), total);
    debug_assert_eq!(out_vals.len(), total);

    // Pass one: local counts, one worker per input slice.
    let classify = &classify;
    let counts: Vec<Vec<u32>> = std::thread::scope(|scope| {
        let handles: Vec<_> = slices
            .iter()
            .map(|&(keys, _)| {
                scope.spawn(move || {
                    let mut counts = vec![0u32; num_buckets];
                    for &k in keys {
                        let b = classify(k);
                        debug_assert!(b < num_buckets);
                        counts[b] += 1;
                    }
                    counts
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Control: column-wise exclusive prefix sum.
    let (offsets, totals) = exclusive_offsets(&counts, num_buckets);

    // Pass two: forward scatter into disjoint positions.
    let keys_out = SharedSliceMut::new(out_keys);
    let vals_out = SharedSliceMut::new(out_vals);
    std::thread::scope(|scope| {
        for (&(keys, vals), offsets) in slices.iter().zip(offsets) {
            let keys_out = &keys_out;
            let vals_out = &vals_out;
            scope.spawn(move || {
                let mut next = offsets;
                for (&k, &v) in keys.iter().zip(vals.iter()) {
                    let b = classify(k);
                    let dst = next[b] as usize;
                    next[b] += 1;
                    keys_out.write(dst, k);
                    vals_out.write(dst, v);
                }
            });
        }
    });

    totals
}

/// Scatters packed u64 records into `num_buckets` partitions of `out`.
/// Same contract as [`distribute_pairs`] without a satellite array.
pub fn distribute_records(
    slices: &[&[u64]],
    num_buckets: usize,
    classify: impl Fn(u64) -> usize + Sync,
    out: &mut [u64],
) -> Vec<u32> {
    let total: usize = slices.iter().map(|s| s.len()).sum();
    debug_assert_eq!(out.len(), total);

    let classify = &classify;
    let counts: Vec<Vec<u32>> = std::thread::scope(|scope| {
        let handles: Vec<_> = slices
            .iter()
            .map(|&records| {
                scope.spawn(move || {
                    let mut counts = vec![0u32; num_buckets];
                    for &r in records {
                        let b = classify(r);
                        debug_assert!(b < num_buckets);
                        counts[b] += 1;
                    }
                    counts
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let (offsets, totals) = exclusive_offsets(&counts, num_buckets);

    let records_out = SharedSliceMut::new(out);
    std::thread::scope(|scope| {
        for (&records, offsets) in slices.iter().zip(offsets) {
            let records_out = &records_out;
            scope.spawn(move || {
                let mut next = offsets;
                for &r in records {
                    let b = classify(r);
                    let dst = next[b] as usize;
                    next[b] += 1;
                    records_out.write(dst, r);
                }
            });
        }
    });

    totals
}

/// Splits one logical input evenly into per-worker slices for the
/// distributors, in worker-id order.
pub fn even_slices<T>(data: &[T], workers: usize) -> Vec<&[T]> {
    worker_ranges(data.len(), workers)
        .into_iter()
        .map(|r| &data[r])
        .collect()
}

//==================================================================================
// 4. Unit Tests
//==================================================================================
