//! In-place LSD radix sort for `u64` keys with a paired `u32` satellite
//! array. 8-bit digits, 8 passes, stable via counting + prefix sums.
//!
//! Stability is load-bearing: entries with equal line points must keep
//! their distributor order so a run is reproducible bit-for-bit.

/// Sorts `keys` ascending and permutes `vals` accordingly.
/// Scratch buffers are allocated once and reused across all passes.
pub fn sort_keyed(keys: &mut [u64], vals: &mut [u32]) {
    debug_assert_eq!(keys.len(), vals.len());
    let n = keys.len();
    if n <= 1 {
        return;
    }

    let mut tmp_keys = vec![0u64; n];
    let mut tmp_vals = vec![0u32; n];

    // One counting-sort pass per byte, low to high.
    for pass in 0..8 {
        let shift = pass * 8;
        let mut counts = [0usize; 256];

        for &k in keys.iter() {
            counts[((k >> shift) & 0xFF) as usize] += 1;
        }

        // A pass whose digit is constant moves nothing; skip it.
        if counts.iter().any(|&c| c == n) {
            continue;
        }

        // Exclusive prefix sums -> first write position per digit.
        let mut sum = 0usize;
        for c in counts.iter_mut() {
            let tmp = *c;
            *c = sum;
            sum += tmp;
        }

        // Stable scatter into the scratch buffers.
        for i in 0..n {
            let k = keys[i];
            let d = ((k >> shift) & 0xFF) as usize;
            let pos = counts[d];
            tmp_keys[pos] = k;
            tmp_vals[pos] = vals[i];
            counts[d] = pos + 1;
        }

        keys.copy_from_slice(&tmp_keys);
        vals.copy_from_slice(&tmp_vals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_empty_and_single() {
        let mut k: Vec<u64> = vec![];
        let mut v: Vec<u32> = vec![];
        sort_keyed(&mut k, &mut v);
        let mut k = vec![9u64];
        let mut v = vec![7u32];
        sort_keyed(&mut k, &mut v);
        assert_eq!((k[0], v[0]), (9, 7));
    }

    #[test]
    fn test_sorts_and_co_permutes() {
        let mut keys = vec![300u64, 5, 300, 1 << 40, 7];
        let mut vals = vec![0u32, 1, 2, 3, 4];
        sort_keyed(&mut keys, &mut vals);
        assert_eq!(keys, vec![5, 7, 300, 300, 1 << 40]);
        assert_eq!(vals, vec![1, 4, 0, 2, 3]);
    }

    #[test]
    fn test_stability_on_equal_keys() {
        let mut keys = vec![42u64; 8];
        let mut vals: Vec<u32> = (0..8).collect();
        sort_keyed(&mut keys, &mut vals);
        assert_eq!(vals, (0..8).collect::<Vec<u32>>());
    }

    #[test]
    fn test_random_against_std_sort() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let keys: Vec<u64> = (0..4096).map(|_| rng.gen::<u64>() >> 1).collect();
        let vals: Vec<u32> = (0..4096).collect();

        let mut expect: Vec<(u64, u32)> =
            keys.iter().copied().zip(vals.iter().copied()).collect();
        expect.sort_by_key(|&(k, _)| k);

        let (mut k2, mut v2) = (keys, vals);
        sort_keyed(&mut k2, &mut v2);
        let got: Vec<(u64, u32)> = k2.into_iter().zip(v2).collect();
        assert_eq!(got, expect);
    }
}
