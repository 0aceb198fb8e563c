//! End-to-end scenarios driving the full phase over in-memory storage,
//! checked against an array-level oracle that recomputes every table's
//! sorted line points and unpacked map independently of the disk pipeline.
//!
//! Fixtures describe the artifacts earlier phases would have left behind:
//! the x file, per-table back-pointer pairs, origin-key maps and marks.
//! Scenario tables are small (k = 8, four buckets, two workers) but cover
//! boundary crossings, pruning, collisions, short trailing buckets and the
//! full seven-table cascade.

use std::sync::{Arc, Mutex};

use crate::config::PlotpressConfig;
use crate::io::queue::DiskQueue;
use crate::io::vfs::MemVfs;
use crate::kernels::line_point::{line_point_to_square, square_to_line_point};
use crate::pipeline::orchestrator::{ParkSink, Phase3, Phase3Report};
use crate::types::{PlotContext, TableId, NUM_TABLES};

fn test_config() -> PlotpressConfig {
    PlotpressConfig {
        k: 8,
        num_buckets: 4,
        lp_buckets: 4,
        extra_l: 4,
        workers: 2,
        heap_size: 1 << 20,
    }
}

//==================================================================================
// 1. Fixtures
//==================================================================================

#[derive(Clone)]
struct TableFixture {
    bucket_counts: Vec<u32>,
    pairs_l: Vec<u32>,
    pairs_r: Vec<u16>,
    /// Origin key per entry; a bijection over `0..entry_count`.
    r_map: Vec<u32>,
    /// Indexed by origin key.
    marks: Vec<bool>,
}

impl TableFixture {
    fn entry_count(&self) -> u64 {
        self.marks.len() as u64
    }

    fn marked_count(&self) -> u64 {
        self.marks.iter().filter(|&&m| m).count() as u64
    }
}

#[derive(Clone)]
struct Fixture {
    x_values: Vec<u32>,
    x_bucket_counts: Vec<u32>,
    /// Index 0 holds table 2.
    tables: Vec<TableFixture>,
}

impl Fixture {
    fn context(&self) -> PlotContext {
        let mut entry_counts = [0u64; NUM_TABLES];
        entry_counts[0] = self.x_values.len() as u64;
        let mut ptr_bucket_counts = vec![Vec::new(); NUM_TABLES];
        for (i, table) in self.tables.iter().enumerate() {
            entry_counts[i + 1] = table.entry_count();
            ptr_bucket_counts[i + 1] = table.bucket_counts.clone();
        }
        PlotContext {
            entry_counts,
            x_bucket_counts: self.x_bucket_counts.clone(),
            ptr_bucket_counts,
        }
    }

    fn write_to(&self, vfs: &MemVfs) {
        vfs.put("x.0", u32_bytes(&self.x_values));
        for (i, table) in self.tables.iter().enumerate() {
            let n = i + 2;
            vfs.put(&format!("marks_{}.0", n), bitfield_bytes(&table.marks));
            vfs.put(&format!("pairs_l_{}.0", n), u32_bytes(&table.pairs_l));
            vfs.put(&format!("pairs_r_{}.0", n), u16_bytes(&table.pairs_r));
            vfs.put(&format!("map_{}.0", n), u32_bytes(&table.r_map));
        }
    }
}

fn u32_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn u16_bytes(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bitfield_bytes(marks: &[bool]) -> Vec<u8> {
    let mut words = vec![0u64; marks.len().div_ceil(64)];
    for (i, &marked) in marks.iter().enumerate() {
        if marked {
            words[i / 64] |= 1 << (i % 64);
        }
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// A table whose entries are all unmarked; safe downstream filler for
/// single-table scenarios.
fn inert_table(num_buckets: usize, per_bucket: u32) -> TableFixture {
    let total = num_buckets as u32 * per_bucket;
    let mut pairs_l = Vec::new();
    let mut pairs_r = Vec::new();
    let mut r_map = Vec::new();
    for b in 0..num_buckets as u32 {
        for j in 0..per_bucket {
            pairs_l.push(0);
            pairs_r.push(1);
            r_map.push(b * per_bucket + (j * 5 + 1) % per_bucket);
        }
    }
    TableFixture {
        bucket_counts: vec![per_bucket; num_buckets],
        pairs_l,
        pairs_r,
        r_map,
        marks: vec![false; total as usize],
    }
}

/// Base fixture: table 2 with 16 entries per bucket, everything marked,
/// `left = i mod 12`, `right = 3`; tables 3..7 inert.
fn single_table_fixture() -> Fixture {
    let x_values: Vec<u32> = (0u32..64).map(|i| (i * 37 + 11) % 64).collect();
    let mut pairs_l = Vec::new();
    let mut pairs_r = Vec::new();
    let mut r_map = Vec::new();
    for i in 0u32..64 {
        pairs_l.push(i % 12);
        pairs_r.push(3);
        r_map.push((i * 7 + 3) % 64);
    }
    let t2 = TableFixture {
        bucket_counts: vec![16; 4],
        pairs_l,
        pairs_r,
        r_map,
        marks: vec![true; 64],
    };
    let mut tables = vec![t2];
    for _ in 0..5 {
        tables.push(inert_table(4, 16));
    }
    Fixture {
        x_values,
        x_bucket_counts: vec![16; 4],
        tables,
    }
}

/// The x stream's final bucket is half-size and table 2's origin space
/// (224 entries) leaves the last unpack bucket half-full.
fn short_bucket_fixture() -> Fixture {
    let x_values: Vec<u32> = (0u32..56).map(|i| (i * 9 + 5) % 256).collect();
    let mut pairs_l = Vec::new();
    let mut pairs_r = Vec::new();
    let mut r_map = Vec::new();
    for b in 0u32..4 {
        for j in 0u32..56 {
            pairs_l.push(j % 5);
            pairs_r.push((j % 2 + 1) as u16);
            r_map.push(b * 56 + (j * 13 + 7) % 56);
        }
    }
    let t2 = TableFixture {
        bucket_counts: vec![56; 4],
        pairs_l,
        pairs_r,
        r_map,
        marks: vec![true; 224],
    };
    let mut tables = vec![t2];
    for _ in 0..5 {
        tables.push(inert_table(4, 16));
    }
    Fixture {
        x_values,
        x_bucket_counts: vec![16, 16, 16, 8],
        tables,
    }
}

/// The full cascade: six 256-entry tables, deterministic pairs with a
/// boundary crossing per non-final bucket. With `all_marked` false, table 7
/// keeps roughly 80% of its entries and the marks of every lower table are
/// the reachability closure of its children's survivors.
fn cascade_fixture(all_marked: bool) -> Fixture {
    let x_values: Vec<u32> = (0u32..256).map(|i| (i * 37 + 11) % 256).collect();

    let mut tables: Vec<TableFixture> = (0..6usize)
        .map(|ti| {
            let mut pairs_l = Vec::new();
            let mut pairs_r = Vec::new();
            let mut r_map = Vec::new();
            for b in 0usize..4 {
                for j in 0usize..64 {
                    let idx = b * 64 + j;
                    let (left, right) = if b < 3 && j == 63 {
                        (62u32, 3u16)
                    } else {
                        (((idx * 17 + ti * 5) % 56) as u32, ((idx + ti) % 3 + 1) as u16)
                    };
                    pairs_l.push(left);
                    pairs_r.push(right);
                    r_map.push((b * 64 + (j * 29 + b * 7 + ti * 3) % 64) as u32);
                }
            }
            TableFixture {
                bucket_counts: vec![64; 4],
                pairs_l,
                pairs_r,
                r_map,
                marks: vec![true; 256],
            }
        })
        .collect();

    if !all_marked {
        let mut marks7 = vec![false; 256];
        for (key, slot) in marks7.iter_mut().enumerate() {
            if (key * 7 + 3) % 5 != 0 {
                *slot = true;
            }
        }
        tables[5].marks = marks7;

        // Reachability closure: a table-t entry survives exactly when it
        // parents a surviving table-(t+1) entry.
        for ti in (0..5).rev() {
            let child = &tables[ti + 1];
            let mut marks = vec![false; 256];
            let mut idx = 0usize;
            for b in 0usize..4 {
                for _ in 0..64 {
                    let key = child.r_map[idx] as usize;
                    if child.marks[key] {
                        let left = b * 64 + child.pairs_l[idx] as usize;
                        let right = left + child.pairs_r[idx] as usize;
                        marks[left] = true;
                        marks[right] = true;
                    }
                    idx += 1;
                }
            }
            tables[ti].marks = marks;
        }
    }

    Fixture {
        x_values,
        x_bucket_counts: vec![64; 4],
        tables,
    }
}

//==================================================================================
// 2. Engine Harness & Oracle
//==================================================================================

#[derive(Clone, Default)]
struct ParkCollector {
    runs: Arc<Mutex<Vec<(u8, u64, Vec<u64>)>>>,
}

impl ParkSink for ParkCollector {
    fn park(&mut self, table: TableId, sorted_line_points: &[u64], global_offset: u64) {
        self.runs
            .lock()
            .unwrap()
            .push((table.number(), global_offset, sorted_line_points.to_vec()));
    }
}

impl ParkCollector {
    /// All of one table's sorted line points, in global post-sort order.
    fn sorted_table(&self, table: u8) -> Vec<u64> {
        let mut runs: Vec<(u64, Vec<u64>)> = self
            .runs
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| *t == table)
            .map(|(_, offset, lps)| (*offset, lps.clone()))
            .collect();
        runs.sort_by_key(|(offset, _)| *offset);
        runs.into_iter().flat_map(|(_, lps)| lps).collect()
    }
}

fn run_engine(cfg: &PlotpressConfig, fixture: &Fixture) -> (MemVfs, Phase3Report, ParkCollector) {
    let vfs = MemVfs::new();
    fixture.write_to(&vfs);
    let queue = DiskQueue::new(Box::new(vfs.clone()), cfg.heap_size);
    let parks = ParkCollector::default();
    let phase = Phase3::new(cfg.clone(), fixture.context(), queue)
        .unwrap()
        .with_park_sink(Box::new(parks.clone()));
    let report = phase.run().unwrap();
    (vfs, report, parks)
}

struct OracleTable {
    sorted_lps: Vec<u64>,
    dense: Vec<u32>,
    write_lens: Vec<u32>,
    pruned: u64,
}

/// Array-level reference implementation of the whole phase.
fn oracle_run(cfg: &PlotpressConfig, fixture: &Fixture) -> Vec<OracleTable> {
    let fixed = cfg.fixed_bucket_size() as u64;
    let lp_shift = cfg.lp_bucket_shift().min(63);
    let key_shift = cfg.origin_bucket_shift();

    let mut l_stream: Vec<u32> = fixture.x_values.clone();
    let mut l_chunks: Vec<u32> = fixture.x_bucket_counts.clone();
    let mut out = Vec::new();

    for table in &fixture.tables {
        let mut chunk_starts = Vec::with_capacity(l_chunks.len());
        let mut acc = 0usize;
        for &c in &l_chunks {
            chunk_starts.push(acc);
            acc += c as usize;
        }

        // Prune in bucket-then-input order, dereferencing the l stream.
        let mut survivors: Vec<(u64, u32)> = Vec::new();
        let mut idx = 0usize;
        for (b, &count) in table.bucket_counts.iter().enumerate() {
            let start = chunk_starts[b];
            for _ in 0..count {
                let key = table.r_map[idx];
                if table.marks[key as usize] {
                    let left = start + table.pairs_l[idx] as usize;
                    let right = left + table.pairs_r[idx] as usize;
                    let lp =
                        square_to_line_point(l_stream[left] as u64, l_stream[right] as u64);
                    survivors.push((lp, key));
                }
                idx += 1;
            }
        }

        // Stable partition into LP buckets, stable sort within each.
        let mut lp_buckets: Vec<Vec<(u64, u32)>> = vec![Vec::new(); cfg.lp_buckets as usize];
        for &(lp, key) in &survivors {
            lp_buckets[(lp >> lp_shift) as usize].push((lp, key));
        }

        let origin_total = table.entry_count();
        let pruned = survivors.len() as u64;
        let write_lens: Vec<u32> = (0..cfg.num_buckets as u64)
            .map(|b| {
                if pruned == 0 {
                    0
                } else {
                    origin_total.saturating_sub(b * fixed).min(fixed) as u32
                }
            })
            .collect();
        let mut dense_starts = Vec::with_capacity(write_lens.len());
        let mut acc = 0usize;
        for &c in &write_lens {
            dense_starts.push(acc);
            acc += c as usize;
        }
        let mut dense = vec![0u32; acc];

        let mut sorted_lps = Vec::with_capacity(survivors.len());
        let mut post_sort_index = 0u32;
        for bucket in lp_buckets.iter_mut() {
            bucket.sort_by_key(|&(lp, _)| lp);
            for &(lp, key) in bucket.iter() {
                sorted_lps.push(lp);
                let ob = ((key as u64) >> key_shift) as usize;
                dense[dense_starts[ob] + (key as u64 - ob as u64 * fixed) as usize] =
                    post_sort_index;
                post_sort_index += 1;
            }
        }

        l_stream = dense.clone();
        l_chunks = write_lens.clone();
        out.push(OracleTable {
            sorted_lps,
            dense,
            write_lens,
            pruned,
        });
    }
    out
}

/// Reads back the dense unpacked map of a table from the map file.
fn dense_from_vfs(vfs: &MemVfs, table: u8, write_lens: &[u32]) -> Vec<u32> {
    let bytes = vfs
        .contents(&format!("lp_map_{}.0", table))
        .expect("unpacked map file missing");
    let total: usize = write_lens.iter().map(|&c| c as usize).sum();
    bytes[..total * 4]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Recursively dereferences a line point down to table-2 x values.
fn expand_chain(tables: &[Vec<u64>], level: usize, lp: u64) -> Vec<u64> {
    let (hi, lo) = line_point_to_square(lp);
    if level == 0 {
        return vec![hi, lo];
    }
    let prev = &tables[level - 1];
    let mut values = expand_chain(tables, level - 1, prev[hi as usize]);
    values.extend(expand_chain(tables, level - 1, prev[lo as usize]));
    values
}

//==================================================================================
// 3. Scenarios
//==================================================================================

#[test]
fn test_identity_prune_single_table() {
    let cfg = test_config();
    let fixture = single_table_fixture();
    let (vfs, report, parks) = run_engine(&cfg, &fixture);
    let oracle = oracle_run(&cfg, &fixture);

    // Pruning conservation: everything marked survives.
    assert_eq!(report.tables[0].entries_after, 64);
    assert_eq!(oracle[0].pruned, 64);

    // Sorted line points match the oracle exactly.
    assert_eq!(parks.sorted_table(2), oracle[0].sorted_lps);

    // The unpacked map is the oracle's and a permutation of 0..64.
    let dense = dense_from_vfs(&vfs, 2, &oracle[0].write_lens);
    assert_eq!(dense, oracle[0].dense);
    let mut values = dense;
    values.sort_unstable();
    assert_eq!(values, (0u32..64).collect::<Vec<u32>>());
}

#[test]
fn test_fully_pruned_table_leaves_empty_outputs() {
    let cfg = test_config();
    let mut fixture = single_table_fixture();
    fixture.tables[0].marks = vec![false; 64];
    let (vfs, report, parks) = run_engine(&cfg, &fixture);

    for stats in &report.tables {
        assert_eq!(stats.entries_after, 0);
    }
    assert!(parks.runs.lock().unwrap().is_empty());

    // No LP bucket was ever written.
    for bucket in 0..4 {
        assert!(vfs.contents(&format!("lp_2.{}", bucket)).is_none());
        assert!(vfs.contents(&format!("lp_key_2.{}", bucket)).is_none());
    }
    // The dense map is empty, so the next table's l-map is empty too.
    for table in 2..=7u8 {
        let map = vfs.contents(&format!("lp_map_{}.0", table)).unwrap_or_default();
        assert!(map.is_empty());
    }
}

#[test]
fn test_pairs_crossing_bucket_boundary() {
    let cfg = test_config();
    let mut fixture = single_table_fixture();
    // First entry of each non-final bucket reaches into the carry slots.
    for b in 0..3usize {
        fixture.tables[0].pairs_l[b * 16] = 14;
        fixture.tables[0].pairs_r[b * 16] = 3;
    }
    let (_vfs, report, parks) = run_engine(&cfg, &fixture);
    let oracle = oracle_run(&cfg, &fixture);

    assert_eq!(report.tables[0].entries_after, 64);
    let lps = parks.sorted_table(2);
    assert_eq!(lps, oracle[0].sorted_lps);

    // The crossing entries read their second parent from the next l-bucket.
    for b in 0..3usize {
        let x = fixture.x_values[b * 16 + 14] as u64;
        let y = fixture.x_values[b * 16 + 17] as u64;
        assert!(lps.contains(&square_to_line_point(x, y)));
    }
}

#[test]
fn test_duplicate_line_points_keep_distinct_keys() {
    let cfg = test_config();
    let mut fixture = single_table_fixture();
    // Entries 0 and 1 share (left, right) and therefore the line point,
    // but keep distinct origin keys.
    for i in 0..2usize {
        fixture.tables[0].pairs_l[i] = 5;
        fixture.tables[0].pairs_r[i] = 3;
    }
    let key_a = fixture.tables[0].r_map[0];
    let key_b = fixture.tables[0].r_map[1];
    assert_ne!(key_a, key_b);

    let (vfs, report, parks) = run_engine(&cfg, &fixture);
    let oracle = oracle_run(&cfg, &fixture);

    assert_eq!(report.tables[0].entries_after, 64);
    let lps = parks.sorted_table(2);
    let duplicated = square_to_line_point(
        fixture.x_values[5] as u64,
        fixture.x_values[8] as u64,
    );
    assert!(lps.iter().filter(|&&lp| lp == duplicated).count() >= 2);

    // Both keys land at distinct post-sort positions in the reverse map.
    let dense = dense_from_vfs(&vfs, 2, &oracle[0].write_lens);
    assert_ne!(dense[key_a as usize], dense[key_b as usize]);
}

#[test]
fn test_short_final_bucket_written_exactly() {
    let cfg = test_config();
    let fixture = short_bucket_fixture();
    let (vfs, report, parks) = run_engine(&cfg, &fixture);
    let oracle = oracle_run(&cfg, &fixture);

    assert_eq!(report.tables[0].entries_after, 224);
    assert_eq!(oracle[0].write_lens, vec![64, 64, 64, 32]);
    assert_eq!(parks.sorted_table(2), oracle[0].sorted_lps);

    // Step 3 wrote exactly origin-space many u32s, last bucket short.
    let map_bytes = vfs.contents("lp_map_2.0").unwrap();
    assert_eq!(map_bytes.len(), 224 * 4);
    assert_eq!(dense_from_vfs(&vfs, 2, &oracle[0].write_lens), oracle[0].dense);
}

#[test]
fn test_full_cascade_matches_oracle() {
    let cfg = test_config();
    let fixture = cascade_fixture(false);
    let (vfs, report, parks) = run_engine(&cfg, &fixture);
    let oracle = oracle_run(&cfg, &fixture);

    let engine_tables: Vec<Vec<u64>> = (2u8..=7).map(|t| parks.sorted_table(t)).collect();
    let oracle_tables: Vec<Vec<u64>> = oracle.iter().map(|o| o.sorted_lps.clone()).collect();

    for (ti, table) in fixture.tables.iter().enumerate() {
        // Pruning conservation against the marks popcount.
        assert_eq!(report.tables[ti].entries_after, table.marked_count());
        assert_eq!(oracle[ti].pruned, table.marked_count());

        // Sorted output and unpacked map match the oracle.
        assert_eq!(engine_tables[ti], oracle_tables[ti], "table {}", ti + 2);
        let dense = dense_from_vfs(&vfs, (ti + 2) as u8, &oracle[ti].write_lens);
        assert_eq!(dense, oracle[ti].dense, "map of table {}", ti + 2);

        // Reverse-map permutation: surviving keys map onto 0..pruned.
        let mut positions: Vec<u32> = table
            .marks
            .iter()
            .enumerate()
            .filter(|(_, &m)| m)
            .map(|(key, _)| dense[key])
            .collect();
        positions.sort_unstable();
        let expect: Vec<u32> = (0..oracle[ti].pruned as u32).collect();
        assert_eq!(positions, expect, "positions of table {}", ti + 2);

        // Emitted LP runs are globally monotonic (bucket ranges disjoint).
        assert!(engine_tables[ti].windows(2).all(|w| w[0] <= w[1]));
    }

    // Chain law: every surviving table-7 entry decomposes through the
    // compressed tables into the same x values as the oracle, and those
    // are genuine x-file values.
    assert!(!engine_tables[5].is_empty());
    for (i, &lp) in engine_tables[5].iter().enumerate() {
        let mut engine_xs = expand_chain(&engine_tables, 5, lp);
        let mut oracle_xs = expand_chain(&oracle_tables, 5, oracle_tables[5][i]);
        engine_xs.sort_unstable();
        oracle_xs.sort_unstable();
        assert_eq!(engine_xs, oracle_xs);
        for x in engine_xs {
            assert!(fixture.x_values.contains(&(x as u32)));
        }
    }
}

#[test]
fn test_full_cascade_all_marked() {
    let cfg = test_config();
    let fixture = cascade_fixture(true);
    let (_vfs, report, parks) = run_engine(&cfg, &fixture);
    let oracle = oracle_run(&cfg, &fixture);

    for ti in 0..6 {
        assert_eq!(report.tables[ti].entries_after, 256);
        assert_eq!(parks.sorted_table((ti + 2) as u8), oracle[ti].sorted_lps);
    }
}

#[test]
fn test_runs_are_byte_identical() {
    let cfg = test_config();
    let fixture = cascade_fixture(false);
    let (vfs_a, _, _) = run_engine(&cfg, &fixture);
    let (vfs_b, _, _) = run_engine(&cfg, &fixture);

    assert_eq!(vfs_a.names(), vfs_b.names());
    for name in vfs_a.names() {
        assert_eq!(vfs_a.contents(&name), vfs_b.contents(&name), "{}", name);
    }
}

#[test]
fn test_report_serializes() {
    let cfg = test_config();
    let fixture = single_table_fixture();
    let (_vfs, report, _parks) = run_engine(&cfg, &fixture);
    let json = report.to_json().unwrap();
    assert!(json.contains("\"entries_after\":64"));
}
