//! The single source of truth for all phase-3 engine configuration.
//!
//! This module defines the unified `PlotpressConfig` struct, which is designed
//! to be created once at the application boundary (e.g. from the plotter's
//! CLI layer or a config file) and then passed into `Phase3::new`. All
//! arithmetic preconditions that can be checked without looking at the data
//! are checked here, at construction time, so the hot loops never have to.

use serde::{Deserialize, Serialize};

use crate::error::PlotpressError;

//==================================================================================
// I. The Unified PlotpressConfig
//==================================================================================

/// Configuration for a phase-3 run. Fixed at engine construction; the heap
/// is carved once and bucket counts never change at runtime.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct PlotpressConfig {
    /// Entry bit-width K. Each table holds up to `2^k` entries and every
    /// l-table value fits in `k` bits.
    #[serde(default = "default_k")]
    pub k: u32,

    /// Number of origin buckets the tables are partitioned into. Must be a
    /// power of two; the reverse map is bucketed by the top `log2(num_buckets)`
    /// bits of the origin key.
    #[serde(default = "default_num_buckets")]
    pub num_buckets: u32,

    /// Number of line-point buckets. Independent of `num_buckets`, but must
    /// also be a power of two.
    #[serde(default = "default_num_buckets")]
    pub lp_buckets: u32,

    /// Extra l-table entries carried across each bucket boundary so that
    /// `left + right` lookups near the end of a bucket stay in bounds.
    /// Must exceed the largest possible `right` offset.
    #[serde(default = "default_extra_l")]
    pub extra_l: u32,

    /// CPU worker count for the parallel steps. The I/O agent thread is
    /// separate and not counted here.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Total heap handed to the engine, in bytes. The fixed bucket buffers
    /// are carved out of this once; the remainder becomes the I/O queue's
    /// block-allocation arena.
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,
}

impl Default for PlotpressConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            num_buckets: default_num_buckets(),
            lp_buckets: default_num_buckets(),
            extra_l: default_extra_l(),
            workers: default_workers(),
            heap_size: default_heap_size(),
        }
    }
}

fn default_k() -> u32 {
    32
}

fn default_num_buckets() -> u32 {
    64
}

fn default_extra_l() -> u32 {
    1024
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_heap_size() -> usize {
    256 * 1024 * 1024
}

//==================================================================================
// II. Derived Quantities & Validation
//==================================================================================

impl PlotpressConfig {
    /// Maximum entry count per table, `2^k`.
    pub fn max_entries(&self) -> u64 {
        1u64 << self.k
    }

    /// `kExtra`: the number of origin-key bits that select an origin bucket.
    pub fn k_extra(&self) -> u32 {
        self.num_buckets.trailing_zeros()
    }

    /// Right-shift applied to a line point to obtain its LP bucket id.
    pub fn lp_bucket_shift(&self) -> u32 {
        2 * self.k - self.lp_buckets.trailing_zeros()
    }

    /// Right-shift applied to an origin key to obtain its origin bucket id.
    pub fn origin_bucket_shift(&self) -> u32 {
        self.k - self.k_extra()
    }

    /// Nominal origin-space entries per bucket, `2^k / num_buckets`.
    pub fn fixed_bucket_size(&self) -> u32 {
        (self.max_entries() / self.num_buckets as u64) as u32
    }

    /// Checks every statically checkable precondition from the error-handling
    /// design: power-of-two bucket counts, per-bucket counts representable in
    /// u32, a sane worker count. Violations are configuration errors detected
    /// before any I/O is issued.
    pub fn validate(&self) -> Result<(), PlotpressError> {
        if self.k == 0 || self.k > 32 {
            return Err(PlotpressError::Config(format!(
                "k must be in 1..=32, got {}",
                self.k
            )));
        }
        if !self.num_buckets.is_power_of_two() {
            return Err(PlotpressError::Config(format!(
                "num_buckets must be a power of two, got {}",
                self.num_buckets
            )));
        }
        if !self.lp_buckets.is_power_of_two() {
            return Err(PlotpressError::Config(format!(
                "lp_buckets must be a power of two, got {}",
                self.lp_buckets
            )));
        }
        if self.k_extra() > self.k {
            return Err(PlotpressError::Config(format!(
                "num_buckets ({}) cannot exceed 2^k (k = {})",
                self.num_buckets, self.k
            )));
        }
        if self.lp_buckets.trailing_zeros() > 2 * self.k {
            return Err(PlotpressError::Config(format!(
                "lp_buckets ({}) cannot exceed 2^(2k) (k = {})",
                self.lp_buckets, self.k
            )));
        }
        if self.fixed_bucket_size() == 0 {
            return Err(PlotpressError::Config(
                "num_buckets leaves an empty fixed bucket size".to_string(),
            ));
        }
        if self.extra_l > self.fixed_bucket_size() {
            return Err(PlotpressError::Config(format!(
                "extra_l ({}) exceeds the fixed bucket size ({})",
                self.extra_l,
                self.fixed_bucket_size()
            )));
        }
        if self.workers == 0 {
            return Err(PlotpressError::Config("workers must be >= 1".to_string()));
        }
        if self.heap_size == 0 {
            return Err(PlotpressError::Config("heap_size must be non-zero".to_string()));
        }
        Ok(())
    }
}

//==================================================================================
// III. Unit Tests
//==================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> PlotpressConfig {
        PlotpressConfig {
            k: 8,
            num_buckets: 4,
            lp_buckets: 4,
            extra_l: 4,
            workers: 2,
            heap_size: 1 << 20,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        PlotpressConfig::default().validate().unwrap();
    }

    #[test]
    fn test_small_config_derived_quantities() {
        let cfg = small();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_entries(), 256);
        assert_eq!(cfg.k_extra(), 2);
        assert_eq!(cfg.fixed_bucket_size(), 64);
        assert_eq!(cfg.origin_bucket_shift(), 6);
        // 2k = 16 bits of line-point space, 4 buckets -> top 2 bits.
        assert_eq!(cfg.lp_bucket_shift(), 14);
    }

    #[test]
    fn test_non_power_of_two_buckets_rejected() {
        let mut cfg = small();
        cfg.num_buckets = 48;
        assert!(matches!(cfg.validate(), Err(PlotpressError::Config(_))));
    }

    #[test]
    fn test_oversized_extra_l_rejected() {
        let mut cfg = small();
        cfg.extra_l = 65;
        assert!(matches!(cfg.validate(), Err(PlotpressError::Config(_))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut cfg = small();
        cfg.workers = 0;
        assert!(matches!(cfg.validate(), Err(PlotpressError::Config(_))));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = small();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PlotpressConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.k, cfg.k);
        assert_eq!(back.num_buckets, cfg.num_buckets);
        assert_eq!(back.heap_size, cfg.heap_size);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let cfg: PlotpressConfig = serde_json::from_str("{\"k\": 16}").unwrap();
        assert_eq!(cfg.k, 16);
        assert_eq!(cfg.num_buckets, 64);
        assert!(cfg.workers >= 1);
    }
}
