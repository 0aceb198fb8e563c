//! Structured diagnostics for the phase-3 pipeline.
//!
//! Runtime logging goes through the `log` facade (`log::info!` for the
//! per-table progress lines, `log::debug!` for bucket-level detail). On top
//! of that, the `plot_metric!` macro emits structured key-value metric lines
//! for offline analysis of pruning ratios and bucket skew.
//!
//! It is a zero-cost abstraction: the `#[cfg(debug_assertions)]` attribute
//! ensures that the macro body is completely compiled out of release builds.

/// Logs a structured key-value metric line to stdout, only in debug builds.
///
/// # Example
/// ```
/// use plotpress_core::plot_metric;
/// let pruned = 117u64;
/// plot_metric!("event" = "table_pruned", "table" = &2, "entries" = &pruned);
/// ```
#[macro_export]
macro_rules! plot_metric {
    ($($key:literal = $value:expr),+ $(,)?) => {
        #[cfg(debug_assertions)]
        {
            let mut parts = Vec::new();
            $(
                parts.push(format!("\"{}\": \"{}\"", $key, $value));
            )+

            println!("PLOTPRESS_METRIC: {{ {} }}", parts.join(", "));
        }
    };
}
