/// The allocator's tunable constants.
///
/// `SPEC_FULL.md` section 6 fixes these for the public contract (`A = 8`,
/// `B = 150`, `T = 1024`), so [`Config::default`] is what every public
/// `malloc`/`free`/`realloc` call uses. The struct exists so the test
/// harness can build a second, independent [`crate::Allocator`] over a
/// [`crate::MockProvider`] with a smaller bin count or threshold without
/// touching process-global state.
#[derive(Debug, Clone, Copy)]
pub struct Config {
  /// Alignment `A`: every block's `total_size` is a multiple of this.
  pub alignment: usize,
  /// Bin count `B`: the number of segregated free-list size classes.
  pub bin_count: usize,
  /// Small/large threshold `T`: sizes below this get exact-fit bins.
  pub small_threshold: usize,
  /// Minimum leftover, beyond the free-block overhead, worth splitting off.
  pub split_threshold: usize,
  /// Precomputed so the large-region bin formula joins continuously with
  /// the small-region one at `size == small_threshold`.
  pub(crate) large_offset: usize,
}

impl Config {
  /// Builds a `Config`, deriving `large_offset` so that
  /// `bin_index(small_threshold)` is the same whether computed by the
  /// small-region or large-region formula.
  ///
  /// `alignment` and `small_threshold` must be powers of two.
  pub fn new(alignment: usize, bin_count: usize, small_threshold: usize, split_threshold: usize) -> Self {
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
    debug_assert!(small_threshold.is_power_of_two(), "small_threshold must be a power of two");
    debug_assert!(bin_count > 0);

    let log2_threshold = (usize::BITS - 1 - small_threshold.leading_zeros()) as usize;
    let small_region_index_at_threshold = small_threshold / alignment;
    let large_offset = small_region_index_at_threshold - log2_threshold;

    Config { alignment, bin_count, small_threshold, split_threshold, large_offset }
  }
}

impl Default for Config {
  /// `A = 8`, `B = 150`, `T = 1024`, split threshold `8` bytes, per
  /// `SPEC_FULL.md` section 6.
  fn default() -> Self {
    Config::new(8, 150, 1024, 8)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_matches_spec_constants() {
    let cfg = Config::default();
    assert_eq!(cfg.alignment, 8);
    assert_eq!(cfg.bin_count, 150);
    assert_eq!(cfg.small_threshold, 1024);
  }

  #[test]
  fn large_offset_joins_continuously() {
    // bin_index's small formula at T is T/A; the large formula must agree.
    let cfg = Config::default();
    let small_formula_at_t = cfg.small_threshold / cfg.alignment;
    let log2_t = (usize::BITS - 1 - cfg.small_threshold.leading_zeros()) as usize;
    assert_eq!(small_formula_at_t, log2_t + cfg.large_offset);
  }
}
