//! Size-class mapping and the doubly-linked free-list operations shared by
//! a thread's bins and its mailbox.

use std::cell::Cell;
use std::ptr;

use crate::block::{self, Header};
use crate::config::Config;

/// Maps a block size to a bin index.
///
/// Pure, total over `size > 0`, and monotone non-decreasing, as required by
/// `SPEC_FULL.md` section 4.2. Below `cfg.small_threshold` each bin holds
/// exactly one `alignment`-sized step (exact fit); at or above it, bins are
/// grouped by power-of-two magnitude via `leading_zeros`, which gives an
/// exact integer `floor(log2(size))` with no floating point involved and no
/// rounding error at powers of two.
pub(crate) fn bin_index(size: usize, cfg: &Config) -> usize {
  debug_assert!(size > 0);

  let idx = if size < cfg.small_threshold {
    size / cfg.alignment
  } else {
    let log2 = (usize::BITS - 1 - size.leading_zeros()) as usize;
    log2 + cfg.large_offset
  };

  idx.min(cfg.bin_count - 1)
}

/// Pushes `header` onto the front of the list rooted at `head_slot` (LIFO).
///
/// # Safety
/// `header` must not currently belong to any other list, and must be valid
/// for writes to its free-list pointers (i.e. it is free).
pub(crate) unsafe fn push_front(head_slot: &Cell<*mut Header>, header: *mut Header) {
  unsafe {
    let old_head = head_slot.get();
    block::set_next_free(header, old_head);
    block::set_prev_free(header, ptr::null_mut());
    if !old_head.is_null() {
      block::set_prev_free(old_head, header);
    }
    head_slot.set(header);
  }
}

/// Removes `header` from the list rooted at `head_slot`.
///
/// # Safety
/// `header` must currently be a member of the list rooted at `head_slot`.
pub(crate) unsafe fn unlink(head_slot: &Cell<*mut Header>, header: *mut Header) {
  unsafe {
    let prev = block::get_prev_free(header);
    let next = block::get_next_free(header);
    if !prev.is_null() {
      block::set_next_free(prev, next);
    } else {
      head_slot.set(next);
    }
    if !next.is_null() {
      block::set_prev_free(next, prev);
    }
  }
}
