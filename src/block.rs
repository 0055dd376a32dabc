//! Block layout: boundary-tagged headers with doubly-linked free pointers
//! that overlay the payload.
//!
//! ```text
//!   Allocated block:
//!   ┌───────────────────────┬──────────────────────────────┬────────┐
//!   │ owner | total_size |  │         user payload          │ footer │
//!   │ is_free            │  │    (incl. first two words)    │        │
//!   └───────────────────────┴──────────────────────────────┴────────┘
//!
//!   Free block (same layout, but the first two payload words are reused):
//!   ┌───────────────────────┬────────────────┬──────────────┬────────┐
//!   │ owner | total_size |  │ next_free |    │  unused      │ footer │
//!   │ is_free            │  │ prev_free      │  payload     │        │
//!   └───────────────────────┴────────────────┴──────────────┴────────┘
//! ```
//!
//! `next_free`/`prev_free` are only meaningful while `is_free` is set; once
//! a block is handed back to a caller the entire payload, including those
//! two words, belongs to them.

use std::mem;

use crate::config::Config;

/// A block's boundary-tag header. Sits at the very start of the block.
#[repr(C)]
pub(crate) struct Header {
  /// Id of the arena that issued this block (see `crate::arena::Arena`).
  pub owner: usize,
  /// Full byte span of the block, header through footer, inclusive.
  pub total_size: usize,
  /// Whether the block is currently free.
  pub is_free: bool,
}

/// The doubly-linked free-list pointers, overlaid on the first bytes of a
/// free block's payload.
#[repr(C)]
struct FreeLinks {
  next_free: *mut Header,
  prev_free: *mut Header,
}

/// Size of the trailing boundary tag: one `usize` duplicating `total_size`.
pub(crate) const FOOTER_SIZE: usize = mem::size_of::<usize>();

pub(crate) fn header_size() -> usize {
  mem::size_of::<Header>()
}

fn free_links_size() -> usize {
  mem::size_of::<FreeLinks>()
}

/// Overhead charged against an allocated block: header (without counting
/// the free-list pointers, since those live inside the payload) plus
/// footer.
pub(crate) fn allocated_overhead() -> usize {
  header_size() + FOOTER_SIZE
}

/// Overhead of a block that must be able to sit in a free list: header,
/// free-list pointers, and footer.
fn free_overhead() -> usize {
  header_size() + free_links_size() + FOOTER_SIZE
}

/// The smallest `total_size` an allocated block may have. Large enough that
/// the block can always be flipped back to a free block (with its list
/// pointers) without resizing.
pub(crate) fn min_allocated_size(cfg: &Config) -> usize {
  crate::align_to!(free_overhead(), cfg.alignment)
}

/// # Safety
/// `payload` must have been produced by [`payload_of`] on a live header.
pub(crate) unsafe fn header_of(payload: *mut u8) -> *mut Header {
  unsafe { payload.sub(header_size()) as *mut Header }
}

/// # Safety
/// `header` must point to a live, properly laid-out block.
pub(crate) unsafe fn payload_of(header: *mut Header) -> *mut u8 {
  unsafe { (header as *mut u8).add(header_size()) }
}

/// # Safety
/// `header` must point to a live block whose `total_size` is accurate.
pub(crate) unsafe fn next_block(header: *mut Header) -> *mut Header {
  unsafe { (header as *mut u8).add((*header).total_size) as *mut Header }
}

/// # Safety
/// `header` must point to a live block whose `total_size` is accurate.
unsafe fn footer_ptr(header: *mut Header) -> *mut usize {
  unsafe { (header as *mut u8).add((*header).total_size - FOOTER_SIZE) as *mut usize }
}

/// Writes `header.total_size` into the block's trailing boundary tag.
///
/// # Safety
/// `header` must point to a live block with a correctly-sized payload.
pub(crate) unsafe fn write_footer(header: *mut Header) {
  unsafe {
    let size = (*header).total_size;
    *footer_ptr(header) = size;
  }
}

/// Reads the trailing boundary tag without assuming it matches the header.
/// Used by the invariant checker and by the left-coalesce footer walk.
///
/// # Safety
/// `header` must point to a live block.
pub(crate) unsafe fn footer_value(header: *mut Header) -> usize {
  unsafe { *footer_ptr(header) }
}

/// Reads the footer word immediately preceding `header` — i.e. the
/// boundary tag of whatever block sits just to the left of it, without
/// knowing that block's header address yet. This is the footer walk of
/// `SPEC_FULL.md` section 4.5/9: its return value is the preceding block's
/// `total_size`, letting the caller step back to find its header.
///
/// # Safety
/// `header` must not be the first block in the managed region.
pub(crate) unsafe fn footer_value_at(header: *mut Header) -> usize {
  unsafe { *(header as *mut usize).sub(1) }
}

/// # Safety
/// `header` must be free, so the free-list pointers overlaying its payload
/// are meaningful.
unsafe fn links_ptr(header: *mut Header) -> *mut FreeLinks {
  unsafe { (header as *mut u8).add(header_size()) as *mut FreeLinks }
}

/// # Safety
/// `header` must be free.
pub(crate) unsafe fn get_next_free(header: *mut Header) -> *mut Header {
  unsafe { (*links_ptr(header)).next_free }
}

/// # Safety
/// `header` must be free.
pub(crate) unsafe fn get_prev_free(header: *mut Header) -> *mut Header {
  unsafe { (*links_ptr(header)).prev_free }
}

/// # Safety
/// `header` must be free (or about to become free).
pub(crate) unsafe fn set_next_free(header: *mut Header, next: *mut Header) {
  unsafe {
    (*links_ptr(header)).next_free = next;
  }
}

/// # Safety
/// `header` must be free (or about to become free).
pub(crate) unsafe fn set_prev_free(header: *mut Header, prev: *mut Header) {
  unsafe {
    (*links_ptr(header)).prev_free = prev;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn min_allocated_size_holds_a_full_free_layout() {
    let cfg = Config::default();
    assert!(min_allocated_size(&cfg) >= free_overhead());
    assert_eq!(min_allocated_size(&cfg) % cfg.alignment, 0);
  }

  #[test]
  fn header_and_payload_round_trip() {
    let mut buf: Vec<u64> = vec![0u64; 32]; // 256 bytes, word-aligned
    let header = buf.as_mut_ptr() as *mut Header;
    unsafe {
      (*header).owner = 1;
      (*header).total_size = 256;
      (*header).is_free = false;
      let payload = payload_of(header);
      assert_eq!(header_of(payload), header);
    }
  }

  #[test]
  fn footer_round_trip() {
    let mut buf: Vec<u64> = vec![0u64; 32];
    let header = buf.as_mut_ptr() as *mut Header;
    unsafe {
      (*header).total_size = 256;
      write_footer(header);
      assert_eq!(footer_value(header), 256);
    }
  }

  #[test]
  fn free_links_overlay_payload() {
    let mut buf: Vec<u64> = vec![0u64; 32];
    let header = buf.as_mut_ptr() as *mut Header;
    unsafe {
      (*header).total_size = 256;
      (*header).is_free = true;
      set_next_free(header, std::ptr::null_mut());
      set_prev_free(header, std::ptr::null_mut());
      assert!(get_next_free(header).is_null());
      assert!(get_prev_free(header).is_null());
    }
  }
}
