//! # rallocator - A Segregated Free-List Memory Allocator
//!
//! This crate provides a general-purpose dynamic memory allocator for
//! multi-threaded programs, built on top of a single contiguous heap region
//! supplied by an `sbrk`-like primitive.
//!
//! ## Overview
//!
//! Each worker thread owns a private arena holding segregated free lists
//! ("bins"), so the common allocate/free path never contends with other
//! threads. A block may still be freed from a thread other than the one
//! that allocated it; such a "remote free" is routed into the owner's
//! mailbox and reclaimed — and coalesced with its free neighbours — the
//! next time the owner allocates.
//!
//! ```text
//!   Per-thread arena:
//!
//!   ┌───────────────────────────────────────────────────────────────┐
//!   │  bins[0] bins[1] bins[2] ... bins[B-1]   (owning thread only)  │
//!   │    │        │       │            │                           │
//!   │    ▼        ▼       ▼            ▼                           │
//!   │  free    free    free          free     (doubly-linked lists) │
//!   │  block   block   block         block                         │
//!   │                                                               │
//!   │  mailbox (mutex-guarded, pushed to by any thread)             │
//!   │    └── blocks freed remotely, drained on the next malloc      │
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Block layout
//!
//! Every block carries a boundary-tagged header and footer so neighbours
//! can be found walking forward (via `total_size`) or backward (via the
//! preceding block's footer):
//!
//! ```text
//!   Allocated block:
//!   ┌───────────────────────┬──────────────────────────────┬────────┐
//!   │ owner | total_size |  │         user payload          │ footer │
//!   │ is_free            │  │                                │        │
//!   └───────────────────────┴──────────────────────────────┴────────┘
//!
//!   Free block (same layout; first two payload words become list links):
//!   ┌───────────────────────┬────────────────┬──────────────┬────────┐
//!   │ owner | total_size |  │ next_free |    │  unused      │ footer │
//!   │ is_free            │  │ prev_free      │  payload     │        │
//!   └───────────────────────┴────────────────┴──────────────┴────────┘
//! ```
//!
//! ## Crate structure
//!
//! ```text
//!   rallocator
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── config     - Tunable constants (A, B, T, split threshold)
//!   ├── error      - ProviderError (typed heap-exhaustion failure)
//!   ├── provider   - HeapProvider trait; SbrkProvider, MockProvider
//!   ├── block      - Boundary-tagged block header/footer layout
//!   ├── bins       - Size-class mapping and free-list operations
//!   ├── arena      - Per-thread bins + mailbox
//!   └── allocator  - malloc/free/realloc/check engines
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use rallocator::{malloc, free, realloc};
//!
//! unsafe {
//!     let p = malloc(64);
//!     assert!(!p.is_null());
//!     let p = realloc(p, 4096);
//!     assert!(!p.is_null());
//!     free(p);
//! }
//! ```
//!
//! ## Safety
//!
//! This crate is inherently unsafe as it deals with raw memory management.
//! All allocation and deallocation operations require `unsafe` blocks, and
//! callers must uphold the contracts documented on each function: pointers
//! must have been returned by this allocator and freed at most once.

pub mod align;
mod allocator;
mod arena;
mod bins;
mod block;
mod config;
mod error;
mod provider;

use std::sync::OnceLock;

pub use allocator::Allocator;
pub use config::Config;
pub use error::ProviderError;
pub use provider::{HeapProvider, MockProvider, SbrkProvider};

static ALLOCATOR: OnceLock<Allocator<SbrkProvider>> = OnceLock::new();

fn global() -> &'static Allocator<SbrkProvider> {
  ALLOCATOR.get_or_init(|| Allocator::new(SbrkProvider::new(), Config::default()))
}

/// Idempotent process-wide setup (`SPEC_FULL.md` section 4.1). Must be
/// called once before any other public operation; subsequent calls are
/// no-ops. Returns `0` on success, matching the wrapper's C-style contract.
pub fn init() -> i32 {
  global();
  0
}

/// Allocates `n` bytes aligned to the configured alignment, returning a
/// pointer to writable memory or `null` on heap exhaustion.
///
/// # Safety
/// The returned pointer must eventually be passed to [`free`] or
/// [`realloc`] at most once, and must not be used after that.
pub unsafe fn malloc(n: usize) -> *mut u8 {
  log::trace!("malloc({n})");
  unsafe { global().malloc(n) }
}

/// Returns a previously-allocated block to the allocator. `ptr` must have
/// been returned by [`malloc`] or [`realloc`] and not already freed; `null`
/// is a no-op.
///
/// # Safety
/// `ptr` must be null, or a pointer previously returned by [`malloc`] or
/// [`realloc`] and not already freed.
pub unsafe fn free(ptr: *mut u8) {
  log::trace!("free({ptr:p})");
  unsafe { global().free(ptr) }
}

/// Resizes a previously-allocated block to `n` bytes, preserving
/// `min(n, old_size)` payload bytes. `ptr = null` behaves as [`malloc`].
///
/// # Safety
/// `ptr` must be null, or a pointer previously returned by [`malloc`] or
/// [`realloc`] and not already freed.
pub unsafe fn realloc(ptr: *mut u8, n: usize) -> *mut u8 {
  log::trace!("realloc({ptr:p}, {n})");
  unsafe { global().realloc(ptr, n) }
}

/// Diagnostic invariant checker (`SPEC_FULL.md` section 4.7). Returns `0`
/// if every bin, mailbox, and the managed region walk are well-formed, or
/// `-1` on the first violation (logged at `error!`).
///
/// # Safety
/// The caller must ensure the heap is quiescent: no other thread may be
/// concurrently calling [`malloc`], [`free`], or [`realloc`]. `check`
/// reads every thread's arena, including bins that are otherwise touched
/// only by their owning thread without synchronization; calling it while
/// another thread is still allocating or freeing is a data race.
pub unsafe fn check() -> i32 {
  unsafe { global().check() }
}

/// Inclusive lower bound of the managed heap region.
pub fn heap_low() -> *mut u8 {
  global().heap_low()
}

/// Inclusive upper bound of the managed heap region.
pub fn heap_high() -> *mut u8 {
  global().heap_high()
}

/// Restores the heap to empty. Intended for use by a trace-replaying test
/// harness between runs, not by ordinary callers.
pub fn reset_brk() {
  global().reset_brk()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn init_is_idempotent() {
    assert_eq!(init(), 0);
    assert_eq!(init(), 0);
  }

  #[test]
  fn malloc_free_round_trip() {
    init();
    unsafe {
      let p = malloc(128);
      assert!(!p.is_null());
      assert_eq!((p as usize) % 8, 0);
      free(p);
    }
    assert_eq!(unsafe { check() }, 0);
  }
}
