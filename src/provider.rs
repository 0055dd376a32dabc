//! The sbrk-like heap provider `SPEC_FULL.md` treats as an external
//! collaborator (section 1/2/6). Modeled as a trait so the allocator's own
//! tests can substitute [`MockProvider`] instead of mutating the real
//! process break.

use std::alloc::{self, Layout};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::error::ProviderError;

/// The four operations `SPEC_FULL.md` section 6 requires from the heap
/// provider: `expand`, `heap_low`, `heap_high`, `reset`, plus `heap_size`
/// as a convenience derived from the other two.
pub trait HeapProvider: Send + Sync {
  /// Appends `n` bytes to the heap, returning a pointer to the start of the
  /// new region. Leaves the heap unchanged on failure.
  fn expand(&self, n: usize) -> Result<*mut u8, ProviderError>;

  /// Inclusive lower bound of the current heap.
  fn heap_low(&self) -> *mut u8;

  /// Inclusive upper bound of the current heap (the last valid byte).
  fn heap_high(&self) -> *mut u8;

  /// Restores the heap to empty. Used by trace-replaying validators between
  /// runs; out of scope for the allocator itself beyond pass-through.
  fn reset(&self);

  /// Current size of the managed region, in bytes.
  fn heap_size(&self) -> usize {
    (self.heap_high() as usize + 1).saturating_sub(self.heap_low() as usize)
  }
}

/// Production provider, backed by `libc::sbrk`, mirroring the teacher
/// crate's direct use of the same primitive.
pub struct SbrkProvider {
  base: OnceLock<usize>,
}

impl SbrkProvider {
  /// Builds a provider. The process break is not sampled until the first
  /// call into the trait, so construction never touches process state.
  pub const fn new() -> Self {
    SbrkProvider { base: OnceLock::new() }
  }

  fn base_addr(&self) -> usize {
    *self.base.get_or_init(|| unsafe { libc::sbrk(0) as usize })
  }

  fn current_break(&self) -> usize {
    unsafe { libc::sbrk(0) as usize }
  }
}

impl Default for SbrkProvider {
  fn default() -> Self {
    Self::new()
  }
}

impl HeapProvider for SbrkProvider {
  fn expand(&self, n: usize) -> Result<*mut u8, ProviderError> {
    self.base_addr(); // anchor the base before the first real growth
    let p = unsafe { libc::sbrk(n as libc::intptr_t) };
    if p as isize == -1 {
      return Err(ProviderError::HeapExhausted { requested: n });
    }
    Ok(p as *mut u8)
  }

  fn heap_low(&self) -> *mut u8 {
    self.base_addr() as *mut u8
  }

  fn heap_high(&self) -> *mut u8 {
    let current = self.current_break();
    let low = self.base_addr();
    if current <= low { low as *mut u8 } else { (current - 1) as *mut u8 }
  }

  fn reset(&self) {
    let base = self.base_addr();
    let current = self.current_break();
    if current > base {
      unsafe {
        libc::sbrk(-((current - base) as libc::intptr_t));
      }
    }
  }
}

/// Test-only provider. Bumps a cursor inside a fixed-capacity buffer it
/// owns, so it never touches the real process break and never moves once
/// allocated (unlike `Vec`, whose growth would invalidate pointers handed
/// out earlier).
pub struct MockProvider {
  base: *mut u8,
  layout: Layout,
  used: Mutex<usize>,
}

unsafe impl Send for MockProvider {}
unsafe impl Sync for MockProvider {}

impl MockProvider {
  /// Reserves `capacity` bytes up front; `expand` fails once exhausted.
  pub fn with_capacity(capacity: usize) -> Self {
    let layout = Layout::from_size_align(capacity.max(1), 8).expect("valid mock heap layout");
    let base = unsafe { alloc::alloc_zeroed(layout) };
    assert!(!base.is_null(), "failed to reserve mock heap");
    MockProvider { base, layout, used: Mutex::new(0) }
  }
}

impl HeapProvider for MockProvider {
  fn expand(&self, n: usize) -> Result<*mut u8, ProviderError> {
    let mut used = self.used.lock();
    if *used + n > self.layout.size() {
      return Err(ProviderError::HeapExhausted { requested: n });
    }
    let ptr = unsafe { self.base.add(*used) };
    *used += n;
    Ok(ptr)
  }

  fn heap_low(&self) -> *mut u8 {
    self.base
  }

  fn heap_high(&self) -> *mut u8 {
    let used = *self.used.lock();
    if used == 0 { self.base } else { unsafe { self.base.add(used - 1) } }
  }

  fn reset(&self) {
    *self.used.lock() = 0;
  }
}

impl Drop for MockProvider {
  fn drop(&mut self) {
    unsafe {
      alloc::dealloc(self.base, self.layout);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mock_provider_grows_monotonically() {
    let provider = MockProvider::with_capacity(4096);
    let p1 = provider.expand(64).unwrap();
    let p2 = provider.expand(64).unwrap();
    assert_eq!(p2 as usize, p1 as usize + 64);
    assert_eq!(provider.heap_size(), 128);
  }

  #[test]
  fn mock_provider_fails_past_capacity() {
    let provider = MockProvider::with_capacity(128);
    assert!(provider.expand(64).is_ok());
    assert!(provider.expand(128).is_err());
  }

  #[test]
  fn mock_provider_reset_reclaims_capacity() {
    let provider = MockProvider::with_capacity(128);
    provider.expand(128).unwrap();
    assert!(provider.expand(1).is_err());
    provider.reset();
    assert!(provider.expand(1).is_ok());
  }
}
