use thiserror::Error;

/// Failure surfaced by a [`crate::HeapProvider`] when it cannot grow the
/// managed region.
///
/// This is strictly an internal plumbing type: none of the public
/// `malloc`/`free`/`realloc`/`check` entry points ever propagate it. They
/// collapse it to the spec's `null` / `-1` contract at the boundary (see
/// `SPEC_FULL.md` section 7), logging it at `warn!` on the way out.
#[derive(Debug, Error)]
pub enum ProviderError {
  /// The provider refused to extend the heap by the requested size.
  #[error("heap provider could not extend the heap by {requested} bytes")]
  HeapExhausted {
    /// The number of bytes the allocator asked the provider to add.
    requested: usize,
  },
}
