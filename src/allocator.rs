//! The allocation, free, reclaim/coalesce, reallocate, and checker engines
//! tying the block layout, bins, arenas, and heap provider together.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, ReentrantMutex};

use crate::arena::Arena;
use crate::block::{self, Header};
use crate::bins;
use crate::config::Config;
use crate::provider::{HeapProvider, SbrkProvider};

thread_local! {
  // Keyed by the owning `Allocator`'s `instance_id`, not its address: a
  // short-lived `Allocator<MockProvider>` (as this crate's own test suite
  // builds by the dozen) is dropped at the end of its function, and a later
  // test's `Allocator` local very often lands at the exact same stack
  // address. An address-keyed cache would then hand back the previous,
  // already-`Drop`ped instance's arena — a silent use-after-free into freed
  // `MockProvider` memory. `instance_id` comes from a process-wide atomic
  // counter (see `NEXT_INSTANCE_ID` below) and is never reused, so a stale
  // cache entry can never alias a live `Allocator`.
  static ARENA_CACHE: RefCell<HashMap<usize, &'static Arena>> = RefCell::new(HashMap::new());
}

/// Issues the `instance_id` distinguishing one `Allocator` from another,
/// independent of (and outliving, in the `ARENA_CACHE` sense) its address.
/// Analogous to `arena::NEXT_ARENA_ID`.
static NEXT_INSTANCE_ID: AtomicUsize = AtomicUsize::new(1);

/// Ties together the global heap cursors, the per-thread arena registry,
/// and a [`HeapProvider`] to implement `SPEC_FULL.md` sections 4-7.
///
/// Generic over the provider so tests can run a fully independent
/// allocator instance over a [`crate::MockProvider`] instead of the real
/// `sbrk`-backed one.
pub struct Allocator<P: HeapProvider = SbrkProvider> {
  provider: P,
  config: Config,
  /// Distinguishes this instance in `ARENA_CACHE`; see the comment there.
  instance_id: usize,
  memory_start: usize,
  end_of_heap: AtomicUsize,
  /// Recursive per spec section 5: a nested extension attempt from within
  /// an already-held critical section must not deadlock the thread that
  /// holds it.
  global_lock: ReentrantMutex<()>,
  registry: Mutex<Vec<&'static Arena>>,
}

// SAFETY: every field is itself Send + Sync (P: HeapProvider: Send + Sync,
// Config is Copy data, AtomicUsize and the parking_lot types are Sync).
unsafe impl<P: HeapProvider> Sync for Allocator<P> {}

impl<P: HeapProvider> Allocator<P> {
  /// Builds a new allocator over `provider`, anchoring `memory_start` and
  /// `end_of_heap` to the provider's current `heap_low()` (spec section
  /// 4.1's `init()`). Idempotent re-initialization is handled by `lib.rs`'s
  /// `OnceLock`-backed singleton for the process-wide instance; an instance
  /// built directly via `new` is already initialized on return.
  pub fn new(provider: P, config: Config) -> Self {
    let low = provider.heap_low() as usize;
    Allocator {
      provider,
      config,
      instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
      memory_start: low,
      end_of_heap: AtomicUsize::new(low),
      global_lock: ReentrantMutex::new(()),
      registry: Mutex::new(Vec::new()),
    }
  }

  fn end_of_heap(&self) -> usize {
    self.end_of_heap.load(Ordering::Acquire)
  }

  /// Lazy per-thread arena lookup/creation (spec section 4.1). Race-free
  /// across threads because each thread only ever touches its own
  /// thread-local slot; race-free against concurrent registry pushes from
  /// other threads because the registry is behind its own mutex.
  fn ensure_arena(&self) -> &'static Arena {
    let key = self.instance_id;
    ARENA_CACHE.with(|cache| {
      if let Some(arena) = cache.borrow().get(&key) {
        return *arena;
      }
      let arena: &'static Arena = Box::leak(Box::new(Arena::new(&self.config)));
      self.registry.lock().push(arena);
      cache.borrow_mut().insert(key, arena);
      arena
    })
  }

  fn find_arena(&self, owner: usize) -> Option<&'static Arena> {
    self.registry.lock().iter().copied().find(|a| a.id == owner)
  }

  fn for_each_arena(&self, mut f: impl FnMut(&'static Arena)) {
    let registry = self.registry.lock();
    for &arena in registry.iter() {
      f(arena);
    }
  }

  fn needed_size(&self, n: usize) -> usize {
    let raw = n + block::allocated_overhead();
    let aligned = crate::align_to!(raw, self.config.alignment);
    aligned.max(block::min_allocated_size(&self.config))
  }

  /// Pushes `header` onto `arena`'s mailbox. Used both for genuine
  /// cross-thread frees and, per this crate's resolution of the split-
  /// remainder open question (`SPEC_FULL.md` section 4.5), for same-thread
  /// split remainders — a single uniform path into the reclaim pass.
  fn post_to_mailbox(&self, arena: &Arena, header: *mut Header) {
    let mut guard = arena.mailbox().lock();
    unsafe {
      (*header).is_free = true;
      let old_head = *guard;
      block::set_prev_free(header, ptr::null_mut());
      block::set_next_free(header, old_head);
      if !old_head.is_null() {
        block::set_prev_free(old_head, header);
      }
    }
    *guard = header;
  }

  /// `SPEC_FULL.md` section 4.3: first-fit search starting at the request's
  /// bin, unlinking the chosen block on success.
  fn find_fit(&self, arena: &Arena, need: usize) -> Option<*mut Header> {
    let start = bins::bin_index(need, &self.config);
    for idx in start..self.config.bin_count {
      let slot = arena.bin_head(idx);
      let mut cur = slot.get();
      while !cur.is_null() {
        let total = unsafe { (*cur).total_size };
        if total >= need {
          unsafe { bins::unlink(slot, cur) };
          return Some(cur);
        }
        cur = unsafe { block::get_next_free(cur) };
      }
    }
    None
  }

  /// Splits `header` if the leftover exceeds `free_overhead + split_threshold`,
  /// mailboxing the trailing piece. Mutates `header.total_size` in place.
  fn split_if_profitable(&self, arena: &Arena, header: *mut Header, need: usize) {
    unsafe {
      let total = (*header).total_size;
      if total >= need + block::min_allocated_size(&self.config) + self.config.split_threshold {
        let remainder_size = total - need;
        (*header).total_size = need;
        block::write_footer(header);

        let remainder = block::next_block(header);
        (*remainder).owner = (*header).owner;
        (*remainder).total_size = remainder_size;
        block::write_footer(remainder);
        self.post_to_mailbox(arena, remainder);
      }
    }
  }

  fn extend_heap(&self, need: usize) -> Result<*mut u8, crate::ProviderError> {
    let _guard = self.global_lock.lock();
    let ptr = self.provider.expand(need)?;
    self.end_of_heap.store(ptr as usize + need, Ordering::Release);
    Ok(ptr)
  }

  fn extend_for_allocation(&self, arena: &Arena, need: usize) -> Result<*mut Header, crate::ProviderError> {
    let ptr = self.extend_heap(need)?;
    let header = ptr as *mut Header;
    unsafe {
      (*header).owner = arena.id;
      (*header).total_size = need;
      (*header).is_free = false;
      block::write_footer(header);
    }
    Ok(header)
  }

  /// `SPEC_FULL.md` section 4.3.
  ///
  /// # Safety
  /// Caller must eventually pass the returned pointer to `free`/`realloc`
  /// on this same allocator at most once, and must not use it after that.
  pub unsafe fn malloc(&self, n: usize) -> *mut u8 {
    let arena = self.ensure_arena();
    self.reclaim(arena);

    let need = self.needed_size(n);

    if let Some(header) = self.find_fit(arena, need) {
      self.split_if_profitable(arena, header, need);
      unsafe {
        (*header).is_free = false;
        return block::payload_of(header);
      }
    }

    match self.extend_for_allocation(arena, need) {
      Ok(header) => unsafe { block::payload_of(header) },
      Err(e) => {
        log::warn!("malloc: heap exhausted requesting {need} bytes ({e})");
        ptr::null_mut()
      }
    }
  }

  /// `SPEC_FULL.md` section 4.4.
  ///
  /// A local free (owner is the calling thread) coalesces with same-owner
  /// free neighbours immediately rather than waiting for the next
  /// `reclaim` pass: the owning thread already has uncontended access to
  /// its own bins, so there is no locking reason to defer it, and
  /// `SPEC_FULL.md` section 8's scenario S2 requires same-thread
  /// free/free/free to merge without an intervening allocation. Only the
  /// remote-free path defers to `reclaim`, since that is the one that
  /// would otherwise need to touch another thread's bins.
  ///
  /// # Safety
  /// `payload` must be null, or a pointer previously returned by `malloc`
  /// or `realloc` on this allocator and not already freed.
  pub unsafe fn free(&self, payload: *mut u8) {
    if payload.is_null() {
      return;
    }
    unsafe {
      let header = block::header_of(payload);
      let owner = (*header).owner;
      let current = self.ensure_arena();

      if owner == current.id {
        // Drain our own mailbox first: a same-owner right/left neighbour
        // might currently be sitting there (an undrained split remainder
        // or a remote free that landed between our last allocate and
        // now), and coalesce_one's unlink assumes the neighbour it finds
        // free is bin-resident. Draining folds any such neighbour into a
        // bin before we look at it.
        self.reclaim(current);
        self.coalesce_one(current, header);
      } else {
        let owner_arena = self
          .find_arena(owner)
          .expect("a block's owner arena must still be registered (arenas outlive all allocations)");
        self.post_to_mailbox(owner_arena, header);
      }
    }
  }

  /// `SPEC_FULL.md` section 4.5: drains `arena`'s mailbox and coalesces
  /// each member with its same-owner free neighbours. Holds the mailbox
  /// lock for the whole pass (the normative choice named in spec section 5).
  fn reclaim(&self, arena: &Arena) {
    let mut guard = arena.mailbox().lock();
    if (*guard).is_null() {
      return;
    }

    // Step 1: collect every member, flipping is_free to false as a
    // sentinel so step 2's coalesce can't absorb an unprocessed sibling.
    let mut members = Vec::new();
    let mut cur = *guard;
    while !cur.is_null() {
      let next = unsafe { block::get_next_free(cur) };
      unsafe {
        (*cur).is_free = false;
      }
      members.push(cur);
      cur = next;
    }

    for member in members {
      self.coalesce_one(arena, member);
    }

    *guard = ptr::null_mut();
  }

  /// Restores `header.is_free`, absorbs same-owner free right and then
  /// left neighbours (right-before-left is mandatory: the post-right size
  /// is what the left footer-walk starts from), and bins the result.
  fn coalesce_one(&self, arena: &Arena, mut header: *mut Header) {
    unsafe {
      (*header).is_free = true;

      // Right.
      loop {
        let neighbor = block::next_block(header);
        if neighbor as usize >= self.end_of_heap() {
          break;
        }
        if (*neighbor).owner != arena.id || !(*neighbor).is_free {
          break;
        }
        let idx = bins::bin_index((*neighbor).total_size, &self.config);
        bins::unlink(arena.bin_head(idx), neighbor);
        (*header).total_size += (*neighbor).total_size;
      }
      block::write_footer(header);

      // Left.
      loop {
        if header as usize <= self.memory_start {
          break;
        }
        let prev_size = block::footer_value_at(header);
        if prev_size == 0 || (header as usize) < self.memory_start + prev_size {
          break;
        }
        let prev_header = (header as *mut u8).sub(prev_size) as *mut Header;
        if (prev_header as usize) < self.memory_start {
          break;
        }
        if (*prev_header).owner != arena.id || !(*prev_header).is_free {
          break;
        }
        let idx = bins::bin_index((*prev_header).total_size, &self.config);
        bins::unlink(arena.bin_head(idx), prev_header);
        (*prev_header).total_size += (*header).total_size;
        header = prev_header;
      }
      block::write_footer(header);

      let idx = bins::bin_index((*header).total_size, &self.config);
      bins::push_front(arena.bin_head(idx), header);
    }
  }

  /// Tries to absorb `header`'s right neighbour in place, returning whether
  /// it happened. `SPEC_FULL.md` section 4.6 case 3, with the "search both
  /// bin and mailbox" caveat subsumed by the unconditional `reclaim` call
  /// at the top of `realloc`: by the time this runs, any free same-owner
  /// neighbour has already been coalesced into a bin. A race against a
  /// concurrent remote free landing on this exact neighbour is benign —
  /// worst case this falls through to relocation (case 5), never incorrect.
  fn try_absorb_right_neighbor(&self, arena: &Arena, header: *mut Header) -> bool {
    unsafe {
      let neighbor = block::next_block(header);
      if neighbor as usize >= self.end_of_heap() {
        return false;
      }
      if (*neighbor).owner != (*header).owner || !(*neighbor).is_free {
        return false;
      }
      let idx = bins::bin_index((*neighbor).total_size, &self.config);
      bins::unlink(arena.bin_head(idx), neighbor);
      (*header).total_size += (*neighbor).total_size;
      block::write_footer(header);
      true
    }
  }

  /// `SPEC_FULL.md` section 4.6. `payload = null` is treated as `malloc(n)`,
  /// this crate's resolution of the open question in spec section 9.
  ///
  /// # Safety
  /// `payload` must be null, or a pointer previously returned by `malloc`
  /// or `realloc` on this allocator and not already freed.
  pub unsafe fn realloc(&self, payload: *mut u8, n: usize) -> *mut u8 {
    if payload.is_null() {
      return unsafe { self.malloc(n) };
    }

    unsafe {
      let arena = self.ensure_arena();
      self.reclaim(arena);

      let header = block::header_of(payload);
      let need = self.needed_size(n);
      let total = (*header).total_size;

      if need <= total {
        self.split_if_profitable(arena, header, need);
        return payload;
      }

      if self.try_absorb_right_neighbor(arena, header) {
        self.split_if_profitable(arena, header, need);
        return payload;
      }

      if block::next_block(header) as usize == self.end_of_heap() {
        let shortfall = need - total;
        return match self.extend_heap(shortfall) {
          Ok(_) => {
            (*header).total_size += shortfall;
            block::write_footer(header);
            payload
          }
          Err(e) => {
            log::warn!("realloc: terminal growth failed requesting {shortfall} more bytes ({e})");
            ptr::null_mut()
          }
        };
      }

      let new_payload = self.malloc(n);
      if new_payload.is_null() {
        return ptr::null_mut();
      }
      let old_payload_size = total - block::allocated_overhead();
      let copy_len = old_payload_size.min(n);
      ptr::copy_nonoverlapping(payload, new_payload, copy_len);
      self.free(payload);
      new_payload
    }
  }

  /// `SPEC_FULL.md` section 4.7. Diagnostic only; never called on the
  /// allocate/free/reallocate hot path.
  ///
  /// # Safety
  /// Per section 5, an arena's bins are touched without synchronization by
  /// their owning thread only; `check_arena` reads every registered arena's
  /// bins from whatever thread calls `check`, not just its own. The caller
  /// must ensure no other thread is concurrently calling `malloc`/`free`/
  /// `realloc` for the duration of this call — i.e. the heap is quiescent —
  /// or this is a data race on those arenas' bin pointers.
  pub unsafe fn check(&self) -> i32 {
    let mut ok = true;
    self.for_each_arena(|arena| {
      if !self.check_arena(arena) {
        ok = false;
      }
    });
    if !self.check_region_walk() {
      ok = false;
    }
    if ok { 0 } else { -1 }
  }

  fn check_arena(&self, arena: &Arena) -> bool {
    for idx in 0..self.config.bin_count {
      let head = arena.bin_head(idx).get();
      if head.is_null() {
        continue;
      }
      if unsafe { block::get_prev_free(head) } != ptr::null_mut() {
        log::error!("check: bin {idx} head has non-null prev_free (owner {})", arena.id);
        return false;
      }
      let mut prev = ptr::null_mut();
      let mut cur = head;
      while !cur.is_null() {
        unsafe {
          if !(*cur).is_free {
            log::error!("check: block {cur:p} listed in bin {idx} is not marked free");
            return false;
          }
          if block::get_prev_free(cur) != prev {
            log::error!("check: broken prev_free round-trip at {cur:p} in bin {idx}");
            return false;
          }
          if block::footer_value(cur) != (*cur).total_size {
            log::error!("check: footer mismatch on bin {idx} member {cur:p}");
            return false;
          }
        }
        prev = cur;
        cur = unsafe { block::get_next_free(cur) };
      }
    }

    let guard = arena.mailbox().lock();
    let mut prev = ptr::null_mut();
    let mut cur = *guard;
    while !cur.is_null() {
      unsafe {
        if block::get_prev_free(cur) != prev {
          log::error!("check: broken mailbox prev_free round-trip at {cur:p} (owner {})", arena.id);
          return false;
        }
        prev = cur;
        cur = block::get_next_free(cur);
      }
    }
    true
  }

  fn check_region_walk(&self) -> bool {
    let end = self.end_of_heap();
    let mut cur = self.memory_start;
    while cur != end {
      if cur > end {
        log::error!("check: region walk overshot end_of_heap ({cur:#x} > {end:#x})");
        return false;
      }
      let header = cur as *mut Header;
      let total = unsafe { (*header).total_size };
      if total == 0 || total % self.config.alignment != 0 {
        log::error!("check: block at {cur:#x} has invalid total_size {total}");
        return false;
      }
      if unsafe { block::footer_value(header) } != total {
        log::error!("check: footer mismatch at {cur:#x}");
        return false;
      }
      cur += total;
    }
    true
  }

  /// Pass-through to the heap provider, per `SPEC_FULL.md` section 6.
  pub fn heap_low(&self) -> *mut u8 {
    self.provider.heap_low()
  }

  /// Pass-through to the heap provider.
  pub fn heap_high(&self) -> *mut u8 {
    self.provider.heap_high()
  }

  /// Pass-through to the heap provider.
  pub fn reset_brk(&self) {
    self.provider.reset();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provider::MockProvider;

  fn new_allocator() -> Allocator<MockProvider> {
    Allocator::new(MockProvider::with_capacity(1 << 20), Config::default())
  }

  #[test]
  fn fit_and_split() {
    // S1: malloc(1000), free, malloc(200) finds the freed range and
    // leaves a findable remainder behind.
    let a = new_allocator();
    unsafe {
      let p1 = a.malloc(1000);
      assert!(!p1.is_null());
      a.free(p1);

      let p2 = a.malloc(200);
      assert!(!p2.is_null());
      assert_eq!(p2, p1, "p2 should reuse the freed range's head");
    }
    assert_eq!(unsafe { a.check() }, 0);
  }

  #[test]
  fn coalesce_on_next_allocate() {
    // S2: three adjacent 64-byte blocks a, b, c; free a, c, b (same
    // thread); malloc(192) then succeeds from the coalesced block without
    // extending the heap.
    let a = new_allocator();
    unsafe {
      let pa = a.malloc(64);
      let pb = a.malloc(64);
      let pc = a.malloc(64);
      assert!(!pa.is_null() && !pb.is_null() && !pc.is_null());

      let before = a.end_of_heap();
      a.free(pa);
      a.free(pc);
      a.free(pb);

      let merged = a.malloc(192);
      assert!(!merged.is_null());
      assert_eq!(a.end_of_heap(), before, "coalesced space must satisfy the request without growing the heap");
      assert_eq!(merged, pa, "the coalesced block should start where a did");
    }
    assert_eq!(unsafe { a.check() }, 0);
  }

  #[test]
  fn realloc_shrink_in_place() {
    // S4.
    let a = new_allocator();
    unsafe {
      let p = a.malloc(4096);
      assert!(!p.is_null());
      let p2 = a.realloc(p, 64);
      assert_eq!(p2, p);
    }
    assert_eq!(unsafe { a.check() }, 0);
  }

  #[test]
  fn realloc_grow_terminal_extends_heap() {
    // S5: p is the last block before end_of_heap; realloc grows it in
    // place by extending the heap, without relocating.
    let a = new_allocator();
    unsafe {
      let p = a.malloc(64);
      assert!(!p.is_null());
      assert_eq!(block::next_block(block::header_of(p)) as usize, a.end_of_heap());

      let grown = a.realloc(p, 1024);
      assert_eq!(grown, p, "terminal growth must not relocate");
    }
    assert_eq!(unsafe { a.check() }, 0);
  }

  #[test]
  fn realloc_relocates_when_neighbor_is_allocated() {
    // S6: p has an allocated right neighbour and is not terminal;
    // realloc must relocate, preserving the original payload bytes.
    let a = new_allocator();
    unsafe {
      let p = a.malloc(64);
      let _neighbor = a.malloc(64); // keeps p non-terminal and blocks in-place growth
      assert!(!p.is_null());

      for i in 0..64u8 {
        *p.add(i as usize) = i;
      }

      let moved = a.realloc(p, 1024);
      assert!(!moved.is_null());
      assert_ne!(moved, p, "an allocated right neighbour forces relocation");
      for i in 0..64u8 {
        assert_eq!(*moved.add(i as usize), i);
      }
    }
    assert_eq!(unsafe { a.check() }, 0);
  }

  #[test]
  fn cross_thread_free_lands_in_mailbox_then_drains() {
    // S3, single-threaded approximation: simulate a remote free by
    // forging a second arena id and routing through post_to_mailbox
    // directly, then confirm the next malloc on the owner drains it.
    let a = new_allocator();
    unsafe {
      let p = a.malloc(128);
      let header = block::header_of(p);
      let owner = a.find_arena((*header).owner).unwrap();

      // Simulate what `free` does when owner != current arena.
      a.post_to_mailbox(owner, header);
      assert!(!(*owner.mailbox().lock()).is_null());

      let p2 = a.malloc(128);
      assert!(!p2.is_null());
      assert!((*owner.mailbox().lock()).is_null(), "the next malloc must drain the mailbox");
    }
    assert_eq!(unsafe { a.check() }, 0);
  }

  #[test]
  fn heap_exhaustion_returns_null_without_partial_mutation() {
    let a = Allocator::new(MockProvider::with_capacity(256), Config::default());
    unsafe {
      let huge = a.malloc(1 << 20);
      assert!(huge.is_null());
    }
    assert_eq!(unsafe { a.check() }, 0);
  }

  #[test]
  fn pointers_are_aligned_and_in_bounds() {
    let a = new_allocator();
    unsafe {
      for n in [1usize, 7, 8, 9, 100, 1000, 5000] {
        let p = a.malloc(n);
        assert!(!p.is_null());
        assert_eq!((p as usize) % a.config.alignment, 0);
        assert!(p as usize >= a.heap_low() as usize);
        assert!(p as usize <= a.heap_high() as usize);
      }
    }
    assert_eq!(unsafe { a.check() }, 0);
  }

  #[test]
  fn disjoint_allocations_never_overlap() {
    let a = new_allocator();
    let mut ranges = Vec::new();
    unsafe {
      for n in [16usize, 32, 64, 128, 256, 512] {
        let p = a.malloc(n);
        assert!(!p.is_null());
        ranges.push((p as usize, (*block::header_of(p)).total_size));
      }
    }
    for (i, &(start_a, size_a)) in ranges.iter().enumerate() {
      for &(start_b, size_b) in ranges.iter().skip(i + 1) {
        let end_a = start_a + size_a;
        let end_b = start_b + size_b;
        assert!(end_a <= start_b || end_b <= start_a, "allocations must not overlap");
      }
    }
  }
}
