//! The router: classifies each request by size, dispatches to the brk
//! arena or the map registry, and implements `resize`'s branching logic
//! on top of both backends.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr;

use crate::arena::Arena;
use crate::block::{self, BlockHeader, Status};
use crate::map::MapRegistry;
use crate::sys;

/// Footprint boundary at or above which allocations go to the map
/// backend instead of the arena. Equal to [`crate::arena::INITIAL_HEAP`]
/// by design: the same number amortizes both the cost of the first brk
/// extension and the point past which per-page mmap overhead pays off.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

/// The allocator: one brk arena, one map registry, and the (possibly
/// temporarily overridden) routing threshold. Constructing one is cheap
/// and does not touch the kernel — the arena initializes lazily on its
/// first allocation.
///
/// Values are independent of one another: since the brk arena only ever
/// grows (never shrinks, see the crate's non-goals) two `Allocator`
/// values always end up owning disjoint address ranges, which is what
/// lets tests construct a fresh instance per test instead of sharing the
/// process-wide default (see [`crate::allocate`] and friends).
pub struct Allocator {
  arena: Arena,
  map: MapRegistry,
  threshold: usize,
}

impl Allocator {
  pub const fn new() -> Self {
    Self { arena: Arena::new(), map: MapRegistry::new(), threshold: MMAP_THRESHOLD }
  }

  /// Allocates `size` bytes, routed to the arena or the map registry by
  /// comparing the request's footprint against the current threshold.
  /// Returns null if `size == 0`.
  pub fn allocate(&mut self, size: usize) -> *mut u8 {
    if size == 0 {
      return ptr::null_mut();
    }

    let payload = crate::align!(size);
    let footprint = block::footprint_of(payload);

    let header = if footprint < self.threshold {
      self.arena.allocate(payload)
    } else {
      self.map.allocate(payload)
    };

    unsafe { block::payload_of(header) }
  }

  /// Frees `ptr`. A null pointer is a no-op; dispatch is by the block's
  /// own status, recovered from its header.
  pub fn free(&mut self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }

    unsafe {
      let header = block::header_from_payload(ptr);
      match (*header).status {
        Status::Mapped => self.map.free(header),
        _ => self.arena.free(header),
      }
    }
  }

  /// Allocates `count * elem_size` bytes and zeroes them unconditionally.
  /// While the allocation is in flight, the routing threshold is lowered
  /// to the OS page size, so any request whose footprint reaches a full
  /// page is served by the map backend (and thus already zero-filled by
  /// the kernel); the unconditional zero-fill below exists for the
  /// sub-page case served from the arena, which may hand back dirty
  /// memory left over from a prior allocation.
  ///
  /// Not reentrant: calling this recursively (from within a destructor
  /// run during the allocation itself, say) would see the overridden
  /// threshold. This cannot happen in practice since nothing this
  /// function calls can call back into `zero_init`.
  pub fn zero_init(&mut self, count: usize, elem_size: usize) -> *mut u8 {
    // `allocate` rounds this up to `ALIGNMENT` and then adds `META` to
    // form the footprint; leave headroom for both so that a saturated
    // `total` can't wrap `usize` further down the call chain and have
    // `allocate` hand back a tiny region while this function still
    // zeroes the original, much larger `total` byte count into it.
    let max_total = usize::MAX - crate::align::ALIGNMENT - block::META;
    let total = count.checked_mul(elem_size).unwrap_or(max_total).min(max_total);

    let saved_threshold = self.threshold;
    self.threshold = sys::page_size();
    let ptr = self.allocate(total);
    self.threshold = saved_threshold;

    if !ptr.is_null() {
      unsafe {
        ptr::write_bytes(ptr, 0, total);
      }
    }

    ptr
  }

  /// Resizes the allocation at `ptr` to `size` bytes, possibly moving it.
  /// Dispatches on the source block's status and backend; see
  /// [`Allocator::resize_mapped`] and [`Allocator::resize_in_arena`] for
  /// the case analysis.
  pub fn resize(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
      return self.allocate(size);
    }
    if size == 0 {
      self.free(ptr);
      return ptr::null_mut();
    }

    let payload = crate::align!(size);
    let footprint = block::footprint_of(payload);

    unsafe {
      let header = block::header_from_payload(ptr);

      if (*header).status == Status::Free {
        return ptr::null_mut();
      }

      if (*header).status == Status::Mapped {
        return self.resize_mapped(header, ptr, payload);
      }

      self.resize_in_arena(header, ptr, payload, footprint)
    }
  }

  /// MAPPED source: always relocates, through the router so a shrunk
  /// allocation can move back into the arena.
  unsafe fn resize_mapped(&mut self, header: *mut BlockHeader, ptr: *mut u8, payload: usize) -> *mut u8 {
    unsafe {
      let old_payload = (*header).payload_size;
      let new_ptr = self.allocate(payload);

      if !new_ptr.is_null() {
        ptr::copy_nonoverlapping(ptr, new_ptr, old_payload.min(payload));
      }
      self.map.free(header);

      new_ptr
    }
  }

  /// ALLOC source in the brk arena: crosses to the map backend if the
  /// request now exceeds the threshold, fails on an unrecognized
  /// pointer, otherwise tries to grow in place by coalescing forward,
  /// falls back to extending the arena at the tail, and finally
  /// relocates within the arena if nothing else fits.
  unsafe fn resize_in_arena(
    &mut self,
    header: *mut BlockHeader,
    ptr: *mut u8,
    payload: usize,
    footprint: usize,
  ) -> *mut u8 {
    unsafe {
      // 1. Crossing the threshold upward. Always compared against the
      //    fixed MMAP_THRESHOLD constant, not `self.threshold` (which
      //    only `zero_init` ever overrides, and `zero_init` never calls
      //    `resize`).
      if footprint >= MMAP_THRESHOLD {
        let old_payload = (*header).payload_size;
        let new_header = self.map.allocate(payload);
        let new_ptr = block::payload_of(new_header);
        ptr::copy_nonoverlapping(ptr, new_ptr, old_payload.min(payload));
        self.arena.free(header);
        return new_ptr;
      }

      // 2. Unknown source.
      if !self.arena.contains(header) {
        return ptr::null_mut();
      }

      let old_payload = (*header).payload_size;

      // 3. Grow in place by coalescing forward, bounded by the request.
      (*header).status = Status::Free;
      self.arena.coalesce_forward_until(header, footprint);
      (*header).status = Status::Alloc;

      if (*header).footprint() >= footprint {
        self.arena.maybe_split(header, payload);
        return ptr;
      }

      // 4. Tail of arena (no successor, even after the partial coalesce
      //    above). The inner best_fit also coalesces as it sweeps, so a
      //    free predecessor may have already absorbed `header` by the
      //    time it returns — in which case `header` is no longer a
      //    distinct node and the later `self.arena.free(header)` becomes
      //    the no-op it should be.
      if (*header).next.is_null() {
        (*header).status = Status::Free;
        let (candidate, tail) = self.arena.best_fit(footprint);
        let candidate = if candidate == header { ptr::null_mut() } else { candidate };

        if candidate.is_null() {
          // `tail` may no longer be `header` itself: if `header`'s
          // predecessor was FREE, the rescan above already coalesced
          // `header` into it, so `header`'s own address is now just
          // interior bytes of the predecessor's (possibly still-FREE)
          // block. `grow` is the authority on which block actually got
          // extended — trust its return value, not `header`/`ptr`.
          let grown = self.arena.grow(tail, footprint);
          (*grown).status = Status::Alloc;
          let grown_payload = block::payload_of(grown);

          if grown != header {
            ptr::copy_nonoverlapping(ptr, grown_payload, old_payload.min(payload));
            self.arena.free(header);
          }

          return grown_payload;
        }

        (*candidate).status = Status::Alloc;
        let candidate_payload = block::payload_of(candidate);
        ptr::copy_nonoverlapping(ptr, candidate_payload, old_payload.min(payload));
        self.arena.free(header);
        return candidate_payload;
      }

      // 5. Relocate inside the arena. Undo the partial coalesce from
      //    step 3 first, if it changed anything, so the excess becomes
      //    a proper FREE block again instead of being silently lost.
      if (*header).payload_size != old_payload {
        self.arena.split_at(header, old_payload);
      }

      let new_header = self.arena.allocate(payload);
      let new_ptr = block::payload_of(new_header);
      ptr::copy_nonoverlapping(ptr, new_ptr, old_payload.min(payload));
      self.arena.free(header);
      new_ptr
    }
  }

  /// Current payload size of the block at `ptr`, for tests exercising
  /// the resize-identity law. Not part of the four core operations.
  pub fn payload_size_of(&self, ptr: *mut u8) -> usize {
    unsafe { (*block::header_from_payload(ptr)).payload_size }
  }

  /// Sum of the footprints of every FREE block in the brk arena. A
  /// debug/introspection helper for the allocate/free round-trip law.
  pub fn arena_free_footprint(&self) -> usize {
    self.arena.free_footprint()
  }

  /// True once every mapped allocation made through this instance has
  /// been freed again.
  pub fn map_registry_is_empty(&self) -> bool {
    self.map.is_empty()
  }
}

impl Default for Allocator {
  fn default() -> Self {
    Self::new()
  }
}

/// Adapts [`Allocator`] to `std`'s global-allocator trait, so a process
/// whose type mix never needs more than 8-byte alignment can use this
/// crate as its `#[global_allocator]`. `Allocator`'s own methods take
/// `&mut self`; `GlobalAlloc` requires `&self` because the global
/// instance is shared through an immutable static. Since this allocator
/// is documented as single-threaded and non-reentrant, the cast below
/// is sound as long as that contract holds — it would not be sound for
/// a type meant to be called concurrently.
///
/// # Safety
///
/// Callers relying on this impl must not use the allocator from more
/// than one thread, and must not request an alignment greater than
/// [`crate::align::ALIGNMENT`].
unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    debug_assert!(layout.align() <= crate::align::ALIGNMENT);
    let this = self as *const Allocator as *mut Allocator;
    unsafe { (*this).allocate(layout.size()) }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    let this = self as *const Allocator as *mut Allocator;
    unsafe { (*this).free(ptr) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    debug_assert!(layout.align() <= crate::align::ALIGNMENT);
    let this = self as *const Allocator as *mut Allocator;
    unsafe { (*this).zero_init(1, layout.size()) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
    let this = self as *const Allocator as *mut Allocator;
    unsafe { (*this).resize(ptr, new_size) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allocate_zero_is_absent() {
    let mut allocator = Allocator::new();
    assert!(allocator.allocate(0).is_null());
  }

  #[test]
  fn allocate_one_returns_aligned_pointer_with_room() {
    let mut allocator = Allocator::new();
    let p = allocator.allocate(1);
    assert!(!p.is_null());
    assert_eq!(p as usize % crate::align::ALIGNMENT, 0);
    assert!(allocator.payload_size_of(p) >= 8);
  }

  #[test]
  fn free_of_null_is_a_noop() {
    let mut allocator = Allocator::new();
    allocator.free(ptr::null_mut());
  }

  #[test]
  fn free_idempotence() {
    let mut allocator = Allocator::new();
    let p = allocator.allocate(64);
    allocator.free(p);
    let footprint_after_first = allocator.arena_free_footprint();
    allocator.free(p);
    assert_eq!(allocator.arena_free_footprint(), footprint_after_first);
  }

  #[test]
  fn allocate_free_roundtrip_does_not_shrink_free_footprint() {
    let mut allocator = Allocator::new();
    let before = allocator.arena_free_footprint();
    let p = allocator.allocate(128);
    allocator.free(p);
    assert!(allocator.arena_free_footprint() >= before);
  }

  #[test]
  fn resize_identity_does_not_move_or_split() {
    let mut allocator = Allocator::new();
    let p = allocator.allocate(100);
    let payload = allocator.payload_size_of(p);
    let p2 = allocator.resize(p, payload);
    assert_eq!(p, p2);
  }

  #[test]
  fn resize_to_zero_frees_and_returns_null() {
    let mut allocator = Allocator::new();
    let p = allocator.allocate(100);
    let r = allocator.resize(p, 0);
    assert!(r.is_null());
  }

  #[test]
  fn resize_from_null_allocates() {
    let mut allocator = Allocator::new();
    let p = allocator.resize(ptr::null_mut(), 32);
    assert!(!p.is_null());
  }

  #[test]
  fn resize_of_free_block_fails() {
    let mut allocator = Allocator::new();
    let p = allocator.allocate(50);
    allocator.free(p);
    let r = allocator.resize(p, 100);
    assert!(r.is_null());
  }

  #[test]
  fn resize_grow_relocates_and_preserves_contents() {
    let mut allocator = Allocator::new();
    let a = allocator.allocate(50);
    let _b = allocator.allocate(50);

    unsafe {
      for i in 0..50u8 {
        *a.add(i as usize) = i;
      }
    }

    let c = allocator.resize(a, 2000);
    assert_ne!(c, a);

    unsafe {
      for i in 0..50u8 {
        assert_eq!(*c.add(i as usize), i);
      }
    }
  }

  #[test]
  fn resize_shrink_keeps_pointer_and_splits() {
    let mut allocator = Allocator::new();
    let a = allocator.allocate(100);
    let footprint_before = allocator.arena_free_footprint();
    let b = allocator.resize(a, 40);
    assert_eq!(a, b);
    assert!(allocator.arena_free_footprint() > footprint_before);
  }

  #[test]
  fn large_allocation_routes_to_map_and_frees_back_to_os() {
    let mut allocator = Allocator::new();
    let p = allocator.allocate(200 * 1024);
    assert!(!p.is_null());
    assert!(allocator.map_registry_is_empty().then_some(()).is_none());
    allocator.free(p);
    assert!(allocator.map_registry_is_empty());
  }

  #[test]
  fn zero_init_zeroes_every_byte_and_restores_threshold() {
    let mut allocator = Allocator::new();
    let p = allocator.zero_init(10, 16);
    assert!(!p.is_null());
    unsafe {
      for i in 0..160 {
        assert_eq!(*p.add(i), 0);
      }
    }

    // Threshold is restored: a small request afterwards should still be
    // served from the arena, not the map registry.
    let small = allocator.allocate(8);
    assert!(!small.is_null());
    assert!(allocator.map_registry_is_empty());
  }

  #[test]
  fn boundary_sizes_route_as_specified() {
    let mut allocator = Allocator::new();

    let at_threshold_minus_one = allocator.allocate(MMAP_THRESHOLD - block::META);
    assert!(allocator.map_registry_is_empty());
    allocator.free(at_threshold_minus_one);

    let mut allocator = Allocator::new();
    let over_threshold = allocator.allocate(MMAP_THRESHOLD - block::META + 1);
    assert!(!allocator.map_registry_is_empty());
    allocator.free(over_threshold);
  }
}
