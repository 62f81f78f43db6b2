//! # osheap — a brk/mmap-backed dynamic memory allocator
//!
//! A general-purpose heap manager exposing the classical four-operation
//! surface — [`allocate`], [`free`], [`zero_init`], [`resize`] — backed
//! by two kernel mechanisms: a contiguous program-break region grown
//! with `sbrk`, and discrete anonymous page mappings obtained from
//! `mmap`.
//!
//! ## Crate structure
//!
//! ```text
//!   osheap
//!   ├── align      - the ALIGNMENT constant and the align! macro
//!   ├── block      - BlockHeader and the header-arithmetic primitives
//!   ├── sys        - the kernel shim: sbrk / mmap / munmap / sysconf
//!   ├── arena      - the brk arena: best-fit, split, coalesce, grow
//!   ├── map        - the map registry for page-mapped blocks
//!   └── allocator  - the router: size-based dispatch and resize
//! ```
//!
//! ## How it works
//!
//! Small requests are carved out of a single, monotonically growing
//! program-break extension using an intrusive free list with a
//! best-fit search, splitting, and eager forward coalescing. Requests
//! at or above [`allocator::MMAP_THRESHOLD`] bytes bypass the arena
//! entirely and get their own anonymous mapping, released with a
//! matching `munmap` on free. [`resize`] moves between the two
//! backends as a request crosses the threshold in either direction.
//!
//! ```text
//!   Request routing:
//!
//!     footprint = META + ALIGN(size)
//!
//!     footprint < MMAP_THRESHOLD ──────────▶ brk arena (best-fit)
//!     footprint >= MMAP_THRESHOLD ─────────▶ map registry (mmap)
//! ```
//!
//! ## Quick start
//!
//! ```
//! let mut allocator = osheap::Allocator::new();
//!
//! let p = allocator.allocate(128);
//! assert!(!p.is_null());
//!
//! let p = allocator.resize(p, 4096);
//! allocator.free(p);
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no locks, no reentrancy, not `Sync`.
//! - **No shrink-to-OS**: the data segment only ever grows.
//! - **No debug instrumentation**: no canaries, no poisoning.
//!
//! ## Safety
//!
//! This crate is inherently unsafe: it manages raw memory and hands out
//! raw pointers. [`Allocator`]'s own methods are safe to *call* (the
//! unsafety is encapsulated inside them), but misusing the pointers
//! they return — freeing a pointer twice through two different means,
//! writing past a payload's size — is undefined behavior same as with
//! any allocator.

pub mod align;
mod allocator;
mod arena;
mod block;
mod map;
mod sys;

pub use allocator::{Allocator, MMAP_THRESHOLD};
pub use arena::INITIAL_HEAP;
pub use block::META;

use std::cell::UnsafeCell;
use std::ptr;

/// The process-wide default instance, per the design notes' "model as a
/// single allocator value initialized lazily; expose process-level
/// operations as thin wrappers over the default instance." Wrapped in
/// `UnsafeCell` rather than a plain `static mut` so the single point of
/// unsafety is the accessor below, not every call site.
struct GlobalCell(UnsafeCell<Allocator>);

// Safety: this crate is documented as single-threaded and non-reentrant;
// `Sync` here only lets the `static` exist, it does not make concurrent
// use sound. Callers must not call across threads.
unsafe impl Sync for GlobalCell {}

static DEFAULT: GlobalCell = GlobalCell(UnsafeCell::new(Allocator::new()));

/// # Safety
///
/// Must not be called from more than one thread, and the returned
/// reference must not outlive the call it backs (no two calls into this
/// module may be interleaved, which holds automatically on one thread).
unsafe fn default_allocator() -> &'static mut Allocator {
  unsafe { &mut *DEFAULT.0.get() }
}

/// Allocates `size` bytes from the process-wide default allocator.
/// Returns an absent (null) pointer if `size == 0`.
pub fn allocate(size: usize) -> *mut u8 {
  unsafe { default_allocator().allocate(size) }
}

/// Frees `ptr`, previously returned by [`allocate`], [`zero_init`], or
/// [`resize`] on the process-wide default allocator. A null `ptr` is a
/// no-op, as is a pointer not owned by this allocator.
pub fn free(ptr: *mut u8) {
  unsafe { default_allocator().free(ptr) }
}

/// Allocates `count * elem_size` bytes from the default allocator and
/// zeroes every byte of the returned region.
pub fn zero_init(count: usize, elem_size: usize) -> *mut u8 {
  unsafe { default_allocator().zero_init(count, elem_size) }
}

/// Resizes the allocation at `ptr` (from the default allocator) to
/// `size` bytes, possibly moving it. `ptr` absent behaves as
/// [`allocate`]; `size == 0` behaves as [`free`] and returns an absent
/// pointer.
pub fn resize(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { default_allocator().resize(ptr, size) }
}

/// An absent pointer, spelled out for readability at call sites that
/// want to name the "no allocation" result explicitly rather than
/// writing `ptr::null_mut()` inline.
pub fn absent() -> *mut u8 {
  ptr::null_mut()
}
