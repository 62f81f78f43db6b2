//! The kernel shim: every direct syscall this crate makes lives here, so
//! the rest of the allocator never touches `libc` itself. Two mechanisms
//! are wrapped — extending the data segment with `sbrk`, and mapping or
//! releasing anonymous pages with `mmap`/`munmap` — plus a page-size
//! query and the fatal-error reporter invoked when either mechanism
//! fails.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{intptr_t, sbrk};

/// Extends the data segment by `delta` bytes and returns the address of
/// the first byte of the new region (the previous program break).
///
/// # Panics / aborts
///
/// Calls [`die`] and never returns if the kernel refuses the request.
///
/// # Safety
///
/// `delta` must be strictly positive: this allocator never shrinks the
/// data segment back to the OS (see the crate's non-goals).
pub unsafe fn extend_heap(delta: usize) -> *mut u8 {
  debug_assert!(delta > 0, "extend_heap called with a non-positive delta");

  let previous_break = unsafe { sbrk(delta as intptr_t) };
  if previous_break == usize::MAX as *mut c_void {
    die("sbrk");
  }

  previous_break as *mut u8
}

/// Maps `size` bytes of anonymous, private, read-write memory.
///
/// # Panics / aborts
///
/// Calls [`die`] and never returns if the kernel refuses the request.
pub fn map_pages(size: usize) -> *mut u8 {
  let addr = unsafe {
    libc::mmap(
      ptr::null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if addr == libc::MAP_FAILED {
    die("mmap");
  }

  addr as *mut u8
}

/// Unmaps exactly `size` bytes previously returned by [`map_pages`].
///
/// # Safety
///
/// `base`/`size` must be exactly a pair previously returned by
/// [`map_pages`] (or a still-valid subset obtained from one, which this
/// allocator never produces — every mapping is released whole).
pub unsafe fn unmap_pages(base: *mut u8, size: usize) {
  let ret = unsafe { libc::munmap(base as *mut c_void, size) };
  if ret != 0 {
    die("munmap");
  }
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the OS page size, querying it once via `sysconf` and caching
/// the result (it is constant for the lifetime of the process).
pub fn page_size() -> usize {
  let cached = PAGE_SIZE.load(Ordering::Relaxed);
  if cached != 0 {
    return cached;
  }

  let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
  PAGE_SIZE.store(queried, Ordering::Relaxed);
  queried
}

/// Reports a fatal kernel failure and terminates the process.
///
/// Mirrors the C original's `DIE(cond, msg)` macro: there is no
/// recovery path for a syscall the allocator depends on refusing to
/// cooperate, so this prints the failing call and `errno`, then aborts.
pub fn die(what: &str) -> ! {
  let errno = std::io::Error::last_os_error();
  eprintln!("osheap: fatal: {what} failed: {errno}");
  std::process::abort();
}

/// Debug helper: prints the current program break. Useful when
/// inspecting heap growth with `pmap`/`htop`/`gdb`, same spirit as a
/// debug trace helper. Never called internally; callers opt in
/// explicitly.
pub fn trace_break(label: &str) {
  let current = unsafe { sbrk(0) };
  eprintln!("osheap: [{label}] program break = {current:?}");
}
