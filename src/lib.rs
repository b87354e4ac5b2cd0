#![allow(clippy::missing_safety_doc)]

//! # buddymalloc
//!
//! A single-threaded buddy-system heap. One pool of `initial_blocks` maximum-size
//! blocks is reserved from the OS on the first request and subdivided by
//! power-of-two size classes ("orders"). Requests too large for the biggest
//! class get their own anonymous mapping.
//!
//! ```text
//!   order:      0      1      2   ...   10
//!   size:     128    256    512   ...  128 KiB   (header included)
//!
//!   ┌────────────────┬──────────────────────────────┐
//!   │  BlockHeader   │          payload             │
//!   └────────────────┴──────────────────────────────┘
//!                    ▲
//!                    └── pointer handed to the caller
//! ```
//!
//! A [`Heap`] owns all of its state; nothing here is a hidden global. Callers
//! that need to share one across threads wrap it in a [`LockedHeap`]. With the
//! `c_api` feature the crate exports `malloc`/`free`/`calloc`/`realloc` backed
//! by one process-wide `LockedHeap`.
//!
//! Every header carries a per-heap random signature. A header whose signature
//! does not match is treated as heap corruption and the process is aborted.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  ffi::CStr,
  fmt, hint,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

// =============================================================================
// Constants
// =============================================================================

/// Smallest block, header included.
pub const MIN_BLOCK_SIZE: usize = 128;
const MIN_BLOCK_BITS: usize = MIN_BLOCK_SIZE.trailing_zeros() as usize;

/// Highest order. Blocks of this order are never merged further.
pub const MAX_ORDER: usize = 10;
const ORDER_COUNT: usize = MAX_ORDER + 1;

/// Largest block the pool hands out, header included (128 KiB).
pub const MAX_BLOCK_SIZE: usize = MIN_BLOCK_SIZE << MAX_ORDER;

/// Maximum-order blocks reserved at initialization.
pub const DEFAULT_INITIAL_BLOCKS: usize = 32;

/// Hard upper bound on a single request.
pub const DEFAULT_MAX_REQUEST: usize = 100_000_000;

/// Every payload pointer is aligned to this.
pub const ALIGNMENT: usize = 16;

/// Bytes of metadata in front of every payload.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

const SIGNATURE_SEED: u64 = 0x4255_4444_5948_4541; // "BUDDYHEA"

const MSG_BAD_SIGNATURE: &str = "buddymalloc: heap corruption detected (bad block signature)\n";
const MSG_BAD_HEADER: &str = "buddymalloc: heap corruption detected (inconsistent block header)\n";
const MSG_INVALID_POINTER: &str = "buddymalloc: invalid pointer passed to release/resize\n";

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(MIN_BLOCK_SIZE.is_power_of_two());
const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(HEADER_SIZE < MIN_BLOCK_SIZE);
const _: () = assert!(MAX_BLOCK_SIZE <= DEFAULT_MAX_REQUEST);

// =============================================================================
// Types
// =============================================================================

/// Metadata at offset 0 of every block, pool or mapped.
#[repr(C, align(16))]
struct BlockHeader {
  /// Size class in bytes (header included). Exact mapped extent for mapped blocks.
  size: usize,
  /// Copy of the heap token. Checked before any other field is trusted.
  signature: u64,
  /// Free-list links while free; mapped-list links while mapped.
  order_prev: *mut BlockHeader,
  order_next: *mut BlockHeader,
  /// Address of this header.
  base: usize,
  is_free: bool,
  is_mapped: bool,
}

/// Recoverable allocation failures. Heap corruption is not one of them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocError {
  /// Zero size, size over the configured maximum, or resize of a freed block.
  InvalidRequest,
  /// No free block of a suitable order.
  Exhausted,
  /// The OS refused the pool reservation or a large mapping.
  OsFailure,
}

impl fmt::Display for AllocError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AllocError::InvalidRequest => f.write_str("invalid allocation request"),
      AllocError::Exhausted => f.write_str("buddy pool exhausted"),
      AllocError::OsFailure => f.write_str("operating system refused memory"),
    }
  }
}

impl std::error::Error for AllocError {}

/// Aggregates computed by [`Heap::stats`].
///
/// Byte counts are payload bytes (`size - HEADER_SIZE`). "Allocated" covers
/// every tracked block: free, live and mapped.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HeapStats {
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub meta_data_bytes: usize,
  pub live_blocks: usize,
  pub live_bytes: usize,
  pub mapped_blocks: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ArenaState {
  Uninit,
  Ready,
  /// The pool reservation was refused. Only the mapped path works.
  Failed,
}

// =============================================================================
// Configuration
// =============================================================================

/// Init-time knobs. Fixed once the [`Heap`] is built, apart from the
/// environment overlay requested with [`HeapConfig::with_env_overlay`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeapConfig {
  /// Maximum-order blocks reserved on first use.
  pub initial_blocks: usize,
  /// Requests above this many bytes are rejected.
  pub max_request: usize,
  /// Header-inclusive size above which requests bypass the pool.
  /// Clamped to `MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE`.
  pub large_threshold: usize,
  /// Apply [`HeapConfig::from_env`]'s overlay on the first request.
  pub read_env: bool,
}

impl HeapConfig {
  pub const DEFAULT: Self = Self {
    initial_blocks: DEFAULT_INITIAL_BLOCKS,
    max_request: DEFAULT_MAX_REQUEST,
    large_threshold: MAX_BLOCK_SIZE,
    read_env: false,
  };

  /// Defaults overlaid with `BUDDYMALLOC_INITIAL_BLOCKS`, `BUDDYMALLOC_MAX_REQUEST`
  /// and `BUDDYMALLOC_LARGE_THRESHOLD`. Malformed values are ignored.
  ///
  /// Reads the environment through `getenv` without allocating, so it can run
  /// before the process allocator is usable.
  pub fn from_env() -> Self {
    Self::DEFAULT.overlay_env()
  }

  fn overlay_env(mut self) -> Self {
    if let Some(v) = getenv_usize(c"BUDDYMALLOC_INITIAL_BLOCKS") {
      self.initial_blocks = v;
    }
    if let Some(v) = getenv_usize(c"BUDDYMALLOC_MAX_REQUEST") {
      self.max_request = v;
    }
    if let Some(v) = getenv_usize(c"BUDDYMALLOC_LARGE_THRESHOLD") {
      self.large_threshold = v;
    }
    self
  }

  pub const fn with_initial_blocks(mut self, blocks: usize) -> Self {
    self.initial_blocks = blocks;
    self
  }

  pub const fn with_max_request(mut self, bytes: usize) -> Self {
    self.max_request = bytes;
    self
  }

  pub const fn with_large_threshold(mut self, bytes: usize) -> Self {
    self.large_threshold = bytes;
    self
  }

  /// Defer the environment overlay to the first request. A `static` heap
  /// cannot read the environment when it is built.
  pub const fn with_env_overlay(mut self) -> Self {
    self.read_env = true;
    self
  }

  const fn normalized(mut self) -> Self {
    if self.large_threshold < MIN_BLOCK_SIZE {
      self.large_threshold = MIN_BLOCK_SIZE;
    } else if self.large_threshold > MAX_BLOCK_SIZE {
      self.large_threshold = MAX_BLOCK_SIZE;
    }
    self
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::DEFAULT
  }
}

fn getenv_usize(key: &CStr) -> Option<usize> {
  let val = unsafe { libc::getenv(key.as_ptr()) };
  if val.is_null() {
    return None;
  }
  parse_usize(unsafe { CStr::from_ptr(val) }.to_bytes())
}

/// Plain decimal, no sign, no whitespace.
fn parse_usize(digits: &[u8]) -> Option<usize> {
  if digits.is_empty() {
    return None;
  }
  digits.iter().try_fold(0usize, |acc, &b| {
    if !b.is_ascii_digit() {
      return None;
    }
    acc.checked_mul(10)?.checked_add((b - b'0') as usize)
  })
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// One OS call that extends the process by `size` bytes for the pool.
#[cfg(not(feature = "brk"))]
unsafe fn os_reserve_pool(size: usize) -> *mut u8 {
  unsafe { os_mmap(size) }
}

#[cfg(feature = "brk")]
unsafe fn os_reserve_pool(size: usize) -> *mut u8 {
  let Ok(increment) = libc::intptr_t::try_from(size) else {
    return null_mut();
  };
  let ptr = unsafe { libc::sbrk(increment) };
  if ptr as usize == usize::MAX {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

/// Non-zero heap token. Kernel entropy when available, otherwise a mix of
/// stack address and wall clock.
fn random_token() -> u64 {
  #[cfg_attr(not(target_os = "linux"), allow(unused_mut))]
  let mut token = 0u64;

  #[cfg(target_os = "linux")]
  {
    let read = unsafe {
      libc::getrandom(
        (&raw mut token).cast(),
        size_of::<u64>(),
        libc::GRND_NONBLOCK,
      )
    };
    if read == size_of::<u64>() as isize && token != 0 {
      return token;
    }
  }

  let nanos = std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_nanos() as u64)
    .unwrap_or(0);
  let mut x = ((&raw const token) as u64) ^ nanos ^ SIGNATURE_SEED;
  x ^= x >> 30;
  x = x.wrapping_mul(0xbf58476d1ce4e5b9);
  x ^= x >> 27;
  x = x.wrapping_mul(0x94d049bb133111eb);
  x ^= x >> 31;
  if x == 0 { SIGNATURE_SEED } else { x }
}

/// Abort with a diagnostic on stderr. No allocation.
#[cold]
#[inline(never)]
fn corruption(msg: &str) -> ! {
  unsafe {
    libc::write(2, msg.as_ptr().cast(), msg.len());
    libc::abort();
  }
}

// =============================================================================
// Block Lists
// =============================================================================

/// Intrusive doubly linked list threaded through `order_prev`/`order_next`.
/// Free lists keep it sorted by address; the mapped list is unordered.
struct BlockList {
  head: *mut BlockHeader,
  count: usize,
}

impl BlockList {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      count: 0,
    }
  }
}

// =============================================================================
// Heap
// =============================================================================

/// A buddy heap. Not thread-safe: every call needs exclusive access, which
/// `&mut self` enforces. Share across threads through [`LockedHeap`].
pub struct Heap {
  config: HeapConfig,
  state: ArenaState,
  /// Pool start, aligned to `MAX_BLOCK_SIZE`.
  base: *mut u8,
  pool_size: usize,
  signature: u64,
  free: [BlockList; ORDER_COUNT],
  mapped: BlockList,
}

// The heap exclusively owns every block it points to.
unsafe impl Send for Heap {}

impl Default for Heap {
  fn default() -> Self {
    Self::new(HeapConfig::DEFAULT)
  }
}

impl Heap {
  pub const fn new(config: HeapConfig) -> Self {
    const EMPTY: BlockList = BlockList::new();
    Self {
      config: config.normalized(),
      state: ArenaState::Uninit,
      base: null_mut(),
      pool_size: 0,
      signature: 0,
      free: [EMPTY; ORDER_COUNT],
      mapped: BlockList::new(),
    }
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  // ---------------------------------------------------------------------------
  // Arena initialization
  // ---------------------------------------------------------------------------

  /// Reserve the pool and seed the top order. Runs at most once.
  #[cold]
  fn init(&mut self) {
    debug_assert!(self.state == ArenaState::Uninit);
    self.signature = random_token();
    self.state = ArenaState::Failed;

    let blocks = self.config.initial_blocks;
    let Some(pool_size) = blocks.checked_mul(MAX_BLOCK_SIZE) else {
      return;
    };
    if pool_size == 0 {
      self.state = ArenaState::Ready;
      return;
    }

    // Over-reserve one block so the base can be aligned to MAX_BLOCK_SIZE.
    let Some(reserve) = pool_size.checked_add(MAX_BLOCK_SIZE) else {
      return;
    };
    let raw = unsafe { os_reserve_pool(reserve) };
    if raw.is_null() {
      return;
    }

    let pad = align_up(raw as usize, MAX_BLOCK_SIZE) - raw as usize;
    self.base = unsafe { raw.add(pad) };
    self.pool_size = pool_size;

    // Descending, so every insert lands at the head of the sorted list.
    for i in (0..blocks).rev() {
      unsafe {
        let block = self.base.add(i * MAX_BLOCK_SIZE).cast::<BlockHeader>();
        write_header(block, MAX_BLOCK_SIZE, false, self.signature);
        self.insert(block, MAX_ORDER);
      }
    }

    self.state = ArenaState::Ready;
  }

  #[inline]
  fn contains(&self, block: *mut BlockHeader) -> bool {
    let base = self.base as usize;
    let addr = block as usize;
    addr >= base && addr < base + self.pool_size
  }

  #[inline]
  fn buddy_of(&self, block: *mut BlockHeader, order: usize) -> *mut BlockHeader {
    debug_assert!(order < MAX_ORDER && self.contains(block));
    let offset = block as usize - self.base as usize;
    unsafe { self.base.add(offset ^ block_size(order)).cast() }
  }

  // ---------------------------------------------------------------------------
  // Corruption detection
  // ---------------------------------------------------------------------------

  /// Abort unless `block` carries this heap's signature.
  #[inline]
  unsafe fn verify(&self, block: *mut BlockHeader) {
    if unsafe { (*block).signature } != self.signature {
      corruption(MSG_BAD_SIGNATURE);
    }
  }

  /// Map a caller pointer to its validated header.
  unsafe fn header_of(&self, ptr: *mut u8) -> *mut BlockHeader {
    let addr = ptr as usize;
    if self.state == ArenaState::Uninit || addr % ALIGNMENT != 0 || addr < HEADER_SIZE {
      corruption(MSG_INVALID_POINTER);
    }

    let block = unsafe { ptr.sub(HEADER_SIZE) }.cast::<BlockHeader>();
    unsafe { self.verify(block) };

    let header = unsafe { &*block };
    if header.base != block as usize || (!header.is_mapped && !self.contains(block)) {
      corruption(MSG_BAD_HEADER);
    }
    block
  }

  // ---------------------------------------------------------------------------
  // Order-indexed free lists
  // ---------------------------------------------------------------------------

  /// Insert in address order and mark free.
  unsafe fn insert(&mut self, block: *mut BlockHeader, order: usize) {
    debug_assert!(order <= MAX_ORDER);
    debug_assert!(unsafe { (*block).size } == block_size(order));

    let mut prev = null_mut::<BlockHeader>();
    let mut cur = self.free[order].head;
    while !cur.is_null() {
      unsafe { self.verify(cur) };
      if cur > block {
        break;
      }
      debug_assert!(cur != block, "block inserted twice");
      prev = cur;
      cur = unsafe { (*cur).order_next };
    }

    unsafe {
      (*block).is_free = true;
      (*block).order_prev = prev;
      (*block).order_next = cur;
      if prev.is_null() {
        self.free[order].head = block;
      } else {
        (*prev).order_next = block;
      }
      if !cur.is_null() {
        (*cur).order_prev = block;
      }
    }
    self.free[order].count += 1;
  }

  /// Detach from the order list. `is_free` is left to the caller.
  unsafe fn remove(&mut self, block: *mut BlockHeader, order: usize) {
    unsafe {
      self.verify(block);
      let prev = (*block).order_prev;
      let next = (*block).order_next;

      if prev.is_null() {
        debug_assert!(self.free[order].head == block);
        self.free[order].head = next;
      } else {
        self.verify(prev);
        (*prev).order_next = next;
      }
      if !next.is_null() {
        self.verify(next);
        (*next).order_prev = prev;
      }

      (*block).order_prev = null_mut();
      (*block).order_next = null_mut();
    }
    self.free[order].count -= 1;
  }

  /// Lowest-address block of the smallest non-empty order `>= min_order`.
  fn peek_smallest_available(&self, min_order: usize) -> Option<(*mut BlockHeader, usize)> {
    (min_order..=MAX_ORDER).find_map(|order| {
      let head = self.free[order].head;
      (!head.is_null()).then_some((head, order))
    })
  }

  /// Carve the upper half off an order-`order + 1` block. `block` keeps the lower half.
  unsafe fn split(&mut self, block: *mut BlockHeader, order: usize) {
    let half = block_size(order);
    unsafe {
      let upper = block.cast::<u8>().add(half).cast::<BlockHeader>();
      write_header(upper, half, false, self.signature);
      self.insert(upper, order);
      (*block).size = half;
    }
  }

  // ---------------------------------------------------------------------------
  // Allocation
  // ---------------------------------------------------------------------------

  /// Allocate `size` bytes, or null.
  pub fn allocate(&mut self, size: usize) -> *mut u8 {
    self
      .try_allocate(size)
      .map_or(null_mut(), NonNull::as_ptr)
  }

  pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    if self.config.read_env {
      self.config = self.config.overlay_env().normalized();
      self.config.read_env = false;
    }
    self.check_request(size)?;

    if self.state == ArenaState::Uninit {
      self.init();
    }

    let needed = size
      .checked_add(HEADER_SIZE)
      .ok_or(AllocError::InvalidRequest)?;
    if needed > self.config.large_threshold {
      return self.map_large(needed);
    }

    let block = unsafe { self.take_block(order_for(needed))? };
    Ok(payload_of(block))
  }

  /// Like [`Heap::allocate`] for `count * elem_size` bytes, zero-filled.
  pub fn allocate_zeroed(&mut self, count: usize, elem_size: usize) -> *mut u8 {
    let Some(total) = count.checked_mul(elem_size) else {
      return null_mut();
    };
    match self.try_allocate(total) {
      Ok(ptr) => {
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        ptr.as_ptr()
      }
      Err(_) => null_mut(),
    }
  }

  fn check_request(&self, size: usize) -> Result<(), AllocError> {
    if size == 0 || size > self.config.max_request {
      Err(AllocError::InvalidRequest)
    } else {
      Ok(())
    }
  }

  /// Pop the best-fitting free block, splitting down to `order`.
  unsafe fn take_block(&mut self, order: usize) -> Result<*mut BlockHeader, AllocError> {
    let Some((block, mut current)) = self.peek_smallest_available(order) else {
      return Err(match self.state {
        ArenaState::Failed => AllocError::OsFailure,
        _ => AllocError::Exhausted,
      });
    };

    unsafe {
      self.remove(block, current);
      while current > order {
        current -= 1;
        self.split(block, current);
      }
      (*block).is_free = false;
    }
    Ok(block)
  }

  // ---------------------------------------------------------------------------
  // Release
  // ---------------------------------------------------------------------------

  /// Return an allocation. Null is ignored, and so is a block that is
  /// already free. A second release of a *mapped* block cannot be detected
  /// once its mapping is gone and is undefined behavior.
  ///
  /// Aborts the process if `ptr` does not lead to a header of this heap.
  pub unsafe fn release(&mut self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }

    unsafe {
      let block = self.header_of(ptr);
      if (*block).is_free {
        return;
      }
      if (*block).is_mapped {
        self.unmap_large(block);
        return;
      }
      self.coalesce(block);
    }
  }

  /// Merge with free buddies while possible, then file the result.
  unsafe fn coalesce(&mut self, mut block: *mut BlockHeader) {
    unsafe {
      (*block).is_free = true;
      let mut order = order_of((*block).size);

      while order < MAX_ORDER {
        let buddy = self.buddy_of(block, order);
        self.verify(buddy);
        if !(*buddy).is_free || (*buddy).size != (*block).size {
          break;
        }

        self.remove(buddy, order);
        block = block.min(buddy);
        order += 1;
        (*block).size = block_size(order);
      }

      self.insert(block, order);
    }
  }

  // ---------------------------------------------------------------------------
  // Resize
  // ---------------------------------------------------------------------------

  /// Resize to `size` bytes, or null. On failure the old allocation stays
  /// valid. Null `ptr` behaves like [`Heap::allocate`].
  pub unsafe fn resize(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { self.try_resize(ptr, size) }.map_or(null_mut(), NonNull::as_ptr)
  }

  pub unsafe fn try_resize(&mut self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, AllocError> {
    let Some(old) = NonNull::new(ptr) else {
      return self.try_allocate(size);
    };
    self.check_request(size)?;

    unsafe {
      let block = self.header_of(ptr);
      if (*block).is_free {
        return Err(AllocError::InvalidRequest);
      }

      let capacity = (*block).size - HEADER_SIZE;
      if (*block).is_mapped {
        return self.relocate(ptr, capacity.min(size), size);
      }
      if capacity >= size {
        return Ok(old);
      }

      let needed = size + HEADER_SIZE;
      if needed <= self.config.large_threshold
        && let Some(grown) = self.grow_in_place(block, order_for(needed))
      {
        return Ok(payload_of(grown));
      }

      self.relocate(ptr, capacity, size)
    }
  }

  /// Absorb free buddies until the block reaches `target`. Nothing changes
  /// unless every level can merge. If a lower buddy is absorbed the block
  /// starts lower and its payload is moved down.
  unsafe fn grow_in_place(
    &mut self,
    block: *mut BlockHeader,
    target: usize,
  ) -> Option<*mut BlockHeader> {
    debug_assert!(target <= MAX_ORDER);
    let start = order_of(unsafe { (*block).size });

    let mut merged = block;
    for order in start..target {
      let buddy = self.buddy_of(merged, order);
      unsafe {
        self.verify(buddy);
        if !(*buddy).is_free || (*buddy).size != block_size(order) {
          return None;
        }
      }
      merged = merged.min(buddy);
    }

    let capacity = unsafe { (*block).size } - HEADER_SIZE;
    let mut merged = block;
    for order in start..target {
      let buddy = self.buddy_of(merged, order);
      unsafe { self.remove(buddy, order) };
      merged = merged.min(buddy);
    }

    unsafe {
      if merged == block {
        (*block).size = block_size(target);
      } else {
        write_header(merged, block_size(target), false, self.signature);
        ptr::copy(
          payload_of(block).as_ptr(),
          payload_of(merged).as_ptr(),
          capacity,
        );
        // The stale header now sits inside the merged payload. Mark it freed
        // so a release through the old pointer is ignored.
        (*block).is_free = true;
      }
    }
    Some(merged)
  }

  unsafe fn relocate(
    &mut self,
    ptr: *mut u8,
    keep: usize,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let fresh = self.try_allocate(size)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), keep);
      self.release(ptr);
    }
    Ok(fresh)
  }

  /// Payload capacity of a live allocation. 0 for null or a freed block.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    if ptr.is_null() {
      return 0;
    }
    unsafe {
      let block = self.header_of(ptr);
      if (*block).is_free {
        0
      } else {
        (*block).size - HEADER_SIZE
      }
    }
  }

  // ---------------------------------------------------------------------------
  // Large objects
  // ---------------------------------------------------------------------------

  fn map_large(&mut self, needed: usize) -> Result<NonNull<u8>, AllocError> {
    let raw = unsafe { os_mmap(needed) };
    if raw.is_null() {
      return Err(AllocError::OsFailure);
    }

    let block = raw.cast::<BlockHeader>();
    unsafe {
      write_header(block, needed, true, self.signature);
      let head = self.mapped.head;
      (*block).order_next = head;
      if !head.is_null() {
        (*head).order_prev = block;
      }
    }
    self.mapped.head = block;
    self.mapped.count += 1;

    Ok(payload_of(block))
  }

  unsafe fn unmap_large(&mut self, block: *mut BlockHeader) {
    unsafe {
      let prev = (*block).order_prev;
      let next = (*block).order_next;
      if prev.is_null() {
        self.mapped.head = next;
      } else {
        self.verify(prev);
        (*prev).order_next = next;
      }
      if !next.is_null() {
        self.verify(next);
        (*next).order_prev = prev;
      }
      self.mapped.count -= 1;

      os_munmap(block.cast(), (*block).size);
    }
  }

  // ---------------------------------------------------------------------------
  // Introspection
  // ---------------------------------------------------------------------------

  /// Walk the free lists, the pool and the mapped list.
  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats::default();

    for list in &self.free {
      let mut cur = list.head;
      while !cur.is_null() {
        unsafe {
          self.verify(cur);
          stats.free_blocks += 1;
          stats.free_bytes += (*cur).size - HEADER_SIZE;
          cur = (*cur).order_next;
        }
      }
    }

    self.for_each_pool_block(|block| {
      let payload = block.size - HEADER_SIZE;
      stats.allocated_blocks += 1;
      stats.allocated_bytes += payload;
      if !block.is_free {
        stats.live_blocks += 1;
        stats.live_bytes += payload;
      }
    });

    let mut cur = self.mapped.head;
    while !cur.is_null() {
      unsafe {
        self.verify(cur);
        let payload = (*cur).size - HEADER_SIZE;
        stats.mapped_blocks += 1;
        stats.allocated_blocks += 1;
        stats.allocated_bytes += payload;
        stats.live_blocks += 1;
        stats.live_bytes += payload;
        cur = (*cur).order_next;
      }
    }

    stats.meta_data_bytes = stats.allocated_blocks * HEADER_SIZE;
    stats
  }

  /// Visit every pool block in address order.
  fn for_each_pool_block(&self, mut f: impl FnMut(&BlockHeader)) {
    let mut offset = 0;
    while offset < self.pool_size {
      unsafe {
        let block = self.base.add(offset).cast::<BlockHeader>();
        self.verify(block);
        let size = (*block).size;
        if !is_pool_size(size) {
          corruption(MSG_BAD_HEADER);
        }
        f(&*block);
        offset += size;
      }
    }
  }

  pub fn num_free_blocks(&self) -> usize {
    self.stats().free_blocks
  }

  pub fn num_free_bytes(&self) -> usize {
    self.stats().free_bytes
  }

  pub fn num_allocated_blocks(&self) -> usize {
    self.stats().allocated_blocks
  }

  pub fn num_allocated_bytes(&self) -> usize {
    self.stats().allocated_bytes
  }

  pub fn num_meta_data_bytes(&self) -> usize {
    self.stats().meta_data_bytes
  }

  pub fn size_meta_data(&self) -> usize {
    HEADER_SIZE
  }

  /// Length of the free list for `order`.
  pub fn free_blocks_at(&self, order: usize) -> usize {
    self.free.get(order).map_or(0, |list| list.count)
  }

  /// Audit every structural invariant without aborting.
  pub fn check(&self) -> Result<(), &'static str> {
    let mut listed = 0;

    for (order, list) in self.free.iter().enumerate() {
      let mut prev = null_mut::<BlockHeader>();
      let mut cur = list.head;
      let mut count = 0;

      while !cur.is_null() {
        if !self.contains(cur) {
          return Err("free block outside the arena");
        }
        let header = unsafe { &*cur };
        if header.signature != self.signature {
          return Err("free block with a bad signature");
        }
        if !header.is_free || header.is_mapped {
          return Err("listed block not marked free");
        }
        if header.size != block_size(order) {
          return Err("free block size does not match its order");
        }
        if header.order_prev != prev {
          return Err("broken free-list back link");
        }
        if !prev.is_null() && prev >= cur {
          return Err("free list not sorted by address");
        }
        if order < MAX_ORDER {
          let buddy = unsafe { &*self.buddy_of(cur, order) };
          if buddy.signature == self.signature && buddy.is_free && buddy.size == header.size {
            return Err("free buddies left uncoalesced");
          }
        }
        count += 1;
        prev = cur;
        cur = header.order_next;
      }

      if count != list.count {
        return Err("free-list count mismatch");
      }
      listed += count;
    }

    let mut offset = 0;
    let mut marked_free = 0;
    while offset < self.pool_size {
      let block = unsafe { self.base.add(offset) }.cast::<BlockHeader>();
      let header = unsafe { &*block };
      if header.signature != self.signature || header.base != block as usize {
        return Err("pool block with a bad header");
      }
      if !is_pool_size(header.size) || offset % header.size != 0 {
        return Err("pool block misaligned for its size class");
      }
      if header.is_mapped {
        return Err("mapped flag set on a pool block");
      }
      if header.is_free {
        marked_free += 1;
      }
      offset += header.size;
    }
    if marked_free != listed {
      return Err("free block missing from the free lists");
    }

    let mut prev = null_mut::<BlockHeader>();
    let mut cur = self.mapped.head;
    let mut count = 0;
    while !cur.is_null() {
      let header = unsafe { &*cur };
      if header.signature != self.signature || !header.is_mapped || header.is_free {
        return Err("bad mapped block");
      }
      if header.order_prev != prev {
        return Err("broken mapped-list back link");
      }
      count += 1;
      prev = cur;
      cur = header.order_next;
    }
    if count != self.mapped.count {
      return Err("mapped-list count mismatch");
    }

    Ok(())
  }
}

// =============================================================================
// Locked Heap
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) -> SpinGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard(self)
  }
}

struct SpinGuard<'a>(&'a SpinLock);

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.0.locked.store(false, Ordering::Release);
  }
}

/// A [`Heap`] behind a spin lock, usable from several threads and as a
/// `#[global_allocator]`.
pub struct LockedHeap {
  lock: SpinLock,
  heap: UnsafeCell<Heap>,
}

unsafe impl Sync for LockedHeap {}

impl LockedHeap {
  pub const fn new(config: HeapConfig) -> Self {
    Self {
      lock: SpinLock::new(),
      heap: UnsafeCell::new(Heap::new(config)),
    }
  }

  /// Run `f` with exclusive access to the heap.
  pub fn with<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
    let _guard = self.lock.lock();
    f(unsafe { &mut *self.heap.get() })
  }
}

unsafe impl GlobalAlloc for LockedHeap {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self.with(|heap| heap.allocate(layout.size().max(1)))
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    self.with(|heap| unsafe { heap.release(ptr) })
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self.with(|heap| unsafe { heap.resize(ptr, new_size.max(1)) })
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self.with(|heap| heap.allocate_zeroed(1, layout.size().max(1)))
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

/// Sole owner of the process allocator when the C symbols are exported.
#[cfg(feature = "c_api")]
static PROCESS_HEAP: LockedHeap = LockedHeap::new(HeapConfig::DEFAULT.with_env_overlay());

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  PROCESS_HEAP.with(|heap| heap.allocate(size))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  PROCESS_HEAP.with(|heap| unsafe { heap.release(ptr) })
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  PROCESS_HEAP.with(|heap| heap.allocate_zeroed(nmemb, size))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  PROCESS_HEAP.with(|heap| unsafe { heap.resize(ptr, size) })
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  PROCESS_HEAP.with(|heap| unsafe { heap.usable_size(ptr) })
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn _num_free_blocks() -> usize {
  PROCESS_HEAP.with(|heap| heap.num_free_blocks())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn _num_free_bytes() -> usize {
  PROCESS_HEAP.with(|heap| heap.num_free_bytes())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn _num_allocated_blocks() -> usize {
  PROCESS_HEAP.with(|heap| heap.num_allocated_blocks())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn _num_allocated_bytes() -> usize {
  PROCESS_HEAP.with(|heap| heap.num_allocated_bytes())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn _num_meta_data_bytes() -> usize {
  PROCESS_HEAP.with(|heap| heap.num_meta_data_bytes())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn _size_meta_data() -> usize {
  HEADER_SIZE
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
const fn block_size(order: usize) -> usize {
  MIN_BLOCK_SIZE << order
}

/// Smallest order whose block holds `needed` bytes (header included).
#[inline(always)]
const fn order_for(needed: usize) -> usize {
  needed
    .div_ceil(MIN_BLOCK_SIZE)
    .next_power_of_two()
    .trailing_zeros() as usize
}

/// Order of a pool block of exactly `size` bytes.
#[inline(always)]
const fn order_of(size: usize) -> usize {
  size.trailing_zeros() as usize - MIN_BLOCK_BITS
}

#[inline(always)]
const fn is_pool_size(size: usize) -> bool {
  size.is_power_of_two() && size >= MIN_BLOCK_SIZE && size <= MAX_BLOCK_SIZE
}

#[inline(always)]
fn payload_of(block: *mut BlockHeader) -> NonNull<u8> {
  unsafe { NonNull::new_unchecked(block.cast::<u8>().add(HEADER_SIZE)) }
}

/// Fresh header: in use, unlinked.
#[inline]
unsafe fn write_header(block: *mut BlockHeader, size: usize, is_mapped: bool, signature: u64) {
  unsafe {
    block.write(BlockHeader {
      size,
      signature,
      order_prev: null_mut(),
      order_next: null_mut(),
      base: block as usize,
      is_free: false,
      is_mapped,
    })
  };
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  fn heap() -> Heap {
    Heap::new(HeapConfig::DEFAULT)
  }

  #[test]
  fn test_size_constants() {
    assert_eq!(MAX_BLOCK_SIZE, 128 * 1024);
    assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
    #[cfg(target_pointer_width = "64")]
    assert_eq!(HEADER_SIZE, 48);
  }

  #[test]
  fn test_order_for() {
    assert_eq!(order_for(1), 0);
    assert_eq!(order_for(128), 0);
    assert_eq!(order_for(129), 1);
    assert_eq!(order_for(100 + HEADER_SIZE), 1);
    assert_eq!(order_for(512), 2);
    assert_eq!(order_for(513), 3);
    assert_eq!(order_for(MAX_BLOCK_SIZE), MAX_ORDER);
  }

  #[test]
  fn test_order_of_round_trips_block_size() {
    for order in 0..=MAX_ORDER {
      assert_eq!(order_of(block_size(order)), order);
      assert_eq!(order_for(block_size(order)), order);
    }
  }

  #[test]
  fn test_parse_usize() {
    assert_eq!(parse_usize(b"0"), Some(0));
    assert_eq!(parse_usize(b"4096"), Some(4096));
    assert_eq!(parse_usize(b""), None);
    assert_eq!(parse_usize(b"12k"), None);
    assert_eq!(parse_usize(b"-1"), None);
    assert_eq!(parse_usize(b"99999999999999999999999999"), None);
  }

  #[test]
  fn test_config_from_env() {
    unsafe {
      std::env::set_var("BUDDYMALLOC_INITIAL_BLOCKS", "3");
      std::env::set_var("BUDDYMALLOC_MAX_REQUEST", "lots");
      std::env::remove_var("BUDDYMALLOC_LARGE_THRESHOLD");
    }
    let config = HeapConfig::from_env();
    assert_eq!(config.initial_blocks, 3);
    assert_eq!(config.max_request, DEFAULT_MAX_REQUEST);
    assert_eq!(config.large_threshold, MAX_BLOCK_SIZE);

    // Same test, since the environment is shared between test threads.
    unsafe {
      std::env::set_var("BUDDYMALLOC_LARGE_THRESHOLD", "1024");
      std::env::set_var("BUDDYMALLOC_MAX_REQUEST", "4096");
    }
    let mut deferred = Heap::new(HeapConfig::DEFAULT.with_env_overlay());
    assert_eq!(deferred.config().initial_blocks, DEFAULT_INITIAL_BLOCKS);

    // The very first request is already checked against the overlay.
    assert_eq!(deferred.try_allocate(5000), Err(AllocError::InvalidRequest));
    assert_eq!(deferred.state, ArenaState::Uninit);
    assert!(!deferred.config().read_env);

    let small = deferred.allocate(8);
    assert_eq!(deferred.config().initial_blocks, 3);
    assert_eq!(deferred.config().max_request, 4096);
    assert_eq!(deferred.config().large_threshold, 1024);
    assert_eq!(deferred.num_allocated_blocks(), 3 + MAX_ORDER);

    let big = deferred.allocate(2000);
    assert_eq!(deferred.stats().mapped_blocks, 1);
    unsafe {
      deferred.release(big);
      deferred.release(small);
    }

    let mut plain = heap();
    let _ = plain.allocate(8);
    assert_eq!(plain.num_allocated_blocks(), DEFAULT_INITIAL_BLOCKS + MAX_ORDER);

    unsafe {
      std::env::remove_var("BUDDYMALLOC_INITIAL_BLOCKS");
      std::env::remove_var("BUDDYMALLOC_MAX_REQUEST");
      std::env::remove_var("BUDDYMALLOC_LARGE_THRESHOLD");
    }
  }

  #[test]
  fn test_threshold_is_clamped() {
    let high = Heap::new(HeapConfig::DEFAULT.with_large_threshold(usize::MAX));
    assert_eq!(high.config().large_threshold, MAX_BLOCK_SIZE);
    let low = Heap::new(HeapConfig::DEFAULT.with_large_threshold(1));
    assert_eq!(low.config().large_threshold, MIN_BLOCK_SIZE);
  }

  #[test]
  fn test_init_is_lazy() {
    let mut heap = heap();
    assert_eq!(heap.state, ArenaState::Uninit);
    assert_eq!(heap.stats(), HeapStats::default());

    assert!(heap.allocate(0).is_null());
    assert_eq!(heap.state, ArenaState::Uninit);

    let p = heap.allocate(8);
    assert!(!p.is_null());
    assert_eq!(heap.state, ArenaState::Ready);
    assert_ne!(heap.signature, 0);
    assert_eq!(heap.base as usize % MAX_BLOCK_SIZE, 0);
  }

  #[test]
  fn test_split_leaves_one_free_block_per_order() {
    let mut heap = heap();
    let p = heap.allocate(100);
    assert_eq!(p as usize, heap.base as usize + HEADER_SIZE);

    assert_eq!(heap.free_blocks_at(0), 0);
    for order in 1..MAX_ORDER {
      assert_eq!(heap.free_blocks_at(order), 1, "order {order}");
      let head = heap.free[order].head;
      assert_eq!(head as usize - heap.base as usize, block_size(order));
    }
    assert_eq!(heap.free_blocks_at(MAX_ORDER), DEFAULT_INITIAL_BLOCKS - 1);
    assert_eq!(heap.check(), Ok(()));
  }

  #[test]
  fn test_insert_keeps_address_order() {
    let mut heap = heap();
    let blocks: Vec<_> = (0..6).map(|_| heap.allocate(16)).collect();

    // Every released block's buddy stays live, so nothing merges.
    for &i in &[4, 0, 2] {
      unsafe { heap.release(blocks[i]) };
    }
    assert_eq!(heap.check(), Ok(()));

    let mut cur = heap.free[0].head;
    let mut last = 0;
    while !cur.is_null() {
      assert!(cur as usize > last);
      last = cur as usize;
      cur = unsafe { (*cur).order_next };
    }
    assert_eq!(heap.free_blocks_at(0), 3);
  }

  #[test]
  fn test_buddy_of_is_symmetric() {
    let mut heap = heap();
    let _ = heap.allocate(1);
    let block = unsafe { heap.base.add(3 * block_size(2)) }.cast::<BlockHeader>();
    let buddy = heap.buddy_of(block, 2);
    assert_eq!(buddy as usize, heap.base as usize + 2 * block_size(2));
    assert_eq!(heap.buddy_of(buddy, 2), block);
  }

  #[test]
  fn test_coalesce_restores_top_order() {
    let mut heap = heap();
    let a = heap.allocate(100);
    let b = heap.allocate(1000);
    unsafe {
      heap.release(b);
      heap.release(a);
    }
    assert_eq!(heap.free_blocks_at(MAX_ORDER), DEFAULT_INITIAL_BLOCKS);
    for order in 0..MAX_ORDER {
      assert_eq!(heap.free_blocks_at(order), 0);
    }
    assert_eq!(heap.check(), Ok(()));
  }

  #[test]
  fn test_grow_in_place_absorbs_lower_buddy() {
    let mut heap = heap();
    let a = heap.allocate(16);
    let b = heap.allocate(16);
    unsafe {
      ptr::write_bytes(b, 0x5A, 16);
      heap.release(a);

      let grown = heap.resize(b, 150);
      assert_eq!(grown, a);
      assert_eq!(heap.usable_size(grown), block_size(1) - HEADER_SIZE);
      assert!((0..16).all(|i| *grown.add(i) == 0x5A));
    }
    assert_eq!(heap.check(), Ok(()));
  }

  #[test]
  fn test_grow_in_place_is_all_or_nothing() {
    let mut heap = heap();
    let x = heap.allocate(16);
    let y = heap.allocate(16);
    let _z = heap.allocate(200);
    unsafe { heap.release(y) };
    let before = heap.stats();

    // Level 0 can absorb y, level 1 runs into z.
    let block = unsafe { heap.header_of(x) };
    assert!(unsafe { heap.grow_in_place(block, 2) }.is_none());
    assert_eq!(heap.stats(), before);
    assert_eq!(heap.free_blocks_at(0), 1);
    assert_eq!(heap.check(), Ok(()));
  }

  #[test]
  fn test_failed_init_reports_os_failure() {
    let mut heap = Heap::new(HeapConfig::DEFAULT.with_initial_blocks(usize::MAX));
    assert_eq!(heap.try_allocate(64), Err(AllocError::OsFailure));
    assert_eq!(heap.state, ArenaState::Failed);
    assert_eq!(heap.stats().free_blocks, 0);
  }

  #[test]
  fn test_alloc_error_display() {
    assert_eq!(AllocError::Exhausted.to_string(), "buddy pool exhausted");
    assert_eq!(
      AllocError::InvalidRequest.to_string(),
      "invalid allocation request"
    );
  }
}
