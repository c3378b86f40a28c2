//! Heap layout and memory validation: the four fixed address ranges named
//! in the data model (read-only, static, dynamic x2 for the semispace
//! collector, plus per-thread stacks allocated by the thread registry) and
//! the bump allocators that hand out space inside the dynamic semispace.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::os::{MappedRegion, OsPort};
use crate::tag::{Word, WORD_BYTES};

/// Which logical address range a word falls in. Read-only and static
/// objects are never collected; dynamic objects are the mutator's working
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceId {
    ReadOnly,
    Static,
    Dynamic,
    Foreign,
}

/// A monotonically-growing region (read-only or static space). Purify is
/// the only writer after startup.
pub struct GrowingRegion {
    region: MappedRegion,
    used: AtomicUsize,
}

impl GrowingRegion {
    fn new(region: MappedRegion) -> Self {
        GrowingRegion { region, used: AtomicUsize::new(0) }
    }

    pub fn base(&self) -> usize {
        self.region.base
    }

    pub fn capacity(&self) -> usize {
        self.region.length
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.region.base && addr < self.region.base + self.region.length
    }

    /// Bump-allocate `bytes`, used only by purify. Fails if the fixed
    /// reservation is exhausted -- growing past the reservation is not
    /// supported; the reservation must be sized generously at startup.
    pub fn bump(&self, bytes: usize) -> Result<usize> {
        let aligned = (bytes + 7) & !7;
        let prev = self.used.fetch_add(aligned, Ordering::AcqRel);
        if prev + aligned > self.region.length {
            self.used.fetch_sub(aligned, Ordering::AcqRel);
            return Err(RuntimeError::OutOfMemory {
                region: "read-only/static",
                requested: aligned,
                available: self.region.length.saturating_sub(prev),
            });
        }
        Ok(self.region.base + prev)
    }
}

/// One half of the dynamic-space semispace pair. Objects are bump-allocated
/// from `free` up to `region.base + region.length`; a thread that exhausts
/// its private slice refills from here via an atomic fetch-add, matching
/// the lock-free refill described in §5. `free` is cache-line padded: every
/// mutator thread's chunk-refill and every transport call during collection
/// contends on this one atomic, so letting it share a line with `region`
/// would serialize unrelated threads on false sharing alone.
pub struct Semispace {
    region: MappedRegion,
    free: CachePadded<AtomicUsize>,
}

impl Semispace {
    fn new(region: MappedRegion) -> Self {
        let base = region.base;
        Semispace { region, free: CachePadded::new(AtomicUsize::new(base)) }
    }

    pub fn base(&self) -> usize {
        self.region.base
    }

    pub fn end(&self) -> usize {
        self.region.base + self.region.length
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.end()
    }

    pub fn bytes_used(&self) -> usize {
        self.free.load(Ordering::Acquire).saturating_sub(self.base())
    }

    /// Reset the bump pointer to the start of the region. Called after a
    /// collection flips semispaces, and after purify zeroes dynamic space.
    pub fn reset(&self) {
        self.free.store(self.base(), Ordering::Release);
    }

    /// Carve out a private chunk of `chunk_bytes` for a thread's TLAB-style
    /// allocation region. Returns `(start, end)`.
    pub fn carve_chunk(&self, chunk_bytes: usize) -> Result<(usize, usize)> {
        let aligned = (chunk_bytes + 7) & !7;
        loop {
            let current = self.free.load(Ordering::Acquire);
            let end = self.end();
            if current + aligned > end {
                return Err(RuntimeError::OutOfMemory {
                    region: "dynamic",
                    requested: aligned,
                    available: end.saturating_sub(current),
                });
            }
            if self
                .free
                .compare_exchange_weak(current, current + aligned, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok((current, current + aligned));
            }
        }
    }

    /// Bump-allocate `bytes` directly from this semispace, returning the
    /// start address. Used by the collector during transport: the
    /// stop-the-world collector is the only thread touching to-space, so
    /// the same lock-free fetch-add used for per-thread chunk refill is
    /// safe without a surrounding lock.
    pub fn bump(&self, bytes: usize) -> Result<usize> {
        let aligned = (bytes + 7) & !7;
        let prev = self.free.fetch_add(aligned, Ordering::AcqRel);
        if prev + aligned > self.end() {
            self.free.fetch_sub(aligned, Ordering::AcqRel);
            return Err(RuntimeError::OutOfMemory {
                region: "dynamic (transport)",
                requested: aligned,
                available: self.end().saturating_sub(prev),
            });
        }
        Ok(prev)
    }
}

/// A per-thread bump allocation region carved from the active semispace's
/// boxed or unboxed half. Allocation within a chunk never takes a lock;
/// exhaustion triggers a refill (`Heap::refill_boxed`/`refill_unboxed`).
pub struct ThreadLocalRegion {
    pub start: AtomicUsize,
    pub end: AtomicUsize,
}

impl ThreadLocalRegion {
    pub fn empty() -> Self {
        ThreadLocalRegion { start: AtomicUsize::new(0), end: AtomicUsize::new(0) }
    }

    pub fn try_allocate(&self, words: usize) -> Option<usize> {
        let bytes = words * crate::tag::WORD_BYTES;
        loop {
            let start = self.start.load(Ordering::Acquire);
            let end = self.end.load(Ordering::Acquire);
            if start == 0 || start + bytes > end {
                return None;
            }
            if self
                .start
                .compare_exchange_weak(start, start + bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(start);
            }
        }
    }

    pub fn install(&self, start: usize, end: usize) {
        self.end.store(end, Ordering::Release);
        self.start.store(start, Ordering::Release);
    }
}

/// A region objects can be bump-allocated into, abstracting over the two
/// shapes purify and the collector each write into: the collector's
/// semispace and the purifier's monotonically-growing read-only/static
/// regions. Letting `Purifier` address either through one trait object
/// avoids duplicating the promote-a-boxed-object / promote-an-unboxed-object
/// logic per destination kind.
pub trait BumpRegion {
    fn bump(&self, bytes: usize) -> Result<usize>;
    fn contains(&self, addr: usize) -> bool;
}

impl BumpRegion for GrowingRegion {
    fn bump(&self, bytes: usize) -> Result<usize> {
        GrowingRegion::bump(self, bytes)
    }

    fn contains(&self, addr: usize) -> bool {
        GrowingRegion::contains(self, addr)
    }
}

impl BumpRegion for Semispace {
    fn bump(&self, bytes: usize) -> Result<usize> {
        Semispace::bump(self, bytes)
    }

    fn contains(&self, addr: usize) -> bool {
        Semispace::contains(self, addr)
    }
}

/// The complete heap: read-only space, static space, and the dynamic
/// semispace pair, plus a boxed/unboxed split within each dynamic
/// semispace half (boxed objects are scavenged recursively; unboxed
/// objects are only skipped over, per §4.2).
pub struct Heap {
    pub read_only: GrowingRegion,
    pub static_space: GrowingRegion,
    semispaces: [Semispace; 2],
    active: AtomicUsize,
    pub chunk_bytes: usize,
}

impl Heap {
    pub fn reserve(config: &RuntimeConfig, os: &dyn OsPort) -> Result<Heap> {
        let read_only = GrowingRegion::new(os.reserve(0, config.read_only_space_size)?);
        let static_space = GrowingRegion::new(os.reserve(0, config.static_space_size)?);
        let space_a = Semispace::new(os.reserve(0, config.dynamic_space_size)?);
        let space_b = Semispace::new(os.reserve(0, config.dynamic_space_size)?);

        Ok(Heap {
            read_only,
            static_space,
            semispaces: [space_a, space_b],
            active: AtomicUsize::new(0),
            chunk_bytes: 64 * 1024,
        })
    }

    pub fn from_space(&self) -> &Semispace {
        &self.semispaces[self.active.load(Ordering::Acquire)]
    }

    pub fn to_space(&self) -> &Semispace {
        &self.semispaces[1 - self.active.load(Ordering::Acquire)]
    }

    /// Swap which semispace is "from" and which is "to", then reset the new
    /// to-space's bump pointer so subsequent allocation starts fresh. This
    /// is called once collection's transport pass has finished.
    pub fn flip(&self) {
        let prev = self.active.swap_with_next(&self.active);
        let _ = prev;
    }

    pub fn space_of(&self, addr: usize) -> SpaceId {
        if self.read_only.contains(addr) {
            SpaceId::ReadOnly
        } else if self.static_space.contains(addr) {
            SpaceId::Static
        } else if self.from_space().contains(addr) || self.to_space().contains(addr) {
            SpaceId::Dynamic
        } else {
            SpaceId::Foreign
        }
    }

    /// Carve a fresh chunk for a thread's TLAB out of the *live* (from-)
    /// semispace -- the mutator allocates out of whichever half is
    /// currently in use, never out of to-space, which only the collector's
    /// own transport touches and which `zero_and_reset_dynamic` zeroes
    /// wholesale after every flip.
    pub fn refill_chunk(&self, region: &ThreadLocalRegion) -> Result<()> {
        let (start, end) = self.from_space().carve_chunk(self.chunk_bytes)?;
        region.install(start, end);
        Ok(())
    }

    /// Zero-fill the currently inactive (about to become active) semispace
    /// and reset its bump pointer, per §6 "dynamic region is zero-filled
    /// before first use and after purify".
    pub fn zero_and_reset_dynamic(&self) {
        let target = self.to_space();
        unsafe {
            std::ptr::write_bytes(target.base() as *mut u8, 0, target.region.length);
        }
        target.reset();
    }

    /// Read the tagged word at `addr`. `addr` must be a live, word-aligned
    /// address inside one of this heap's regions; the collector never
    /// dereferences a foreign address.
    #[inline]
    pub fn read_word(&self, addr: usize) -> Word {
        debug_assert_eq!(addr % WORD_BYTES, 0, "unaligned heap word read");
        Word::new(unsafe { std::ptr::read((addr as *const usize).cast()) })
    }

    #[inline]
    pub fn write_word(&self, addr: usize, word: Word) {
        debug_assert_eq!(addr % WORD_BYTES, 0, "unaligned heap word write");
        unsafe { std::ptr::write((addr as *mut usize).cast(), word.as_usize()) }
    }

    /// Copy `n_words` starting at `src` to `dst`, non-overlapping -- true
    /// for every transport in this collector since to-space and from-space
    /// are disjoint address ranges.
    #[inline]
    pub fn copy_words(&self, src: usize, dst: usize, n_words: usize) {
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const usize, dst as *mut usize, n_words);
        }
    }
}

trait SwapActive {
    fn swap_with_next(&self, active: &AtomicUsize) -> usize;
}

impl SwapActive for AtomicUsize {
    fn swap_with_next(&self, active: &AtomicUsize) -> usize {
        let prev = active.load(Ordering::Acquire);
        active.store(1 - prev, Ordering::Release);
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::HostOs;

    #[test]
    fn reserve_produces_disjoint_semispaces() {
        let config = RuntimeConfig {
            dynamic_space_size: 64 * 1024,
            read_only_space_size: 64 * 1024,
            static_space_size: 64 * 1024,
            ..Default::default()
        };
        let os = HostOs::default();
        let heap = Heap::reserve(&config, &os).expect("reserve");
        assert_ne!(heap.from_space().base(), heap.to_space().base());
    }

    #[test]
    fn carve_chunk_advances_bump_pointer() {
        let config = RuntimeConfig {
            dynamic_space_size: 64 * 1024,
            read_only_space_size: 4096,
            static_space_size: 4096,
            ..Default::default()
        };
        let os = HostOs::default();
        let heap = Heap::reserve(&config, &os).expect("reserve");
        let (s1, e1) = heap.to_space().carve_chunk(1024).unwrap();
        let (s2, _e2) = heap.to_space().carve_chunk(1024).unwrap();
        assert_eq!(e1, s2);
        assert!(s2 > s1);
    }

    #[test]
    fn flip_swaps_from_and_to() {
        let config = RuntimeConfig {
            dynamic_space_size: 64 * 1024,
            read_only_space_size: 4096,
            static_space_size: 4096,
            ..Default::default()
        };
        let os = HostOs::default();
        let heap = Heap::reserve(&config, &os).expect("reserve");
        let from_before = heap.from_space().base();
        heap.flip();
        assert_eq!(heap.to_space().base(), from_before);
    }

    #[test]
    fn thread_local_region_allocates_without_double_issue() {
        let region = ThreadLocalRegion::empty();
        region.install(0x1000, 0x2000);
        let a = region.try_allocate(4).unwrap();
        let b = region.try_allocate(4).unwrap();
        assert_ne!(a, b);
    }
}
