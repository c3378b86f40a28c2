//! The collector itself: the `Collector` struct threads the heap, dispatch
//! tables, and arch port through every scavenge/transport call, and
//! `Collector::collect` runs one full stop-the-world cycle. §4.1-§4.5.

pub mod forwarding;
pub mod transport;
pub mod weak;

use std::cell::RefCell;

use crate::arch::ArchPort;
use crate::config::RootScanMode;
use crate::dispatch::DispatchTables;
use crate::heap::Heap;
use crate::tag::{Lowtag, Word, OBJECT_ALIGNMENT_WORDS, WORD_BYTES};

/// A contiguous range of precise (statically known pointer) slots to scan
/// as roots: static-space symbol values, a thread's TLS array, etc.
pub struct PreciseRoot {
    pub start: usize,
    pub words: usize,
}

/// A contiguous range of raw memory to scan conservatively: a thread's
/// control stack and register save area, where a word's status as a
/// pointer can only be guessed at, not derived from surrounding structure.
pub struct ConservativeRoot {
    pub start: usize,
    pub words: usize,
}

/// Tallies returned from one collection cycle, surfaced to `tracing` and to
/// callers deciding whether to grow the heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionStats {
    pub bytes_copied: usize,
    pub weak_pointers_seen: usize,
    pub weak_pointers_broken: usize,
}

/// Holds everything one collection cycle needs. Borrowed, not owned: the
/// `Runtime` that drives a cycle constructs one of these per collection and
/// lets it go out of scope once `collect` returns.
///
/// Every scavenge/transport function takes `&Collector` rather than
/// `&mut Collector` so that recursive scavenging (a transported object's
/// own payload, reached while still inside the call that transported it)
/// never fights the borrow checker; the one piece of cycle-local mutable
/// state, the pending weak-pointer list, uses a `RefCell` instead. This is
/// sound because collection is strictly single-threaded: every other
/// mutator thread is stopped for its duration (§5).
pub struct Collector<'a> {
    pub heap: &'a Heap,
    pub dispatch: &'a DispatchTables,
    pub arch: &'a dyn ArchPort,
    pub root_scan_mode: RootScanMode,
    weak_pointers: RefCell<Vec<usize>>,
}

impl<'a> Collector<'a> {
    pub fn new(heap: &'a Heap, dispatch: &'a DispatchTables, arch: &'a dyn ArchPort, root_scan_mode: RootScanMode) -> Self {
        Collector {
            heap,
            dispatch,
            arch,
            root_scan_mode,
            weak_pointers: RefCell::new(Vec::new()),
        }
    }

    /// Scavenge `n_words` consecutive tagged slots starting at `start`.
    /// Each slot is examined independently, not parsed as a header stream
    /// -- this is the routine a boxed object's generic scavenge uses on its
    /// own payload, and the one precise root scanning uses on a statically
    /// known pointer range.
    pub fn scavenge_range(&self, start: usize, n_words: usize) {
        for i in 0..n_words {
            let slot_addr = start + i * WORD_BYTES;
            let word = self.heap.read_word(slot_addr);
            if word.is_pointer() {
                self.scavenge_pointer_slot(slot_addr, word);
            }
        }
    }

    /// The scavenge loop's five-way branch on one already-known-to-be-a-
    /// pointer slot: a fixnum or other immediate is impossible to reach
    /// here (callers only invoke this after `Word::is_pointer` passed), so
    /// the five cases are cons, fun-pointer, instance-pointer,
    /// other-pointer, and "already forwarded." Returns the word count the
    /// caller should advance by -- always 1, since this operates on a
    /// single slot rather than a header-prefixed object. §4.3.
    pub fn scavenge_pointer_slot(&self, slot_addr: usize, word: Word) -> usize {
        let from_addr = word.untag();

        if !self.heap.from_space().contains(from_addr) {
            // Already in to-space, static space, or read-only space: stable.
            return 1;
        }

        if let Some(target) = forwarding::forwarding_target(self.heap, from_addr) {
            self.heap.write_word(slot_addr, target);
            return 1;
        }

        let new_ref = match word.lowtag() {
            Lowtag::ListPointer => transport::transport_cons(self, word),
            Lowtag::FunPointer | Lowtag::InstancePointer | Lowtag::OtherPointer => {
                let header = self.heap.read_word(from_addr);
                (self.dispatch.transport(header.widetag()))(self, word)
            }
            Lowtag::EvenFixnum | Lowtag::OddFixnum | Lowtag::OtherImmediate0 | Lowtag::OtherImmediate1 => {
                crate::error::lose(format!(
                    "scavenge_pointer_slot called on a non-pointer lowtag at {:#x}",
                    slot_addr
                ))
            }
        };

        self.heap.write_word(slot_addr, new_ref);
        1
    }

    /// Validate a raw stack word as a plausible heap reference before
    /// treating it as a root: it must carry a pointer lowtag, land on an
    /// object-aligned address, and fall inside from-space. A word failing
    /// any check is assumed to be non-pointer data and left untouched.
    /// §4.3 "conservative roots", §9.
    pub fn scavenge_conservative_word(&self, slot_addr: usize, raw: usize) {
        let word = Word::new(raw);
        if !word.is_pointer() {
            return;
        }
        let addr = word.untag();
        if addr % (OBJECT_ALIGNMENT_WORDS * WORD_BYTES) != 0 {
            return;
        }
        if !self.heap.from_space().contains(addr) {
            return;
        }
        self.scavenge_pointer_slot(slot_addr, word);
    }

    /// Record a weak pointer's new (to-space) address for the post-scavenge
    /// fixup pass. Called exactly once per weak pointer transported, from
    /// `transport::transport_weak_pointer`.
    pub(crate) fn record_weak_pointer(&self, to_space_addr: usize) {
        self.weak_pointers.borrow_mut().push(to_space_addr);
    }

    /// Run one full stop-the-world collection: scavenge every root
    /// (precise ranges directly, conservative ranges through the
    /// validating path), let the resulting transport calls recursively
    /// drain the rest of the live graph, fix up weak pointers, and flip
    /// semispaces. The caller is responsible for having already stopped
    /// every mutator thread and for zero-filling the new to-space before
    /// this is called (`Heap::zero_and_reset_dynamic`).
    pub fn collect(&self, precise_roots: &[PreciseRoot], conservative_roots: &[ConservativeRoot]) -> CollectionStats {
        let before = self.heap.to_space().bytes_used();

        for root in precise_roots {
            self.scavenge_range(root.start, root.words);
        }

        for root in conservative_roots {
            for i in 0..root.words {
                let slot_addr = root.start + i * WORD_BYTES;
                let raw = self.heap.read_word(slot_addr).as_usize();
                self.scavenge_conservative_word(slot_addr, raw);
            }
        }

        let weak_pointers = self.weak_pointers.borrow();
        weak::fixup(self.heap, &weak_pointers);
        let weak_pointers_seen = weak_pointers.len();
        drop(weak_pointers);

        let weak_pointers_broken = self
            .weak_pointers
            .borrow()
            .iter()
            .filter(|&&addr| {
                let flag = self
                    .heap
                    .read_word(unsafe { crate::object::WeakPointerLayout::broken_word_addr(addr) });
                flag.fixnum_decode() != 0
            })
            .count();

        let after = self.heap.to_space().bytes_used();

        self.heap.flip();
        self.heap.zero_and_reset_dynamic();

        CollectionStats {
            bytes_copied: after.saturating_sub(before),
            weak_pointers_seen,
            weak_pointers_broken,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::os::HostOs;
    use crate::arch::HostArch;
    use crate::tag::Word;

    fn test_fixture() -> (Heap, DispatchTables, HostArch) {
        let config = RuntimeConfig {
            dynamic_space_size: 16 * 1024,
            read_only_space_size: 4096,
            static_space_size: 4096,
            ..Default::default()
        };
        let heap = Heap::reserve(&config, &HostOs::default()).unwrap();
        (heap, DispatchTables::new(), HostArch::default())
    }

    #[test]
    fn cons_chain_survives_collection_and_linearizes() {
        let (heap, dispatch, arch) = test_fixture();
        let col = Collector::new(&heap, &dispatch, &arch, RootScanMode::Precise);

        // Build a two-element list in from-space: (1 . (2 . nil))
        let tail = heap.from_space().bump(2 * WORD_BYTES).unwrap();
        heap.write_word(tail, Word::fixnum_encode(2));
        heap.write_word(tail + WORD_BYTES, crate::tag::NIL);

        let head = heap.from_space().bump(2 * WORD_BYTES).unwrap();
        heap.write_word(head, Word::fixnum_encode(1));
        heap.write_word(head + WORD_BYTES, Word::retag(tail, Lowtag::ListPointer));

        // The root slot itself must live outside either semispace -- exactly
        // like a real root (a control-stack word or a TLS slot) does -- since
        // `collect` zero-fills the *other* semispace once it becomes the new
        // to-space, and that would stomp a root carved from from-space.
        let mut root_storage: usize = 0;
        let root_slot = std::ptr::addr_of_mut!(root_storage) as usize;
        heap.write_word(root_slot, Word::retag(head, Lowtag::ListPointer));

        let stats = col.collect(&[PreciseRoot { start: root_slot, words: 1 }], &[]);
        assert_eq!(stats.weak_pointers_seen, 0);

        let new_head = heap.read_word(root_slot);
        let new_head_addr = new_head.untag();
        assert_eq!(heap.read_word(new_head_addr).fixnum_decode(), 1);
        let new_tail = heap.read_word(new_head_addr + WORD_BYTES);
        assert_eq!(new_tail.untag(), new_head_addr + 2 * WORD_BYTES, "linearized cons lands immediately after its predecessor");
        assert_eq!(heap.read_word(new_tail.untag()).fixnum_decode(), 2);
    }

    #[test]
    fn already_stable_pointer_is_left_alone() {
        let (heap, dispatch, arch) = test_fixture();
        let col = Collector::new(&heap, &dispatch, &arch, RootScanMode::Precise);
        let static_addr = heap.static_space.bump(WORD_BYTES).unwrap();
        let word = Word::retag(static_addr, Lowtag::OtherPointer);
        heap.write_word(static_addr, word);
        let n = col.scavenge_pointer_slot(static_addr, word);
        assert_eq!(n, 1);
        assert_eq!(heap.read_word(static_addr), word);
    }

    /// §8 "Forwarding convergence" and "Round-trip and idempotence laws",
    /// exercised as quickcheck properties over an arbitrary number of
    /// duplicate root references and an arbitrary fixnum payload, rather
    /// than the single fixed scenario `cons_chain_survives_collection_and_linearizes`
    /// already covers.
    mod properties {
        use super::*;
        use quickcheck_macros::quickcheck;

        /// A root array lives outside either semispace (a stack-allocated
        /// `Vec`, standing in for a control-stack word range), matching how
        /// real roots are never carved from the collected dynamic space.
        fn root_storage(words: usize) -> Vec<usize> {
            vec![0usize; words]
        }

        #[quickcheck]
        fn forwarding_convergence(duplicate_count: u8, payload: isize) -> bool {
            let duplicates = 1 + (duplicate_count as usize % 8);
            let (heap, dispatch, arch) = test_fixture();
            let col = Collector::new(&heap, &dispatch, &arch, RootScanMode::Precise);

            let cons = heap.from_space().bump(2 * WORD_BYTES).unwrap();
            heap.write_word(cons, Word::fixnum_encode(payload));
            heap.write_word(cons + WORD_BYTES, crate::tag::NIL);
            let tagged = Word::retag(cons, Lowtag::ListPointer);

            let mut roots = root_storage(duplicates);
            let root_start = roots.as_mut_ptr() as usize;
            for slot in roots.iter_mut() {
                *slot = tagged.as_usize();
            }

            col.collect(&[PreciseRoot { start: root_start, words: duplicates }], &[]);

            let first = heap.read_word(root_start);
            (0..duplicates).all(|i| heap.read_word(root_start + i * WORD_BYTES) == first)
        }

        /// §8 "Two successive collections with no mutator activity between
        /// them leave every object at the same address": with exactly two
        /// semispaces, one collection flips from space A to space B and the
        /// next flips back from B to A, so the round trip (not a single
        /// collection) is where the invariant actually holds -- a lone
        /// object transported first, then transported back, lands at the
        /// same bump offset it started at, since both semispaces reset their
        /// free pointer to their own base on every flip.
        #[quickcheck]
        fn two_collections_roundtrip_to_the_original_address(payload: isize) -> bool {
            let (heap, dispatch, arch) = test_fixture();
            let col = Collector::new(&heap, &dispatch, &arch, RootScanMode::Precise);

            let cons = heap.from_space().bump(2 * WORD_BYTES).unwrap();
            heap.write_word(cons, Word::fixnum_encode(payload));
            heap.write_word(cons + WORD_BYTES, crate::tag::NIL);
            let original = Word::retag(cons, Lowtag::ListPointer);

            let mut roots = root_storage(1);
            let root_start = roots.as_mut_ptr() as usize;
            heap.write_word(root_start, original);

            col.collect(&[PreciseRoot { start: root_start, words: 1 }], &[]);
            col.collect(&[PreciseRoot { start: root_start, words: 1 }], &[]);

            heap.read_word(root_start) == original
        }
    }
}
