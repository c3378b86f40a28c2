//! Purify: the one-shot pass that promotes a reachable set of dynamic
//! objects into read-only or static space so they survive every future
//! collection without ever being scavenged again. §4.6.
//!
//! Structurally this mirrors the collector's own transport (copy, install a
//! forwarding pointer, recurse into boxed contents) but targets one of the
//! two monotonically-growing regions instead of to-space, and its own
//! notion of "already done" checks those regions rather than to-space.

use std::cell::RefCell;

use crate::arch::ArchPort;
use crate::heap::{BumpRegion, Heap};
use crate::object::{CodeLayout, InstanceLayout, SimpleFunLayout, WeakPointerLayout, CONS_WORDS};
use crate::tag::{align_words, Lowtag, Word, WORD_BYTES};
use crate::widetag::{header_total_words, Widetag};

/// Which of the two growing regions an object is promoted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purity {
    ReadOnly,
    Static,
    /// The source layout's "0" pure flag: the instance shell always goes
    /// static, but its contents are promoted to whatever destination the
    /// caller originally requested.
    PromoteContentsOnly,
}

enum DeferralKind {
    Cons,
    BoxedGeneric { word_count: usize },
    CodeConstants { boxed_count: usize },
}

struct PurifyDeferral {
    new_base: usize,
    kind: DeferralKind,
    destination: Purity,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PurifyStats {
    pub bytes_promoted: usize,
}

/// Returned when purify refuses to run: a soft failure, never a `lose`,
/// because an active interrupt context means some thread's control flow is
/// still mid-unwind and could be holding a reference purify has not yet
/// accounted for.
pub struct PurifyRefused {
    pub active_interrupt_contexts: usize,
}

pub struct Purifier<'a> {
    heap: &'a Heap,
    arch: &'a dyn ArchPort,
    deferred: RefCell<Vec<PurifyDeferral>>,
}

impl<'a> Purifier<'a> {
    pub fn new(heap: &'a Heap, arch: &'a dyn ArchPort) -> Self {
        Purifier { heap, arch, deferred: RefCell::new(Vec::new()) }
    }

    fn region_for(&self, destination: Purity) -> &dyn BumpRegion {
        match destination {
            Purity::ReadOnly => &self.heap.read_only,
            Purity::Static | Purity::PromoteContentsOnly => &self.heap.static_space,
        }
    }

    fn forwarding_target(&self, from_addr: usize) -> Option<Word> {
        let slot_zero = self.heap.read_word(from_addr);
        if slot_zero.is_pointer()
            && (self.heap.read_only.contains(slot_zero.untag()) || self.heap.static_space.contains(slot_zero.untag()))
        {
            Some(slot_zero)
        } else {
            None
        }
    }

    /// Run one purify pass over the given static-destined and
    /// read-only-destined root slots. Refuses if any thread has an active
    /// interrupt context, since purify assumes no control flow is
    /// currently unwinding through a signal handler that might still touch
    /// the heap region being rewritten.
    pub fn run(
        &self,
        static_roots: &[usize],
        read_only_roots: &[usize],
        active_interrupt_contexts: usize,
    ) -> Result<PurifyStats, PurifyRefused> {
        if active_interrupt_contexts > 0 {
            return Err(PurifyRefused { active_interrupt_contexts });
        }

        let read_only_before = self.heap.read_only.used();
        let static_before = self.heap.static_space.used();
        let _span = crate::logging::purify_span(read_only_before, static_before).entered();

        for &slot in static_roots {
            self.promote_slot(slot, Purity::Static);
        }
        for &slot in read_only_roots {
            self.promote_slot(slot, Purity::ReadOnly);
        }
        self.drain_deferred();

        self.heap.zero_and_reset_dynamic();

        let stats = PurifyStats {
            bytes_promoted: (self.heap.read_only.used() - read_only_before)
                + (self.heap.static_space.used() - static_before),
        };
        tracing::info!(bytes_promoted = stats.bytes_promoted, "purify finished");
        Ok(stats)
    }

    fn promote_slot(&self, slot_addr: usize, destination: Purity) {
        let word = self.heap.read_word(slot_addr);
        if !word.is_pointer() {
            return;
        }
        let new_ref = self.promote(word, destination);
        self.heap.write_word(slot_addr, new_ref);
    }

    fn promote(&self, word: Word, destination: Purity) -> Word {
        let from_addr = word.untag();
        if !self.heap.from_space().contains(from_addr) {
            // Already read-only, static, or otherwise stable: nothing to do.
            return word;
        }
        if let Some(existing) = self.forwarding_target(from_addr) {
            return existing;
        }

        match word.lowtag() {
            Lowtag::ListPointer => self.promote_cons(from_addr, destination),
            _ => {
                let header = self.heap.read_word(from_addr);
                match Widetag::from_u8(header.widetag()) {
                    Some(Widetag::Instance) => self.promote_instance(from_addr, word, header, destination),
                    Some(Widetag::CodeHeader) => self.promote_code(from_addr, word, header, destination),
                    Some(Widetag::WeakPointer) => self.promote_verbatim(from_addr, word, WeakPointerLayout::TOTAL_WORDS, destination),
                    Some(w) if w.is_boxed() => self.promote_boxed(from_addr, word, header, destination),
                    _ => self.promote_unboxed(from_addr, word, header, destination),
                }
            }
        }
    }

    fn alloc_and_copy(&self, destination: Purity, from_addr: usize, total_words: usize) -> usize {
        let region = self.region_for(destination);
        let new_base = region
            .bump(align_words(total_words) * WORD_BYTES)
            .unwrap_or_else(|e| crate::error::lose(e));
        self.heap.copy_words(from_addr, new_base, total_words);
        new_base
    }

    fn promote_cons(&self, from_addr: usize, destination: Purity) -> Word {
        let new_base = self.alloc_and_copy(destination, from_addr, CONS_WORDS);
        let new_ref = Word::retag(new_base, Lowtag::ListPointer);
        self.heap.write_word(from_addr, new_ref);
        self.deferred.borrow_mut().push(PurifyDeferral { new_base, kind: DeferralKind::Cons, destination });
        new_ref
    }

    fn promote_boxed(&self, from_addr: usize, word: Word, header: Word, destination: Purity) -> Word {
        let total = header_total_words(header);
        let new_base = self.alloc_and_copy(destination, from_addr, total);
        let new_ref = Word::retag(new_base, word.lowtag());
        self.heap.write_word(from_addr, new_ref);
        self.deferred
            .borrow_mut()
            .push(PurifyDeferral { new_base, kind: DeferralKind::BoxedGeneric { word_count: total - 1 }, destination });
        new_ref
    }

    fn promote_unboxed(&self, from_addr: usize, word: Word, header: Word, destination: Purity) -> Word {
        let total = header_total_words(header);
        let new_base = self.alloc_and_copy(destination, from_addr, total);
        let new_ref = Word::retag(new_base, word.lowtag());
        self.heap.write_word(from_addr, new_ref);
        new_ref
    }

    fn promote_verbatim(&self, from_addr: usize, word: Word, total_words: usize, destination: Purity) -> Word {
        let new_base = self.alloc_and_copy(destination, from_addr, total_words);
        let new_ref = Word::retag(new_base, word.lowtag());
        self.heap.write_word(from_addr, new_ref);
        new_ref
    }

    fn promote_instance(&self, from_addr: usize, word: Word, header: Word, requested: Purity) -> Word {
        let flag = unsafe { InstanceLayout::purity_flag(self.heap, from_addr) };
        let (shell_destination, contents_destination) = match flag {
            1 => (Purity::ReadOnly, Purity::ReadOnly),
            0 => (Purity::Static, requested),
            _ => (Purity::Static, Purity::Static),
        };

        let total = header_total_words(header);
        let new_base = self.alloc_and_copy(shell_destination, from_addr, total);
        let new_ref = Word::retag(new_base, word.lowtag());
        self.heap.write_word(from_addr, new_ref);
        self.deferred.borrow_mut().push(PurifyDeferral {
            new_base,
            kind: DeferralKind::BoxedGeneric { word_count: total - 1 },
            destination: contents_destination,
        });
        new_ref
    }

    /// Promote a whole code object as one unit, rewriting entry-point self
    /// pointers by the move displacement exactly as the collector's
    /// transport does, except the destination is a growing region instead
    /// of to-space and the boxed constants are promoted rather than merely
    /// scavenged.
    fn promote_code(&self, from_addr: usize, word: Word, header: Word, destination: Purity) -> Word {
        let total = CodeLayout::total_words(header);
        let new_base = self.alloc_and_copy(destination, from_addr, total);
        let new_ref = Word::retag(new_base, word.lowtag());
        self.heap.write_word(from_addr, new_ref);

        let displacement = new_base as isize - from_addr as isize;
        let boxed_count = unsafe { CodeLayout::boxed_count(self.heap, new_base) };
        let entry_count = unsafe { CodeLayout::entry_point_count(self.heap, new_base) };

        for i in 0..entry_count {
            let offset_words = unsafe { CodeLayout::entry_offset(self.heap, new_base, boxed_count, i) };
            let old_entry_addr = from_addr + offset_words * WORD_BYTES;
            let new_entry_addr = new_base + offset_words * WORD_BYTES;
            let self_slot = unsafe { SimpleFunLayout::self_word_addr(new_entry_addr) };
            let old_self = self.heap.read_word(self_slot);
            let new_self_addr = (old_self.untag() as isize + displacement) as usize;
            self.heap.write_word(self_slot, Word::retag(new_self_addr, Lowtag::FunPointer));
            self.heap.write_word(old_entry_addr, Word::retag(new_entry_addr, Lowtag::FunPointer));
        }

        for fixup in unsafe { CodeLayout::fixups(self.heap, new_base, boxed_count) } {
            self.arch.apply_code_fixup(new_base, fixup, displacement);
        }
        self.arch.flush_icache(new_base, align_words(total) * WORD_BYTES);

        self.deferred
            .borrow_mut()
            .push(PurifyDeferral { new_base, kind: DeferralKind::CodeConstants { boxed_count }, destination });
        new_ref
    }

    /// Drain the deferral worklist, promoting one object's boxed contents
    /// per iteration. Using an explicit `Vec`-backed worklist rather than
    /// recursing into contents at promotion time bounds this pass's own
    /// stack usage to O(1) regardless of how deep the promoted graph is.
    fn drain_deferred(&self) {
        loop {
            let next = self.deferred.borrow_mut().pop();
            let Some(deferral) = next else { break };

            match deferral.kind {
                DeferralKind::Cons => {
                    self.promote_slot(deferral.new_base, deferral.destination);
                    self.promote_slot(deferral.new_base + WORD_BYTES, deferral.destination);
                }
                DeferralKind::BoxedGeneric { word_count } => {
                    for i in 0..word_count {
                        self.promote_slot(deferral.new_base + WORD_BYTES + i * WORD_BYTES, deferral.destination);
                    }
                }
                DeferralKind::CodeConstants { boxed_count } => {
                    let start = deferral.new_base + CodeLayout::boxed_region_offset() * WORD_BYTES;
                    for i in 0..boxed_count {
                        self.promote_slot(start + i * WORD_BYTES, deferral.destination);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::os::HostOs;

    fn test_heap() -> Heap {
        let config = RuntimeConfig {
            dynamic_space_size: 16 * 1024,
            read_only_space_size: 8192,
            static_space_size: 8192,
            ..Default::default()
        };
        Heap::reserve(&config, &HostOs::default()).unwrap()
    }

    #[test]
    fn cons_promoted_to_static_is_forwarded_on_second_reference() {
        let heap = test_heap();
        let arch = crate::arch::HostArch::default();
        let purifier = Purifier::new(&heap, &arch);

        let cell = heap.from_space().bump(CONS_WORDS * WORD_BYTES).unwrap();
        heap.write_word(cell, Word::fixnum_encode(5));
        heap.write_word(cell + WORD_BYTES, crate::tag::NIL);

        let root_a = heap.from_space().bump(WORD_BYTES).unwrap();
        let root_b = heap.from_space().bump(WORD_BYTES).unwrap();
        heap.write_word(root_a, Word::retag(cell, Lowtag::ListPointer));
        heap.write_word(root_b, Word::retag(cell, Lowtag::ListPointer));

        let stats = purifier.run(&[root_a, root_b], &[], 0).unwrap();
        assert!(stats.bytes_promoted > 0);

        let a = heap.read_word(root_a);
        let b = heap.read_word(root_b);
        assert_eq!(a, b, "both roots must converge on the same promoted object");
        assert!(heap.static_space.contains(a.untag()));
    }

    #[test]
    fn refuses_with_active_interrupt_context() {
        let heap = test_heap();
        let arch = crate::arch::HostArch::default();
        let purifier = Purifier::new(&heap, &arch);
        let err = purifier.run(&[], &[], 2).unwrap_err();
        assert_eq!(err.active_interrupt_contexts, 2);
    }
}
