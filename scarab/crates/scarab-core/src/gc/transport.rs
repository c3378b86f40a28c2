//! Transport: copy an object into to-space and return its new tagged
//! reference, plus the generic boxed/unboxed scavenge bodies that recurse
//! into (or skip over) a transported object's payload. §4.4.

use crate::dispatch::{DispatchEntry, ScavengeFn, SizeFn, TransportFn};
use crate::gc::forwarding;
use crate::gc::Collector;
use crate::object::{CodeLayout, SimpleFunLayout, WeakPointerLayout, CONS_WORDS};
use crate::tag::{align_words, Lowtag, Word, WORD_BYTES};
use crate::widetag::{header_total_words, Widetag};

/// Build the real `(scavenge, transport, size)` triple for one
/// header-bearing widetag. Called once per widetag from
/// `DispatchTables::new`.
pub(crate) fn dispatch_entry_for(widetag: Widetag) -> DispatchEntry {
    let size: SizeFn = match widetag {
        Widetag::CodeHeader => size_code,
        _ => size_generic,
    };

    let (scavenge, transport): (ScavengeFn, TransportFn) = match widetag {
        Widetag::WeakPointer => (scavenge_weak_pointer, transport_weak_pointer),
        Widetag::CodeHeader => (scavenge_code, transport_code_entry),
        Widetag::SimpleFunHeader | Widetag::ReturnPcHeader => {
            // Never reached as an inline header in a scavenge_range walk
            // (code's own scavenge only recurses into its boxed prefix,
            // never the unboxed instruction bytes that embed these), but
            // reachable via a function-pointer transport.
            (unreachable_scavenge, transport_simple_fun)
        }
        _ if widetag.is_boxed() => (scavenge_boxed_generic, transport_boxed_generic),
        _ => (scavenge_unboxed_generic, transport_unboxed_generic),
    };

    DispatchEntry { scavenge, transport, size }
}

fn unreachable_scavenge(_col: &Collector, addr: usize, header: Word) -> usize {
    crate::error::lose(format!(
        "scavenge dispatched directly to a code-entry header at {:#x} ({:?}) -- \
         entry points must only be reached through code-object transport",
        addr, header
    ))
}

/// The pointer-lowtag-family defensive scavenger described in §4.2's
/// dispatch-table initialization policy, used only by the conservative
/// root scanner (`Collector::scavenge_conservative_word`): treat the
/// already-validated word at `addr` as a tagged pointer and forward or
/// transport it.
pub(crate) fn conservative_pointer_scavenger(_lowtag: Lowtag) -> ScavengeFn {
    scavenge_pointer_like
}

fn scavenge_pointer_like(col: &Collector, addr: usize, word: Word) -> usize {
    col.scavenge_pointer_slot(addr, word)
}

// ---------------------------------------------------------------------
// Boxed / unboxed generic objects
// ---------------------------------------------------------------------

fn size_generic(header: Word) -> usize {
    header_total_words(header)
}

fn scavenge_boxed_generic(col: &Collector, addr: usize, header: Word) -> usize {
    let total = size_generic(header);
    col.scavenge_range(addr + WORD_BYTES, total - 1);
    total
}

fn scavenge_unboxed_generic(_col: &Collector, _addr: usize, header: Word) -> usize {
    size_generic(header)
}

fn transport_boxed_generic(col: &Collector, tagged: Word) -> Word {
    transport_generic(col, tagged, true)
}

fn transport_unboxed_generic(col: &Collector, tagged: Word) -> Word {
    transport_generic(col, tagged, false)
}

fn transport_generic(col: &Collector, tagged: Word, boxed: bool) -> Word {
    let from_addr = tagged.untag();
    let header = col.heap.read_word(from_addr);
    let total_words = size_generic(header);
    let alloc_words = align_words(total_words);
    let new_base = col
        .heap
        .to_space()
        .bump(alloc_words * WORD_BYTES)
        .unwrap_or_else(|e| crate::error::lose(e));

    col.heap.copy_words(from_addr, new_base, total_words);
    let new_ref = Word::retag(new_base, tagged.lowtag());
    forwarding::install_forwarding(col.heap, from_addr, new_ref);

    if boxed {
        col.scavenge_range(new_base + WORD_BYTES, total_words - 1);
    }
    new_ref
}

// ---------------------------------------------------------------------
// Cons cells -- handled outside the widetag table (no header word), but
// kept in this module since it is the same family of operation.
// ---------------------------------------------------------------------

/// Transport a from-space cons, then linearize: while the cdr is an
/// unforwarded from-space cons, copy it immediately following in to-space
/// so the whole chain lands in consecutive memory (§3, §4.4, §8 scenario 1).
pub fn transport_cons(col: &Collector, tagged: Word) -> Word {
    let first_new = transport_one_cons(col, tagged.untag());
    let mut prev_cdr_slot = first_new + WORD_BYTES;

    loop {
        let cdr = col.heap.read_word(prev_cdr_slot);
        if cdr.lowtag() != Lowtag::ListPointer || !col.heap.from_space().contains(cdr.untag()) {
            break;
        }
        if let Some(resolved) = forwarding::forwarding_target(col.heap, cdr.untag()) {
            // Already forwarded by some other strong reference; stop
            // linearizing but still resolve this slot.
            col.heap.write_word(prev_cdr_slot, resolved);
            break;
        }
        let next_new = transport_one_cons(col, cdr.untag());
        col.heap.write_word(prev_cdr_slot, Word::retag(next_new, Lowtag::ListPointer));
        prev_cdr_slot = next_new + WORD_BYTES;
    }

    Word::retag(first_new, Lowtag::ListPointer)
}

fn transport_one_cons(col: &Collector, from_addr: usize) -> usize {
    let new_base = col
        .heap
        .to_space()
        .bump(CONS_WORDS * WORD_BYTES)
        .unwrap_or_else(|e| crate::error::lose(e));
    col.heap.copy_words(from_addr, new_base, CONS_WORDS);
    let new_ref = Word::retag(new_base, Lowtag::ListPointer);
    forwarding::install_forwarding(col.heap, from_addr, new_ref);

    // The car slot of the *new* cons is a normal tagged slot; scavenge it
    // immediately. The cdr slot is handled by the linearization loop in
    // `transport_cons`, not here, so a long chain doesn't recurse one
    // stack frame per link.
    col.scavenge_range(new_base, 1);
    new_ref
}

// ---------------------------------------------------------------------
// Weak pointers
// ---------------------------------------------------------------------

fn scavenge_weak_pointer(_col: &Collector, _addr: usize, _header: Word) -> usize {
    // A weak pointer is only ever reached through the pointer branch
    // (OtherPointer lowtag), which calls `transport_weak_pointer`
    // directly; this entry exists so the dispatch table has a defined
    // (non-`lose`) row, matching every other widetag.
    WeakPointerLayout::TOTAL_WORDS
}

fn transport_weak_pointer(col: &Collector, tagged: Word) -> Word {
    let from_addr = tagged.untag();
    let new_base = col
        .heap
        .to_space()
        .bump(align_words(WeakPointerLayout::TOTAL_WORDS) * WORD_BYTES)
        .unwrap_or_else(|e| crate::error::lose(e));
    col.heap.copy_words(from_addr, new_base, WeakPointerLayout::TOTAL_WORDS);
    let new_ref = Word::retag(new_base, tagged.lowtag());
    forwarding::install_forwarding(col.heap, from_addr, new_ref);

    // Deliberately not scavenged: the value slot is recorded for the
    // post-scavenge weak-pointer fixup pass instead (§4.4, §4.5).
    col.record_weak_pointer(new_base);
    new_ref
}

// ---------------------------------------------------------------------
// Code objects
// ---------------------------------------------------------------------

fn size_code(header: Word) -> usize {
    CodeLayout::total_words(header)
}

fn scavenge_code(col: &Collector, addr: usize, header: Word) -> usize {
    // Only the boxed constants region is scavenged; the entry-point
    // directory and unboxed instruction bytes (including embedded
    // simple-fun/return-pc headers) are never walked generically.
    let boxed_count = unsafe { CodeLayout::boxed_count(col.heap, addr) };
    let boxed_start = addr + CodeLayout::boxed_region_offset() * WORD_BYTES;
    col.scavenge_range(boxed_start, boxed_count);
    size_code(header)
}

/// Transport entry point reachable via `Lowtag::OtherPointer` targeting a
/// code object directly (rather than via one of its embedded entry
/// points).
fn transport_code_entry(col: &Collector, tagged: Word) -> Word {
    transport_code(col, tagged.untag())
}

/// Copy the whole code block as one unit, rewrite every entry point's
/// `self` field by the move displacement, install a forwarding pointer at
/// the code base *and* at each embedded entry point's own address so a
/// later function-pointer reference resolves without re-walking the
/// block, and flush the instruction cache over the new copy. §4.4.
fn transport_code(col: &Collector, from_base: usize) -> Word {
    if let Some(existing) = forwarding::forwarding_target(col.heap, from_base) {
        return existing;
    }

    let header = col.heap.read_word(from_base);
    let total_words = size_code(header);
    let alloc_words = align_words(total_words);
    let new_base = col
        .heap
        .to_space()
        .bump(alloc_words * WORD_BYTES)
        .unwrap_or_else(|e| crate::error::lose(e));

    col.heap.copy_words(from_base, new_base, total_words);
    let new_code_ref = Word::retag(new_base, Lowtag::OtherPointer);
    forwarding::install_forwarding(col.heap, from_base, new_code_ref);

    let displacement = new_base as isize - from_base as isize;
    let boxed_count = unsafe { CodeLayout::boxed_count(col.heap, new_base) };
    let entry_count = unsafe { CodeLayout::entry_point_count(col.heap, new_base) };

    for i in 0..entry_count {
        let offset_words = unsafe { CodeLayout::entry_offset(col.heap, new_base, boxed_count, i) };
        let old_entry_addr = from_base + offset_words * WORD_BYTES;
        let new_entry_addr = new_base + offset_words * WORD_BYTES;

        let self_slot = unsafe { SimpleFunLayout::self_word_addr(new_entry_addr) };
        let old_self = col.heap.read_word(self_slot);
        let new_self_addr = (old_self.untag() as isize + displacement) as usize;
        col.heap
            .write_word(self_slot, Word::retag(new_self_addr, Lowtag::FunPointer));

        forwarding::install_forwarding(
            col.heap,
            old_entry_addr,
            Word::retag(new_entry_addr, Lowtag::FunPointer),
        );
    }

    for fixup in unsafe { CodeLayout::fixups(col.heap, new_base, boxed_count) } {
        col.arch.apply_code_fixup(new_base, fixup, displacement);
    }

    col.arch.flush_icache(new_base, alloc_words * WORD_BYTES);

    // Recurse into the boxed constants only -- same region `scavenge_code`
    // would walk, now at the new address.
    let boxed_start = new_base + CodeLayout::boxed_region_offset() * WORD_BYTES;
    col.scavenge_range(boxed_start, boxed_count);

    new_code_ref
}

/// Resolve a function-pointer reference that targets an embedded
/// simple-fun (or return-pc) header: find the enclosing code object via
/// the header's own back-offset, transport the whole block, then report
/// the entry's *own* forwarding target (installed as a side effect of
/// `transport_code`).
fn transport_simple_fun(col: &Collector, tagged: Word) -> Word {
    let sf_addr = tagged.untag();
    let back_words = unsafe { SimpleFunLayout::back_offset_words(col.heap, sf_addr) };
    let code_base = sf_addr - back_words * WORD_BYTES;

    transport_code(col, code_base);

    forwarding::forwarding_target(col.heap, sf_addr)
        .unwrap_or_else(|| crate::error::lose("code transport did not forward its own entry point"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RootScanMode, RuntimeConfig};
    use crate::dispatch::DispatchTables;
    use crate::gc::Collector;
    use crate::os::HostOs;

    fn test_fixture() -> (crate::heap::Heap, DispatchTables, crate::arch::HostArch) {
        let config = RuntimeConfig {
            dynamic_space_size: 16 * 1024,
            read_only_space_size: 4096,
            static_space_size: 4096,
            ..Default::default()
        };
        let heap = crate::heap::Heap::reserve(&config, &HostOs::default()).unwrap();
        (heap, DispatchTables::new(), crate::arch::HostArch::default())
    }

    /// A bit-vector's header length counts bits, not words; transporting
    /// one must carve only the words its packed bits actually need rather
    /// than treating the element count as a word count.
    #[test]
    fn bit_vector_transport_sizes_by_element_bits_not_header_length() {
        let (heap, dispatch, arch) = test_fixture();
        let col = Collector::new(&heap, &dispatch, &arch, RootScanMode::Precise);

        // 100 bits -> ceil(100/64) = 2 payload words, 3 words total.
        let header = Word::make_header(Widetag::SimpleBitVector as u8, 100);
        let from_addr = heap.from_space().bump(4 * WORD_BYTES).unwrap();
        heap.write_word(from_addr, header);

        let tagged = Word::retag(from_addr, Lowtag::OtherPointer);
        let new_ref = transport_unboxed_generic(&col, tagged);

        assert_eq!(heap.read_word(new_ref.untag()), header);
        // The next bump in to-space must start exactly `align_words(3)`
        // words after this object's base, not `align_words(1 + 100)`.
        let next = heap.to_space().bump(WORD_BYTES).unwrap();
        assert_eq!(next, new_ref.untag() + align_words(3) * WORD_BYTES);
    }

    /// §8 scenario 4: a code object with two entry points, each whose
    /// `self` field initially equals its own in-code address tagged with
    /// the function-pointer lowtag. After transport, both entries' `self`
    /// fields must point into the *new* code block, offset from the new
    /// base by exactly the pre-copy displacement.
    #[test]
    fn code_transport_rewrites_both_entry_self_pointers() {
        let (heap, dispatch, arch) = test_fixture();
        let col = Collector::new(&heap, &dispatch, &arch, RootScanMode::Precise);

        let boxed_count = 0usize;
        let entry_count = 2usize;
        let dir_offset = CodeLayout::entry_directory_offset(boxed_count);
        let entry0_offset = dir_offset + entry_count;
        let entry1_offset = entry0_offset + 2;
        let total_words = entry1_offset + 2;
        let header_length = total_words - 1;

        let code_base = heap.from_space().bump(total_words * WORD_BYTES).unwrap();
        heap.write_word(code_base, Word::make_header(Widetag::CodeHeader as u8, header_length));
        heap.write_word(code_base + CodeLayout::BOXED_COUNT_WORD * WORD_BYTES, Word::new(boxed_count));
        heap.write_word(code_base + CodeLayout::ENTRY_COUNT_WORD * WORD_BYTES, Word::new(entry_count));
        heap.write_word(code_base + dir_offset * WORD_BYTES, Word::new(entry0_offset));
        heap.write_word(code_base + (dir_offset + 1) * WORD_BYTES, Word::new(entry1_offset));

        let entry0_addr = code_base + entry0_offset * WORD_BYTES;
        let entry1_addr = code_base + entry1_offset * WORD_BYTES;
        heap.write_word(entry0_addr, Word::make_header(Widetag::SimpleFunHeader as u8, entry0_offset));
        heap.write_word(unsafe { SimpleFunLayout::self_word_addr(entry0_addr) }, Word::retag(entry0_addr, Lowtag::FunPointer));
        heap.write_word(entry1_addr, Word::make_header(Widetag::SimpleFunHeader as u8, entry1_offset));
        heap.write_word(unsafe { SimpleFunLayout::self_word_addr(entry1_addr) }, Word::retag(entry1_addr, Lowtag::FunPointer));

        let tagged = Word::retag(code_base, Lowtag::OtherPointer);
        let new_ref = transport_code_entry(&col, tagged);
        let new_base = new_ref.untag();
        let displacement = new_base as isize - code_base as isize;

        let new_entry0 = new_base + entry0_offset * WORD_BYTES;
        let new_entry1 = new_base + entry1_offset * WORD_BYTES;
        let self0 = heap.read_word(unsafe { SimpleFunLayout::self_word_addr(new_entry0) });
        let self1 = heap.read_word(unsafe { SimpleFunLayout::self_word_addr(new_entry1) });

        assert_eq!(self0.lowtag(), Lowtag::FunPointer);
        assert_eq!(self1.lowtag(), Lowtag::FunPointer);
        assert_eq!(self0.untag() as isize, entry0_addr as isize + displacement);
        assert_eq!(self1.untag() as isize, entry1_addr as isize + displacement);
    }
}
