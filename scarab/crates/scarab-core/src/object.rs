//! Concrete in-memory layouts for the handful of object shapes the
//! collector needs to understand structurally rather than generically:
//! cons cells (no header at all), code objects (mixed boxed/unboxed with
//! embedded entry points), and weak pointers (one slot intentionally not
//! scavenged). Every other header-bearing kind is either "boxed generic"
//! or "unboxed generic" and needs no dedicated layout module -- its whole
//! payload is either recursively scavenged or skipped, per
//! [`crate::widetag::Widetag::is_boxed`].

use crate::arch::CodeFixup;
use crate::tag::{Word, WORD_BYTES, NIL};

/// A cons cell is two words, car then cdr, with no header word -- the
/// list-pointer lowtag names the shape directly. §3 data model.
pub const CONS_WORDS: usize = 2;

/// Code object layout, word-indexed from the tagged object's base address:
///
/// ```text
/// [0] header:            widetag = CodeHeader, header_length = total
///                         payload words following this header (boxed
///                         constants + entry-point directory + unboxed
///                         instruction bytes, but not this word itself)
/// [1] boxed_count:        number of boxed constant words at [2..)
/// [2] entry_point_count:  number of simple-fun entries embedded below
/// [3 .. 3+boxed_count)                 boxed constants (scavenged)
/// [3+boxed_count .. +entry_point_count) entry-point directory: one word
///                                        offset (from the code object's
///                                        own base, in words) per entry
/// [.. end of header_length]             unboxed instruction bytes,
///                                        including the embedded
///                                        simple-fun/return-pc headers
///                                        named by the directory
/// ```
///
/// This mirrors §3's "code object never moves relative to its
/// constituent simple-fun headers" and §4.4's "whole code_header + payload
/// as a single unit" by keeping one contiguous allocation and a directory
/// transport can walk without re-deriving entry-point addresses from
/// instruction bytes.
pub struct CodeLayout;

impl CodeLayout {
    pub const BOXED_COUNT_WORD: usize = 1;
    pub const ENTRY_COUNT_WORD: usize = 2;
    pub const FIXED_PREFIX_WORDS: usize = 3;

    #[inline]
    pub fn total_payload_words(header: Word) -> usize {
        header.header_length()
    }

    #[inline]
    pub fn total_words(header: Word) -> usize {
        1 + Self::total_payload_words(header)
    }

    #[inline]
    pub unsafe fn boxed_count(heap: &crate::heap::Heap, code_base: usize) -> usize {
        heap.read_word(code_base + Self::BOXED_COUNT_WORD * WORD_BYTES).as_usize()
    }

    #[inline]
    pub unsafe fn entry_point_count(heap: &crate::heap::Heap, code_base: usize) -> usize {
        heap.read_word(code_base + Self::ENTRY_COUNT_WORD * WORD_BYTES).as_usize()
    }

    /// Word offset (from `code_base`) of the boxed constants region.
    pub fn boxed_region_offset() -> usize {
        Self::FIXED_PREFIX_WORDS
    }

    /// Word offset of the entry-point directory, given how many boxed
    /// words precede it.
    pub fn entry_directory_offset(boxed_count: usize) -> usize {
        Self::FIXED_PREFIX_WORDS + boxed_count
    }

    pub unsafe fn entry_offset(
        heap: &crate::heap::Heap,
        code_base: usize,
        boxed_count: usize,
        index: usize,
    ) -> usize {
        let slot = code_base + (Self::entry_directory_offset(boxed_count) + index) * WORD_BYTES;
        heap.read_word(slot).as_usize()
    }

    /// Saved relocation records for this code object, read from its first
    /// boxed constant slot if present: nil (or no boxed constants at all)
    /// means no fixups. When present, the slot holds a
    /// `SimpleVectorUnsigned64` whose data words each directly encode a
    /// `CodeFixup::site_offset`, applied by `ArchPort::apply_code_fixup`
    /// during transport and purify.
    pub unsafe fn fixups(heap: &crate::heap::Heap, code_base: usize, boxed_count: usize) -> Vec<CodeFixup> {
        if boxed_count == 0 {
            return Vec::new();
        }
        let first_slot = code_base + Self::boxed_region_offset() * WORD_BYTES;
        let slot_word = heap.read_word(first_slot);
        if slot_word == NIL || !slot_word.is_pointer() {
            return Vec::new();
        }

        let vec_addr = slot_word.untag();
        let header = heap.read_word(vec_addr);
        let element_count = header.header_length();
        (0..element_count)
            .map(|i| CodeFixup {
                site_offset: heap.read_word(vec_addr + (1 + i) * WORD_BYTES).as_usize(),
            })
            .collect()
    }
}

/// A simple-fun or return-pc header embedded inside a code object's
/// unboxed region:
///
/// ```text
/// [0] header: widetag = SimpleFunHeader | ReturnPcHeader, header_length
///             = word offset from this header back to the enclosing code
///             object's own base (used to locate the code object when
///             only a function-pointer reference to the entry is in
///             hand, per §4.4 "never reached directly ... resolves to
///             transporting the whole enclosing code object")
/// [1] self:   a tagged function-pointer word whose untagged value equals
///             this header's own address; rewritten by the transport's
///             constant displacement after the enclosing code object
///             moves (§3 invariant, §8 scenario 4)
/// ```
pub struct SimpleFunLayout;

impl SimpleFunLayout {
    pub const SELF_WORD: usize = 1;

    pub unsafe fn back_offset_words(heap: &crate::heap::Heap, sf_addr: usize) -> usize {
        heap.read_word(sf_addr).header_length()
    }

    pub unsafe fn self_word_addr(sf_addr: usize) -> usize {
        sf_addr + Self::SELF_WORD * WORD_BYTES
    }
}

/// A weak pointer: one header word, one value slot the scavenger must
/// never follow, and one broken-flag slot set by the post-scavenge fixup
/// pass when the referent did not survive (§3, §4.4, §4.5).
pub struct WeakPointerLayout;

impl WeakPointerLayout {
    pub const VALUE_WORD: usize = 1;
    pub const BROKEN_WORD: usize = 2;
    pub const TOTAL_WORDS: usize = 3;

    pub unsafe fn value_word_addr(addr: usize) -> usize {
        addr + Self::VALUE_WORD * WORD_BYTES
    }

    pub unsafe fn broken_word_addr(addr: usize) -> usize {
        addr + Self::BROKEN_WORD * WORD_BYTES
    }
}

/// An instance object's purity classification for the purifier (§4.6):
/// word index 1 (right after the header) carries a fixnum flag mirroring
/// the source layout's three-way pure flag (`T` / `nil` / `0`). This is
/// this port's own encoding, not a byte-for-byte match to any external
/// layout metaobject format -- the data model only specifies the
/// three-way behavior, not its bit layout.
pub struct InstanceLayout;

impl InstanceLayout {
    pub const PURITY_WORD: usize = 1;

    pub unsafe fn purity_flag(heap: &crate::heap::Heap, addr: usize) -> isize {
        heap.read_word(addr + Self::PURITY_WORD * WORD_BYTES).fixnum_decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::os::HostOs;
    use crate::tag::Lowtag;
    use crate::widetag::Widetag;

    #[test]
    fn code_layout_offsets_are_monotonic() {
        let boxed = 4;
        let dir_offset = CodeLayout::entry_directory_offset(boxed);
        assert!(dir_offset > CodeLayout::boxed_region_offset());
        assert_eq!(dir_offset, CodeLayout::FIXED_PREFIX_WORDS + boxed);
    }

    fn test_heap() -> crate::heap::Heap {
        let config = RuntimeConfig {
            dynamic_space_size: 16 * 1024,
            read_only_space_size: 4096,
            static_space_size: 4096,
            ..Default::default()
        };
        crate::heap::Heap::reserve(&config, &HostOs::default()).unwrap()
    }

    #[test]
    fn fixups_is_empty_when_first_boxed_slot_is_nil() {
        let heap = test_heap();
        let code_base = heap.from_space().bump(4 * WORD_BYTES).unwrap();
        heap.write_word(code_base + CodeLayout::boxed_region_offset() * WORD_BYTES, NIL);
        assert!(unsafe { CodeLayout::fixups(&heap, code_base, 1) }.is_empty());
    }

    #[test]
    fn fixups_is_empty_with_no_boxed_constants() {
        let heap = test_heap();
        let code_base = heap.from_space().bump(4 * WORD_BYTES).unwrap();
        assert!(unsafe { CodeLayout::fixups(&heap, code_base, 0) }.is_empty());
    }

    #[test]
    fn fixups_reads_site_offsets_from_fixup_vector() {
        let heap = test_heap();
        let code_base = heap.from_space().bump(4 * WORD_BYTES).unwrap();

        let fixup_vec = heap.from_space().bump(3 * WORD_BYTES).unwrap();
        heap.write_word(fixup_vec, Word::make_header(Widetag::SimpleVectorUnsigned64 as u8, 2));
        heap.write_word(fixup_vec + WORD_BYTES, Word::new(8));
        heap.write_word(fixup_vec + 2 * WORD_BYTES, Word::new(24));

        heap.write_word(
            code_base + CodeLayout::boxed_region_offset() * WORD_BYTES,
            Word::retag(fixup_vec, Lowtag::OtherPointer),
        );

        let fixups = unsafe { CodeLayout::fixups(&heap, code_base, 1) };
        assert_eq!(fixups.len(), 2);
        assert_eq!(fixups[0].site_offset, 8);
        assert_eq!(fixups[1].site_offset, 24);
    }
}
