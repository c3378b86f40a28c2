//! Forwarding pointer recognition for the semispace collector.
//!
//! §3 invariant: "A forwarding pointer marks an already-copied object in
//! from-space. In the semispace collector it is recognized because its
//! slot-zero word is itself a pointer into to-space." To-space starts
//! every collection empty and zero-filled (`Heap::zero_and_reset_dynamic`),
//! so no legitimate mutator data can point into it before the collector
//! itself starts writing transported copies there -- any from-space
//! object whose first word now points into to-space was, unambiguously,
//! forwarded by this collection.

use crate::heap::Heap;
use crate::tag::Word;

/// If the object based at `from_addr` (untagged) has already been
/// transported during this collection, return the new tagged reference
/// recorded in its slot-zero word.
#[inline]
pub fn forwarding_target(heap: &Heap, from_addr: usize) -> Option<Word> {
    let slot_zero = heap.read_word(from_addr);
    if slot_zero.is_pointer() && heap.to_space().contains(slot_zero.untag()) {
        Some(slot_zero)
    } else {
        None
    }
}

/// Mark `from_addr` as forwarded to `new_ref` by overwriting its
/// slot-zero word. Must be called exactly once per transported object,
/// before any recursive scavenge of that object's own contents, so that
/// cyclic graphs terminate (§9 "implementations must not recursively call
/// scavenge on a subobject before installing its forwarding pointer").
#[inline]
pub fn install_forwarding(heap: &Heap, from_addr: usize, new_ref: Word) {
    heap.write_word(from_addr, new_ref);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::os::HostOs;
    use crate::tag::Lowtag;

    fn test_heap() -> Heap {
        let config = RuntimeConfig {
            dynamic_space_size: 4096,
            read_only_space_size: 4096,
            static_space_size: 4096,
            ..Default::default()
        };
        Heap::reserve(&config, &HostOs::default()).unwrap()
    }

    #[test]
    fn unforwarded_object_has_no_target() {
        let heap = test_heap();
        let addr = heap.from_space().base();
        heap.write_word(addr, Word::fixnum_encode(7));
        assert!(forwarding_target(&heap, addr).is_none());
    }

    #[test]
    fn forwarded_object_reports_its_target() {
        let heap = test_heap();
        let from_addr = heap.from_space().base();
        let to_addr = heap.to_space().base() + 16;
        let new_ref = Word::retag(to_addr, Lowtag::OtherPointer);
        install_forwarding(&heap, from_addr, new_ref);
        assert_eq!(forwarding_target(&heap, from_addr), Some(new_ref));
    }
}
