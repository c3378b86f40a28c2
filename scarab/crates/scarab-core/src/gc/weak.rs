//! Weak pointer fixup: the post-scavenge pass over every weak pointer
//! transported during a collection. §4.5, §8 "weak semantics".

use crate::gc::forwarding;
use crate::heap::Heap;
use crate::object::WeakPointerLayout;
use crate::tag::NIL;

/// Walk the list of to-space weak pointers transported during the
/// collection just finished and resolve each value slot:
///
/// - not a from-space pointer: left alone (already stable, or an
///   immediate, or already nil).
/// - a from-space pointer whose referent was transported by some other
///   strong reference: rewritten to the forwarded destination.
/// - a from-space pointer whose referent never got forwarded (no strong
///   path survived it): set to nil and the broken flag raised.
///
/// Weak pointers never themselves keep a referent alive: this pass runs
/// strictly after the main scavenge loop has quiesced, so "forwarded" at
/// this point means "reachable by some other root."
pub fn fixup(heap: &Heap, weak_pointers: &[usize]) {
    for &addr in weak_pointers {
        let value_slot = unsafe { WeakPointerLayout::value_word_addr(addr) };
        let broken_slot = unsafe { WeakPointerLayout::broken_word_addr(addr) };
        let value = heap.read_word(value_slot);

        if !value.is_pointer() || !heap.from_space().contains(value.untag()) {
            continue;
        }

        match forwarding::forwarding_target(heap, value.untag()) {
            Some(target) => heap.write_word(value_slot, target),
            None => {
                heap.write_word(value_slot, NIL);
                heap.write_word(broken_slot, crate::tag::Word::fixnum_encode(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::os::HostOs;
    use crate::tag::{Lowtag, Word};

    fn test_heap() -> Heap {
        let config = RuntimeConfig {
            dynamic_space_size: 8192,
            read_only_space_size: 4096,
            static_space_size: 4096,
            ..Default::default()
        };
        Heap::reserve(&config, &HostOs::default()).unwrap()
    }

    #[test]
    fn broken_weak_pointer_becomes_nil() {
        let heap = test_heap();
        let weak_addr = heap.to_space().base();
        let referent = heap.from_space().base() + 64; // never forwarded
        heap.write_word(unsafe { WeakPointerLayout::value_word_addr(weak_addr) }, Word::retag(referent, Lowtag::ListPointer));

        fixup(&heap, &[weak_addr]);

        assert_eq!(heap.read_word(unsafe { WeakPointerLayout::value_word_addr(weak_addr) }), crate::tag::NIL);
        assert_eq!(heap.read_word(unsafe { WeakPointerLayout::broken_word_addr(weak_addr) }).fixnum_decode(), 1);
    }

    #[test]
    fn surviving_referent_updates_to_forwarded_address() {
        let heap = test_heap();
        let weak_addr = heap.to_space().base();
        let referent = heap.from_space().base() + 64;
        let forwarded_to = heap.to_space().base() + 256;
        heap.write_word(unsafe { WeakPointerLayout::value_word_addr(weak_addr) }, Word::retag(referent, Lowtag::ListPointer));
        forwarding::install_forwarding(&heap, referent, Word::retag(forwarded_to, Lowtag::ListPointer));

        fixup(&heap, &[weak_addr]);

        let updated = heap.read_word(unsafe { WeakPointerLayout::value_word_addr(weak_addr) });
        assert_eq!(updated.untag(), forwarded_to);
        assert_eq!(heap.read_word(unsafe { WeakPointerLayout::broken_word_addr(weak_addr) }).fixnum_decode(), 0);
    }
}
