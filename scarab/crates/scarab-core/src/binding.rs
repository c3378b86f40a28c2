//! Dynamic binding stack: `bind`/`unbind`/`unbind_to`, one per thread. §4.8.
//!
//! A binding record saves both the symbol's previous value *and* the
//! thread-local slot index it was resolved to at bind time, so `unbind`
//! restores through the same slot without a second lookup -- the slot
//! assignment cannot change within one thread's lifetime, but resolving it
//! twice on every dynamic-extent exit would be wasted work on a hot path.

use crate::tag::Word;
use crate::thread::ThreadLocalSlots;

struct BindingRecord {
    tls_index: usize,
    saved_value: Word,
}

/// A LIFO stack of saved thread-local values, one per thread. `bind` pushes
/// the slot's current value and installs a new one; `unbind`/`unbind_to`
/// restore in reverse order.
pub struct BindingStack {
    entries: Vec<BindingRecord>,
}

impl BindingStack {
    pub fn new() -> Self {
        BindingStack { entries: Vec::new() }
    }

    /// A marker identifying the current stack depth, to be passed to a
    /// later `unbind_to` -- the idiom for "restore every binding made since
    /// this dynamic extent was entered," e.g. at a non-local exit.
    pub fn mark(&self) -> usize {
        self.entries.len()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Save `slots[tls_index]`'s current value and install `new_value`.
    pub fn bind(&mut self, slots: &ThreadLocalSlots, tls_index: usize, new_value: Word) {
        let saved_value = slots.get(tls_index);
        self.entries.push(BindingRecord { tls_index, saved_value });
        slots.set(tls_index, new_value);
    }

    /// Restore the most recently bound slot to its saved value. Calling
    /// this with no outstanding binding is a corrupted-control-flow bug in
    /// the caller (a non-local exit that skipped an `unbind`, for
    /// instance), not a recoverable condition -- the thread's dynamic state
    /// is no longer trustworthy either way.
    pub fn unbind(&mut self, slots: &ThreadLocalSlots) {
        let record = self
            .entries
            .pop()
            .unwrap_or_else(|| crate::error::lose("unbind called with an empty binding stack"));
        slots.set(record.tls_index, record.saved_value);
    }

    /// Unbind every binding made since `marker` (as returned by an earlier
    /// `mark`), restoring the round-trip invariant: after this call, every
    /// slot touched since `marker` holds exactly the value it held then.
    pub fn unbind_to(&mut self, slots: &ThreadLocalSlots, marker: usize) {
        if marker > self.entries.len() {
            crate::error::lose("unbind_to marker is ahead of the current binding stack depth");
        }
        while self.entries.len() > marker {
            self.unbind(slots);
        }
    }
}

impl Default for BindingStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::os::HostOs;

    #[test]
    fn bind_unbind_round_trips() {
        let tcb = {
            let os = HostOs::default();
            let config = RuntimeConfig { thread_local_values_size: 4096, ..Default::default() };
            let heap = crate::heap::Heap::reserve(&config, &os).unwrap();
            let registry = crate::thread::ThreadRegistry::new();
            let template = crate::thread::ThreadTemplate::new(vec![Word::fixnum_encode(0); 16]);
            registry
                .register(&os, &config, &heap, crate::thread::TlsSeed::Template(&template), true)
                .unwrap()
        };

        tcb.tls.set(3, Word::fixnum_encode(10));
        let mut stack = BindingStack::new();
        let mark = stack.mark();

        stack.bind(&tcb.tls, 3, Word::fixnum_encode(20));
        assert_eq!(tcb.tls.get(3).fixnum_decode(), 20);

        stack.bind(&tcb.tls, 3, Word::fixnum_encode(30));
        assert_eq!(tcb.tls.get(3).fixnum_decode(), 30);

        stack.unbind_to(&tcb.tls, mark);
        assert_eq!(tcb.tls.get(3).fixnum_decode(), 10);
        assert_eq!(stack.depth(), mark);
    }
}
