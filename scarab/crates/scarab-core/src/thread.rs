//! Thread registry: the per-thread address ranges (control stack, binding
//! stack, alien stack, thread-local slot array) and the global list every
//! registered thread is linked into. §4.9, §5.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::binding::BindingStack;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::heap::{Heap, ThreadLocalRegion};
use crate::os::{MappedRegion, OsPort};
use crate::signal::SavedInterruptContext;
use crate::tag::{Word, WORD_BYTES};

/// A thread's dynamic-binding slot array: one word per special-variable
/// thread-local slot, addressed by the slot index resolved at bind time
/// (§4.8). Backed by its own reserved range rather than a `Vec` so its
/// address is stable for the lifetime of the thread and so a foreign signal
/// handler reading it never races with reallocation.
pub struct ThreadLocalSlots {
    region: MappedRegion,
    slot_count: usize,
}

impl ThreadLocalSlots {
    fn reserve(os: &dyn OsPort, bytes: usize) -> Result<Self> {
        let region = os.reserve(0, bytes)?;
        let slot_count = region.length / WORD_BYTES;
        Ok(ThreadLocalSlots { region, slot_count })
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    #[inline]
    pub fn get(&self, index: usize) -> Word {
        debug_assert!(index < self.slot_count, "thread-local slot index out of range");
        Word::new(unsafe { std::ptr::read((self.region.base + index * WORD_BYTES) as *const usize) })
    }

    #[inline]
    pub fn set(&self, index: usize, value: Word) {
        debug_assert!(index < self.slot_count, "thread-local slot index out of range");
        unsafe { std::ptr::write((self.region.base + index * WORD_BYTES) as *mut usize, value.as_usize()) }
    }
}

/// The thread-local default values baked into the core image at build time,
/// populated once in `Runtime::new` from the image's initial dynamic
/// bindings, before the initial thread links itself into the registry.
pub struct ThreadTemplate {
    defaults: Vec<Word>,
}

impl ThreadTemplate {
    pub fn new(defaults: Vec<Word>) -> Self {
        ThreadTemplate { defaults }
    }

    pub fn default_value(&self, index: usize) -> Word {
        self.defaults.get(index).copied().unwrap_or(crate::tag::NIL)
    }
}

/// Where a newly registered thread's slot defaults come from: the global
/// template for the very first thread, or the creating thread's own
/// already-populated array for every thread after that (§4.9 supplement).
pub enum TlsSeed<'a> {
    Template(&'a ThreadTemplate),
    Creator(&'a ThreadControlBlock),
}

impl<'a> TlsSeed<'a> {
    fn word(&self, index: usize) -> Word {
        match self {
            TlsSeed::Template(template) => template.default_value(index),
            TlsSeed::Creator(creator) => creator.tls.get(index),
        }
    }
}

/// One registered thread's complete resource set.
pub struct ThreadControlBlock {
    pub thread_id: usize,
    pub control_stack: MappedRegion,
    pub binding_stack: MappedRegion,
    pub alien_stack: MappedRegion,
    pub tls: ThreadLocalSlots,
    pub bindings: Mutex<BindingStack>,
    pub is_initial: bool,
    /// Bump cursor into `control_stack`, advanced by `FakeForeignFrame` to
    /// carve a synthetic frame for a deferred signal handler to run under.
    pub control_stack_pointer: AtomicUsize,
    /// Saved register/PC snapshots for signal contexts currently executing
    /// under a `FakeForeignFrame`, innermost last.
    pub interrupt_contexts: Mutex<Vec<SavedInterruptContext>>,
    /// Per-thread bump-allocation regions (§5 "shared resources"): each
    /// thread bumps its own free pointer within a chunk carved from the
    /// live semispace without locking; exhaustion refills from
    /// `Heap::refill_chunk`.
    pub boxed_region: ThreadLocalRegion,
    pub unboxed_region: ThreadLocalRegion,
}

impl ThreadControlBlock {
    /// Bump-allocate one word on this thread's control stack for a
    /// synthetic frame, returning its address.
    pub fn push_control_stack_word(&self, value: usize) -> usize {
        let addr = self.control_stack_pointer.fetch_add(WORD_BYTES, Ordering::AcqRel);
        unsafe { std::ptr::write(addr as *mut usize, value) };
        addr
    }

    /// Undo a `push_control_stack_word`, restoring the bump cursor.
    pub fn pop_control_stack_word(&self) {
        self.control_stack_pointer.fetch_sub(WORD_BYTES, Ordering::AcqRel);
    }
}

/// The global thread list and its guarding lock.
///
/// §4.9 describes a singly-linked list under one spinlock with the
/// holder's thread id recorded for deadlock diagnosis. The mutual exclusion
/// itself is a `parking_lot::Mutex` (a spin-then-park implementation, and
/// the same primitive the rest of this codebase already reaches for around
/// shared collections) rather than a hand-rolled `AtomicUsize` test-and-set
/// loop; `holder` is tracked alongside it purely to preserve the
/// diagnostic the original exposes (see DESIGN.md open question 2). Keyed by
/// OS thread id in an `FxHashMap` (the non-cryptographic hasher the rest of
/// this corpus reaches for on hot lookup paths) rather than a linear `Vec`
/// scan, since the GC-stop signal handler's "find my own `ThreadControlBlock`"
/// lookup (§4.7) runs on every stop-the-world episode.
pub struct ThreadRegistry {
    threads: Mutex<FxHashMap<usize, Arc<ThreadControlBlock>>>,
    holder: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        ThreadRegistry { threads: Mutex::new(FxHashMap::default()), holder: AtomicUsize::new(0) }
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a new thread's four address ranges and its boxed/unboxed
    /// allocation regions, seed its thread-local slots, and publish it into
    /// the registry. The publication (pushing into `threads` while the
    /// lock is held) is the barrier a concurrent `snapshot` relies on to
    /// never observe a partially-initialized thread.
    pub fn register(
        &self,
        os: &dyn OsPort,
        config: &RuntimeConfig,
        heap: &Heap,
        seed: TlsSeed,
        is_initial: bool,
    ) -> Result<Arc<ThreadControlBlock>> {
        let thread_id = os.current_thread_id();
        let control_stack = os.reserve(0, config.control_stack_size)?;
        let binding_stack = os.reserve(0, config.binding_stack_size)?;
        let alien_stack = os.reserve(0, config.alien_stack_size)?;
        let tls = ThreadLocalSlots::reserve(os, config.thread_local_values_size)?;

        for i in 0..tls.slot_count() {
            tls.set(i, seed.word(i));
        }

        let control_stack_pointer = AtomicUsize::new(control_stack.base);
        let boxed_region = ThreadLocalRegion::empty();
        let unboxed_region = ThreadLocalRegion::empty();
        heap.refill_chunk(&boxed_region)?;
        heap.refill_chunk(&unboxed_region)?;

        let tcb = Arc::new(ThreadControlBlock {
            thread_id,
            control_stack,
            binding_stack,
            alien_stack,
            tls,
            bindings: Mutex::new(BindingStack::new()),
            is_initial,
            control_stack_pointer,
            interrupt_contexts: Mutex::new(Vec::new()),
            boxed_region,
            unboxed_region,
        });

        self.holder.store(thread_id, Ordering::Release);
        self.threads.lock().insert(thread_id, Arc::clone(&tcb));
        self.holder.store(0, Ordering::Release);

        let _span = crate::logging::thread_lifecycle_span(thread_id, is_initial).entered();
        tracing::info!(thread_id, is_initial, "thread registered");

        Ok(tcb)
    }

    /// Remove a thread from the registry and release its four ranges.
    /// Releasing an address range that some other thread still holds a
    /// reference to is the caller's bug to avoid, not this function's to
    /// detect -- matching `OsPort::release`'s own contract.
    pub fn unregister(&self, os: &dyn OsPort, tcb: &Arc<ThreadControlBlock>) -> Result<()> {
        self.holder.store(tcb.thread_id, Ordering::Release);
        self.threads.lock().remove(&tcb.thread_id);
        self.holder.store(0, Ordering::Release);

        os.release(&tcb.control_stack)?;
        os.release(&tcb.binding_stack)?;
        os.release(&tcb.alien_stack)?;

        tracing::info!(thread_id = tcb.thread_id, "thread unregistered");
        Ok(())
    }

    /// A snapshot of currently registered threads, used by the
    /// stop-the-world coordinator to know how many peers to wait for and
    /// by root scanning to enumerate every thread's stacks and TLS array.
    pub fn snapshot(&self) -> Vec<Arc<ThreadControlBlock>> {
        self.threads.lock().values().cloned().collect()
    }

    /// Look up a single registered thread by OS thread id, used by a
    /// GC-stop signal handler to find its own `ThreadControlBlock` (§4.7).
    pub fn find(&self, thread_id: usize) -> Option<Arc<ThreadControlBlock>> {
        self.threads.lock().get(&thread_id).cloned()
    }

    pub fn lock_holder(&self) -> Option<usize> {
        match self.holder.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::HostOs;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            control_stack_size: 64 * 1024,
            binding_stack_size: 16 * 1024,
            alien_stack_size: 16 * 1024,
            thread_local_values_size: 4096,
            dynamic_space_size: 64 * 1024,
            read_only_space_size: 4096,
            static_space_size: 4096,
            ..Default::default()
        }
    }

    #[test]
    fn register_then_unregister_round_trips() {
        let os = HostOs::default();
        let config = test_config();
        let heap = Heap::reserve(&config, &os).unwrap();
        let registry = ThreadRegistry::new();
        let template = ThreadTemplate::new(vec![Word::fixnum_encode(0); 8]);

        let tcb = registry.register(&os, &config, &heap, TlsSeed::Template(&template), true).unwrap();
        assert_eq!(registry.len(), 1);

        registry.unregister(&os, &tcb).unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn find_locates_registered_thread_by_id() {
        let os = HostOs::default();
        let config = test_config();
        let heap = Heap::reserve(&config, &os).unwrap();
        let registry = ThreadRegistry::new();
        let template = ThreadTemplate::new(vec![Word::fixnum_encode(0); 8]);

        let tcb = registry.register(&os, &config, &heap, TlsSeed::Template(&template), true).unwrap();
        let found = registry.find(tcb.thread_id).expect("registered thread should be found");
        assert!(Arc::ptr_eq(&found, &tcb));

        registry.unregister(&os, &tcb).unwrap();
        assert!(registry.find(tcb.thread_id).is_none());
    }

    #[test]
    fn non_initial_thread_inherits_creators_slots() {
        let os = HostOs::default();
        let config = test_config();
        let heap = Heap::reserve(&config, &os).unwrap();
        let registry = ThreadRegistry::new();
        let template = ThreadTemplate::new(vec![Word::fixnum_encode(7)]);

        let creator = registry.register(&os, &config, &heap, TlsSeed::Template(&template), true).unwrap();
        creator.tls.set(0, Word::fixnum_encode(99));

        let child = registry
            .register(&os, &config, &heap, TlsSeed::Creator(&creator), false)
            .unwrap();
        assert_eq!(child.tls.get(0).fixnum_decode(), 99);
    }

    #[test]
    fn registered_thread_gets_live_bump_allocation_regions() {
        let os = HostOs::default();
        let config = test_config();
        let heap = Heap::reserve(&config, &os).unwrap();
        let registry = ThreadRegistry::new();
        let template = ThreadTemplate::new(vec![Word::fixnum_encode(0); 8]);

        let tcb = registry.register(&os, &config, &heap, TlsSeed::Template(&template), true).unwrap();
        assert!(tcb.boxed_region.try_allocate(1).is_some());
        assert!(tcb.unboxed_region.try_allocate(1).is_some());
    }
}
