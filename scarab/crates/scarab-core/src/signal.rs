//! Signal and interrupt spine: blockable vs. always-through classification,
//! per-thread deferred-interrupt bookkeeping, pseudo-atomic windows, the
//! fake foreign-frame a deferred handler runs under, and the
//! stop-the-world coordinator used during collection. §4.7, §5.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lazy_static::lazy_static;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::arch::{ArchPort, SignalContext};
use crate::error::RuntimeError;
use crate::tag::Word;
use crate::thread::ThreadControlBlock;

/// Reserved thread-local slot a `FakeForeignFrame` binds to the synthetic
/// frame's control-stack address for the frame's duration, so nested
/// interrupt servicing can find its own enclosing frame without a separate
/// side channel.
pub const INTERRUPT_CONTEXT_TLS_INDEX: usize = 0;

lazy_static! {
    /// The always-through signal set named in §4.7: synchronous traps raised
    /// by the thread's own faulting instruction, which must run immediately
    /// no matter what state the thread is in because the trapping PC is the
    /// only sensible resume point. Everything else (job control, alarm,
    /// child, IO, user-defined, and the internal GC-stop signal) is
    /// blockable. Populated once, read on every signal arrival.
    static ref ALWAYS_THROUGH_SIGNALS: FxHashSet<i32> = {
        let mut set = FxHashSet::default();
        #[cfg(unix)]
        {
            set.insert(libc::SIGSEGV);
            set.insert(libc::SIGBUS);
            set.insert(libc::SIGILL);
            set.insert(libc::SIGFPE);
            set.insert(libc::SIGTRAP);
        }
        set
    };
}

/// Classify an OS signal number as blockable or always-through (§4.7).
pub fn classify_signal(signum: i32) -> SignalClass {
    if ALWAYS_THROUGH_SIGNALS.contains(&signum) {
        SignalClass::AlwaysThrough
    } else {
        SignalClass::Blockable
    }
}

/// Whether the OS is free to defer a signal of this kind until the
/// receiving thread leaves a pseudo-atomic window, or must deliver it
/// synchronously no matter what state the thread is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    /// Ordinary asynchronous signals: timer ticks, cancellation requests,
    /// GC-stop requests aimed at a peer thread.
    Blockable,
    /// Synchronous traps raised by the thread's own faulting instruction
    /// (an allocation trap, a type-check trap): these always run
    /// immediately, because the trapping instruction's own PC is the only
    /// sensible resume point and pseudo-atomic only protects asynchronous
    /// delivery.
    AlwaysThrough,
}

/// What a deferred signal does once it is finally serviced.
pub enum PendingHandler {
    /// A generic deferred signal whose real handler runs through the arch
    /// port's ordinary signal path once re-enabled.
    Deferred,
    /// The interrupt-thread cancellation mechanism (§5 "Cancellation and
    /// timeouts"): a one-shot callback invoked with the target thread's id.
    Cancellation(Box<dyn FnOnce(usize) + Send>),
}

/// One saved signal awaiting delivery: the handler to run, the signal
/// number, and the signal mask that was in effect when it arrived (so
/// delivery can restore it, matching sigprocmask semantics).
pub struct PendingSignal {
    pub handler: PendingHandler,
    pub signum: i32,
    pub saved_mask: u64,
}

/// Per-thread interrupt state: enabled/pending bits, the pseudo-atomic bit
/// pair, and the deferred-signal queue bounded by `max_nesting`
/// (`RuntimeConfig::max_interrupt_nesting`).
pub struct InterruptState {
    enabled: AtomicBool,
    in_pseudo_atomic: AtomicBool,
    pseudo_atomic_interrupted: AtomicBool,
    deferred: Mutex<Vec<PendingSignal>>,
    max_nesting: usize,
}

impl InterruptState {
    pub fn new(max_nesting: usize) -> Self {
        InterruptState {
            enabled: AtomicBool::new(true),
            in_pseudo_atomic: AtomicBool::new(false),
            pseudo_atomic_interrupted: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
            max_nesting,
        }
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_interrupts_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::Release);
    }

    /// Enter a pseudo-atomic window: while inside one, an async signal must
    /// be deferred rather than delivered, because the mutator may be
    /// mid-way through an operation (an allocation, a multi-word pointer
    /// update) that a GC observing half-finished state would corrupt.
    pub fn enter_pseudo_atomic(&self) {
        self.in_pseudo_atomic.store(true, Ordering::Release);
        self.pseudo_atomic_interrupted.store(false, Ordering::Release);
    }

    /// Leave a pseudo-atomic window. Returns `true` if a signal arrived
    /// while inside it and must now be serviced before the mutator
    /// proceeds -- the arch port sets `pseudo_atomic_interrupted` when it
    /// observes a signal land during the window (`ArchPort::pseudo_atomic_state`).
    pub fn leave_pseudo_atomic(&self) -> bool {
        self.in_pseudo_atomic.store(false, Ordering::Release);
        self.pseudo_atomic_interrupted.swap(false, Ordering::AcqRel)
    }

    pub fn in_pseudo_atomic(&self) -> bool {
        self.in_pseudo_atomic.load(Ordering::Acquire)
    }

    pub fn mark_pseudo_atomic_interrupted(&self) {
        self.pseudo_atomic_interrupted.store(true, Ordering::Release);
    }

    /// Decide whether `signal` must be delivered immediately or queued for
    /// later, and queue it when deferral applies. Exceeding `max_nesting`
    /// deferred records means the thread is not keeping up with its own
    /// signal load and the heap's invariants can no longer be trusted to
    /// hold by the time they would be serviced -- fatal, not recoverable.
    pub fn defer_or_deliver(&self, class: SignalClass, signal: PendingSignal) -> Result<DeliveryDecision, RuntimeError> {
        let must_defer = class == SignalClass::Blockable && (!self.interrupts_enabled() || self.in_pseudo_atomic());
        if !must_defer {
            return Ok(DeliveryDecision::DeliverNow(signal));
        }

        let mut queue = self.deferred.lock();
        if queue.len() >= self.max_nesting {
            crate::error::lose(format!(
                "deferred interrupt nesting exceeded max_interrupt_nesting ({})",
                self.max_nesting
            ));
        }
        queue.push(signal);
        if self.in_pseudo_atomic() {
            self.mark_pseudo_atomic_interrupted();
        }
        Ok(DeliveryDecision::Deferred)
    }

    /// Pop the oldest deferred signal (FIFO: signals are serviced in the
    /// order they arrived) for servicing once re-enabled.
    pub fn take_pending(&self) -> Option<PendingSignal> {
        let mut queue = self.deferred.lock();
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    pub fn pending_count(&self) -> usize {
        self.deferred.lock().len()
    }
}

pub enum DeliveryDecision {
    DeliverNow(PendingSignal),
    Deferred,
}

/// One saved register/PC snapshot for a signal context currently executing
/// under a `FakeForeignFrame`, pushed onto the owning thread's
/// `interrupt_contexts` stack for the frame's duration.
pub struct SavedInterruptContext {
    pub registers: Vec<usize>,
    pub pc: usize,
}

/// A synthetic stack frame wrapped around deferred-signal servicing so a
/// debugger/unwinder walking the control stack sees a recognizable
/// transition point between Lisp frames and the runtime's own signal-
/// handling code, rather than an opaque jump. Constructed on entry to a
/// deferred handler: bumps the owning thread's control stack, records the
/// interrupted context, and binds `INTERRUPT_CONTEXT_TLS_INDEX` to the new
/// frame's address. `Drop` reverses all three in the opposite order.
pub struct FakeForeignFrame<'a> {
    tcb: &'a ThreadControlBlock,
    binding_mark: usize,
}

impl<'a> FakeForeignFrame<'a> {
    pub fn enter(arch: &dyn ArchPort, tcb: &'a ThreadControlBlock, ctx: &SignalContext) -> Self {
        let pc = arch.read_pc(ctx);
        let frame_addr = tcb.push_control_stack_word(pc);
        tcb.interrupt_contexts
            .lock()
            .push(SavedInterruptContext { registers: ctx.registers.to_vec(), pc });

        let mut bindings = tcb.bindings.lock();
        let binding_mark = bindings.mark();
        bindings.bind(&tcb.tls, INTERRUPT_CONTEXT_TLS_INDEX, Word::new(frame_addr));
        drop(bindings);

        FakeForeignFrame { tcb, binding_mark }
    }

    pub fn saved_pc(&self) -> usize {
        self.tcb
            .interrupt_contexts
            .lock()
            .last()
            .map(|saved| saved.pc)
            .unwrap_or(0)
    }
}

impl<'a> Drop for FakeForeignFrame<'a> {
    fn drop(&mut self) {
        self.tcb.bindings.lock().unbind_to(&self.tcb.tls, self.binding_mark);
        self.tcb.interrupt_contexts.lock().pop();
        self.tcb.pop_control_stack_word();
    }
}

/// Stop-the-world coordination, grounded in the same poll-and-park shape
/// the teacher's concurrent marker uses for safepoints, adapted to this
/// runtime's signal-based model: the requester raises `requested`, every
/// registered peer thread notices it at its own next poll point (a signal
/// handler, an allocation slow path, a pseudo-atomic exit) and calls
/// `park`, and the requester's collection proceeds once every participant
/// has checked in.
pub struct StopTheWorld {
    requested: AtomicBool,
    parked: AtomicUsize,
    participants: AtomicUsize,
}

impl StopTheWorld {
    pub fn new() -> Self {
        StopTheWorld {
            requested: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
            participants: AtomicUsize::new(0),
        }
    }

    pub fn set_participants(&self, count: usize) {
        self.participants.store(count, Ordering::Release);
    }

    pub fn should_park(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Step 1: the requester (the thread about to collect) raises the flag
    /// every peer polls.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Step 2/3: a peer thread, having noticed `should_park`, checks in and
    /// blocks until the episode ends.
    pub fn park(&self) {
        self.parked.fetch_add(1, Ordering::SeqCst);
        while self.requested.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }

    /// Step 3: the requester waits until every participant has checked in.
    pub fn wait_for_all_parked(&self) {
        while self.parked.load(Ordering::Acquire) < self.participants.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    }

    /// Step 4: release every parked peer once the collection finishes.
    pub fn resume(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

impl Default for StopTheWorld {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn memory_fault_is_always_through() {
        assert_eq!(classify_signal(libc::SIGSEGV), SignalClass::AlwaysThrough);
    }

    #[cfg(unix)]
    #[test]
    fn alarm_is_blockable() {
        assert_eq!(classify_signal(libc::SIGALRM), SignalClass::Blockable);
    }

    #[test]
    fn signal_is_deferred_inside_pseudo_atomic() {
        let state = InterruptState::new(4);
        state.enter_pseudo_atomic();
        let signal = PendingSignal { handler: PendingHandler::Deferred, signum: 2, saved_mask: 0 };
        let decision = state.defer_or_deliver(SignalClass::Blockable, signal).unwrap();
        assert!(matches!(decision, DeliveryDecision::Deferred));
        assert!(state.leave_pseudo_atomic());
        assert_eq!(state.pending_count(), 1);
    }

    #[test]
    fn always_through_signal_is_never_deferred() {
        let state = InterruptState::new(4);
        state.enter_pseudo_atomic();
        let signal = PendingSignal { handler: PendingHandler::Deferred, signum: 11, saved_mask: 0 };
        let decision = state.defer_or_deliver(SignalClass::AlwaysThrough, signal).unwrap();
        assert!(matches!(decision, DeliveryDecision::DeliverNow(_)));
        assert_eq!(state.pending_count(), 0);
    }

    #[test]
    fn deferred_queue_is_fifo() {
        let state = InterruptState::new(4);
        state.enter_pseudo_atomic();
        for signum in [1, 2, 3] {
            let signal = PendingSignal { handler: PendingHandler::Deferred, signum, saved_mask: 0 };
            state.defer_or_deliver(SignalClass::Blockable, signal).unwrap();
        }
        assert_eq!(state.take_pending().unwrap().signum, 1);
        assert_eq!(state.take_pending().unwrap().signum, 2);
    }

    fn test_tcb() -> (crate::heap::Heap, crate::thread::ThreadRegistry, std::sync::Arc<ThreadControlBlock>) {
        use crate::config::RuntimeConfig;
        use crate::os::HostOs;
        use crate::thread::{ThreadRegistry, ThreadTemplate, TlsSeed};

        let os = HostOs::default();
        let config = RuntimeConfig {
            control_stack_size: 64 * 1024,
            binding_stack_size: 16 * 1024,
            alien_stack_size: 16 * 1024,
            thread_local_values_size: 4096,
            dynamic_space_size: 64 * 1024,
            read_only_space_size: 4096,
            static_space_size: 4096,
            ..Default::default()
        };
        let heap = crate::heap::Heap::reserve(&config, &os).unwrap();
        let registry = ThreadRegistry::new();
        let template = ThreadTemplate::new(vec![Word::new(0); 8]);
        let tcb = registry
            .register(&os, &config, &heap, TlsSeed::Template(&template), true)
            .unwrap();
        (heap, registry, tcb)
    }

    #[test]
    fn fake_foreign_frame_records_and_unwinds_interrupt_context() {
        let (_heap, _registry, tcb) = test_tcb();
        let arch = crate::arch::HostArch::default();
        let mut ctx = SignalContext::synthetic();
        ctx.program_counter = 0xdead_beef;

        let before_cursor = tcb.control_stack_pointer.load(Ordering::Acquire);
        {
            let frame = FakeForeignFrame::enter(&arch, &tcb, &ctx);
            assert_eq!(frame.saved_pc(), 0xdead_beef);
            assert_eq!(tcb.interrupt_contexts.lock().len(), 1);
            assert_eq!(tcb.tls.get(INTERRUPT_CONTEXT_TLS_INDEX).as_usize(), before_cursor);
        }
        assert_eq!(tcb.interrupt_contexts.lock().len(), 0);
        assert_eq!(tcb.control_stack_pointer.load(Ordering::Acquire), before_cursor);
    }

    #[test]
    fn stop_the_world_waits_for_every_participant() {
        let coordinator = StopTheWorld::new();
        coordinator.set_participants(2);
        coordinator.request();
        assert!(coordinator.should_park());
        coordinator.parked.fetch_add(2, Ordering::SeqCst);
        coordinator.wait_for_all_parked();
        coordinator.resume();
        assert!(!coordinator.should_park());
    }
}
