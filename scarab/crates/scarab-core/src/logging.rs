//! Structured event vocabulary for the runtime's lifecycle, built on
//! `tracing` spans rather than a bespoke sink type. Every caller that wants
//! to observe a GC cycle, a stop-the-world episode, a purify pass, or
//! thread lifecycle events attaches a `tracing_subscriber` layer; this
//! module only names the spans and fields, it never decides how they are
//! rendered.

use tracing::{info_span, Span};

/// One span covering a full collection cycle, from root scan through
/// semispace flip.
pub fn gc_cycle_span(cycle: u64, trigger_bytes: usize) -> Span {
    info_span!("gc_cycle", cycle, trigger_bytes)
}

/// One span covering the interval every mutator thread is parked while the
/// collector runs.
pub fn stop_the_world_span(cycle: u64, thread_count: usize) -> Span {
    info_span!("stop_the_world", cycle, thread_count)
}

/// One span covering a purify pass.
pub fn purify_span(read_only_before: usize, static_before: usize) -> Span {
    info_span!("purify", read_only_before, static_before)
}

/// One span covering a thread's registration with the thread registry, from
/// `ThreadRegistry::register` to `ThreadRegistry::unregister`.
pub fn thread_lifecycle_span(thread_id: usize, initial: bool) -> Span {
    info_span!("thread_lifecycle", thread_id, initial)
}

/// Record the outcome of a finished GC cycle on the currently entered
/// `gc_cycle_span`.
pub fn record_gc_outcome(bytes_copied: usize, weak_seen: usize, weak_broken: usize) {
    tracing::info!(bytes_copied, weak_seen, weak_broken, "gc cycle finished");
}
