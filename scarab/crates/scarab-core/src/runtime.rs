//! The runtime context: the single value that owns every piece of
//! process-wide mutable state named in §4 and §5 (the heap, the dispatch
//! tables, the thread registry, the stop-the-world coordinator) instead of
//! scattering it across file-scope statics (§9 "Global mutable state").
//!
//! Grounded in the teacher's `GarbageCollector` orchestrator
//! (`gc.rs`: heap + marker + relocator + stats + config, one struct threaded
//! through every public entry point) and its `RuntimeInitializer`
//! (`runtime/init.rs`: validate config, construct, start, guard against
//! double-init) — this module plays both roles for the semispace collector
//! and signal spine instead of a concurrent mark-compact cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::arch::ArchPort;
use crate::config::RuntimeConfig;
use crate::dispatch::DispatchTables;
use crate::error::{Result, RuntimeError};
use crate::gc::{Collector, CollectionStats, ConservativeRoot, PreciseRoot};
use crate::heap::Heap;
use crate::image::CoreLoader;
use crate::os::OsPort;
use crate::purify::{PurifyRefused, PurifyStats, Purifier};
use crate::signal::StopTheWorld;
use crate::tag::Word;
use crate::thread::{ThreadControlBlock, ThreadRegistry, ThreadTemplate, TlsSeed};

/// Everything a running instance of this language needs that is genuinely
/// process-wide: the heap, the three dispatch tables, the thread registry,
/// and the stop-the-world coordinator. Constructed once in `Runtime::new`
/// and handed to the initial callable; every subsequent thread and every
/// collection cycle borrows it rather than touching scattered globals.
pub struct Runtime {
    pub heap: Heap,
    pub dispatch: DispatchTables,
    pub threads: ThreadRegistry,
    pub stop_the_world: StopTheWorld,
    pub config: RuntimeConfig,
    os: Arc<dyn OsPort>,
    arch: Arc<dyn ArchPort>,
    gc_cycle: AtomicU64,
    thread_template: ThreadTemplate,
}

impl Runtime {
    /// Validate `config`, reserve the four fixed address ranges, and
    /// populate the dispatch tables. Mirrors the teacher's
    /// `RuntimeInitializer::initialize` sequence (validate → construct →
    /// start) collapsed into one call, since this runtime has no separate
    /// "start" phase distinct from constructing the heap.
    pub fn new(config: RuntimeConfig, os: Arc<dyn OsPort>, arch: Arc<dyn ArchPort>) -> Result<Runtime> {
        config.validate().map_err(|e| RuntimeError::Configuration(e.to_string()))?;

        let heap = Heap::reserve(&config, os.as_ref())?;
        let dispatch = DispatchTables::new();

        Ok(Runtime {
            heap,
            dispatch,
            threads: ThreadRegistry::new(),
            stop_the_world: StopTheWorld::new(),
            config,
            os,
            arch,
            gc_cycle: AtomicU64::new(0),
            thread_template: ThreadTemplate::new(Vec::new()),
        })
    }

    /// Load a core image: verify its build id, map each directory entry
    /// into the region this runtime already reserved for that kind, and
    /// return the initial callable. §6 "Image file format".
    pub fn load_image(&self, loader: &dyn CoreLoader) -> Result<Word> {
        let header = loader.read_header()?;
        header.check_build_id()?;

        for entry in &header.directory {
            let dest_base = match entry.identifier {
                crate::image::RegionKind::ReadOnly => self.heap.read_only.base(),
                crate::image::RegionKind::Static => self.heap.static_space.base(),
                crate::image::RegionKind::Dynamic => self.heap.from_space().base(),
            };
            loader.map_entry(entry, dest_base)?;
        }

        Ok(header.initial_callable)
    }

    /// Register the process's first thread: it runs the loaded image's
    /// initial callable directly rather than cloning, and seeds its
    /// thread-local slots from the global template (§4.9 "Initial thread").
    pub fn register_initial_thread(&self) -> Result<Arc<ThreadControlBlock>> {
        let tcb = self.threads.register(
            self.os.as_ref(),
            &self.config,
            &self.heap,
            TlsSeed::Template(&self.thread_template),
            true,
        )?;
        self.stop_the_world.set_participants(self.threads.len());
        Ok(tcb)
    }

    /// Register a non-initial thread, inheriting thread-local defaults from
    /// its creator's already-populated slot array (§4.9 "Non-initial
    /// thread").
    pub fn register_thread(&self, creator: &ThreadControlBlock) -> Result<Arc<ThreadControlBlock>> {
        let tcb = self
            .threads
            .register(self.os.as_ref(), &self.config, &self.heap, TlsSeed::Creator(creator), false)?;
        self.stop_the_world.set_participants(self.threads.len());
        Ok(tcb)
    }

    pub fn unregister_thread(&self, tcb: &Arc<ThreadControlBlock>) -> Result<()> {
        self.threads.unregister(self.os.as_ref(), tcb)?;
        self.stop_the_world.set_participants(self.threads.len());
        Ok(())
    }

    /// Create a non-initial thread for real: spawn an OS thread that
    /// registers itself (inheriting `creator`'s thread-local defaults),
    /// runs `entry`, then unregisters (§4.9 "Non-initial thread": clone
    /// with shared address space, register, run, destroy).
    ///
    /// Requires `&'static self` because the spawned thread's closure must
    /// outlive the call that created it; every real embedding of this type
    /// (e.g. `scarab-runtime`'s `ffi.rs`, which holds its `Runtime` in a
    /// `OnceLock`) already produces exactly that kind of `'static`
    /// reference, so this is not a hypothetical constraint.
    pub fn spawn_thread(
        &'static self,
        creator: Arc<ThreadControlBlock>,
        entry: impl FnOnce(Arc<ThreadControlBlock>) + Send + 'static,
    ) -> Result<()> {
        self.os.create_thread(Box::new(move || {
            let tcb = match self.register_thread(&creator) {
                Ok(tcb) => tcb,
                Err(e) => {
                    tracing::error!(error = %e, "non-initial thread failed to register");
                    return;
                }
            };
            entry(Arc::clone(&tcb));
            if let Err(e) = self.unregister_thread(&tcb) {
                tracing::error!(error = %e, "non-initial thread failed to unregister");
            }
        }))
    }

    pub fn gc_cycle_count(&self) -> u64 {
        self.gc_cycle.load(Ordering::Acquire)
    }

    /// Run one stop-the-world collection: request every peer park, wait for
    /// them to check in, scavenge the given roots, then resume every peer.
    /// The caller (the thread whose allocation crossed the trigger, or a
    /// thread servicing an explicit GC request) is the sole collector for
    /// the cycle's duration (§4.7 "Stop-the-world", §5 "Scheduling model").
    pub fn collect(&self, precise_roots: &[PreciseRoot], conservative_roots: &[ConservativeRoot]) -> CollectionStats {
        let cycle = self.gc_cycle.fetch_add(1, Ordering::AcqRel) + 1;
        let _span = crate::logging::gc_cycle_span(cycle, self.config.gc_trigger_bytes).entered();

        {
            let _stw_span = crate::logging::stop_the_world_span(cycle, self.threads.len()).entered();
            self.stop_the_world.request();
            self.stop_the_world.wait_for_all_parked();
        }

        let collector = Collector::new(&self.heap, &self.dispatch, self.arch.as_ref(), self.config.root_scan_mode);
        let stats = collector.collect(precise_roots, conservative_roots);

        self.stop_the_world.resume();
        crate::logging::record_gc_outcome(stats.bytes_copied, stats.weak_pointers_seen, stats.weak_pointers_broken);
        stats
    }

    /// Run one purify pass, refusing (not `lose`-ing) if any thread is
    /// currently inside a fake foreign frame (§4.6 failure mode).
    pub fn purify(
        &self,
        static_roots: &[usize],
        read_only_roots: &[usize],
        active_interrupt_contexts: usize,
    ) -> std::result::Result<PurifyStats, PurifyRefused> {
        let purifier = Purifier::new(&self.heap, self.arch.as_ref());
        purifier.run(static_roots, read_only_roots, active_interrupt_contexts)
    }

    pub fn arch(&self) -> &dyn ArchPort {
        self.arch.as_ref()
    }

    pub fn os(&self) -> &dyn OsPort {
        self.os.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::HostArch;
    use crate::os::HostOs;

    fn test_runtime() -> Runtime {
        let config = RuntimeConfig {
            dynamic_space_size: 64 * 1024,
            read_only_space_size: 8192,
            static_space_size: 8192,
            control_stack_size: 64 * 1024,
            binding_stack_size: 16 * 1024,
            alien_stack_size: 16 * 1024,
            thread_local_values_size: 4096,
            ..Default::default()
        };
        Runtime::new(config, Arc::new(HostOs::default()), Arc::new(HostArch::default())).unwrap()
    }

    #[test]
    fn new_populates_dispatch_and_heap() {
        let rt = test_runtime();
        assert_ne!(rt.heap.from_space().base(), rt.heap.to_space().base());
    }

    #[test]
    fn register_and_unregister_initial_thread() {
        let rt = test_runtime();
        let tcb = rt.register_initial_thread().unwrap();
        assert_eq!(rt.threads.len(), 1);
        rt.unregister_thread(&tcb).unwrap();
        assert_eq!(rt.threads.len(), 0);
    }

    #[test]
    fn spawn_thread_registers_runs_entry_and_unregisters() {
        let rt: &'static Runtime = Box::leak(Box::new(test_runtime()));
        let creator = rt.register_initial_thread().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        rt.spawn_thread(Arc::clone(&creator), move |child| {
            tx.send(child.thread_id).unwrap();
        })
        .unwrap();

        let child_id = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_ne!(child_id, creator.thread_id);
        // give the spawned thread a moment to reach `unregister_thread`
        while rt.threads.len() > 1 {
            std::thread::yield_now();
        }
        assert_eq!(rt.threads.len(), 1);
    }

    #[test]
    fn collect_runs_without_participants() {
        let rt = test_runtime();
        let stats = rt.collect(&[], &[]);
        assert_eq!(stats.weak_pointers_seen, 0);
        assert_eq!(rt.gc_cycle_count(), 1);
    }
}
