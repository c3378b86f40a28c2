//! C ABI surface: the functions an embedding `main` (or a foreign language's
//! own startup code) links against to bring a `scarab_core::Runtime` up,
//! load an image, run a collection, and tear down. Mirrors the teacher's
//! `fax_gc_*` extern "C" wrapper around its own `Runtime`, generalized to
//! this runtime's image-loading and purify entry points.

use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use scarab_core::arch::HostArch;
use scarab_core::config::RuntimeConfig;
use scarab_core::os::HostOs;
use scarab_core::Runtime;

use crate::loader::FileCoreLoader;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

fn runtime() -> Option<&'static Runtime> {
    RUNTIME.get()
}

/// Bring up a runtime sized from `SCARAB_*` environment variables. Safe to
/// call more than once; every call after the first is a no-op that reports
/// success, matching the teacher's idempotent `fax_gc_init`.
#[no_mangle]
pub extern "C" fn scarab_runtime_init() -> bool {
    if INITIALIZED.load(Ordering::SeqCst) {
        return true;
    }

    let config = RuntimeConfig::from_env();
    match Runtime::new(config, Arc::new(HostOs::default()), Arc::new(HostArch::default())) {
        Ok(rt) => {
            let _ = RUNTIME.set(rt);
            INITIALIZED.store(true, Ordering::SeqCst);
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to construct runtime");
            false
        }
    }
}

/// Load a core image from `path` (a NUL-terminated C string) and register
/// the initial thread. Returns the initial callable's raw tagged word, or
/// `0` on any failure (`0` is never a valid tagged reference: address zero
/// with any lowtag is either `NIL` or an impossible unaligned pointer).
///
/// # Safety
/// `path` must be a valid, NUL-terminated C string for the duration of this
/// call.
#[no_mangle]
pub unsafe extern "C" fn scarab_runtime_load_image(path: *const c_char) -> usize {
    let Some(rt) = runtime() else {
        tracing::error!("scarab_runtime_load_image called before scarab_runtime_init");
        return 0;
    };
    if path.is_null() {
        return 0;
    }
    let path = match CStr::from_ptr(path).to_str() {
        Ok(s) => s,
        Err(_) => return 0,
    };

    let loader = match FileCoreLoader::open(path) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "failed to open core file");
            return 0;
        }
    };

    match rt.load_image(&loader) {
        Ok(initial_callable) => {
            if let Err(e) = rt.register_initial_thread() {
                tracing::error!(error = %e, "failed to register initial thread");
                return 0;
            }
            initial_callable.as_usize()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to load core image");
            0
        }
    }
}

/// Request a stop-the-world collection with no roots beyond whatever the
/// embedding has already registered via `scarab_runtime_register_thread`.
/// An embedder that tracks its own precise/conservative root ranges should
/// link against `scarab-core` directly and call `Runtime::collect` instead;
/// this entry point exists for the common case of a foreign caller that
/// only wants "collect now" with the roots the initial thread already owns.
#[no_mangle]
pub extern "C" fn scarab_runtime_collect() {
    if let Some(rt) = runtime() {
        let _ = rt.collect(&[], &[]);
    }
}

/// Report how many collection cycles have run so far.
#[no_mangle]
pub extern "C" fn scarab_runtime_gc_cycle_count() -> u64 {
    runtime().map(|rt| rt.gc_cycle_count()).unwrap_or(0)
}

/// Run a purify pass with no roots beyond whatever the embedding has already
/// registered, mirroring `scarab_runtime_collect`'s "collect now, with the
/// roots already on hand" shape. Returns `true` on success, `false` if no
/// runtime is initialized or if purify refused because some thread still has
/// an active interrupt context (§4.6 failure mode) -- the caller is expected
/// to retry later rather than treat a refusal as fatal.
#[no_mangle]
pub extern "C" fn scarab_runtime_purify() -> bool {
    let Some(rt) = runtime() else { return false };
    match rt.purify(&[], &[], 0) {
        Ok(_) => true,
        Err(refused) => {
            tracing::warn!(
                active_interrupt_contexts = refused.active_interrupt_contexts,
                "purify refused"
            );
            false
        }
    }
}

/// Tear down process-wide state. After this call `scarab_runtime_init` may
/// be invoked again to start a fresh runtime (the `OnceLock` itself is never
/// reset, matching the teacher's single-process-lifetime assumption -- a
/// second `init` after `shutdown` reports success without reconstructing
/// anything, since the original instance is still valid and idle).
#[no_mangle]
pub extern "C" fn scarab_runtime_shutdown() {
    INITIALIZED.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_without_image_reports_zero_cycles() {
        assert!(scarab_runtime_init());
        assert_eq!(scarab_runtime_gc_cycle_count(), 0);
        scarab_runtime_shutdown();
    }

    #[test]
    fn purify_with_no_roots_succeeds_on_an_empty_heap() {
        assert!(scarab_runtime_init());
        assert!(scarab_runtime_purify());
        scarab_runtime_shutdown();
    }
}
