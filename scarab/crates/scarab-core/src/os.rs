//! OS port: the operations the core needs from the host operating system.
//!
//! Kept as a trait so the address-range arithmetic in `heap`/`validate`
//! never touches a raw syscall directly, and so a non-unix host can supply
//! its own implementation without the rest of the crate noticing.

use crate::error::{Result, RuntimeError};

/// A virtual memory range reserved (and possibly committed) from the OS.
#[derive(Debug)]
pub struct MappedRegion {
    pub base: usize,
    pub length: usize,
}

/// Page protection flags, expressed independently of the host's own
/// `PROT_*`/`PAGE_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Protection {
    pub const NONE: Protection = Protection { read: false, write: false, exec: false };
    pub const READ_WRITE: Protection = Protection { read: true, write: true, exec: false };
    pub const READ_ONLY: Protection = Protection { read: true, write: false, exec: false };
    pub const READ_EXEC: Protection = Protection { read: true, write: false, exec: true };
}

/// Operations the core needs from the host OS. §6 "OS interface".
pub trait OsPort: Send + Sync {
    /// Reserve (and commit) `length` bytes, preferring `hint` as the base
    /// address. The four fixed regions (read-only, static, dynamic x2,
    /// per-thread stacks) all go through this call.
    fn reserve(&self, hint: usize, length: usize) -> Result<MappedRegion>;

    /// Release a previously reserved region.
    fn release(&self, region: &MappedRegion) -> Result<()>;

    /// Change the protection of an already-reserved range.
    fn protect(&self, base: usize, length: usize, prot: Protection) -> Result<()>;

    /// Test-and-set a spinlock word; returns the previous value. A return
    /// of 0 means the lock was acquired.
    fn test_and_set(&self, lock: &std::sync::atomic::AtomicUsize, holder: usize) -> usize;

    /// Release a spinlock acquired via `test_and_set`.
    fn spinlock_release(&self, lock: &std::sync::atomic::AtomicUsize) {
        lock.store(0, std::sync::atomic::Ordering::Release);
    }

    /// Identifier for the calling OS thread, used as the spinlock holder id
    /// for deadlock diagnostics and as the thread registry's key.
    fn current_thread_id(&self) -> usize;

    /// Install a handler for `signum`, blocking every signal in
    /// `blocked_mask` for the handler's duration and, if `use_altstack` is
    /// set, running it on the thread's alternate signal stack (§6 "install
    /// signal handlers with blockable mask + altstack").
    fn install_signal_handler(
        &self,
        signum: i32,
        handler: extern "C" fn(i32),
        blocked_mask: &[i32],
        use_altstack: bool,
    ) -> Result<()>;

    /// Create a new OS thread sharing this process's address space and file
    /// descriptors, running `entry` to completion (§6 "create threads
    /// sharing address space").
    fn create_thread(&self, entry: Box<dyn FnOnce() + Send + 'static>) -> Result<()>;
}

#[cfg(unix)]
pub struct HostOs;

#[cfg(unix)]
impl Default for HostOs {
    fn default() -> Self {
        HostOs
    }
}

#[cfg(unix)]
impl OsPort for HostOs {
    fn reserve(&self, hint: usize, length: usize) -> Result<MappedRegion> {
        use std::ptr;
        let aligned = (length + page_size::get() - 1) & !(page_size::get() - 1);
        let addr = hint as *mut libc::c_void;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | if hint != 0 { libc::MAP_FIXED } else { 0 };
        let ptr = unsafe {
            libc::mmap(
                if hint != 0 { addr } else { ptr::null_mut() },
                aligned,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RuntimeError::ReservationFailed {
                address: hint,
                length: aligned,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(MappedRegion { base: ptr as usize, length: aligned })
    }

    fn release(&self, region: &MappedRegion) -> Result<()> {
        let rc = unsafe { libc::munmap(region.base as *mut libc::c_void, region.length) };
        if rc != 0 {
            return Err(RuntimeError::ReservationFailed {
                address: region.base,
                length: region.length,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    fn protect(&self, base: usize, length: usize, prot: Protection) -> Result<()> {
        let mut flags = 0;
        if prot.read {
            flags |= libc::PROT_READ;
        }
        if prot.write {
            flags |= libc::PROT_WRITE;
        }
        if prot.exec {
            flags |= libc::PROT_EXEC;
        }
        let rc = unsafe { libc::mprotect(base as *mut libc::c_void, length, flags) };
        if rc != 0 {
            return Err(RuntimeError::ReservationFailed {
                address: base,
                length,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    fn test_and_set(&self, lock: &std::sync::atomic::AtomicUsize, holder: usize) -> usize {
        lock.compare_exchange(
            0,
            holder,
            std::sync::atomic::Ordering::AcqRel,
            std::sync::atomic::Ordering::Acquire,
        )
        .unwrap_or_else(|prev| prev)
    }

    fn current_thread_id(&self) -> usize {
        unsafe { libc::pthread_self() as usize }
    }

    fn install_signal_handler(
        &self,
        signum: i32,
        handler: extern "C" fn(i32),
        blocked_mask: &[i32],
        use_altstack: bool,
    ) -> Result<()> {
        unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            for &blocked in blocked_mask {
                libc::sigaddset(&mut mask, blocked);
            }
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            action.sa_mask = mask;
            action.sa_flags = if use_altstack { libc::SA_ONSTACK } else { 0 };
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(RuntimeError::SignalSetup(std::io::Error::last_os_error().to_string()));
            }
        }
        Ok(())
    }

    fn create_thread(&self, entry: Box<dyn FnOnce() + Send + 'static>) -> Result<()> {
        std::thread::Builder::new()
            .spawn(entry)
            .map(|_| ())
            .map_err(|e| RuntimeError::ThreadRegistry(e.to_string()))
    }
}

#[cfg(not(unix))]
pub struct HostOs;

#[cfg(not(unix))]
impl Default for HostOs {
    fn default() -> Self {
        HostOs
    }
}

#[cfg(not(unix))]
impl OsPort for HostOs {
    fn reserve(&self, hint: usize, length: usize) -> Result<MappedRegion> {
        let _ = hint;
        // Host-agnostic fallback: a plain heap buffer, leaked so the
        // address stays stable for the process lifetime. Fine for tests;
        // a real non-unix port would call VirtualAlloc here.
        let mut buf = vec![0u8; length].into_boxed_slice();
        let base = buf.as_mut_ptr() as usize;
        std::mem::forget(buf);
        Ok(MappedRegion { base, length })
    }

    fn release(&self, _region: &MappedRegion) -> Result<()> {
        Ok(())
    }

    fn protect(&self, _base: usize, _length: usize, _prot: Protection) -> Result<()> {
        Ok(())
    }

    fn test_and_set(&self, lock: &std::sync::atomic::AtomicUsize, holder: usize) -> usize {
        lock.compare_exchange(
            0,
            holder,
            std::sync::atomic::Ordering::AcqRel,
            std::sync::atomic::Ordering::Acquire,
        )
        .unwrap_or_else(|prev| prev)
    }

    fn current_thread_id(&self) -> usize {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        thread_local! {
            static ID: usize = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        ID.with(|id| *id)
    }

    fn install_signal_handler(
        &self,
        _signum: i32,
        _handler: extern "C" fn(i32),
        _blocked_mask: &[i32],
        _use_altstack: bool,
    ) -> Result<()> {
        // No host signal API on this fallback target; same no-op posture as
        // `protect`/`release` above.
        Ok(())
    }

    fn create_thread(&self, entry: Box<dyn FnOnce() + Send + 'static>) -> Result<()> {
        std::thread::Builder::new()
            .spawn(entry)
            .map(|_| ())
            .map_err(|e| RuntimeError::ThreadRegistry(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_roundtrip() {
        let os = HostOs::default();
        let region = os.reserve(0, 4096).expect("reserve");
        assert!(region.length >= 4096);
        os.release(&region).expect("release");
    }

    #[test]
    fn test_and_set_is_mutually_exclusive() {
        let os = HostOs::default();
        let lock = std::sync::atomic::AtomicUsize::new(0);
        assert_eq!(os.test_and_set(&lock, 11), 0);
        assert_eq!(os.test_and_set(&lock, 22), 11);
        os.spinlock_release(&lock);
        assert_eq!(os.test_and_set(&lock, 33), 0);
    }
}
