//! Configuration Module - Runtime Tuning Parameters
//!
//! Sizes and limits for the four fixed address ranges, the interrupt
//! nesting bound, and the root-scan strategy. Most fields have sensible
//! defaults sized for unit tests rather than production workloads; override
//! with `RuntimeConfig::from_env` or by constructing the struct directly.

use thiserror::Error;

/// How the root scanner treats a stack word that isn't known-precise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootScanMode {
    /// Accept any word whose value plausibly points to a valid object start
    /// in dynamic space, validated by widetag-specific sanity checks.
    Conservative,
    /// Scan only statically known pointer slots.
    Precise,
}

/// Runtime-wide configuration.
///
/// # Examples
///
/// ```rust
/// use scarab_core::RuntimeConfig;
///
/// let config = RuntimeConfig::default();
/// let low_latency = RuntimeConfig {
///     max_interrupt_nesting: 64,
///     ..Default::default()
/// };
/// assert!(low_latency.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Size of the read-only space, in bytes. Grows only during purify.
    pub read_only_space_size: usize,

    /// Size of the static space, in bytes. Grows only during purify.
    pub static_space_size: usize,

    /// Size of one dynamic-space semispace, in bytes (the collector
    /// reserves two of these, from-space and to-space).
    pub dynamic_space_size: usize,

    /// Control-stack size per thread, in bytes.
    pub control_stack_size: usize,

    /// Binding-stack size per thread, in bytes.
    pub binding_stack_size: usize,

    /// Alien (foreign) stack size per thread, in bytes.
    pub alien_stack_size: usize,

    /// Size of the per-thread thread-local slot array, in bytes
    /// (`dynamic_values_bytes` in the source material).
    pub thread_local_values_size: usize,

    /// Bytes allocated since the last collection that trigger the next
    /// one.
    pub gc_trigger_bytes: usize,

    /// Maximum nesting depth of deferred pending-signal records per
    /// thread before a `lose`. Matches the original's `MAX_INTERRUPTS`.
    pub max_interrupt_nesting: usize,

    /// Root-scanning strategy.
    pub root_scan_mode: RootScanMode,

    /// Emit a `tracing` span around each GC cycle, stop-the-world episode,
    /// and purify pass.
    pub trace_gc_events: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            read_only_space_size: 4 * 1024 * 1024,
            static_space_size: 4 * 1024 * 1024,
            dynamic_space_size: 16 * 1024 * 1024,
            control_stack_size: 1024 * 1024,
            binding_stack_size: 256 * 1024,
            alien_stack_size: 128 * 1024,
            thread_local_values_size: 64 * 1024,
            gc_trigger_bytes: 8 * 1024 * 1024,
            max_interrupt_nesting: 4096,
            root_scan_mode: RootScanMode::Conservative,
            trace_gc_events: true,
        }
    }
}

impl RuntimeConfig {
    /// Validate internal consistency. Called once by `Runtime::new` before
    /// any address range is reserved.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dynamic_space_size == 0 {
            return Err(ConfigError::InvalidSize("dynamic_space_size must be nonzero"));
        }
        if self.gc_trigger_bytes == 0 || self.gc_trigger_bytes > self.dynamic_space_size {
            return Err(ConfigError::InvalidSize(
                "gc_trigger_bytes must be nonzero and not exceed dynamic_space_size",
            ));
        }
        if self.max_interrupt_nesting == 0 {
            return Err(ConfigError::InvalidSize("max_interrupt_nesting must be nonzero"));
        }
        if self.control_stack_size < page_size::get() {
            return Err(ConfigError::InvalidSize("control_stack_size smaller than a page"));
        }
        Ok(())
    }

    /// Build a configuration from `SCARAB_*` environment variables, falling
    /// back to `Default::default()` for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SCARAB_DYNAMIC_SPACE_MB") {
            if let Ok(mb) = val.parse::<usize>() {
                config.dynamic_space_size = mb * 1024 * 1024;
            }
        }
        if let Ok(val) = std::env::var("SCARAB_GC_TRIGGER_MB") {
            if let Ok(mb) = val.parse::<usize>() {
                config.gc_trigger_bytes = mb * 1024 * 1024;
            }
        }
        if let Ok(val) = std::env::var("SCARAB_MAX_INTERRUPT_NESTING") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_interrupt_nesting = n;
            }
        }
        if let Ok(val) = std::env::var("SCARAB_ROOT_SCAN") {
            config.root_scan_mode = match val.as_str() {
                "precise" => RootScanMode::Precise,
                _ => RootScanMode::Conservative,
            };
        }
        if let Ok(val) = std::env::var("SCARAB_TRACE_GC") {
            config.trace_gc_events = val != "0";
        }

        config
    }

    /// Total bytes this configuration will reserve, across both dynamic
    /// semispaces and the three other fixed regions (not counting per-thread
    /// stacks, which scale with thread count).
    pub fn reserved_bytes(&self) -> usize {
        self.read_only_space_size + self.static_space_size + 2 * self.dynamic_space_size
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidSize(&'static str),
}
