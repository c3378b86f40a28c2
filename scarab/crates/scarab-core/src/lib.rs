//! scarab-core: a tagged-pointer managed heap with a precise copying
//! garbage collector, and the signal-based coordination that makes it safe
//! under multi-threading and user interrupts.
//!
//! This crate is the core of a high-level-language runtime and nothing
//! else: it consumes an already-validated heap image (§6 [`image`]) and a
//! pointer to an initial callable, then provides the primitives ([`tag`],
//! [`widetag`], [`dispatch`], [`gc`], [`purify`]) an embedding `main` drives
//! to allocate, collect, and promote objects. Bytecode/native code
//! generation, the image loader's on-disk format, and any command-line
//! front end live outside this crate.

pub mod arch;
pub mod binding;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gc;
pub mod heap;
pub mod image;
pub mod logging;
pub mod object;
pub mod os;
pub mod purify;
pub mod runtime;
pub mod signal;
pub mod tag;
pub mod thread;
pub mod widetag;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use runtime::Runtime;
