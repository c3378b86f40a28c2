//! Runtime embedding layer: the file-backed core image loader and the
//! C-ABI entry points a host `main` links against to bring a
//! `scarab_core::Runtime` up, load an image, and collect.

mod ffi;
mod loader;

pub use ffi::*;
pub use loader::FileCoreLoader;
