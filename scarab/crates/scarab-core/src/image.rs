//! Core loader interface: the core image format this runtime consumes. §6.
//!
//! This module is an *interface* only — a header type, a directory-entry
//! type, and a trait a concrete loader implements. The generator that
//! produces a core image (the bytecode/native codegen, §1) is out of scope;
//! `scarab-runtime` supplies the concrete file-backed implementation since
//! reading bytes off disk into fixed address ranges is an embedding concern,
//! not a core-algorithm one.

use crate::error::{Result, RuntimeError};
use crate::tag::Word;

/// Which fixed region a directory entry maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    ReadOnly,
    Static,
    Dynamic,
}

/// One directory entry: a fixed-address region to map, named by
/// `identifier` and sized in words. Mirrors `struct ndir_entry` in the
/// source material's `core.h` (`identifier`, `nwords`, `data_page`,
/// `address`, `page_count`).
#[derive(Debug, Clone, Copy)]
pub struct DirectoryEntry {
    pub identifier: RegionKind,
    pub nwords: usize,
    pub data_page: usize,
    pub address: usize,
    pub page_count: usize,
}

/// The core image header: a build-id string that must exactly match the one
/// compiled into this runtime (mismatch is fatal per §7), the directory of
/// regions to map, and the tagged reference to the initial callable.
pub struct CoreHeader {
    pub build_id: String,
    pub directory: Vec<DirectoryEntry>,
    pub initial_callable: Word,
}

/// The build id this runtime was compiled with. A real build would bake
/// this in via `env!("SCARAB_BUILD_ID")` or similar generated-at-build-time
/// string; fixed here since the core-image generator that would produce a
/// matching value is out of scope (§1).
pub const BUILD_ID: &str = "scarab-core-0";

impl CoreHeader {
    /// Verify the build id embedded in a loaded core matches this runtime's
    /// own. A mismatch is the one core-loading failure mode the source
    /// material treats as unconditionally fatal rather than a soft error
    /// the caller might retry (§7 "Fatal invariant violation").
    pub fn check_build_id(&self) -> Result<()> {
        if self.build_id != BUILD_ID {
            return Err(RuntimeError::BuildIdMismatch {
                found: self.build_id.clone(),
                expected: BUILD_ID.to_string(),
            });
        }
        Ok(())
    }
}

/// Produces a validated heap image and an initial callable. The core itself
/// never parses file bytes; it only consumes whatever a `CoreLoader`
/// implementation hands back (§1 "The core consumes an already-validated
/// heap image and a pointer to an initial callable").
pub trait CoreLoader {
    /// Read and validate a core image's header and directory without
    /// mapping any region yet, so the caller can check the build id before
    /// committing to address-range reservation.
    fn read_header(&self) -> Result<CoreHeader>;

    /// Map one directory entry's bytes into the already-reserved address
    /// range named by `entry.address`. Called once per entry, in directory
    /// order, after every fixed region has been reserved.
    fn map_entry(&self, entry: &DirectoryEntry, dest_base: usize) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHeader(CoreHeader);

    impl CoreLoader for FixedHeader {
        fn read_header(&self) -> Result<CoreHeader> {
            Ok(CoreHeader {
                build_id: self.0.build_id.clone(),
                directory: self.0.directory.clone(),
                initial_callable: self.0.initial_callable,
            })
        }

        fn map_entry(&self, _entry: &DirectoryEntry, _dest_base: usize) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn mismatched_build_id_is_rejected() {
        let header = CoreHeader {
            build_id: "some-other-build".to_string(),
            directory: vec![],
            initial_callable: Word::new(0),
        };
        assert!(header.check_build_id().is_err());
    }

    #[test]
    fn matching_build_id_is_accepted() {
        let header = CoreHeader {
            build_id: BUILD_ID.to_string(),
            directory: vec![],
            initial_callable: Word::new(0),
        };
        assert!(header.check_build_id().is_ok());
    }
}
