//! A concrete, file-backed implementation of `scarab_core::image::CoreLoader`.
//!
//! The on-disk format is a direct descendant of the directory-of-regions
//! layout named in `core.h`'s `struct ndir_entry` in the source material:
//! a small header (magic, build id, initial callable, directory) followed
//! by each region's raw words at a page-aligned offset. Reading the file is
//! a single `mmap`, matching the zero-copy load the source material performs
//! with its own fixed-address mappings; this loader instead copies each
//! region's bytes into the address range `Runtime::new` has already reserved,
//! since this crate's heap regions are reserved independently of the file
//! rather than mapped directly over it (see DESIGN.md, core image loading).

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use scarab_core::error::{Result, RuntimeError};
use scarab_core::image::{CoreHeader, CoreLoader, DirectoryEntry, RegionKind};
use scarab_core::tag::{Word, WORD_BYTES};

const MAGIC: &[u8; 8] = b"SCARABC0";
const PAGE_SIZE: u64 = 4096;

pub struct FileCoreLoader {
    mmap: Mmap,
}

impl FileCoreLoader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())
            .map_err(|e| RuntimeError::CoreImage(format!("cannot open {}: {e}", path.as_ref().display())))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| RuntimeError::CoreImage(format!("cannot map {}: {e}", path.as_ref().display())))?;
        Ok(FileCoreLoader { mmap })
    }

    fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    fn read_u64(&self, offset: usize) -> Result<u64> {
        let bytes = self
            .bytes()
            .get(offset..offset + 8)
            .ok_or_else(|| RuntimeError::CoreImage("truncated core file".to_string()))?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}

impl CoreLoader for FileCoreLoader {
    /// Parse the header: magic, length-prefixed build id, the initial
    /// callable word, and the region directory. No region bytes are touched
    /// here -- `Runtime::load_image` calls `check_build_id` before this
    /// loader is asked to map anything, so a mismatched core never triggers
    /// a page-copy.
    fn read_header(&self) -> Result<CoreHeader> {
        let bytes = self.bytes();
        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(RuntimeError::CoreImage("bad magic: not a scarab core file".to_string()));
        }

        let mut offset = MAGIC.len();
        let build_id_len = self.read_u64(offset)? as usize;
        offset += 8;
        let build_id = std::str::from_utf8(
            bytes
                .get(offset..offset + build_id_len)
                .ok_or_else(|| RuntimeError::CoreImage("truncated build id".to_string()))?,
        )
        .map_err(|e| RuntimeError::CoreImage(format!("build id is not valid utf-8: {e}")))?
        .to_string();
        offset += build_id_len;

        let initial_callable = Word::new(self.read_u64(offset)? as usize);
        offset += 8;

        let directory_count = self.read_u64(offset)? as usize;
        offset += 8;

        let mut directory = Vec::with_capacity(directory_count);
        for _ in 0..directory_count {
            let identifier = match self.read_u64(offset)? {
                0 => RegionKind::ReadOnly,
                1 => RegionKind::Static,
                2 => RegionKind::Dynamic,
                other => return Err(RuntimeError::CoreImage(format!("unknown region kind tag {other}"))),
            };
            offset += 8;
            let nwords = self.read_u64(offset)? as usize;
            offset += 8;
            let data_page = self.read_u64(offset)? as usize;
            offset += 8;
            let address = self.read_u64(offset)? as usize;
            offset += 8;
            let page_count = self.read_u64(offset)? as usize;
            offset += 8;

            directory.push(DirectoryEntry { identifier, nwords, data_page, address, page_count });
        }

        Ok(CoreHeader { build_id, directory, initial_callable })
    }

    /// Copy `entry.nwords` words from the file's page-aligned data region
    /// into `dest_base`. `dest_base` must already be backed by a reservation
    /// at least `entry.nwords * WORD_BYTES` bytes long -- the caller
    /// (`Runtime::load_image`) derives it from the heap region matching
    /// `entry.identifier`.
    fn map_entry(&self, entry: &DirectoryEntry, dest_base: usize) -> Result<()> {
        let file_offset = entry.data_page as u64 * PAGE_SIZE;
        let nbytes = entry.nwords * WORD_BYTES;
        let region = self
            .bytes()
            .get(file_offset as usize..file_offset as usize + nbytes)
            .ok_or_else(|| RuntimeError::CoreImage(format!("directory entry overruns core file at page {}", entry.data_page)))?;

        unsafe {
            std::ptr::copy_nonoverlapping(region.as_ptr(), dest_base as *mut u8, nbytes);
        }
        Ok(())
    }
}
