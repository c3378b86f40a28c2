//! Dispatch tables: three parallel 256-entry tables indexed by widetag,
//! populated once at startup and read-only for the remainder of the
//! process. §4.2.
//!
//! Represented as a flat array of function pointers rather than `dyn`
//! trait objects -- this is a hot inner-loop table consulted on every
//! scavenged header word, and the set of handlers is closed and known at
//! compile time.

use crate::gc::Collector;
use crate::tag::Word;
use crate::widetag::{Widetag, WIDETAG_TABLE_SIZE};

/// Update the slot at `addr` holding header word `header` (or, for the
/// defensive pointer-family entries, a tagged pointer); recursively
/// scavenge any boxed contents; return how many words this object
/// occupies so the caller can advance past it.
pub type ScavengeFn = fn(&Collector, usize, Word) -> usize;

/// Copy the object `tagged` refers to into to-space and return the new
/// tagged reference. Never called on a cons (list-pointer transport is
/// handled inline by the scavenge loop, since cons cells carry no widetag).
pub type TransportFn = fn(&Collector, Word) -> Word;

/// Total length of the object named by header word `header`, in words,
/// including the header word itself.
pub type SizeFn = fn(Word) -> usize;

#[derive(Clone, Copy)]
pub(crate) struct DispatchEntry {
    pub scavenge: ScavengeFn,
    pub transport: TransportFn,
    pub size: SizeFn,
}

fn lose_scavenge(_col: &Collector, addr: usize, header: Word) -> usize {
    crate::error::lose(format!(
        "no scavenge handler for widetag {:#04x} at {:#x} (word {:?})",
        header.widetag(),
        addr,
        header
    ))
}

fn lose_transport(_col: &Collector, tagged: Word) -> Word {
    crate::error::lose(format!(
        "no transport handler for widetag {:#04x} (word {:?})",
        tagged.widetag(),
        tagged
    ))
}

fn lose_size(header: Word) -> usize {
    crate::error::lose(format!(
        "no size handler for widetag {:#04x} (word {:?})",
        header.widetag(),
        header
    ))
}

const LOSE_ENTRY: DispatchEntry = DispatchEntry {
    scavenge: lose_scavenge,
    transport: lose_transport,
    size: lose_size,
};

/// The three dispatch tables, filled once in [`DispatchTables::new`] and
/// never mutated again -- safe to share across threads without locking.
pub struct DispatchTables {
    entries: [DispatchEntry; WIDETAG_TABLE_SIZE],
}

impl DispatchTables {
    pub fn new() -> Self {
        let mut entries = [LOSE_ENTRY; WIDETAG_TABLE_SIZE];

        // Every widetag-bearing header kind gets its real triple first.
        for widetag in Widetag::ALL
            .iter()
            .copied()
            .chain([
                Widetag::Instance,
                Widetag::Layout,
                Widetag::Sap,
                Widetag::UnboundMarker,
                Widetag::NoTlsValueMarker,
            ])
        {
            entries[widetag as usize] = crate::gc::transport::dispatch_entry_for(widetag);
        }

        // Defensive: every widetag *byte value* whose low 3 bits equal one
        // of the four pointer lowtags, and that isn't already claimed by a
        // real header widetag above, gets a pointer-chasing scavenger. A
        // precise scavenge of a known slot never reaches these (a pointer
        // word is handled by the inline branch in `Collector::scavenge_range`
        // before it would fall through to a table lookup); they exist for
        // the conservative root scanner, which does not know in advance
        // whether a stack word is a pointer or an inline header and so
        // dispatches through this table uniformly (§4.3 edge-case policy,
        // §9 "conservative vs. precise roots").
        for lowtag in crate::tag::Lowtag::POINTER_TAGS {
            let handler = crate::gc::transport::conservative_pointer_scavenger(lowtag);
            for byte in 0u16..256 {
                let byte = byte as u8;
                if byte as usize & crate::tag::LOWTAG_MASK == lowtag as usize {
                    let slot = &mut entries[byte as usize];
                    if matches!(slot.scavenge as usize, x if x == (lose_scavenge as usize)) {
                        slot.scavenge = handler;
                    }
                }
            }
        }

        DispatchTables { entries }
    }

    #[inline]
    pub fn scavenge(&self, widetag: u8) -> ScavengeFn {
        self.entries[widetag as usize].scavenge
    }

    #[inline]
    pub fn transport(&self, widetag: u8) -> TransportFn {
        self.entries[widetag as usize].transport
    }

    #[inline]
    pub fn size(&self, widetag: u8) -> SizeFn {
        self.entries[widetag as usize].size
    }
}

impl Default for DispatchTables {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unclaimed_widetag_loses() {
        let tables = DispatchTables::new();
        // 0x00 has lowtag 0b000, the even-fixnum tag, which is not one of
        // the four pointer lowtags and names no real widetag either.
        let f = tables.scavenge(0x00);
        assert_eq!(f as usize, lose_scavenge as usize);
    }

    #[test]
    fn real_widetags_are_populated() {
        let tables = DispatchTables::new();
        assert_ne!(tables.transport(Widetag::Symbol as u8) as usize, lose_transport as usize);
        assert_ne!(tables.size(Widetag::CodeHeader as u8) as usize, lose_size as usize);
    }

    #[test]
    fn pointer_family_byte_values_get_defensive_scavenger() {
        let tables = DispatchTables::new();
        // 0b011 (list-pointer) with high bits 0b00001 = 0x0b, not a real
        // widetag, should have picked up the defensive pointer scavenger.
        let byte = 0b000_01_011u8;
        assert_ne!(tables.scavenge(byte) as usize, lose_scavenge as usize);
    }
}
