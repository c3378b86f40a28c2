//! Widetag catalogue: the object kinds a header word can name, and the
//! boxed/unboxed classification that the generic scavenger consults.

use crate::tag::{Lowtag, Word, WORD_BITS};

/// One entry per header-bearing object kind named in the data model. The
/// numeric values are arbitrary but stable within this crate; they are not
/// meant to match any external core-file format (the loader's directory
/// entries name regions, not individual widetags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Widetag {
    // Numeric
    Bignum = 0x01,
    Ratio = 0x02,
    SingleFloat = 0x03,
    DoubleFloat = 0x04,
    LongFloat = 0x05,
    ComplexSingleFloat = 0x06,
    ComplexDoubleFloat = 0x07,
    ComplexRational = 0x08,

    // Simple vectors by element width
    SimpleBitVector = 0x10,
    SimpleVectorUnsigned2 = 0x11,
    SimpleVectorUnsigned4 = 0x12,
    SimpleVectorUnsigned8 = 0x13,
    SimpleVectorUnsigned16 = 0x14,
    SimpleVectorUnsigned32 = 0x15,
    SimpleVectorUnsigned64 = 0x16,
    SimpleVectorSingleFloat = 0x17,
    SimpleVectorDoubleFloat = 0x18,
    SimpleVectorComplexFloat = 0x19,
    SimpleBaseString = 0x1a,
    SimpleCharacterString = 0x1b,
    SimpleVectorT = 0x1c, // generic boxed simple-vector
    ComplexVector = 0x1d,
    ComplexBaseString = 0x1e,
    ComplexCharacterString = 0x1f,
    ComplexBitVector = 0x20,

    // Code & functions
    CodeHeader = 0x30,
    SimpleFunHeader = 0x31,
    ReturnPcHeader = 0x32,
    Closure = 0x33,
    FuncallableInstance = 0x34,

    // Structural
    Symbol = 0x40,
    Fdefn = 0x41,
    ValueCell = 0x42,
    WeakPointer = 0x43,
    Instance = 0x44,
    Layout = 0x45,
    Sap = 0x46,
    UnboundMarker = 0x47,
    NoTlsValueMarker = 0x48,
}

pub const WIDETAG_TABLE_SIZE: usize = 256;

impl Widetag {
    pub const ALL: [Widetag; 33] = [
        Widetag::Bignum,
        Widetag::Ratio,
        Widetag::SingleFloat,
        Widetag::DoubleFloat,
        Widetag::LongFloat,
        Widetag::ComplexSingleFloat,
        Widetag::ComplexDoubleFloat,
        Widetag::ComplexRational,
        Widetag::SimpleBitVector,
        Widetag::SimpleVectorUnsigned2,
        Widetag::SimpleVectorUnsigned4,
        Widetag::SimpleVectorUnsigned8,
        Widetag::SimpleVectorUnsigned16,
        Widetag::SimpleVectorUnsigned32,
        Widetag::SimpleVectorUnsigned64,
        Widetag::SimpleVectorSingleFloat,
        Widetag::SimpleVectorDoubleFloat,
        Widetag::SimpleVectorComplexFloat,
        Widetag::SimpleBaseString,
        Widetag::SimpleCharacterString,
        Widetag::SimpleVectorT,
        Widetag::ComplexVector,
        Widetag::ComplexBaseString,
        Widetag::ComplexCharacterString,
        Widetag::ComplexBitVector,
        Widetag::CodeHeader,
        Widetag::SimpleFunHeader,
        Widetag::ReturnPcHeader,
        Widetag::Closure,
        Widetag::FuncallableInstance,
        Widetag::Symbol,
        Widetag::Fdefn,
        Widetag::ValueCell,
        Widetag::WeakPointer,
    ];

    #[inline]
    pub fn from_u8(raw: u8) -> Option<Widetag> {
        Widetag::ALL
            .iter()
            .copied()
            .chain([Widetag::Instance, Widetag::Layout, Widetag::Sap, Widetag::UnboundMarker, Widetag::NoTlsValueMarker])
            .find(|w| *w as u8 == raw)
    }

    /// Whether this object's payload words should be recursively scavenged
    /// (boxed) or merely skipped over (unboxed raw data).
    pub fn is_boxed(self) -> bool {
        !matches!(
            self,
            Widetag::Bignum
                | Widetag::SingleFloat
                | Widetag::DoubleFloat
                | Widetag::LongFloat
                | Widetag::ComplexSingleFloat
                | Widetag::ComplexDoubleFloat
                | Widetag::SimpleBitVector
                | Widetag::SimpleVectorUnsigned2
                | Widetag::SimpleVectorUnsigned4
                | Widetag::SimpleVectorUnsigned8
                | Widetag::SimpleVectorUnsigned16
                | Widetag::SimpleVectorUnsigned32
                | Widetag::SimpleVectorUnsigned64
                | Widetag::SimpleVectorSingleFloat
                | Widetag::SimpleVectorDoubleFloat
                | Widetag::SimpleVectorComplexFloat
                | Widetag::SimpleBaseString
                | Widetag::SimpleCharacterString
                | Widetag::Sap
        )
    }

    /// The code-object family gets its own transport path: it is never
    /// relocated word-by-word, only as a whole self-relative block.
    pub fn is_code_like(self) -> bool {
        matches!(
            self,
            Widetag::CodeHeader | Widetag::SimpleFunHeader | Widetag::ReturnPcHeader
        )
    }

    /// Element width in bits for the vector widetags, used by the purifier's
    /// by-width vector transport.
    pub fn element_bits(self) -> Option<u32> {
        Some(match self {
            Widetag::SimpleBitVector => 1,
            Widetag::SimpleVectorUnsigned2 => 2,
            Widetag::SimpleVectorUnsigned4 => 4,
            Widetag::SimpleBaseString | Widetag::SimpleVectorUnsigned8 => 8,
            Widetag::SimpleCharacterString | Widetag::SimpleVectorUnsigned16 => 16,
            Widetag::SimpleVectorUnsigned32 | Widetag::SimpleVectorSingleFloat => 32,
            Widetag::SimpleVectorUnsigned64 | Widetag::SimpleVectorDoubleFloat => 64,
            Widetag::SimpleVectorComplexFloat => 128,
            _ => return None,
        })
    }

    /// Which pointer lowtag, if any, naturally dereferences to an object of
    /// this widetag. Used to pre-seed dispatch-table rows for entire pointer
    /// families as described in the dispatch-table initialization policy.
    pub fn pointer_family(self) -> Option<Lowtag> {
        match self {
            Widetag::Instance | Widetag::FuncallableInstance => Some(Lowtag::InstancePointer),
            Widetag::Closure | Widetag::SimpleFunHeader => Some(Lowtag::FunPointer),
            _ => Some(Lowtag::OtherPointer),
        }
    }
}

/// Total word count of an object (including its own header word) given
/// only that header. For the vector widetags `header_length()` counts
/// *elements*, not words, so their size must go through `element_bits()`;
/// every other widetag's `header_length()` already is a word count.
pub fn header_total_words(header: Word) -> usize {
    let widetag = Widetag::from_u8(header.widetag());
    match widetag.and_then(Widetag::element_bits) {
        Some(bits) => {
            let element_count = header.header_length();
            let payload_bits = element_count * bits as usize;
            let payload_words = (payload_bits + WORD_BITS - 1) / WORD_BITS;
            1 + payload_words
        }
        None => 1 + header.header_length(),
    }
}
