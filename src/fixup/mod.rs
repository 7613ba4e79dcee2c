//! The relocation ("fixup") stream codec (§1, §4.3, §4.4).
//!
//! A fixup stream is a per-subspace byte string of opcodes. Each opcode
//! advances an input-offset cursor `L` through the subspace's own
//! address space; the opcodes that carry a relocation produce one
//! [`Relocation`] each. [`encoder`] and [`decoder`] are the two halves
//! of the codec; both are driven by the opcode classification in this
//! module instead of a literal per-opcode format-string table — see
//! the module doc on [`OpcodeKind`] for why.

pub mod argreloc;
pub mod decoder;
pub mod encoder;

use alloc::string::String;

use crate::reloc_queue::RelocQueue;

/// The logical relocation kind a fixup opcode carries, independent of
/// which byte-width variant encoded it.
///
/// §9 (REDESIGN FLAGS) explicitly sanctions replacing the C source's
/// per-opcode format-string table with "a small tagged enumeration of
/// opcode kinds plus a data-driven table", or compiling the table to
/// native match arms; this crate takes the match-arm route; see
/// [`classify`] and the `howto` accessor below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    NoRelocation,
    DataOverride,
    PcrelCall,
    AbsCall,
    CodeOneSymbol,
    DpRelative,
    DataOneSymbol,
    DataPlabel,
    CodePlabel,
    DltRel,
    DataGprel,
    Entry,
    Exit,
    AltEntry,
    Fsel,
    Lsel,
    Rsel,
    BeginBrtab,
    EndBrtab,
    BeginTry,
    EndTry,
    N0sel,
    N1sel,
    CodeExpr,
    DataExpr,
    NMode,
    SMode,
    DMode,
    RMode,
    ShortPcrelMode,
    LongPcrelMode,
    Comp1,
    Comp2,
    /// `R_PREV_FIXUP+idx`: redirect to the reloc queue (§4.2). Never
    /// itself produces a [`Relocation`].
    PrevFixup(u8),
    /// Anything the table doesn't assign: counted, never materialized
    /// (§4.4, §7).
    Reserved,
}

impl RelocKind {
    /// Stable name, for debug output and the symbolic constant an
    /// opcode table entry would otherwise carry.
    pub fn name(self) -> &'static str {
        match self {
            RelocKind::NoRelocation => "R_NO_RELOCATION",
            RelocKind::DataOverride => "R_DATA_OVERRIDE",
            RelocKind::PcrelCall => "R_PCREL_CALL",
            RelocKind::AbsCall => "R_ABS_CALL",
            RelocKind::CodeOneSymbol => "R_CODE_ONE_SYMBOL",
            RelocKind::DpRelative => "R_DP_RELATIVE",
            RelocKind::DataOneSymbol => "R_DATA_ONE_SYMBOL",
            RelocKind::DataPlabel => "R_DATA_PLABEL",
            RelocKind::CodePlabel => "R_CODE_PLABEL",
            RelocKind::DltRel => "R_DLT_REL",
            RelocKind::DataGprel => "R_DATA_GPREL",
            RelocKind::Entry => "R_ENTRY",
            RelocKind::Exit => "R_EXIT",
            RelocKind::AltEntry => "R_ALT_ENTRY",
            RelocKind::Fsel => "R_FSEL",
            RelocKind::Lsel => "R_LSEL",
            RelocKind::Rsel => "R_RSEL",
            RelocKind::BeginBrtab => "R_BEGIN_BRTAB",
            RelocKind::EndBrtab => "R_END_BRTAB",
            RelocKind::BeginTry => "R_BEGIN_TRY",
            RelocKind::EndTry => "R_END_TRY",
            RelocKind::N0sel => "R_N0SEL",
            RelocKind::N1sel => "R_N1SEL",
            RelocKind::CodeExpr => "R_CODE_EXPR",
            RelocKind::DataExpr => "R_DATA_EXPR",
            RelocKind::NMode => "R_N_MODE",
            RelocKind::SMode => "R_S_MODE",
            RelocKind::DMode => "R_D_MODE",
            RelocKind::RMode => "R_R_MODE",
            RelocKind::ShortPcrelMode => "R_SHORT_PCREL_MODE",
            RelocKind::LongPcrelMode => "R_LONG_PCREL_MODE",
            RelocKind::Comp1 => "R_COMP1",
            RelocKind::Comp2 => "R_COMP2",
            RelocKind::PrevFixup(_) => "R_PREV_FIXUP",
            RelocKind::Reserved => "R_RESERVED",
        }
    }

    /// True for the two kinds that carry no independent relocation
    /// record of their own (§3 "Relocation (internal)").
    pub fn is_meta(self) -> bool {
        matches!(self, RelocKind::NoRelocation | RelocKind::DataOverride)
    }
}

/// Byte width of a symbol-index-bearing opcode's symbolic operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymWidth {
    /// Index embedded in the opcode itself; `< 0x20`.
    Inline,
    /// One explicit byte; `< 0x100`.
    Byte,
    /// Three explicit bytes; `< 0x1000_0000` (2^28).
    Triple,
}

/// One of the seven symbolic data/code relocation families (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolicKind {
    CodeOneSymbol,
    DpRelative,
    DataOneSymbol,
    DataPlabel,
    CodePlabel,
    DltRel,
    DataGprel,
}

impl SymbolicKind {
    pub fn to_reloc_kind(self) -> RelocKind {
        match self {
            SymbolicKind::CodeOneSymbol => RelocKind::CodeOneSymbol,
            SymbolicKind::DpRelative => RelocKind::DpRelative,
            SymbolicKind::DataOneSymbol => RelocKind::DataOneSymbol,
            SymbolicKind::DataPlabel => RelocKind::DataPlabel,
            SymbolicKind::CodePlabel => RelocKind::CodePlabel,
            SymbolicKind::DltRel => RelocKind::DltRel,
            SymbolicKind::DataGprel => RelocKind::DataGprel,
        }
    }

    /// Only the three highest-frequency kinds get the fully inline
    /// (opcode-only) 1-byte encoding; see DESIGN.md for the opcode
    /// budget this trades off against.
    pub fn supports_inline(self) -> bool {
        matches!(
            self,
            SymbolicKind::CodeOneSymbol | SymbolicKind::DpRelative | SymbolicKind::DataOneSymbol
        )
    }
}

/// Opcode ranges. Each constant is the first opcode of its block; see
/// `classify` for the block widths, and DESIGN.md for the budget that
/// produced this layout (it is this crate's own invention — the
/// original C opcode numbering was not available in the retrieval
/// pack this crate was built from).
pub mod opcodes {
    /// Flat 1-byte skip form: `gap/4 - 1` in 0..=23, i.e. gaps 4..=0x60.
    pub const NO_RELOCATION: u8 = 0;
    pub const NO_RELOCATION_1BYTE_END: u8 = 23;
    /// 2-byte skip form, opcode selects the high bits of `gap/4 - 1`.
    pub const NO_RELOCATION_2BYTE: u8 = 24;
    pub const NO_RELOCATION_2BYTE_END: u8 = 27;
    /// 3-byte skip form, same scheme with a 16-bit tail.
    pub const NO_RELOCATION_3BYTE: u8 = 28;
    pub const NO_RELOCATION_3BYTE_END: u8 = 30;
    /// 4-byte fallback: literal `gap - 1` (not divided by 4). Also used
    /// for the 2^24-byte super-chunk loop in §4.3.
    pub const NO_RELOCATION_END: u8 = 31;
    pub const DATA_OVERRIDE: u8 = 32;
    pub const PCREL_CALL_SIMPLE: u8 = 36;
    pub const PCREL_CALL_SIMPLE_END: u8 = 55;
    pub const PCREL_CALL_COMPLEX_SHORT: u8 = 56;
    pub const PCREL_CALL_COMPLEX_LONG: u8 = 57;
    pub const ABS_CALL_SIMPLE: u8 = 58;
    pub const ABS_CALL_SIMPLE_END: u8 = 77;
    pub const ABS_CALL_COMPLEX_SHORT: u8 = 78;
    pub const ABS_CALL_COMPLEX_LONG: u8 = 79;

    pub const CODE_ONE_SYMBOL_INLINE: u8 = 80;
    pub const CODE_ONE_SYMBOL_INLINE_END: u8 = 111;
    pub const CODE_ONE_SYMBOL_BYTE: u8 = 112;
    pub const CODE_ONE_SYMBOL_TRIPLE: u8 = 113;

    pub const DP_RELATIVE_INLINE: u8 = 114;
    pub const DP_RELATIVE_INLINE_END: u8 = 145;
    pub const DP_RELATIVE_BYTE: u8 = 146;
    pub const DP_RELATIVE_TRIPLE: u8 = 147;

    pub const DATA_ONE_SYMBOL_INLINE: u8 = 148;
    pub const DATA_ONE_SYMBOL_INLINE_END: u8 = 179;
    pub const DATA_ONE_SYMBOL_BYTE: u8 = 180;
    pub const DATA_ONE_SYMBOL_TRIPLE: u8 = 181;

    pub const DATA_PLABEL_BYTE: u8 = 182;
    pub const DATA_PLABEL_TRIPLE: u8 = 183;
    pub const CODE_PLABEL_BYTE: u8 = 184;
    pub const CODE_PLABEL_TRIPLE: u8 = 185;
    pub const DLT_REL_BYTE: u8 = 186;
    pub const DLT_REL_TRIPLE: u8 = 187;
    pub const DATA_GPREL_BYTE: u8 = 188;
    pub const DATA_GPREL_TRIPLE: u8 = 189;

    pub const ENTRY: u8 = 190;
    pub const EXIT: u8 = 191;

    pub const ALT_ENTRY: u8 = 192;
    pub const FSEL: u8 = 193;
    pub const LSEL: u8 = 194;
    pub const RSEL: u8 = 195;
    pub const BEGIN_BRTAB: u8 = 196;
    pub const END_BRTAB: u8 = 197;
    pub const BEGIN_TRY: u8 = 198;
    pub const N0SEL: u8 = 199;
    pub const N1SEL: u8 = 200;
    pub const CODE_EXPR: u8 = 201;
    pub const DATA_EXPR: u8 = 202;

    pub const END_TRY_1: u8 = 203;
    pub const END_TRY_2: u8 = 204;
    pub const END_TRY_4: u8 = 205;

    pub const N_MODE: u8 = 206;
    pub const S_MODE: u8 = 207;
    pub const D_MODE: u8 = 208;
    pub const R_MODE: u8 = 209;

    pub const SHORT_PCREL_MODE: u8 = 210;
    pub const LONG_PCREL_MODE: u8 = 211;

    pub const COMP1: u8 = 212;
    pub const COMP2: u8 = 213;

    /// First of the 4 one-byte `R_PREV_FIXUP+idx` opcodes (§4.2).
    pub const PREV_FIXUP: u8 = 214;
    pub const PREV_FIXUP_END: u8 = 217;

    /// Forward-compatibility catch-all the encoder falls back to for a
    /// relocation kind it does not know how to encode (§4.3, §7).
    pub const UNKNOWN: u8 = 255;
}

/// Classifies a raw opcode byte into its [`RelocKind`] and, where
/// relevant, its symbol-width sub-variant.
pub fn classify(op: u8) -> RelocKind {
    use opcodes::*;
    match op {
        NO_RELOCATION..=NO_RELOCATION_END => RelocKind::NoRelocation,
        DATA_OVERRIDE..=35 => RelocKind::DataOverride,
        PCREL_CALL_SIMPLE..=PCREL_CALL_SIMPLE_END => RelocKind::PcrelCall,
        PCREL_CALL_COMPLEX_SHORT | PCREL_CALL_COMPLEX_LONG => RelocKind::PcrelCall,
        ABS_CALL_SIMPLE..=ABS_CALL_SIMPLE_END => RelocKind::AbsCall,
        ABS_CALL_COMPLEX_SHORT | ABS_CALL_COMPLEX_LONG => RelocKind::AbsCall,
        CODE_ONE_SYMBOL_INLINE..=CODE_ONE_SYMBOL_INLINE_END => RelocKind::CodeOneSymbol,
        CODE_ONE_SYMBOL_BYTE | CODE_ONE_SYMBOL_TRIPLE => RelocKind::CodeOneSymbol,
        DP_RELATIVE_INLINE..=DP_RELATIVE_INLINE_END => RelocKind::DpRelative,
        DP_RELATIVE_BYTE | DP_RELATIVE_TRIPLE => RelocKind::DpRelative,
        DATA_ONE_SYMBOL_INLINE..=DATA_ONE_SYMBOL_INLINE_END => RelocKind::DataOneSymbol,
        DATA_ONE_SYMBOL_BYTE | DATA_ONE_SYMBOL_TRIPLE => RelocKind::DataOneSymbol,
        DATA_PLABEL_BYTE | DATA_PLABEL_TRIPLE => RelocKind::DataPlabel,
        CODE_PLABEL_BYTE | CODE_PLABEL_TRIPLE => RelocKind::CodePlabel,
        DLT_REL_BYTE | DLT_REL_TRIPLE => RelocKind::DltRel,
        DATA_GPREL_BYTE | DATA_GPREL_TRIPLE => RelocKind::DataGprel,
        ENTRY => RelocKind::Entry,
        EXIT => RelocKind::Exit,
        ALT_ENTRY => RelocKind::AltEntry,
        FSEL => RelocKind::Fsel,
        LSEL => RelocKind::Lsel,
        RSEL => RelocKind::Rsel,
        BEGIN_BRTAB => RelocKind::BeginBrtab,
        END_BRTAB => RelocKind::EndBrtab,
        BEGIN_TRY => RelocKind::BeginTry,
        N0SEL => RelocKind::N0sel,
        N1SEL => RelocKind::N1sel,
        CODE_EXPR => RelocKind::CodeExpr,
        DATA_EXPR => RelocKind::DataExpr,
        END_TRY_1 | END_TRY_2 | END_TRY_4 => RelocKind::EndTry,
        N_MODE => RelocKind::NMode,
        S_MODE => RelocKind::SMode,
        D_MODE => RelocKind::DMode,
        R_MODE => RelocKind::RMode,
        SHORT_PCREL_MODE => RelocKind::ShortPcrelMode,
        LONG_PCREL_MODE => RelocKind::LongPcrelMode,
        COMP1 => RelocKind::Comp1,
        COMP2 => RelocKind::Comp2,
        PREV_FIXUP..=PREV_FIXUP_END => RelocKind::PrevFixup(op - PREV_FIXUP),
        _ => RelocKind::Reserved,
    }
}

/// A decoded (or to-be-encoded) relocation record (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset within the subspace.
    pub address: u32,
    pub kind: RelocKind,
    /// Index into the symbol table, if this kind carries one.
    pub symbol: Option<u32>,
    pub addend: i64,
    /// Packed PA-RISC argument-relocation word, for call relocations.
    pub arg_reloc: Option<u16>,
}

impl Relocation {
    pub fn new(address: u32, kind: RelocKind) -> Self {
        Relocation {
            address,
            kind,
            symbol: None,
            addend: 0,
            arg_reloc: None,
        }
    }

    pub fn with_symbol(mut self, symbol: u32) -> Self {
        self.symbol = Some(symbol);
        self
    }

    pub fn with_addend(mut self, addend: i64) -> Self {
        self.addend = addend;
        self
    }

    pub fn with_arg_reloc(mut self, arg_reloc: u16) -> Self {
        self.arg_reloc = Some(arg_reloc);
        self
    }
}

/// Carried encoder/decoder state that a single opcode can change but
/// that persists across opcodes for the rest of the subspace (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    N,
    S,
    D,
    R,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    ShortPcrel,
    LongPcrel,
}

/// A sink for decoded relocations, parameterizing the single decode
/// loop between "just count" and "materialize" (§4.4, §9).
pub trait RelocSink {
    fn record(&mut self, reloc: Relocation);
    fn count_only(&self) -> bool {
        false
    }
}

/// Counts relocations without allocating storage for them; used for
/// the decoder's first (upper-bound) pass.
#[derive(Debug, Default)]
pub struct CountingSink {
    pub count: usize,
}

impl RelocSink for CountingSink {
    fn record(&mut self, _reloc: Relocation) {
        self.count += 1;
    }
    fn count_only(&self) -> bool {
        true
    }
}

/// Materializes every decoded relocation into a `Vec`.
#[derive(Debug, Default)]
pub struct MaterializingSink {
    pub relocs: alloc::vec::Vec<Relocation>,
}

impl RelocSink for MaterializingSink {
    fn record(&mut self, reloc: Relocation) {
        self.relocs.push(reloc);
    }
}

pub(crate) fn bad_value(msg: impl Into<String>) -> crate::error::Error {
    crate::error::Error::BadValue(msg.into())
}
