//! The symbol dictionary: on-disk record ↔ internal [`Symbol`] (§3, §4.6).

use alloc::string::String;
use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::space::Subspace;
use crate::strtab::Strtab;

/// The on-disk symbol dictionary record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct RawSymbol {
    pub name: u32,
    /// Packed: `symbol_type`(5) `symbol_scope`(3) `arg_reloc`(10)
    /// `xleast`(2) `symbol_info`(20) laid out per §4.6; see
    /// [`unpack_flags`].
    pub flags: u32,
    pub symbol_info: u32,
    pub symbol_value: u32,
}

const ST_SYM_EXT: u8 = 0x1E;
const ST_ARG_EXT: u8 = 0x1F;
const ST_NULL: u8 = 0;
const ST_ABSOLUTE: u8 = 1;
const ST_DATA: u8 = 2;
const ST_CODE: u8 = 3;
const ST_PRI_PROG: u8 = 4;
const ST_SEC_PROG: u8 = 5;
const ST_ENTRY: u8 = 6;
const ST_STORAGE: u8 = 7;
const ST_STUB: u8 = 8;
const ST_MILLICODE: u8 = 9;
const ST_PLABEL: u8 = 10;

const SS_EXTERNAL: u8 = 0;
const SS_LOCAL: u8 = 1;
const SS_UNIVERSAL: u8 = 2;
const SS_UNSAT: u8 = 3;

// Bit 17 sits inside arg_reloc's 15..25 field: a weak symbol whose
// arg_reloc has bit 2 set would corrupt arg_reloc on pack, and any
// arg_reloc with bit 2 set would decode as weak. Bit 12 sits below
// XLEAST (13..15) and outside symbol_type/symbol_scope/arg_reloc.
const SECONDARY_DEF_BIT: u32 = 1 << 12;

fn unpack_flags(flags: u32) -> (u8, u8, u16, bool) {
    let symbol_type = ((flags >> 27) & 0x1F) as u8;
    let symbol_scope = ((flags >> 25) & 0x3) as u8;
    let arg_reloc = ((flags >> 15) & 0x3FF) as u16;
    let secondary_def = flags & SECONDARY_DEF_BIT != 0;
    (symbol_type, symbol_scope, arg_reloc, secondary_def)
}

fn pack_flags(symbol_type: u8, symbol_scope: u8, arg_reloc: u16, secondary_def: bool) -> u32 {
    let mut flags = ((symbol_type as u32 & 0x1F) << 27) | ((symbol_scope as u32 & 0x3) << 25);
    flags |= (arg_reloc as u32 & 0x3FF) << 15;
    // XLEAST is fixed at 3 on output (§4.8 step "Build and write the
    // symbol dictionary").
    flags |= 3 << 13;
    if secondary_def {
        flags |= SECONDARY_DEF_BIT;
    }
    flags
}

/// SOM symbol kind, internalized (§3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SomType {
    Unknown,
    Absolute,
    Data,
    Code,
    PriProg,
    SecProg,
    Entry,
    Millicode,
    Plabel,
}

impl SomType {
    fn from_raw(symbol_type: u8) -> Self {
        match symbol_type {
            ST_ABSOLUTE => SomType::Absolute,
            ST_DATA => SomType::Data,
            ST_CODE | ST_STUB => SomType::Code,
            ST_PRI_PROG => SomType::PriProg,
            ST_SEC_PROG => SomType::SecProg,
            ST_ENTRY => SomType::Entry,
            ST_MILLICODE => SomType::Millicode,
            ST_PLABEL => SomType::Plabel,
            _ => SomType::Unknown,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolFlags: u32 {
        const EXPORT     = 1 << 0;
        const GLOBAL     = 1 << 1;
        const LOCAL      = 1 << 2;
        const WEAK       = 1 << 3;
        const FUNCTION   = 1 << 4;
        const SECTION_SYM = 1 << 5;
        const DEBUGGING  = 1 << 6;
        const COMMON     = 1 << 7;
        const UNDEFINED  = 1 << 8;
    }
}

/// Where a symbol's value is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionBinding {
    Undefined,
    Common,
    Absolute,
    Subspace(usize),
}

/// An internalized symbol record (§3, §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub som_type: SomType,
    pub flags: SymbolFlags,
    pub section: SectionBinding,
    pub value: u32,
    pub arg_reloc: u16,
    pub priv_level: u8,
}

/// Skip `ST_SYM_EXT`/`ST_ARG_EXT` records — they are extension
/// follow-ons of the preceding symbol, not independent symbols.
pub fn is_extension(raw: &RawSymbol) -> bool {
    let (symbol_type, ..) = unpack_flags(raw.flags);
    matches!(symbol_type, ST_SYM_EXT | ST_ARG_EXT)
}

fn resolve_subspace(
    subspaces: &[Subspace],
    function_like: bool,
    executable: bool,
    symbol_info: u32,
    value: u32,
) -> SectionBinding {
    if executable && function_like {
        for (idx, s) in subspaces.iter().enumerate() {
            if value >= s.vma && value <= s.vma.saturating_add(s.size) {
                return SectionBinding::Subspace(idx);
            }
        }
        return SectionBinding::Absolute;
    }
    let idx = symbol_info as usize;
    if idx < subspaces.len() {
        SectionBinding::Subspace(idx)
    } else {
        SectionBinding::Absolute
    }
}

/// Internalizes one raw symbol record (§4.6). `executable` selects
/// whether function-like symbols resolve to a subspace by containing
/// VMA range rather than by the raw `symbol_info` index.
pub fn from_raw(
    raw: &RawSymbol,
    strings: &Strtab,
    subspaces: &[Subspace],
    executable: bool,
) -> Result<Symbol> {
    let (symbol_type, symbol_scope, arg_reloc, secondary_def) = unpack_flags(raw.flags);
    let name = strings.get(raw.name as usize)?.into();

    let som_type = SomType::from_raw(symbol_type);
    let mut value = raw.symbol_value;
    let mut priv_level = 0u8;
    let mut flags = SymbolFlags::empty();

    let function_like = matches!(symbol_type, ST_ENTRY | ST_MILLICODE);
    if function_like {
        flags |= SymbolFlags::FUNCTION;
        priv_level = (value & 0x3) as u8;
        value &= !0x3;
    } else if matches!(
        symbol_type,
        ST_STUB | ST_CODE | ST_PRI_PROG | ST_SEC_PROG
    ) {
        priv_level = (value & 0x3) as u8;
        value &= !0x3;
        if symbol_scope == SS_UNSAT {
            flags |= SymbolFlags::FUNCTION;
        }
    }

    let is_storage = symbol_type == ST_STORAGE;
    let section = match symbol_scope {
        SS_EXTERNAL => {
            flags |= SymbolFlags::EXPORT | SymbolFlags::GLOBAL;
            if is_storage {
                flags |= SymbolFlags::COMMON;
                SectionBinding::Common
            } else {
                flags |= SymbolFlags::UNDEFINED;
                SectionBinding::Undefined
            }
        }
        SS_UNSAT => {
            if is_storage {
                flags |= SymbolFlags::COMMON;
                SectionBinding::Common
            } else {
                flags |= SymbolFlags::UNDEFINED;
                SectionBinding::Undefined
            }
        }
        SS_UNIVERSAL => {
            flags |= SymbolFlags::EXPORT | SymbolFlags::GLOBAL;
            let function_like_resolve = matches!(
                symbol_type,
                ST_ENTRY | ST_PRI_PROG | ST_SEC_PROG | ST_MILLICODE
            );
            let binding = resolve_subspace(
                subspaces,
                function_like_resolve,
                executable,
                raw.symbol_info,
                value,
            );
            if let SectionBinding::Subspace(idx) = binding {
                value -= subspaces[idx].vma;
            }
            binding
        }
        _ => {
            flags |= SymbolFlags::LOCAL;
            let function_like_resolve = matches!(
                symbol_type,
                ST_ENTRY | ST_PRI_PROG | ST_SEC_PROG | ST_MILLICODE
            );
            let binding = resolve_subspace(
                subspaces,
                function_like_resolve,
                executable,
                raw.symbol_info,
                value,
            );
            if let SectionBinding::Subspace(idx) = binding {
                value -= subspaces[idx].vma;
            }
            binding
        }
    };

    if secondary_def {
        flags |= SymbolFlags::WEAK;
    }

    if name.starts_with('$') && name.ends_with('$') {
        if let SectionBinding::Subspace(idx) = section {
            if subspaces[idx].name == name {
                flags |= SymbolFlags::SECTION_SYM;
            }
        }
    }
    let renamed_name = if let Some(rest) = name.strip_prefix("L$0\u{2}") {
        let _ = rest;
        flags |= SymbolFlags::SECTION_SYM;
        if let SectionBinding::Subspace(idx) = section {
            subspaces[idx].name.clone()
        } else {
            name.clone()
        }
    } else if name.starts_with("L$0\u{1}") {
        flags |= SymbolFlags::DEBUGGING;
        name.clone()
    } else {
        name
    };

    Ok(Symbol {
        name: renamed_name,
        som_type,
        flags,
        section,
        value,
        arg_reloc,
        priv_level,
    })
}

/// Derives the on-disk symbol type/scope/flags for writing (inverse of
/// [`from_raw`], §4.6 "The inverse").
pub fn to_raw(symbol: &Symbol, section_index: Option<u32>, strings_offset: u32) -> RawSymbol {
    let is_common = symbol.flags.contains(SymbolFlags::COMMON);
    let is_function = symbol.flags.contains(SymbolFlags::FUNCTION);
    let is_undefined = symbol.flags.contains(SymbolFlags::UNDEFINED);

    let symbol_type = match symbol.som_type {
        SomType::Entry | SomType::Millicode => {
            if symbol.som_type == SomType::Entry {
                ST_ENTRY
            } else {
                ST_MILLICODE
            }
        }
        _ if is_common && symbol.flags.contains(SymbolFlags::UNDEFINED | SymbolFlags::GLOBAL) => {
            ST_STORAGE
        }
        _ if is_undefined && is_function => ST_CODE,
        SomType::Absolute => ST_ABSOLUTE,
        SomType::Data => ST_DATA,
        SomType::Code => {
            if is_function {
                ST_ENTRY
            } else {
                ST_CODE
            }
        }
        SomType::PriProg => ST_PRI_PROG,
        SomType::SecProg => ST_SEC_PROG,
        SomType::Plabel => ST_PLABEL,
        SomType::Unknown => ST_NULL,
    };

    let symbol_scope = if symbol.flags.contains(SymbolFlags::LOCAL) {
        SS_LOCAL
    } else if is_common {
        if symbol.flags.contains(SymbolFlags::UNDEFINED) {
            SS_UNSAT
        } else {
            SS_EXTERNAL
        }
    } else if is_undefined {
        if symbol.flags.contains(SymbolFlags::GLOBAL) {
            SS_EXTERNAL
        } else {
            SS_UNSAT
        }
    } else {
        SS_UNIVERSAL
    };

    let secondary_def = symbol.flags.contains(SymbolFlags::WEAK);
    let flags = pack_flags(symbol_type, symbol_scope, symbol.arg_reloc, secondary_def);
    // Section-relative value stays section-relative on disk; the
    // writer adds the subspace base back in when it knows the layout.
    let value = symbol.value | symbol.priv_level as u32;

    RawSymbol {
        name: strings_offset,
        flags,
        symbol_info: section_index.unwrap_or(0),
        symbol_value: value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strtab::StrtabWriter;

    fn one_name_strtab(name: &str) -> (alloc::vec::Vec<u8>, u32) {
        let mut w = StrtabWriter::new();
        let off = w.push(name);
        (w.into_bytes(), off)
    }

    #[test]
    fn entry_symbol_extracts_priv_level_and_function_flag() {
        let (blob, off) = one_name_strtab("main");
        let strtab = Strtab::new(&blob);
        let flags = pack_flags(ST_ENTRY, SS_UNIVERSAL, 0, false);
        let raw = RawSymbol {
            name: off,
            flags,
            symbol_info: 0,
            symbol_value: 0x1003,
        };
        let subspaces = alloc::vec![Subspace {
            name: "$CODE$".into(),
            space: 0,
            flags: crate::space::SectionFlags::CODE,
            vma: 0x1000,
            size: 0x100,
            filepos: 0,
            alignment_power: 3,
            access_control_bits: 0,
            quadrant: 0,
            sort_key: 0,
            target_index: 0,
            fixup_location: 0,
            fixup_length: 0,
            is_loadable: true,
            is_comdat: false,
            is_common: false,
            dup_common: false,
            code_only: true,
            memory_resident: false,
            initially_frozen: false,
            is_first: true,
            replicate_init: false,
            continuation: false,
            target_specific: false,
        }];
        let sym = from_raw(&raw, &strtab, &subspaces, true).unwrap();
        assert_eq!(sym.som_type, SomType::Entry);
        assert!(sym.flags.contains(SymbolFlags::FUNCTION));
        assert_eq!(sym.priv_level, 3);
        assert_eq!(sym.value, 3); // 0x1003 & !0x3 - vma(0x1000) = 3
        assert_eq!(sym.section, SectionBinding::Subspace(0));
    }

    #[test]
    fn section_sym_heuristic_renames_l_dollar_zero() {
        let (blob, off) = one_name_strtab("L$0\u{2}foo");
        let strtab = Strtab::new(&blob);
        let flags = pack_flags(ST_CODE, SS_LOCAL, 0, false);
        let raw = RawSymbol {
            name: off,
            flags,
            symbol_info: 0,
            symbol_value: 0,
        };
        let subspaces = alloc::vec![Subspace {
            name: "$CODE$".into(),
            space: 0,
            flags: crate::space::SectionFlags::CODE,
            vma: 0,
            size: 0x10,
            filepos: 0,
            alignment_power: 0,
            access_control_bits: 0,
            quadrant: 0,
            sort_key: 0,
            target_index: 0,
            fixup_location: 0,
            fixup_length: 0,
            is_loadable: true,
            is_comdat: false,
            is_common: false,
            dup_common: false,
            code_only: false,
            memory_resident: false,
            initially_frozen: false,
            is_first: false,
            replicate_init: false,
            continuation: false,
            target_specific: false,
        }];
        let sym = from_raw(&raw, &strtab, &subspaces, false).unwrap();
        assert!(sym.flags.contains(SymbolFlags::SECTION_SYM));
        assert_eq!(sym.name, "$CODE$");
    }

    #[test]
    fn weak_flag_and_arg_reloc_round_trip_independently() {
        // arg_reloc with bit 2 set used to be misread as the weak bit.
        let arg_reloc = 0b00_0100;
        let flags = pack_flags(ST_DATA, SS_UNIVERSAL, arg_reloc, true);
        let (symbol_type, symbol_scope, unpacked_arg_reloc, secondary_def) = unpack_flags(flags);
        assert_eq!(symbol_type, ST_DATA);
        assert_eq!(symbol_scope, SS_UNIVERSAL);
        assert_eq!(unpacked_arg_reloc, arg_reloc);
        assert!(secondary_def);

        let not_weak = pack_flags(ST_DATA, SS_UNIVERSAL, arg_reloc, false);
        let (.., unpacked_arg_reloc2, secondary_def2) = unpack_flags(not_weak);
        assert_eq!(unpacked_arg_reloc2, arg_reloc);
        assert!(!secondary_def2);
    }
}
