//! The library symbol table (LST): a chained-hash directory of a
//! `.a` archive's exported symbols (§3 "EXECLIB archive container",
//! §4.10).

use alloc::string::String;
use alloc::vec::Vec;
use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};
use crate::strtab::{Strtab, StrtabWriter};
use crate::symbol::{SectionBinding, Symbol, SymbolFlags};

/// Fixed hash-table width the format uses (§4.10).
pub const HASH_SIZE: usize = 31;

/// Sentinel marking the end of a hash chain; no valid record offset
/// can equal it (record offsets fit in 31 bits well under `u32::MAX`).
pub const NO_NEXT: u32 = u32::MAX;

/// The on-disk LST header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct LstHeader {
    pub magic: u32,
    pub version_id: u32,
    pub file_time: [u32; 4],
    pub hash_loc: u32,
    pub hash_size: u32,
    pub module_count: u32,
    pub module_limit: u32,
    pub dir_loc: u32,
    pub export_loc: u32,
    pub export_count: u32,
    pub string_loc: u32,
    pub string_size: u32,
    pub free_list: u32,
    pub file_end: u32,
    pub checksum: u32,
}

/// One entry in the per-member module directory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct ModuleEntry {
    pub location: u32,
    pub length: u32,
}

/// One exported-symbol record (§4.10).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct LstSymbol {
    pub symbol_type: u32,
    pub symbol_scope: u32,
    pub name: u32,
    pub som_index: u32,
    pub arg_reloc: u32,
    pub symbol_key: u32,
    pub next_entry: u32,
}

/// Computes the SOM library-symbol hash for `name` (§4.10).
pub fn hash_name(name: &[u8]) -> Result<u32> {
    match name.len() {
        0 => Err(Error::MalformedArchive("cannot hash an empty symbol name".into())),
        1 => Ok(0x0100_0100 | ((name[0] as u32) << 16) | name[0] as u32),
        len => Ok(((len as u32 & 0x7F) << 24)
            | ((name[1] as u32) << 16)
            | ((name[len - 2] as u32) << 8)
            | name[len - 1] as u32),
    }
}

/// True if `symbol` should be indexed in the LST: defined, and either
/// universally-scoped or of storage type (§4.10).
fn is_indexable(symbol: &Symbol) -> bool {
    if symbol.flags.contains(SymbolFlags::UNDEFINED) {
        return false;
    }
    let universal = symbol.flags.contains(SymbolFlags::EXPORT | SymbolFlags::GLOBAL)
        && !matches!(symbol.section, SectionBinding::Common);
    let storage = symbol.flags.contains(SymbolFlags::COMMON);
    universal || storage
}

/// One module's symbols, about to be folded into a shared [`LstSymbol`]
/// array plus string blob.
pub struct ModuleSymbols<'a> {
    pub som_index: u32,
    pub symbols: &'a [Symbol],
}

/// Builds the complete symbol-record array, its string blob, and the
/// `HASH_SIZE`-wide bucket table (byte offset of each chain's head, or
/// [`NO_NEXT`]).
pub fn build(modules: &[ModuleSymbols]) -> Result<(Vec<LstSymbol>, Vec<u8>, [u32; HASH_SIZE])> {
    const RECORD_SIZE: u32 = 28; // 7 u32 fields

    let mut strings = StrtabWriter::new();
    let mut records = Vec::new();
    let mut buckets = [NO_NEXT; HASH_SIZE];
    // Per-bucket tail record index, to append rather than prepend (so
    // chain order matches input order, which keeps hashing stable).
    let mut tails: [Option<usize>; HASH_SIZE] = [None; HASH_SIZE];

    for module in modules {
        for symbol in module.symbols {
            if !is_indexable(symbol) {
                continue;
            }
            let hash = hash_name(symbol.name.as_bytes())?;
            let bucket = (hash % HASH_SIZE as u32) as usize;
            let name_offset = strings.push(&symbol.name);

            let record_index = records.len();
            records.push(LstSymbol {
                symbol_type: 0,
                symbol_scope: 0,
                name: name_offset,
                som_index: module.som_index,
                arg_reloc: symbol.arg_reloc as u32,
                symbol_key: hash,
                next_entry: NO_NEXT,
            });

            match tails[bucket] {
                None => {
                    buckets[bucket] = record_index as u32 * RECORD_SIZE;
                }
                Some(prev) => {
                    records[prev].next_entry = record_index as u32 * RECORD_SIZE;
                }
            }
            tails[bucket] = Some(record_index);
        }
    }

    Ok((records, strings.into_bytes(), buckets))
}

/// Byte width of one packed [`LstSymbol`] record on disk.
const RECORD_SIZE: usize = 28;
/// Byte width of the fixed [`LstHeader`] on disk (18 packed u32 words;
/// `file_time` alone is 4).
const HEADER_SIZE: usize = 72;

/// Serializes a [`build`]-produced symbol table into a complete
/// `LIBMAGIC` member's bytes: header, hash table, records, string
/// blob, in that layout order (the inverse of
/// `archive::parse_symbol_table`). `module_count` is the number of
/// member SOMs the table was built from; this crate does not populate
/// the per-member module directory (see DESIGN.md), so `dir_loc` and
/// `module_limit` are written as `0`/`module_count` placeholders.
pub fn emit(
    module_count: u32,
    records: &[LstSymbol],
    strings: &[u8],
    buckets: &[u32; HASH_SIZE],
) -> Result<Vec<u8>> {
    let hash_loc = HEADER_SIZE as u32;
    let hash_bytes_len = (HASH_SIZE * 4) as u32;
    let export_loc = hash_loc + hash_bytes_len;
    let export_count = records.len() as u32;
    let string_loc = export_loc
        + export_count
            .checked_mul(RECORD_SIZE as u32)
            .ok_or(Error::FileTooBig)?;
    let string_size = strings.len() as u32;
    let file_end = string_loc.checked_add(string_size).ok_or(Error::FileTooBig)?;

    let header = LstHeader {
        magic: crate::header::LIBMAGIC,
        version_id: 1,
        file_time: [0; 4],
        hash_loc,
        hash_size: HASH_SIZE as u32,
        module_count,
        module_limit: module_count,
        dir_loc: 0,
        export_loc,
        export_count,
        string_loc,
        string_size,
        free_list: NO_NEXT,
        file_end,
        checksum: 0,
    };

    let mut out = alloc::vec![0u8; file_end as usize];
    out.pwrite_with(header, 0, scroll::BE)?;

    let mut pos = hash_loc as usize;
    for &bucket in buckets {
        out.pwrite_with(bucket, pos, scroll::BE)?;
        pos += 4;
    }

    let mut pos = export_loc as usize;
    for record in records {
        out.pwrite_with(*record, pos, scroll::BE)?;
        pos += RECORD_SIZE;
    }

    out[string_loc as usize..].copy_from_slice(strings);
    Ok(out)
}

/// Walks one hash bucket's chain starting at `head` (a byte offset, or
/// [`NO_NEXT`] for an empty bucket), returning the resolved names in
/// chain order.
pub fn walk_chain<'a>(
    records: &[LstSymbol],
    strings: &Strtab<'a>,
    head: u32,
) -> Result<Vec<&'a str>> {
    const RECORD_SIZE: u32 = 28;
    let mut names = Vec::new();
    let mut offset = head;
    let mut steps = 0usize;
    while offset != NO_NEXT {
        let idx = (offset / RECORD_SIZE) as usize;
        let record = records
            .get(idx)
            .ok_or_else(|| Error::MalformedArchive("library symbol table chain index out of range".into()))?;
        names.push(strings.get(record.name as usize)?);
        let next = record.next_entry;
        if next != NO_NEXT && next <= offset + RECORD_SIZE {
            return Err(Error::MalformedArchive(
                "library symbol table hash chain does not advance".into(),
            ));
        }
        offset = next;
        steps += 1;
        if steps > records.len() {
            return Err(Error::MalformedArchive(
                "library symbol table hash chain longer than the record array".into(),
            ));
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SectionFlags;
    use alloc::string::ToString;

    fn exported(name: &str) -> Symbol {
        Symbol {
            name: name.to_string(),
            som_type: crate::symbol::SomType::Code,
            flags: SymbolFlags::EXPORT | SymbolFlags::GLOBAL,
            section: SectionBinding::Subspace(0),
            value: 0,
            arg_reloc: 0,
            priv_level: 0,
        }
    }

    #[test]
    fn single_char_hash_matches_formula() {
        assert_eq!(hash_name(b"x").unwrap(), 0x0100_0100 | (b'x' as u32) << 16 | b'x' as u32);
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(hash_name(b"").is_err());
    }

    #[test]
    fn build_indexes_only_exported_symbols() {
        let mut undefined = exported("hidden");
        undefined.flags = SymbolFlags::UNDEFINED;
        let syms = alloc::vec![exported("foo"), undefined];
        let modules = alloc::vec![ModuleSymbols {
            som_index: 0,
            symbols: &syms,
        }];
        let (records, strings, buckets) = build(&modules).unwrap();
        assert_eq!(records.len(), 1);
        let strtab = Strtab::new(&strings);
        let bucket = (hash_name(b"foo").unwrap() % HASH_SIZE as u32) as usize;
        let names = walk_chain(&records, &strtab, buckets[bucket]).unwrap();
        assert_eq!(names, alloc::vec!["foo"]);
        let _ = SectionFlags::CODE;
    }

    #[test]
    fn emit_round_trips_through_parse_symbol_table() {
        let syms = alloc::vec![exported("foo"), exported("bar")];
        let modules = alloc::vec![ModuleSymbols {
            som_index: 3,
            symbols: &syms,
        }];
        let (records, strings, buckets) = build(&modules).unwrap();
        let bytes = emit(1, &records, &strings, &buckets).unwrap();

        let table = super::super::parse_symbol_table(&bytes).unwrap();
        assert_eq!(table.records, records);
        assert_eq!(table.strings, strings.as_slice());
        assert_eq!(table.buckets, buckets);
        assert_eq!(table.lookup(b"foo").unwrap(), alloc::vec!["foo"]);
        assert_eq!(table.lookup(b"bar").unwrap(), alloc::vec!["bar"]);
    }

    #[test]
    fn chain_that_does_not_advance_is_rejected() {
        let records = alloc::vec![
            LstSymbol {
                name: 0,
                next_entry: 0, // points back at/inside itself: invalid
                ..Default::default()
            },
        ];
        let strings = Vec::new();
        let strtab = Strtab::new(&strings);
        assert!(walk_chain(&records, &strtab, 0).is_err());
    }
}
