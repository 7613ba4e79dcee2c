//! Archive support: the generic SysV `ar` container plus the library
//! symbol table (LST) that turns a directory of SOM files into a
//! searchable `.a` (§4.10).

pub mod ar;
pub mod lst;

use alloc::vec::Vec;
use scroll::Pread;

use crate::error::{Error, Result};
use crate::header::LIBMAGIC;

pub use ar::{Archive as ArArchive, Member, MemberHeader};
pub use lst::{hash_name, LstHeader, LstSymbol, ModuleSymbols, HASH_SIZE, NO_NEXT};
pub use lst::{build as build_symbol_table, emit as emit_symbol_table};

/// A `.a` library, with its member map and (if present) exported-symbol
/// index.
pub struct Library<'a> {
    pub members: ArArchive<'a>,
    pub symbol_table: Option<SymbolTable<'a>>,
}

/// The parsed library symbol table: record array, string blob, and the
/// per-bucket chain heads.
pub struct SymbolTable<'a> {
    pub records: Vec<LstSymbol>,
    pub strings: &'a [u8],
    pub buckets: [u32; HASH_SIZE],
}

impl<'a> SymbolTable<'a> {
    /// Resolves every exported name in `bucket`'s chain, validating
    /// termination as it walks (§4.10, §8 property 8).
    pub fn names_in_bucket(&self, bucket: usize) -> Result<Vec<&'a str>> {
        let strtab = crate::strtab::Strtab::new(self.strings);
        lst::walk_chain(&self.records, &strtab, self.buckets[bucket])
    }

    /// Resolves the names reachable by hashing `name` into its bucket.
    pub fn lookup(&self, name: &[u8]) -> Result<Vec<&'a str>> {
        let bucket = (hash_name(name)? % HASH_SIZE as u32) as usize;
        self.names_in_bucket(bucket)
    }
}

/// Reads a library symbol table member's bytes into a [`SymbolTable`].
fn parse_symbol_table(bytes: &[u8]) -> Result<SymbolTable> {
    let header: LstHeader = bytes.pread_with(0, scroll::BE)?;
    if header.magic != LIBMAGIC {
        return Err(Error::MalformedArchive("symbol-lookup member is not a LIBMAGIC LST".into()));
    }
    if header.hash_size as usize != HASH_SIZE {
        return Err(Error::MalformedArchive("unexpected library symbol table hash width".into()));
    }

    let mut buckets = [NO_NEXT; HASH_SIZE];
    let mut pos = header.hash_loc as usize;
    for bucket in buckets.iter_mut() {
        *bucket = bytes.pread_with(pos, scroll::BE)?;
        pos += 4;
    }

    const RECORD_SIZE: usize = 28; // 7 packed u32 fields
    let mut records = Vec::with_capacity(header.export_count as usize);
    let mut pos = header.export_loc as usize;
    for _ in 0..header.export_count {
        let record: LstSymbol = bytes.pread_with(pos, scroll::BE)?;
        pos += RECORD_SIZE;
        records.push(record);
    }

    let string_start = header.string_loc as usize;
    let string_end = string_start
        .checked_add(header.string_size as usize)
        .ok_or(Error::FileTooBig)?;
    let strings = bytes
        .get(string_start..string_end)
        .ok_or_else(|| Error::MalformedArchive("library symbol table string blob out of range".into()))?;

    Ok(SymbolTable { records, strings, buckets })
}

/// Slurps an archive: parses the member directory and, if the special
/// `/               ` member is present, its library symbol table.
/// Absent that member, the archive simply has no map (§4.10).
pub fn slurp(bytes: &[u8]) -> Result<Library> {
    let members = ArArchive::parse(bytes)?;
    let symbol_table = match members.symbol_table_bytes() {
        Some(member_bytes) => Some(parse_symbol_table(member_bytes)?),
        None => None,
    };
    Ok(Library { members, symbol_table })
}
