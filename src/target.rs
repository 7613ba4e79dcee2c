//! Ties the header, space/subspace, and symbol modules together into a
//! single parsed object — the reader pipeline (§4.9) and the thin
//! descriptor a generic driver would dispatch through (§6 "Exposed
//! interface").

use alloc::vec::Vec;
use scroll::Pread;

use crate::archive::lst::ModuleEntry;
use crate::error::{Error, Result};
use crate::header::{
    self, ExecAuxHeader, RawHeader, AUX_ID_EXEC, DL_MAGIC, EXECLIBMAGIC, LIBMAGIC, SHL_MAGIC,
};
use crate::space::{self, RawSpace, RawSubspace, Space, Subspace};
use crate::strtab::Strtab;
use crate::symbol::{self, RawSymbol, Symbol};

bitflags::bitflags! {
    /// BFD-style object flags derived from the header magic
    /// (`object_setup`, §4.9).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        const EXEC_P    = 1 << 0;
        const HAS_RELOC = 1 << 1;
        const HAS_SYMS  = 1 << 2;
        const DYNAMIC   = 1 << 3;
        const D_PAGED   = 1 << 4;
        const WP_TEXT   = 1 << 5;
    }
}

/// Derives [`ObjectFlags`] from the header magic (`object_setup`).
pub fn object_flags(magic: u32) -> ObjectFlags {
    use crate::header::{DEMAND_MAGIC, EXEC_MAGIC, RELOC_MAGIC, SHARE_MAGIC};
    let mut flags = ObjectFlags::HAS_SYMS;
    match magic {
        RELOC_MAGIC => flags |= ObjectFlags::HAS_RELOC,
        EXEC_MAGIC => flags |= ObjectFlags::EXEC_P,
        SHARE_MAGIC => flags |= ObjectFlags::EXEC_P | ObjectFlags::WP_TEXT,
        DEMAND_MAGIC => flags |= ObjectFlags::EXEC_P | ObjectFlags::D_PAGED,
        DL_MAGIC | SHL_MAGIC => flags |= ObjectFlags::EXEC_P | ObjectFlags::DYNAMIC,
        _ => {}
    }
    flags
}

/// A fully parsed SOM object: header, section geometry, and symbols.
pub struct SomObject {
    pub header: RawHeader,
    pub flags: ObjectFlags,
    pub exec_aux: Option<ExecAuxHeader>,
    pub spaces: Vec<Space>,
    pub subspaces: Vec<Subspace>,
    pub symbols: Vec<Symbol>,
    /// Default architecture the reader records when nothing in the
    /// header distinguishes a finer PA-RISC revision (§4.9).
    pub architecture: &'static str,
}

fn executable_magic(magic: u32) -> bool {
    header::is_executable_magic(magic)
}

/// Follows the EXECLIBMAGIC indirection: LST header → directory →
/// first module's location (§3, §4.9). Returns the byte offset of the
/// inner SOM's own header.
fn resolve_execlib(bytes: &[u8]) -> Result<usize> {
    let lst: crate::archive::lst::LstHeader = bytes.pread_with(0, scroll::BE)?;
    if lst.magic != LIBMAGIC {
        return Err(Error::WrongFormat("EXECLIB front matter is not a LIBMAGIC LST".into()));
    }
    if lst.module_count == 0 {
        return Err(Error::WrongFormat("EXECLIB directory has no modules".into()));
    }
    let first: ModuleEntry = bytes.pread_with(lst.dir_loc as usize, scroll::BE)?;
    Ok(first.location as usize)
}

/// Reads every aux header between `aux_header_location` and
/// `aux_header_location + aux_header_size`, returning the executable
/// one if present (§4.8, §4.9).
fn read_exec_aux_header(bytes: &[u8], header: &RawHeader) -> Result<Option<ExecAuxHeader>> {
    if header.aux_header_size == 0 {
        return Ok(None);
    }
    let start = header.aux_header_location as usize;
    let end = start
        .checked_add(header.aux_header_size as usize)
        .ok_or(Error::FileTooBig)?;
    let region = bytes
        .get(start..end)
        .ok_or_else(|| Error::BadValue("aux header region out of range".into()))?;

    let mut pos = 0usize;
    while pos + 8 <= region.len() {
        let kind: u32 = region.pread_with(pos, scroll::BE)?;
        let len: u32 = region.pread_with(pos + 4, scroll::BE)?;
        let body_start = pos + 8;
        let body_end = body_start
            .checked_add(len as usize)
            .ok_or(Error::FileTooBig)?;
        if body_end > region.len() {
            return Err(Error::BadValue("aux header body runs past its region".into()));
        }
        if kind == AUX_ID_EXEC {
            let exec: ExecAuxHeader = region.pread_with(body_start, scroll::BE)?;
            return Ok(Some(exec));
        }
        let padded = (len as usize + 3) & !3;
        pos = body_start + padded;
    }
    Ok(None)
}

/// The "buggy linker" workaround (`object_setup`, §4.9, §9): some
/// linkers write `exec_entry`/`exec_flags` transposed. If the entry
/// point looks wrong for an executable, swap the two fields back.
/// Retained as a compatibility quirk, not a design choice.
fn fix_buggy_linker(exec: &mut ExecAuxHeader, flags: ObjectFlags, subspaces: &[Subspace]) {
    let zero_and_not_dynamic = exec.exec_entry == 0 && !flags.contains(ObjectFlags::DYNAMIC);
    let misaligned = exec.exec_entry % 4 != 0;
    let in_no_code_section = !subspaces.iter().any(|s| {
        s.flags.contains(crate::space::SectionFlags::CODE)
            && exec.exec_entry >= s.vma
            && exec.exec_entry < s.vma.saturating_add(s.size)
    });
    if zero_and_not_dynamic || misaligned || in_no_code_section {
        core::mem::swap(&mut exec.exec_entry, &mut exec.exec_flags);
    }
}

/// Parses a complete SOM object, following EXECLIBMAGIC indirection if
/// present (§4.9).
pub fn parse(bytes: &[u8]) -> Result<SomObject> {
    let probe: RawHeader = bytes
        .pread_with(0, scroll::BE)
        .map_err(|_| Error::WrongFormat("file too short for a header".into()))?;

    let current_offset = if probe.a_magic == EXECLIBMAGIC {
        resolve_execlib(bytes)?
    } else {
        0
    };

    let region = bytes
        .get(current_offset..)
        .ok_or_else(|| Error::WrongFormat("EXECLIB directory points past end of file".into()))?;
    let raw_header = header::parse_header(region)?;

    let exec_aux = if executable_magic(raw_header.a_magic) {
        read_exec_aux_header(region, &raw_header)?
    } else {
        None
    };

    let space_bytes = region
        .get(
            raw_header.space_location as usize
                ..raw_header.space_location as usize
                    + raw_header.space_total as usize * core::mem::size_of::<RawSpace>(),
        )
        .ok_or_else(|| Error::BadValue("space dictionary out of range".into()))?;
    let mut raw_spaces = Vec::with_capacity(raw_header.space_total as usize);
    for i in 0..raw_header.space_total as usize {
        let s: RawSpace = space_bytes.pread_with(i * core::mem::size_of::<RawSpace>(), scroll::BE)?;
        raw_spaces.push(s);
    }

    let subspace_bytes = region
        .get(
            raw_header.subspace_location as usize
                ..raw_header.subspace_location as usize
                    + raw_header.subspace_total as usize * core::mem::size_of::<RawSubspace>(),
        )
        .ok_or_else(|| Error::BadValue("subspace dictionary out of range".into()))?;
    let mut raw_subspaces = Vec::with_capacity(raw_header.subspace_total as usize);
    for i in 0..raw_header.subspace_total as usize {
        let s: RawSubspace =
            subspace_bytes.pread_with(i * core::mem::size_of::<RawSubspace>(), scroll::BE)?;
        raw_subspaces.push(s);
    }

    let space_strings_region = region
        .get(
            raw_header.space_strings_location as usize
                ..raw_header.space_strings_location as usize
                    + raw_header.space_strings_size as usize,
        )
        .ok_or_else(|| Error::BadValue("space string table out of range".into()))?;
    let space_strings = Strtab::new(space_strings_region);

    let (spaces, subspaces) = space::build(&raw_spaces, &raw_subspaces, &space_strings)?;

    let symbol_strings_region = region
        .get(
            raw_header.symbol_strings_location as usize
                ..raw_header.symbol_strings_location as usize
                    + raw_header.symbol_strings_size as usize,
        )
        .ok_or_else(|| Error::BadValue("symbol string table out of range".into()))?;
    let symbol_strings = Strtab::new(symbol_strings_region);
    if raw_header.symbol_total > 0 && symbol_strings.is_empty() {
        return Err(Error::NoSymbols);
    }

    let symbol_bytes = region
        .get(
            raw_header.symbol_location as usize
                ..raw_header.symbol_location as usize
                    + raw_header.symbol_total as usize * core::mem::size_of::<RawSymbol>(),
        )
        .ok_or_else(|| Error::BadValue("symbol dictionary out of range".into()))?;
    let executable = executable_magic(raw_header.a_magic);
    let mut symbols = Vec::with_capacity(raw_header.symbol_total as usize);
    for i in 0..raw_header.symbol_total as usize {
        let raw: RawSymbol = symbol_bytes.pread_with(i * core::mem::size_of::<RawSymbol>(), scroll::BE)?;
        if symbol::is_extension(&raw) {
            continue;
        }
        symbols.push(symbol::from_raw(&raw, &symbol_strings, &subspaces, executable)?);
    }

    let flags = object_flags(raw_header.a_magic);
    let mut exec_aux = exec_aux;
    if let Some(exec) = exec_aux.as_mut() {
        fix_buggy_linker(exec, flags, &subspaces);
    }

    Ok(SomObject {
        header: raw_header,
        flags,
        exec_aux,
        spaces,
        subspaces,
        symbols,
        architecture: "hppa:pa10",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{EXEC_MAGIC, VERSION_ID_NEW};
    use crate::strtab::StrtabWriter;
    use scroll::Pwrite;

    #[test]
    fn object_flags_mark_exec_p_for_exec_magic() {
        let flags = object_flags(EXEC_MAGIC);
        assert!(flags.contains(ObjectFlags::EXEC_P));
        assert!(flags.contains(ObjectFlags::HAS_SYMS));
        assert!(!flags.contains(ObjectFlags::DYNAMIC));
    }

    #[test]
    fn parse_rejects_file_too_short_for_header() {
        let bytes = [0u8; 4];
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn parse_plain_reloc_object_with_no_spaces() {
        use crate::header::RELOC_MAGIC;
        let mut strings = StrtabWriter::new();
        let _ = strings.push("");
        let blob = strings.into_bytes();

        let mut header = RawHeader {
            system_id: 0x20B,
            a_magic: RELOC_MAGIC,
            version_id: VERSION_ID_NEW,
            space_strings_size: blob.len() as u32,
            symbol_strings_size: blob.len() as u32,
            ..Default::default()
        };
        header.fix_checksum();

        let mut bytes = alloc::vec![0u8; crate::header::HEADER_WORDS * 4 + blob.len()];
        bytes.pwrite_with(header, 0, scroll::BE).unwrap();
        let strings_off = crate::header::HEADER_WORDS * 4;
        bytes[strings_off..].copy_from_slice(&blob);
        // Both string locations point at the same (empty) blob.
        let mut header2 = header;
        header2.space_strings_location = strings_off as u32;
        header2.symbol_strings_location = strings_off as u32;
        header2.fix_checksum();
        bytes.pwrite_with(header2, 0, scroll::BE).unwrap();

        let object = parse(&bytes).unwrap();
        assert_eq!(object.spaces.len(), 0);
        assert_eq!(object.symbols.len(), 0);
        assert_eq!(object.architecture, "hppa:pa10");
    }
}
