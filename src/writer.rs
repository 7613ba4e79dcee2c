//! The phased writer pipeline (§4.8): lays out header, aux headers,
//! dictionaries, string tables, section contents, fixups, and the
//! symbol table into one flat file image.
//!
//! This crate writes fixups in the caller's symbol order rather than
//! re-sorting symbols by output-reloc frequency first; the frequency
//! sort in the pipeline this is grounded on is a size optimization
//! (small indices encode in fewer bytes), not a correctness
//! requirement, and is recorded as a simplification in DESIGN.md.

use alloc::vec;
use alloc::vec::Vec;
use scroll::Pwrite;

use crate::error::{Error, Result};
use crate::fixup::{self, Relocation};
use crate::header::{
    self, CompilationUnit, ExecAuxHeader, RawHeader, AUX_ID_EXEC, DEMAND_MAGIC, EXEC_MAGIC,
    HEADER_WORDS, RELOC_MAGIC, SHARE_MAGIC, SHL_MAGIC, VERSION_ID_NEW,
};
use crate::space::{RawSpace, RawSubspace, SectionFlags, Space, Subspace};
use crate::strtab::StrtabWriter;
use crate::symbol::{self, RawSymbol, Symbol};
use crate::target::ObjectFlags;

/// The standard PA-RISC page size, used for executable segment
/// alignment (§4.8 step 3).
pub const PA_PAGESIZE: u32 = 4096;

/// The three PA-RISC revisions the writer knows how to tag a system id
/// for (§4.8 step "Compute system id from machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    Pa10,
    Pa11,
    Pa20,
}

fn system_id(machine: Machine) -> u32 {
    match machine {
        Machine::Pa10 => 0x20B,
        Machine::Pa11 => 0x210,
        Machine::Pa20 => 0x215,
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

fn pad_to(out: &mut Vec<u8>, align: u32) {
    let target = align_up(out.len() as u32, align) as usize;
    out.resize(target, 0);
}

/// Chooses the output magic from the object's BFD-style flags
/// (`object_setup`'s inverse, §4.8 step 1).
pub fn choose_magic(flags: ObjectFlags) -> u32 {
    if !flags.contains(ObjectFlags::EXEC_P) {
        return RELOC_MAGIC;
    }
    if flags.contains(ObjectFlags::DYNAMIC) {
        SHL_MAGIC
    } else if flags.contains(ObjectFlags::D_PAGED) {
        DEMAND_MAGIC
    } else if flags.contains(ObjectFlags::WP_TEXT) {
        SHARE_MAGIC
    } else {
        EXEC_MAGIC
    }
}

/// One subspace's output material: its raw bytes and the relocations
/// against it, in the same order as [`WriteRequest::subspaces`].
pub struct SubspaceData<'a> {
    pub contents: &'a [u8],
    pub relocations: &'a [Relocation],
}

/// Everything the writer needs to lay out one SOM file.
pub struct WriteRequest<'a> {
    pub flags: ObjectFlags,
    pub machine: Machine,
    pub spaces: &'a [Space],
    pub subspaces: &'a [Subspace],
    pub subspace_data: &'a [SubspaceData<'a>],
    pub symbols: &'a [Symbol],
    pub compilation_unit: Option<CompilationUnit>,
    pub version_string: Option<&'a str>,
    pub copyright_string: Option<&'a str>,
}

fn write_aux_string(out: &mut Vec<u8>, kind: u32, text: &str) {
    let len = text.len() as u32;
    let pos = out.len();
    out.resize(pos + 8, 0);
    out.pwrite_with(kind, pos, scroll::BE).unwrap();
    out.pwrite_with(len, pos + 4, scroll::BE).unwrap();
    out.extend_from_slice(text.as_bytes());
    pad_to(out, 4);
}

/// Serializes one [`WriteRequest`] into a complete SOM file image
/// (§4.8).
pub fn write(req: &WriteRequest) -> Result<Vec<u8>> {
    if req.subspaces.len() != req.subspace_data.len() {
        return Err(Error::BadValue(
            "subspace_data must have one entry per subspace".into(),
        ));
    }

    let magic = choose_magic(req.flags);
    let executable = header::is_executable_magic(magic);

    let mut out = vec![0u8; HEADER_WORDS * 4];

    // Aux headers: version/copyright strings, then a reserved slot for
    // the executable aux header if this is an executable.
    let aux_header_location = out.len() as u32;
    if let Some(version) = req.version_string {
        write_aux_string(&mut out, header::AUX_ID_VERSION, version);
    }
    if let Some(copyright) = req.copyright_string {
        write_aux_string(&mut out, header::AUX_ID_COPYRIGHT, copyright);
    }
    let exec_aux_location = if executable {
        let pos = out.len();
        out.resize(pos + 8, 0);
        out.pwrite_with(AUX_ID_EXEC, pos, scroll::BE).unwrap();
        let size = core::mem::size_of::<ExecAuxHeader>() as u32;
        out.pwrite_with(size, pos + 4, scroll::BE).unwrap();
        let loc = out.len() as u32;
        out.resize(out.len() + size as usize, 0);
        Some(loc)
    } else {
        None
    };
    let aux_header_size = out.len() as u32 - aux_header_location;

    // Init array: empty (no writer-side producer for it in this
    // crate's scope).
    let init_array_location = out.len() as u32;

    // Reserve space/subspace dict regions by count.
    let space_location = out.len() as u32;
    out.resize(out.len() + req.spaces.len() * core::mem::size_of::<RawSpace>(), 0);
    let subspace_location = out.len() as u32;
    out.resize(
        out.len() + req.subspaces.len() * core::mem::size_of::<RawSubspace>(),
        0,
    );
    pad_to(&mut out, 4);

    // Space string table: every space and subspace name, tracking the
    // offset each gets so the dicts can be filled in once written.
    let space_strings_location = out.len() as u32;
    let mut space_strings = StrtabWriter::new();
    let space_name_offsets: Vec<u32> = req.spaces.iter().map(|s| space_strings.push(&s.name)).collect();
    let subspace_name_offsets: Vec<u32> =
        req.subspaces.iter().map(|s| space_strings.push(&s.name)).collect();
    let space_strings_bytes = space_strings.into_bytes();
    let space_strings_size = space_strings_bytes.len() as u32;
    out.extend_from_slice(&space_strings_bytes);

    // Compilation-unit record.
    let compiler_location = out.len() as u32;
    let compiler_total = if let Some(cu) = req.compilation_unit {
        let pos = out.len();
        out.resize(pos + core::mem::size_of::<CompilationUnit>(), 0);
        out.pwrite_with(cu, pos, scroll::BE).unwrap();
        1u32
    } else {
        0
    };

    // Two passes over subspaces: loadable first (with page/VMA-hole
    // alignment and text/data/bss accounting), then non-loadable.
    let mut filepos = vec![0u32; req.subspaces.len()];
    let mut exec = ExecAuxHeader::default();
    let mut seen_code = false;
    let mut seen_data = false;
    let mut last_space: Option<usize> = None;

    let order_loadable: Vec<usize> = (0..req.subspaces.len())
        .filter(|&i| req.subspaces[i].is_loadable)
        .collect();
    let order_nonloadable: Vec<usize> = (0..req.subspaces.len())
        .filter(|&i| !req.subspaces[i].is_loadable)
        .collect();

    for &idx in &order_loadable {
        let sub = &req.subspaces[idx];
        if executable && last_space != Some(sub.space) {
            pad_to(&mut out, PA_PAGESIZE);
            last_space = Some(sub.space);
        }
        let is_code = sub.flags.contains(SectionFlags::CODE);
        let is_data = !is_code;
        if executable && is_code && !seen_code {
            exec.exec_tmem = sub.vma;
            exec.exec_tfile = out.len() as u32;
            seen_code = true;
        }
        if executable && is_data && !seen_data {
            exec.exec_dmem = sub.vma;
            exec.exec_dfile = out.len() as u32;
            seen_data = true;
        }
        filepos[idx] = out.len() as u32;
        out.extend_from_slice(req.subspace_data[idx].contents);
        if sub.flags.contains(SectionFlags::CODE) {
            exec.exec_tsize += sub.size;
        } else if sub.flags.contains(SectionFlags::HAS_CONTENTS) {
            exec.exec_dsize += sub.size;
        } else {
            exec.exec_bsize += sub.size;
        }
    }

    if !order_nonloadable.is_empty() {
        pad_to(&mut out, PA_PAGESIZE);
        for &idx in &order_nonloadable {
            filepos[idx] = out.len() as u32;
            out.extend_from_slice(req.subspace_data[idx].contents);
        }
    }

    // Symbol table region, reserved then filled once string offsets
    // are known.
    pad_to(&mut out, 4);
    let symbol_location = out.len() as u32;
    out.resize(out.len() + req.symbols.len() * core::mem::size_of::<RawSymbol>(), 0);

    pad_to(&mut out, 4);
    let symbol_strings_location = out.len() as u32;
    let mut symbol_strings = StrtabWriter::new();
    let symbol_name_offsets: Vec<u32> =
        req.symbols.iter().map(|s| symbol_strings.push(&s.name)).collect();
    let symbol_strings_bytes = symbol_strings.into_bytes();
    let symbol_strings_size = symbol_strings_bytes.len() as u32;
    out.extend_from_slice(&symbol_strings_bytes);

    // Fixups: one encoded stream per subspace with contents, in the
    // caller's relocation order (see module doc for the frequency-sort
    // simplification).
    let mut fixup_location = vec![0u32; req.subspaces.len()];
    let mut fixup_quantity = vec![0u32; req.subspaces.len()];
    let fixup_request_location = out.len() as u32;
    for (idx, sub) in req.subspaces.iter().enumerate() {
        let relocs = req.subspace_data[idx].relocations;
        if relocs.is_empty() && !sub.flags.contains(SectionFlags::RELOC) {
            continue;
        }
        let stream = fixup::encoder::encode(relocs, sub.size)?;
        fixup_location[idx] = out.len() as u32;
        fixup_quantity[idx] = stream.len() as u32;
        out.extend_from_slice(&stream);
    }
    let fixup_request_total = out.len() as u32 - fixup_request_location;

    // Symbol dictionary.
    for (i, symbol) in req.symbols.iter().enumerate() {
        let section_index = match symbol.section {
            crate::symbol::SectionBinding::Subspace(idx) => Some(idx as u32),
            _ => None,
        };
        let raw = symbol::to_raw(symbol, section_index, symbol_name_offsets[i]);
        out.pwrite_with(raw, symbol_location as usize + i * core::mem::size_of::<RawSymbol>(), scroll::BE)?;
    }

    // Subspace dicts, loadable first, then non-loadable.
    let written_order: Vec<usize> = order_loadable.iter().chain(order_nonloadable.iter()).copied().collect();
    for (slot, &idx) in written_order.iter().enumerate() {
        let sub = &req.subspaces[idx];
        let raw = RawSubspace {
            space_index: sub.space as u32,
            flags: subspace_flags_word(sub),
            file_loc_init_value: filepos[idx],
            initialization_length: if sub.flags.contains(SectionFlags::HAS_CONTENTS) {
                sub.size
            } else {
                0
            },
            subspace_start: sub.vma,
            subspace_length: sub.size,
            alignment: 1 << sub.alignment_power,
            quadrant: sub.quadrant as u32,
            sort_key: sub.sort_key as u32,
            access_control_bits: sub.access_control_bits as u32,
            fixup_request_index: fixup_location[idx],
            fixup_request_quantity: fixup_quantity[idx],
            name: subspace_name_offsets[idx],
            reserved: 0,
        };
        out.pwrite_with(
            raw,
            subspace_location as usize + slot * core::mem::size_of::<RawSubspace>(),
            scroll::BE,
        )?;
    }

    // Space dicts: subspace_index/quantity point at each space's run
    // within the now loadable-first subspace dict order.
    for (i, space) in req.spaces.iter().enumerate() {
        let positions: Vec<usize> = written_order
            .iter()
            .enumerate()
            .filter(|(_, &orig)| req.subspaces[orig].space == i)
            .map(|(slot, _)| slot)
            .collect();
        let (subspace_index, subspace_quantity) = match (positions.first(), positions.len()) {
            (Some(&first), n) => (first as u32, n as u32),
            (None, _) => (0, 0),
        };
        let raw = RawSpace {
            name: space_name_offsets[i],
            flags: space_flags_word(space),
            space_number: space.space_number,
            subspace_index,
            subspace_quantity,
            loader_fix_index: 0,
            loader_fix_quantity: 0,
            init_pointer_index: 0,
            init_pointer_quantity: 0,
            sort_key: space.sort_key as u32,
            reserved: 0,
        };
        out.pwrite_with(
            raw,
            space_location as usize + i * core::mem::size_of::<RawSpace>(),
            scroll::BE,
        )?;
    }

    // Header, checksummed last.
    let mut header = RawHeader {
        system_id: system_id(req.machine),
        a_magic: magic,
        version_id: VERSION_ID_NEW,
        aux_header_location,
        aux_header_size,
        som_length: out.len() as u32,
        space_location,
        space_total: req.spaces.len() as u32,
        subspace_location,
        subspace_total: req.subspaces.len() as u32,
        loader_fixup_location: 0,
        loader_fixup_total: 0,
        space_strings_location,
        space_strings_size,
        init_array_location,
        init_array_total: 0,
        compiler_location,
        compiler_total,
        symbol_location,
        symbol_total: req.symbols.len() as u32,
        fixup_request_location,
        fixup_request_total,
        symbol_strings_location,
        symbol_strings_size,
        unloadable_sp_location: 0,
        unloadable_sp_size: 0,
        reserved1: 0,
        reserved2: 0,
        checksum: 0,
    };
    header.fix_checksum();
    out.pwrite_with(header, 0, scroll::BE)?;

    if let Some(loc) = exec_aux_location {
        // Round data size up to a page, shrinking bss by the delta
        // (§4.8 step 4, last bullet).
        let rounded_dsize = align_up(exec.exec_dsize, PA_PAGESIZE);
        let delta = rounded_dsize - exec.exec_dsize;
        exec.exec_bsize = exec.exec_bsize.saturating_sub(delta);
        exec.exec_dsize = rounded_dsize;
        if exec.exec_tfile + exec.exec_tsize > out.len() as u32
            || exec.exec_dfile + exec.exec_dsize > out.len() as u32
        {
            return Err(Error::BadValue(
                "executable text/data extent exceeds file length".into(),
            ));
        }
        out.pwrite_with(exec, loc as usize, scroll::BE)?;
    }

    Ok(out)
}

fn subspace_flags_word(sub: &Subspace) -> u32 {
    let mut flags = 0u32;
    if sub.is_loadable {
        flags |= 1 << 31;
    }
    if sub.memory_resident {
        flags |= 1 << 30;
    }
    if sub.dup_common {
        flags |= 1 << 29;
    }
    if sub.is_common {
        flags |= 1 << 28;
    }
    if sub.is_comdat {
        flags |= 1 << 27;
    }
    if sub.code_only {
        flags |= 1 << 26;
    }
    if sub.initially_frozen {
        flags |= 1 << 25;
    }
    if sub.is_first {
        flags |= 1 << 24;
    }
    if sub.replicate_init {
        flags |= 1 << 23;
    }
    if sub.continuation {
        flags |= 1 << 22;
    }
    if sub.target_specific {
        flags |= 1 << 21;
    }
    flags
}

fn space_flags_word(space: &Space) -> u32 {
    let mut flags = 0u32;
    if space.loadable {
        flags |= 1 << 31;
    }
    if space.defined {
        flags |= 1 << 30;
    }
    if space.private {
        flags |= 1 << 29;
    }
    if space.has_intermediate_code {
        flags |= 1 << 28;
    }
    if space.target_specific {
        flags |= 1 << 27;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixup::RelocKind;
    use crate::symbol::{SectionBinding, SomType, SymbolFlags};

    #[test]
    fn writes_a_relocatable_object_with_one_code_subspace_and_one_symbol() {
        let space = Space {
            name: "$TEXT$".into(),
            space_number: 0,
            sort_key: 0,
            loadable: true,
            defined: true,
            private: false,
            has_intermediate_code: false,
            target_specific: false,
            size: 4,
            vma: 0,
            subspaces: alloc::vec![0],
        };
        let subspace = Subspace {
            name: "$CODE$".into(),
            space: 0,
            flags: SectionFlags::CODE | SectionFlags::ALLOC | SectionFlags::LOAD | SectionFlags::HAS_CONTENTS,
            vma: 0,
            size: 4,
            filepos: 0,
            alignment_power: 2,
            access_control_bits: 0x30,
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
        };
        let symbol = Symbol {
            name: "main".into(),
            som_type: SomType::Entry,
            flags: SymbolFlags::EXPORT | SymbolFlags::GLOBAL | SymbolFlags::FUNCTION,
            section: SectionBinding::Subspace(0),
            value: 0,
            arg_reloc: 0,
            priv_level: 3,
        };
        let contents = [0u8; 4];
        let relocations: [Relocation; 0] = [];
        let data = SubspaceData {
            contents: &contents,
            relocations: &relocations,
        };

        let req = WriteRequest {
            flags: ObjectFlags::HAS_RELOC,
            machine: Machine::Pa10,
            spaces: &[space],
            subspaces: &[subspace],
            subspace_data: &[data],
            symbols: &[symbol],
            compilation_unit: None,
            version_string: None,
            copyright_string: None,
        };

        let bytes = write(&req).unwrap();
        let object = crate::target::parse(&bytes).unwrap();
        assert_eq!(object.header.a_magic, RELOC_MAGIC);
        assert_eq!(object.spaces.len(), 1);
        assert_eq!(object.subspaces.len(), 1);
        assert_eq!(object.symbols.len(), 1);
        assert_eq!(object.symbols[0].name, "main");
        assert!(object.header.checksum_valid());
    }
}
