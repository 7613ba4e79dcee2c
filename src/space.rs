//! The space/subspace section hierarchy (§3, §4.5).
//!
//! A [`Space`] is a top-level section (`$TEXT$`, `$DATA$`, ...); each
//! owns a contiguous run of [`Subspace`]s. Both are read from fixed-size
//! dictionary records and resolve their `name` against the space-string
//! table.

use alloc::string::String;
use alloc::vec::Vec;
use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};
use crate::strtab::Strtab;

bitflags::bitflags! {
    /// Section-level flags, derived from on-disk space/subspace
    /// attributes (§4.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const ALLOC       = 1 << 0;
        const LOAD        = 1 << 1;
        const RELOC       = 1 << 2;
        const READONLY    = 1 << 3;
        const CODE        = 1 << 4;
        const DATA        = 1 << 5;
        const HAS_CONTENTS= 1 << 6;
        const DEBUGGING   = 1 << 7;
        const LINK_ONCE   = 1 << 8;
    }
}

/// The on-disk space dictionary record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct RawSpace {
    pub name: u32,
    /// Packed flags: bit 31 loadable, bit 30 defined, bit 29 private,
    /// bit 28 has-intermediate-code, bit 27 target-specific; low byte
    /// space number.
    pub flags: u32,
    pub space_number: u32,
    pub subspace_index: u32,
    pub subspace_quantity: u32,
    pub loader_fix_index: u32,
    pub loader_fix_quantity: u32,
    pub init_pointer_index: u32,
    pub init_pointer_quantity: u32,
    pub sort_key: u32,
    pub reserved: u32,
}

const SPACE_LOADABLE: u32 = 1 << 31;
const SPACE_DEFINED: u32 = 1 << 30;
const SPACE_PRIVATE: u32 = 1 << 29;
const SPACE_HAS_INTERMEDIATE_CODE: u32 = 1 << 28;
const SPACE_IS_TSPECIFIC: u32 = 1 << 27;

/// The on-disk subspace dictionary record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct RawSubspace {
    pub space_index: u32,
    /// Packed flags + 6-bit `access_control_bits` + 2-bit `quadrant`.
    pub flags: u32,
    pub file_loc_init_value: u32,
    pub initialization_length: u32,
    pub subspace_start: u32,
    pub subspace_length: u32,
    pub alignment: u32,
    pub quadrant: u32,
    pub sort_key: u32,
    pub access_control_bits: u32,
    pub fixup_request_index: u32,
    pub fixup_request_quantity: u32,
    pub name: u32,
    pub reserved: u32,
}

const SUB_LOADABLE: u32 = 1 << 31;
const SUB_MEMORY_RESIDENT: u32 = 1 << 30;
const SUB_DUP_COMMON: u32 = 1 << 29;
const SUB_IS_COMMON: u32 = 1 << 28;
const SUB_IS_COMDAT: u32 = 1 << 27;
const SUB_CODE_ONLY: u32 = 1 << 26;
const SUB_INITIALLY_FROZEN: u32 = 1 << 25;
const SUB_IS_FIRST: u32 = 1 << 24;
const SUB_REPLICATE_INIT: u32 = 1 << 23;
const SUB_CONTINUATION: u32 = 1 << 22;
const SUB_IS_TSPECIFIC: u32 = 1 << 21;

/// Internalized space/section record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Space {
    pub name: String,
    pub space_number: u32,
    pub sort_key: u8,
    pub loadable: bool,
    pub defined: bool,
    pub private: bool,
    pub has_intermediate_code: bool,
    pub target_specific: bool,
    pub size: u32,
    pub vma: u32,
    /// Indices into the crate-global subspace vector this space owns.
    pub subspaces: Vec<usize>,
}

/// Internalized subspace/section record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    pub name: String,
    pub space: usize,
    pub flags: SectionFlags,
    pub vma: u32,
    pub size: u32,
    pub filepos: u32,
    pub alignment_power: u32,
    pub access_control_bits: u8,
    pub quadrant: u8,
    pub sort_key: u8,
    pub target_index: u32,
    pub fixup_location: u32,
    pub fixup_length: u32,
    pub is_loadable: bool,
    pub is_comdat: bool,
    pub is_common: bool,
    pub dup_common: bool,
    pub code_only: bool,
    pub memory_resident: bool,
    pub initially_frozen: bool,
    pub is_first: bool,
    pub replicate_init: bool,
    pub continuation: bool,
    pub target_specific: bool,
}

fn log2_exact(value: u32) -> Result<u32> {
    if value == 0 || !value.is_power_of_two() {
        return Err(Error::BadValue(alloc::format!(
            "subspace alignment {} is not a power of two",
            value
        )));
    }
    Ok(value.trailing_zeros())
}

/// Maps `access_control_bits >> 4` to a base section-flags value (§4.5).
fn access_flags(access_control_bits: u8) -> SectionFlags {
    match access_control_bits >> 4 {
        0x0 => SectionFlags::DATA | SectionFlags::READONLY,
        0x1 => SectionFlags::DATA,
        0x3 => SectionFlags::CODE,
        0x2 | 0x4..=0x7 => SectionFlags::CODE | SectionFlags::READONLY,
        _ => SectionFlags::DATA,
    }
}

/// Builds the internalized space/subspace graph from the raw dictionary
/// arrays and resolved names (§4.5). Subspaces are assumed already in
/// their on-disk order; this renumbers them `0..N` by `target_index`.
pub fn build(
    raw_spaces: &[RawSpace],
    raw_subspaces: &[RawSubspace],
    strings: &Strtab,
) -> Result<(Vec<Space>, Vec<Subspace>)> {
    let mut subspaces = Vec::with_capacity(raw_subspaces.len());
    for (idx, raw) in raw_subspaces.iter().enumerate() {
        let name = strings.get(raw.name as usize)?.into();
        let access_control_bits = raw.access_control_bits as u8;
        let mut flags = access_flags(access_control_bits);

        let is_comdat = raw.flags & SUB_IS_COMDAT != 0;
        let is_common = raw.flags & SUB_IS_COMMON != 0;
        let dup_common = raw.flags & SUB_DUP_COMMON != 0;
        if is_comdat || is_common || dup_common {
            flags |= SectionFlags::LINK_ONCE;
        }
        if raw.subspace_length > 0 {
            flags |= SectionFlags::HAS_CONTENTS;
        }
        let is_loadable = raw.flags & SUB_LOADABLE != 0;
        if is_loadable {
            flags |= SectionFlags::ALLOC | SectionFlags::LOAD;
        } else {
            flags |= SectionFlags::DEBUGGING;
        }
        let code_only = raw.flags & SUB_CODE_ONLY != 0;
        if code_only {
            flags |= SectionFlags::CODE;
        }
        if raw.file_loc_init_value == 0 && raw.initialization_length == 0 {
            flags.remove(SectionFlags::DATA | SectionFlags::LOAD | SectionFlags::HAS_CONTENTS);
        }
        if raw.fixup_request_quantity != 0 {
            flags |= SectionFlags::RELOC;
        }

        let alignment_power = log2_exact(raw.alignment)?;

        subspaces.push(Subspace {
            name,
            space: raw.space_index as usize,
            flags,
            vma: raw.subspace_start,
            size: raw.subspace_length,
            filepos: raw.file_loc_init_value,
            alignment_power,
            access_control_bits,
            quadrant: raw.quadrant as u8,
            sort_key: raw.sort_key as u8,
            target_index: idx as u32,
            fixup_location: raw.fixup_request_index,
            fixup_length: raw.fixup_request_quantity,
            is_loadable,
            is_comdat,
            is_common,
            dup_common,
            code_only,
            memory_resident: raw.flags & SUB_MEMORY_RESIDENT != 0,
            initially_frozen: raw.flags & SUB_INITIALLY_FROZEN != 0,
            is_first: raw.flags & SUB_IS_FIRST != 0,
            replicate_init: raw.flags & SUB_REPLICATE_INIT != 0,
            continuation: raw.flags & SUB_CONTINUATION != 0,
            target_specific: raw.flags & SUB_IS_TSPECIFIC != 0,
        });
    }

    // Stable-sort by original target_index, then renumber 0..N.
    let mut order: Vec<usize> = (0..subspaces.len()).collect();
    order.sort_by_key(|&i| subspaces[i].target_index);
    let mut sorted = Vec::with_capacity(subspaces.len());
    for (new_idx, old_idx) in order.into_iter().enumerate() {
        let mut s = subspaces[old_idx].clone();
        s.target_index = new_idx as u32;
        sorted.push(s);
    }
    let subspaces = sorted;

    let mut spaces = Vec::with_capacity(raw_spaces.len());
    for raw in raw_spaces {
        let name = strings.get(raw.name as usize)?.into();
        let owned: Vec<usize> = subspaces
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                // space_index on the subspace refers to the space's
                // position in `raw_spaces`, not its renumbered index.
                s.space == spaces.len()
            })
            .map(|(i, _)| i)
            .collect();

        let vma = owned
            .first()
            .map(|&i| subspaces[i].vma)
            .unwrap_or(0);
        let size = if owned.is_empty() {
            0
        } else {
            let last = &subspaces[*owned.last().unwrap()];
            (last.vma.saturating_sub(vma)).saturating_add(last.size)
        };

        spaces.push(Space {
            name,
            space_number: raw.space_number,
            sort_key: raw.sort_key as u8,
            loadable: raw.flags & SPACE_LOADABLE != 0,
            defined: raw.flags & SPACE_DEFINED != 0,
            private: raw.flags & SPACE_PRIVATE != 0,
            has_intermediate_code: raw.flags & SPACE_HAS_INTERMEDIATE_CODE != 0,
            target_specific: raw.flags & SPACE_IS_TSPECIFIC != 0,
            size,
            vma,
            subspaces: owned,
        });
    }

    Ok((spaces, subspaces))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strtab::StrtabWriter;

    #[test]
    fn alignment_must_be_power_of_two() {
        let mut w = StrtabWriter::new();
        let name = w.push("$CODE$");
        let blob = w.into_bytes();
        let strtab = Strtab::new(&blob);

        let raw_sub = RawSubspace {
            space_index: 0,
            name,
            alignment: 6,
            ..Default::default()
        };
        let err = build(&[], &[raw_sub], &strtab).unwrap_err();
        match err {
            Error::BadValue(_) => {}
            other => panic!("expected BadValue, got {:?}", other),
        }
    }

    #[test]
    fn access_control_bits_map_to_expected_flags() {
        assert_eq!(
            access_flags(0x00),
            SectionFlags::DATA | SectionFlags::READONLY
        );
        assert_eq!(access_flags(0x10), SectionFlags::DATA);
        assert_eq!(access_flags(0x30), SectionFlags::CODE);
        assert_eq!(
            access_flags(0x20),
            SectionFlags::CODE | SectionFlags::READONLY
        );
    }

    #[test]
    fn one_space_one_subspace_round_trips_geometry() {
        let mut w = StrtabWriter::new();
        let space_name = w.push("$TEXT$");
        let sub_name = w.push("$CODE$");
        let blob = w.into_bytes();
        let strtab = Strtab::new(&blob);

        let raw_space = RawSpace {
            name: space_name,
            flags: SPACE_DEFINED | SPACE_LOADABLE,
            subspace_quantity: 1,
            ..Default::default()
        };
        let raw_sub = RawSubspace {
            space_index: 0,
            name: sub_name,
            alignment: 8,
            subspace_start: 0,
            subspace_length: 16,
            flags: SUB_LOADABLE,
            ..Default::default()
        };
        let (spaces, subspaces) = build(&[raw_space], &[raw_sub], &strtab).unwrap();
        assert_eq!(spaces.len(), 1);
        assert_eq!(subspaces.len(), 1);
        assert_eq!(subspaces[0].alignment_power, 3);
        assert_eq!(spaces[0].subspaces, alloc::vec![0]);
        assert_eq!(spaces[0].size, 16);
    }
}
