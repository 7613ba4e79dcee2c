//! The SOM file header and its auxiliary headers.
//!
//! Every field here is big-endian on disk (§3, §6). [`RawHeader`] is the
//! literal 30-word on-disk layout; [`Header`] is what the rest of the
//! crate works with after the reserved bits are masked out and the
//! checksum has been verified.

use alloc::string::String;
use alloc::vec::Vec;
use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};

/// Number of 32-bit words in [`RawHeader`]; also the span the XOR
/// checksum covers (§6, §8 property 1 and S6).
pub const HEADER_WORDS: usize = 30;

/// Relocatable object, not yet linked.
pub const RELOC_MAGIC: u32 = 0x0106;
/// Demand-paged executable.
pub const DEMAND_MAGIC: u32 = 0x010B;
/// Plain executable.
pub const EXEC_MAGIC: u32 = 0x0107;
/// Executable sharing a writable text segment.
pub const SHARE_MAGIC: u32 = 0x0108;
/// Dynamically loadable module.
pub const DL_MAGIC: u32 = 0x010D;
/// Shared library.
pub const SHL_MAGIC: u32 = 0x010E;
/// An EXECLIB-fronted container: the real SOM is reached through an LST.
pub const EXECLIBMAGIC: u32 = 0x0619;
/// Magic of the LST header itself, at the front of an EXECLIBMAGIC file
/// or a `.a` archive's symbol-index member.
pub const LIBMAGIC: u32 = 0x0A00;
/// Alternate share magic used by some linkers; accepted on read.
pub const SHARED_MAGIC_CNX: u32 = 0x0619;

/// Old-format version id.
pub const VERSION_ID_OLD: u32 = 85082112;
/// New-format version id.
pub const VERSION_ID_NEW: u32 = 87102412;

/// Returns true for any magic this crate knows how to read.
pub fn is_known_magic(magic: u32) -> bool {
    matches!(
        magic,
        RELOC_MAGIC | DEMAND_MAGIC | EXEC_MAGIC | SHARE_MAGIC | DL_MAGIC | SHL_MAGIC | EXECLIBMAGIC
    )
}

/// True if `magic` denotes something the linker can execute (used to
/// decide exec-aux-header handling and text/data/bss accounting).
pub fn is_executable_magic(magic: u32) -> bool {
    matches!(magic, DEMAND_MAGIC | EXEC_MAGIC | SHARE_MAGIC | DL_MAGIC | SHL_MAGIC)
}

/// Validates a PA-RISC CPU id (§6): exactly `0x20B`, or in `[0x210, 0x2FF]`.
pub fn is_pa_risc_id(system_id: u32) -> bool {
    system_id == 0x20B || (0x210..=0x2FF).contains(&system_id)
}

/// The literal 30-word big-endian on-disk header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct RawHeader {
    pub system_id: u32,
    pub a_magic: u32,
    pub version_id: u32,
    pub file_time: u32,
    pub aux_header_location: u32,
    pub aux_header_size: u32,
    pub som_length: u32,
    pub space_location: u32,
    pub space_total: u32,
    pub subspace_location: u32,
    pub subspace_total: u32,
    pub loader_fixup_location: u32,
    pub loader_fixup_total: u32,
    pub space_strings_location: u32,
    pub space_strings_size: u32,
    pub init_array_location: u32,
    pub init_array_total: u32,
    pub compiler_location: u32,
    pub compiler_total: u32,
    pub symbol_location: u32,
    pub symbol_total: u32,
    pub fixup_request_location: u32,
    pub fixup_request_total: u32,
    pub symbol_strings_location: u32,
    pub symbol_strings_size: u32,
    pub unloadable_sp_location: u32,
    pub unloadable_sp_size: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub checksum: u32,
}

impl RawHeader {
    /// The header as an array of 32-bit words, in on-disk order.
    pub fn as_words(&self) -> [u32; HEADER_WORDS] {
        [
            self.system_id,
            self.a_magic,
            self.version_id,
            self.file_time,
            self.aux_header_location,
            self.aux_header_size,
            self.som_length,
            self.space_location,
            self.space_total,
            self.subspace_location,
            self.subspace_total,
            self.loader_fixup_location,
            self.loader_fixup_total,
            self.space_strings_location,
            self.space_strings_size,
            self.init_array_location,
            self.init_array_total,
            self.compiler_location,
            self.compiler_total,
            self.symbol_location,
            self.symbol_total,
            self.fixup_request_location,
            self.fixup_request_total,
            self.symbol_strings_location,
            self.symbol_strings_size,
            self.unloadable_sp_location,
            self.unloadable_sp_size,
            self.reserved1,
            self.reserved2,
            self.checksum,
        ]
    }

    /// Recomputes `checksum` so that XORing every word (including the
    /// checksum itself) yields zero.
    pub fn fix_checksum(&mut self) {
        self.checksum = 0;
        let sum = self.as_words().iter().fold(0u32, |acc, w| acc ^ w);
        self.checksum = sum;
    }

    /// True if the XOR of all 30 words is zero.
    pub fn checksum_valid(&self) -> bool {
        self.as_words().iter().fold(0u32, |acc, w| acc ^ w) == 0
    }
}

/// One aux-header record: a length-prefixed (4-byte id + length), 4-byte
/// padded blob following the main header (§3, §4.8 step 3, §4.9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxHeader {
    /// The linker/compiler version string, e.g. `"ld(1) 92453-07 ..."`.
    VersionString(String),
    /// The copyright notice string.
    CopyrightString(String),
    /// Anything this crate doesn't interpret; round-tripped byte for
    /// byte so unknown aux headers survive a read/write cycle.
    Unknown { kind: u32, flags: u32, data: Vec<u8> },
    /// The executable aux header (parsed separately; see [`ExecAuxHeader`]).
    Exec(ExecAuxHeader),
}

/// Aux-header kind tags.
pub const AUX_ID_VERSION: u32 = 0x0002;
pub const AUX_ID_COPYRIGHT: u32 = 0x0003;
pub const AUX_ID_EXEC: u32 = 0x0004;

/// Defaults to 0 when neither HPUX nor HIUX define it (§3).
pub const EXEC_AUX_ID: u32 = 0;

/// The executable aux header: base addresses, sizes, and entry point
/// for an executable or shared-library output (§4.8, §4.9).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct ExecAuxHeader {
    pub exec_tsize: u32,
    pub exec_tmem: u32,
    pub exec_tfile: u32,
    pub exec_dsize: u32,
    pub exec_dmem: u32,
    pub exec_dfile: u32,
    pub exec_bsize: u32,
    pub exec_entry: u32,
    pub exec_flags: u32,
    pub exec_bfill: u32,
}

/// A round-tripped compilation-unit record (§4.8; see SPEC_FULL.md §2.G).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct CompilationUnit {
    pub name: u32,
    pub language_name: u32,
    pub product_id: u32,
    pub version_id: u32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

/// Parses the fixed-size header and validates system id/magic/version.
pub fn parse_header(bytes: &[u8]) -> Result<RawHeader> {
    let raw: RawHeader = bytes.pread_with(0, scroll::BE)?;
    if !is_pa_risc_id(raw.system_id) {
        return Err(Error::WrongFormat(alloc::format!(
            "system id 0x{:x} is not a PA-RISC CPU id",
            raw.system_id
        )));
    }
    if !is_known_magic(raw.a_magic) {
        return Err(Error::WrongFormat(alloc::format!(
            "unrecognized magic 0x{:x}",
            raw.a_magic
        )));
    }
    if raw.version_id != VERSION_ID_OLD && raw.version_id != VERSION_ID_NEW {
        return Err(Error::WrongFormat(alloc::format!(
            "unrecognized version id {}",
            raw.version_id
        )));
    }
    if !raw.checksum_valid() {
        return Err(Error::BadValue(String::from(
            "header checksum does not validate",
        )));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trip() {
        let mut h = RawHeader {
            system_id: 0x20B,
            a_magic: EXEC_MAGIC,
            version_id: VERSION_ID_NEW,
            som_length: 4096,
            space_total: 2,
            subspace_total: 3,
            ..Default::default()
        };
        h.fix_checksum();
        assert!(h.checksum_valid());
        // Flipping any bit of any word breaks the property.
        h.som_length ^= 1;
        assert!(!h.checksum_valid());
    }

    #[test]
    fn pa_risc_id_ranges() {
        assert!(is_pa_risc_id(0x20B));
        assert!(is_pa_risc_id(0x210));
        assert!(is_pa_risc_id(0x2FF));
        assert!(!is_pa_risc_id(0x20A));
        assert!(!is_pa_risc_id(0x300));
    }

    #[test]
    fn parse_rejects_bad_system_id() {
        let mut h = RawHeader {
            system_id: 0x20A,
            a_magic: EXEC_MAGIC,
            version_id: VERSION_ID_NEW,
            ..Default::default()
        };
        h.fix_checksum();
        let mut bytes = [0u8; HEADER_WORDS * 4];
        bytes.pwrite_with(h, 0, scroll::BE).unwrap();
        match parse_header(&bytes) {
            Err(Error::WrongFormat(_)) => {}
            other => panic!("expected WrongFormat, got {:?}", other),
        }
    }
}
