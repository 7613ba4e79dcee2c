//! The generic Unix `ar` container (SysV variant).
//!
//! This is the "surrounding generic archive iterator" SPEC_FULL.md
//! treats as out of scope for the rest of the crate, reimplemented
//! here in minimal form purely so [`super::lst`] has something to sit
//! on top of — grounded on the legacy archive reader this crate's
//! ambient stack started from, trimmed to what the library symbol
//! table needs.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::{Error, Result};

pub const SIZEOF_MAGIC: usize = 8;
pub const MAGIC: &[u8; SIZEOF_MAGIC] = b"!<arch>\x0A";

const SIZEOF_FILE_IDENTIFIER: usize = 16;
const SIZEOF_FILE_SIZE: usize = 10;
pub const SIZEOF_FILE_HEADER: usize =
    SIZEOF_FILE_IDENTIFIER + 12 + 6 + 6 + 8 + SIZEOF_FILE_SIZE + 2;

/// The SysV special member carrying the library symbol table (§4.10).
pub const SYMBOL_LOOKUP_NAME: &str = "/               ";

/// One archive member's fixed-size ASCII header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberHeader {
    pub identifier: String,
    pub size: usize,
}

fn parse_decimal(field: &[u8]) -> Result<usize> {
    let text = core::str::from_utf8(field)
        .map_err(|_| Error::MalformedArchive("member header field is not ASCII".into()))?;
    usize::from_str_radix(text.trim_end(), 10)
        .map_err(|_| Error::MalformedArchive(alloc::format!("bad decimal field {:?}", text)))
}

impl MemberHeader {
    pub fn parse(bytes: &[u8]) -> Result<MemberHeader> {
        if bytes.len() < SIZEOF_FILE_HEADER {
            return Err(Error::MalformedArchive("truncated member header".into()));
        }
        let identifier = core::str::from_utf8(&bytes[0..SIZEOF_FILE_IDENTIFIER])
            .map_err(|_| Error::MalformedArchive("member identifier is not ASCII".into()))?
            .to_string();
        let size_field = &bytes[SIZEOF_FILE_HEADER - SIZEOF_FILE_SIZE - 2
            ..SIZEOF_FILE_HEADER - 2];
        let size = parse_decimal(size_field)?;
        let terminator = &bytes[SIZEOF_FILE_HEADER - 2..SIZEOF_FILE_HEADER];
        if terminator != [0x60, 0x0A] {
            return Err(Error::MalformedArchive("bad member header terminator".into()));
        }
        Ok(MemberHeader { identifier, size })
    }
}

/// One parsed member: its header plus where its content starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub header: MemberHeader,
    pub offset: usize,
}

impl Member {
    pub fn name(&self) -> &str {
        &self.header.identifier
    }

    pub fn size(&self) -> usize {
        self.header.size
    }
}

/// A parsed archive: member lookup by name plus the raw byte source.
#[derive(Debug)]
pub struct Archive<'a> {
    bytes: &'a [u8],
    members: BTreeMap<String, Member>,
    order: Vec<String>,
}

impl<'a> Archive<'a> {
    /// Walks every member header in `bytes`, verifying the magic first.
    pub fn parse(bytes: &'a [u8]) -> Result<Archive<'a>> {
        if bytes.len() < SIZEOF_MAGIC || &bytes[..SIZEOF_MAGIC] != MAGIC {
            return Err(Error::MalformedArchive("bad ar magic".into()));
        }
        let mut members = BTreeMap::new();
        let mut order = Vec::new();
        let mut pos = SIZEOF_MAGIC;
        while pos + SIZEOF_FILE_HEADER <= bytes.len() {
            let header = MemberHeader::parse(&bytes[pos..pos + SIZEOF_FILE_HEADER])?;
            let content_start = pos + SIZEOF_FILE_HEADER;
            let content_end = content_start
                .checked_add(header.size)
                .ok_or(Error::FileTooBig)?;
            if content_end > bytes.len() {
                return Err(Error::MalformedArchive("member content runs past end of archive".into()));
            }
            let name = header.identifier.clone();
            members.insert(
                name.clone(),
                Member {
                    header,
                    offset: content_start,
                },
            );
            order.push(name);
            pos = content_end + (content_end & 1);
        }
        Ok(Archive { bytes, members, order })
    }

    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn extract(&self, member: &Member) -> &'a [u8] {
        &self.bytes[member.offset..member.offset + member.size()]
    }

    /// The raw content of the SysV symbol-lookup member, if this
    /// archive carries one (§4.10 "Archive slurp").
    pub fn symbol_table_bytes(&self) -> Option<&'a [u8]> {
        self.get(SYMBOL_LOOKUP_NAME).map(|m| self.extract(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad_header(identifier: &str, size: usize) -> Vec<u8> {
        let mut h = Vec::with_capacity(SIZEOF_FILE_HEADER);
        let mut id = identifier.as_bytes().to_vec();
        id.resize(SIZEOF_FILE_IDENTIFIER, b' ');
        h.extend_from_slice(&id);
        h.extend_from_slice(&[b' '; 12]); // timestamp
        h.extend_from_slice(&[b' '; 6]); // owner
        h.extend_from_slice(&[b' '; 6]); // group
        h.extend_from_slice(&[b' '; 8]); // mode
        let size_str = alloc::format!("{:<10}", size);
        h.extend_from_slice(size_str.as_bytes());
        h.extend_from_slice(&[0x60, 0x0A]);
        h
    }

    #[test]
    fn round_trips_one_member() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&pad_header("hello.o/        ", 4));
        bytes.extend_from_slice(b"abcd");
        let archive = Archive::parse(&bytes).unwrap();
        let member = archive.get("hello.o/        ").unwrap();
        assert_eq!(archive.extract(member), b"abcd");
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = b"not an archive!!".to_vec();
        assert!(Archive::parse(&bytes).is_err());
    }

    #[test]
    fn odd_sized_member_is_padded() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&pad_header("a/              ", 3));
        bytes.extend_from_slice(b"xyz\n"); // pad byte after odd-sized content
        bytes.extend_from_slice(&pad_header("b/              ", 2));
        bytes.extend_from_slice(b"ok");
        let archive = Archive::parse(&bytes).unwrap();
        assert_eq!(archive.extract(archive.get("a/              ").unwrap()), b"xyz");
        assert_eq!(archive.extract(archive.get("b/              ").unwrap()), b"ok");
    }
}
