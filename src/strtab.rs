//! A length-prefixed string table (§3 "space_strings"/"symbol_strings").
//!
//! Unlike the null-delimited string tables of most object formats, a
//! SOM string is stored as a big-endian `u32` byte length, that many
//! bytes of (non-NUL-terminated) string data, then zero-padding out to
//! the next 4-byte boundary. An offset into the table always points at
//! the length word, never into the middle of a string.

use alloc::string::String;
use alloc::vec::Vec;
use core::str;

use scroll::{Pread, Pwrite};

use crate::error::{Error, Result};

/// A read-only view of one string table blob.
#[derive(Debug, Clone, Copy, Default)]
pub struct Strtab<'a> {
    bytes: &'a [u8],
}

/// Rounds `n` up to the next multiple of 4.
fn align4(n: usize) -> usize {
    (n + 3) & !3
}

impl<'a> Strtab<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Strtab { bytes }
    }

    /// Reads the string whose length word starts at `offset`.
    pub fn get(&self, offset: usize) -> Result<&'a str> {
        let len: u32 = self
            .bytes
            .pread_with(offset, scroll::BE)
            .map_err(|_| bad(offset))?;
        let start = offset + 4;
        let end = start
            .checked_add(len as usize)
            .ok_or_else(|| bad(offset))?;
        let slice = self.bytes.get(start..end).ok_or_else(|| bad(offset))?;
        str::from_utf8(slice).map_err(|_| Error::BadValue(alloc::format!(
            "string table entry at offset {} is not valid utf-8",
            offset
        )))
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

fn bad(offset: usize) -> Error {
    Error::BadValue(alloc::format!(
        "string table entry at offset {} is truncated or out of bounds",
        offset
    ))
}

/// Accumulates strings into a single length-prefixed blob, returning
/// each string's offset as it is added. Used by the writer to build
/// `space_strings`/`symbol_strings` (§4.8 step 3).
#[derive(Debug, Default)]
pub struct StrtabWriter {
    bytes: Vec<u8>,
}

impl StrtabWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `s`, returning the byte offset of its length word.
    pub fn push(&mut self, s: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        let len = s.len() as u32;
        let mut header = [0u8; 4];
        header.pwrite_with(len, 0, scroll::BE).unwrap();
        self.bytes.extend_from_slice(&header);
        self.bytes.extend_from_slice(s.as_bytes());
        let padded = align4(self.bytes.len());
        self.bytes.resize(padded, 0);
        offset
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Convenience: builds one blob from an ordered list of strings,
/// returning the blob and each string's offset in the same order.
pub fn build(strings: &[String]) -> (Vec<u8>, Vec<u32>) {
    let mut w = StrtabWriter::new();
    let offsets = strings.iter().map(|s| w.push(s)).collect();
    (w.into_bytes(), offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn round_trips_several_strings() {
        let strings = alloc::vec!["main".to_string(), "".to_string(), "_start".to_string()];
        let (blob, offsets) = build(&strings);
        let strtab = Strtab::new(&blob);
        for (s, off) in strings.iter().zip(offsets.iter()) {
            assert_eq!(strtab.get(*off as usize).unwrap(), s.as_str());
        }
    }

    #[test]
    fn entries_are_four_byte_aligned() {
        let mut w = StrtabWriter::new();
        let a = w.push("abc");
        let b = w.push("de");
        assert_eq!(a % 4, 0);
        assert_eq!(b % 4, 0);
    }

    #[test]
    fn truncated_length_is_rejected() {
        let blob = [0u8, 0, 0, 100]; // claims 100 bytes follow; none do
        let strtab = Strtab::new(&blob);
        assert!(strtab.get(0).is_err());
    }
}
