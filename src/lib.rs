//! A reader/writer for HP PA-RISC SOM object files and archives.
//!
//! The on-disk model mirrors the format itself: a [`header`] describes
//! the file as a whole, [`space`] holds the section/segment geometry,
//! [`symbol`] the symbol dictionary, and [`fixup`] the per-subspace
//! relocation opcode stream. [`archive`] layers the SysV `ar` container
//! and library symbol table on top for `.a` files.
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod error;
pub mod options;

#[cfg(feature = "alloc")]
pub mod header;
#[cfg(feature = "alloc")]
pub mod strtab;
#[cfg(feature = "alloc")]
pub mod space;
#[cfg(feature = "alloc")]
pub mod symbol;
#[cfg(feature = "alloc")]
pub mod reloc_queue;
#[cfg(feature = "alloc")]
pub mod fixup;
#[cfg(feature = "archive")]
pub mod archive;

#[cfg(all(feature = "alloc", feature = "archive"))]
pub mod target;
#[cfg(all(feature = "alloc", feature = "archive"))]
pub mod writer;

pub use error::{Error, Result};
