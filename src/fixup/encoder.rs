//! Fixup stream encoding (§4.3).
//!
//! [`encode`] takes a subspace's relocations in address order and
//! produces its fixup byte stream: runs of skipped (unrelocated) bytes
//! are folded into the smallest [`opcodes::NO_RELOCATION`] encoding
//! that covers them (§4.3 "Skip n bytes"), and any encoding at least
//! two bytes wide is checked against the [`RelocQueue`] first so a
//! repeat gets the 1-byte `R_PREV_FIXUP+idx` form instead. A
//! `DataOneSymbol` relocation with a nonzero addend gets a
//! `R_DATA_OVERRIDE` opcode synthesized immediately ahead of it
//! (§4.3 "Addend override"), through the same queue check.

use alloc::vec::Vec;

use crate::error::Result;
use crate::reloc_queue::RelocQueue;

use super::argreloc::{self, ArgReloc};
use super::{bad_value, opcodes, CallMode, RelocKind, Relocation, RoundingMode};

/// Largest gap a single 4-byte `R_NO_RELOCATION` super-chunk covers
/// (§4.3's `2^24`-byte loop body).
const SKIP_SUPERCHUNK: u32 = 1 << 24;
/// Largest gap the 1-byte `NO_RELOCATION+n` form covers.
const SKIP_1BYTE_MAX: u32 = 0x60;
/// Largest gap the 2-byte form covers.
const SKIP_2BYTE_MAX: u32 = 0x1000;
/// Largest gap the 3-byte form covers.
const SKIP_3BYTE_MAX: u32 = 0xC0000;

fn push_u24(out: &mut Vec<u8>, v: u32) {
    out.push((v >> 16) as u8);
    out.push((v >> 8) as u8);
    out.push(v as u8);
}

/// Encodes a `R_DATA_OVERRIDE` opcode carrying `addend`, choosing the
/// minimal variant (2, 3, 4, or 5 bytes total) whose signed payload
/// fits (§4.3 "Addend override"). Never called directly by a caller —
/// only synthesized by [`encode`] ahead of a `DataOneSymbol` relocation
/// with a nonzero addend.
fn encode_data_override(addend: i64) -> Vec<u8> {
    let v = addend as i32;
    let mut out = Vec::new();
    if (i8::MIN as i32..=i8::MAX as i32).contains(&v) {
        out.push(opcodes::DATA_OVERRIDE);
        out.push(v as u8);
    } else if (i16::MIN as i32..=i16::MAX as i32).contains(&v) {
        out.push(opcodes::DATA_OVERRIDE + 1);
        out.extend_from_slice(&(v as i16).to_be_bytes());
    } else if (-(1 << 23)..(1 << 23)).contains(&v) {
        out.push(opcodes::DATA_OVERRIDE + 2);
        push_u24(&mut out, (v as u32) & 0xFF_FFFF);
    } else {
        out.push(opcodes::DATA_OVERRIDE + 3);
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}

/// Pushes `bytes` literally, or replaces it with a 1-byte
/// `R_PREV_FIXUP+idx` reference if the reloc queue has already seen
/// this exact encoding — the same queue-or-emit choice [`encode`] makes
/// for every multi-byte opcode, factored out so a synthesized
/// `R_DATA_OVERRIDE` goes through it too and keeps the decoder's queue
/// in lockstep.
fn emit_queued(out: &mut Vec<u8>, queue: &mut RelocQueue, bytes: &[u8]) {
    if bytes.len() > 1 {
        if let Some(idx) = queue.try_prev_fixup(bytes) {
            out.push(opcodes::PREV_FIXUP + idx as u8);
            return;
        }
    }
    out.extend_from_slice(bytes);
}

/// Emits the smallest `R_NO_RELOCATION` encoding(s) covering `gap` bytes
/// (§4.3 "Skip n bytes"). A gap that is a multiple of 4 and within
/// `SKIP_3BYTE_MAX` gets one of three packed size classes (1, 2, or 3
/// bytes, keyed on `gap/4 - 1`); anything else — not 4-aligned, or
/// bigger than the packed range but still under 2^24 — falls back to a
/// literal 4-byte `(gap - 1)` count. Gaps of 2^24 bytes or more are
/// chunked one super-chunk at a time first.
fn emit_skip(out: &mut Vec<u8>, mut gap: u32) {
    while gap >= SKIP_SUPERCHUNK {
        out.push(opcodes::NO_RELOCATION_END);
        push_u24(out, SKIP_SUPERCHUNK - 1);
        gap -= SKIP_SUPERCHUNK;
    }
    if gap == 0 {
        return;
    }
    if gap % 4 == 0 && gap <= SKIP_3BYTE_MAX {
        let units = gap / 4 - 1;
        if gap <= SKIP_1BYTE_MAX {
            out.push(opcodes::NO_RELOCATION + units as u8);
        } else if gap <= SKIP_2BYTE_MAX {
            let band = (units / 256) as u8;
            out.push(opcodes::NO_RELOCATION_2BYTE + band);
            out.push((units % 256) as u8);
        } else {
            let band = (units / 65536) as u8;
            out.push(opcodes::NO_RELOCATION_3BYTE + band);
            out.extend_from_slice(&((units % 65536) as u16).to_be_bytes());
        }
    } else {
        out.push(opcodes::NO_RELOCATION_END);
        push_u24(out, gap - 1);
    }
}

fn encode_symbolic(
    inline_base: u8,
    byte_op: u8,
    triple_op: u8,
    supports_inline: bool,
    symbol: u32,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if supports_inline && symbol < 32 {
        out.push(inline_base + symbol as u8);
    } else if symbol < 256 {
        out.push(byte_op);
        out.push(symbol as u8);
    } else if symbol < (1 << 24) {
        out.push(triple_op);
        push_u24(&mut out, symbol);
    } else {
        return Err(bad_value(alloc::format!(
            "symbol index {} too large to encode",
            symbol
        )));
    }
    Ok(out)
}

fn encode_call(
    simple_base: u8,
    complex_short: u8,
    complex_long: u8,
    reloc: &Relocation,
) -> Result<Vec<u8>> {
    let symbol = reloc
        .symbol
        .ok_or_else(|| bad_value("call relocation missing symbol"))?;
    if symbol >= (1 << 24) {
        return Err(bad_value(alloc::format!(
            "call symbol index {} too large to encode",
            symbol
        )));
    }
    let arg_reloc = ArgReloc::from_word(reloc.arg_reloc.unwrap_or(0));
    let mut out = Vec::new();
    if reloc.addend == 0 {
        if symbol < 0x100 {
            if let Some(ty) = argreloc::simple_type(arg_reloc) {
                let rtn_bits = arg_reloc.rtn as u8;
                out.push(simple_base + argreloc::simple_offset(ty, rtn_bits));
                out.push(symbol as u8);
                return Ok(out);
            }
        }
        out.push(complex_short);
        let word = arg_reloc.to_word();
        out.push((word >> 8) as u8);
        out.push(word as u8);
        push_u24(&mut out, symbol);
        return Ok(out);
    }
    out.push(complex_long);
    let word = arg_reloc.to_word();
    out.push((word >> 8) as u8);
    out.push(word as u8);
    push_u24(&mut out, symbol);
    out.extend_from_slice(&(reloc.addend as i32).to_be_bytes());
    Ok(out)
}

/// Encodes one relocation's canonical byte form, independent of the
/// reloc-queue lookup (the caller checks the queue separately so the
/// same function serves both the literal-bytes and the
/// about-to-be-queued path).
fn encode_one(
    reloc: &Relocation,
    rounding: &mut RoundingMode,
    call_mode: &mut CallMode,
) -> Result<Vec<u8>> {
    use RelocKind::*;
    match reloc.kind {
        NoRelocation | RelocKind::PrevFixup(_) | RelocKind::Reserved | DataOverride => {
            Err(bad_value("this relocation kind cannot be encoded directly"))
        }
        PcrelCall => encode_call(
            opcodes::PCREL_CALL_SIMPLE,
            opcodes::PCREL_CALL_COMPLEX_SHORT,
            opcodes::PCREL_CALL_COMPLEX_LONG,
            reloc,
        ),
        AbsCall => encode_call(
            opcodes::ABS_CALL_SIMPLE,
            opcodes::ABS_CALL_COMPLEX_SHORT,
            opcodes::ABS_CALL_COMPLEX_LONG,
            reloc,
        ),
        CodeOneSymbol => encode_symbolic(
            opcodes::CODE_ONE_SYMBOL_INLINE,
            opcodes::CODE_ONE_SYMBOL_BYTE,
            opcodes::CODE_ONE_SYMBOL_TRIPLE,
            true,
            reloc.symbol.ok_or_else(|| bad_value("missing symbol"))?,
        ),
        DpRelative => encode_symbolic(
            opcodes::DP_RELATIVE_INLINE,
            opcodes::DP_RELATIVE_BYTE,
            opcodes::DP_RELATIVE_TRIPLE,
            true,
            reloc.symbol.ok_or_else(|| bad_value("missing symbol"))?,
        ),
        DataOneSymbol => encode_symbolic(
            opcodes::DATA_ONE_SYMBOL_INLINE,
            opcodes::DATA_ONE_SYMBOL_BYTE,
            opcodes::DATA_ONE_SYMBOL_TRIPLE,
            true,
            reloc.symbol.ok_or_else(|| bad_value("missing symbol"))?,
        ),
        DataPlabel => encode_symbolic(
            0,
            opcodes::DATA_PLABEL_BYTE,
            opcodes::DATA_PLABEL_TRIPLE,
            false,
            reloc.symbol.ok_or_else(|| bad_value("missing symbol"))?,
        ),
        CodePlabel => encode_symbolic(
            0,
            opcodes::CODE_PLABEL_BYTE,
            opcodes::CODE_PLABEL_TRIPLE,
            false,
            reloc.symbol.ok_or_else(|| bad_value("missing symbol"))?,
        ),
        DltRel => encode_symbolic(
            0,
            opcodes::DLT_REL_BYTE,
            opcodes::DLT_REL_TRIPLE,
            false,
            reloc.symbol.ok_or_else(|| bad_value("missing symbol"))?,
        ),
        DataGprel => encode_symbolic(
            0,
            opcodes::DATA_GPREL_BYTE,
            opcodes::DATA_GPREL_TRIPLE,
            false,
            reloc.symbol.ok_or_else(|| bad_value("missing symbol"))?,
        ),
        Entry => {
            let t = (reloc.addend >> 32) as u32;
            let u = reloc.addend as u32;
            let mut out = alloc::vec![opcodes::ENTRY];
            out.extend_from_slice(&t.to_be_bytes());
            out.extend_from_slice(&u.to_be_bytes());
            Ok(out)
        }
        Exit => {
            let mut out = alloc::vec![opcodes::EXIT];
            out.extend_from_slice(&(reloc.addend as u32).to_be_bytes());
            Ok(out)
        }
        AltEntry => Ok(alloc::vec![opcodes::ALT_ENTRY]),
        Fsel => Ok(alloc::vec![opcodes::FSEL]),
        Lsel => Ok(alloc::vec![opcodes::LSEL]),
        Rsel => Ok(alloc::vec![opcodes::RSEL]),
        BeginBrtab => Ok(alloc::vec![opcodes::BEGIN_BRTAB]),
        EndBrtab => Ok(alloc::vec![opcodes::END_BRTAB]),
        BeginTry => Ok(alloc::vec![opcodes::BEGIN_TRY]),
        N0sel => Ok(alloc::vec![opcodes::N0SEL]),
        N1sel => Ok(alloc::vec![opcodes::N1SEL]),
        CodeExpr => Ok(alloc::vec![opcodes::CODE_EXPR]),
        DataExpr => Ok(alloc::vec![opcodes::DATA_EXPR]),
        EndTry => {
            let len = reloc.addend as u64;
            let mut out = Vec::new();
            if len <= u8::MAX as u64 {
                out.push(opcodes::END_TRY_1);
                out.push(len as u8);
            } else if len <= u16::MAX as u64 {
                out.push(opcodes::END_TRY_2);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                out.push(opcodes::END_TRY_4);
                out.extend_from_slice(&(len as u32).to_be_bytes());
            }
            Ok(out)
        }
        NMode => {
            *rounding = RoundingMode::N;
            Ok(alloc::vec![opcodes::N_MODE])
        }
        SMode => {
            *rounding = RoundingMode::S;
            Ok(alloc::vec![opcodes::S_MODE])
        }
        DMode => {
            *rounding = RoundingMode::D;
            Ok(alloc::vec![opcodes::D_MODE])
        }
        RMode => {
            *rounding = RoundingMode::R;
            Ok(alloc::vec![opcodes::R_MODE])
        }
        ShortPcrelMode => {
            *call_mode = CallMode::ShortPcrel;
            Ok(alloc::vec![opcodes::SHORT_PCREL_MODE])
        }
        LongPcrelMode => {
            *call_mode = CallMode::LongPcrel;
            Ok(alloc::vec![opcodes::LONG_PCREL_MODE])
        }
        Comp1 => Ok(alloc::vec![opcodes::COMP1, reloc.addend as u8]),
        Comp2 => Ok(alloc::vec![opcodes::COMP2, reloc.addend as u8]),
    }
}

/// Encodes `relocs` (already in non-decreasing address order) into one
/// subspace's fixup byte stream, padding the final gap out to
/// `subspace_len`.
pub fn encode(relocs: &[Relocation], subspace_len: u32) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut queue = RelocQueue::new();
    let mut rounding = RoundingMode::N;
    let mut call_mode = CallMode::ShortPcrel;
    let mut cursor: u32 = 0;

    for reloc in relocs {
        if reloc.address < cursor {
            return Err(bad_value(alloc::format!(
                "relocation address {} precedes cursor {}",
                reloc.address, cursor
            )));
        }
        emit_skip(&mut out, reloc.address - cursor);
        cursor = reloc.address;

        if reloc.kind == RelocKind::DataOneSymbol && reloc.addend != 0 {
            let override_bytes = encode_data_override(reloc.addend);
            emit_queued(&mut out, &mut queue, &override_bytes);
        }

        let bytes = encode_one(reloc, &mut rounding, &mut call_mode)?;
        emit_queued(&mut out, &mut queue, &bytes);
    }

    if cursor > subspace_len {
        return Err(bad_value(alloc::format!(
            "relocations cover {} bytes, subspace is only {}",
            cursor, subspace_len
        )));
    }
    emit_skip(&mut out, subspace_len - cursor);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixup::decoder::decode_to_vec;

    #[test]
    fn skip_only_stream_round_trips() {
        let out = encode(&[], 10).unwrap();
        let relocs = decode_to_vec(&out).unwrap();
        assert!(relocs.is_empty());
    }

    #[test]
    fn inline_symbol_round_trips() {
        let relocs = alloc::vec![Relocation::new(4, RelocKind::DataOneSymbol).with_symbol(7)];
        let out = encode(&relocs, 20).unwrap();
        let decoded = decode_to_vec(&out).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].address, 4);
        assert_eq!(decoded[0].symbol, Some(7));
    }

    #[test]
    fn repeated_relocation_uses_prev_fixup() {
        let relocs = alloc::vec![
            Relocation::new(0, RelocKind::DataOneSymbol).with_symbol(500),
            Relocation::new(8, RelocKind::DataOneSymbol).with_symbol(500),
        ];
        let out = encode(&relocs, 16).unwrap();
        assert!(out
            .iter()
            .any(|&b| (opcodes::PREV_FIXUP..=opcodes::PREV_FIXUP_END).contains(&b)));
        let decoded = decode_to_vec(&out).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].symbol, decoded[1].symbol);
    }

    #[test]
    fn aligned_skip_uses_packed_size_class() {
        // 100 is a multiple of 4 and above the 1-byte form's 0x60 cutoff,
        // so it packs into the 2-byte size class instead of 25 single-byte runs.
        let relocs = alloc::vec![Relocation::new(100, RelocKind::Fsel)];
        let out = encode(&relocs, 100).unwrap();
        assert_eq!(out.len(), 3); // 2-byte skip opcode + 1-byte Fsel opcode
        let decoded = decode_to_vec(&out).unwrap();
        assert_eq!(decoded[0].address, 100);
    }

    #[test]
    fn skip_spanning_a_superchunk_round_trips() {
        let gap = (1u32 << 24) + 4;
        let relocs = alloc::vec![Relocation::new(gap, RelocKind::Fsel)];
        let out = encode(&relocs, gap).unwrap();
        let decoded = decode_to_vec(&out).unwrap();
        assert_eq!(decoded[0].address, gap);
    }

    #[test]
    fn call_relocation_round_trips_simple_and_complex() {
        let simple = Relocation::new(0, RelocKind::PcrelCall)
            .with_symbol(12)
            .with_arg_reloc(0);
        let complex = Relocation::new(4, RelocKind::AbsCall)
            .with_symbol(99999)
            .with_arg_reloc(0b11_10_01_00_10)
            .with_addend(42);
        let out = encode(&[simple, complex], 8).unwrap();
        let decoded = decode_to_vec(&out).unwrap();
        assert_eq!(decoded[0].symbol, Some(12));
        assert_eq!(decoded[1].symbol, Some(99999));
        assert_eq!(decoded[1].addend, 42);
    }

    #[test]
    fn out_of_order_address_rejected() {
        let relocs = alloc::vec![
            Relocation::new(8, RelocKind::Fsel),
            Relocation::new(4, RelocKind::Fsel),
        ];
        assert!(encode(&relocs, 16).is_err());
    }

    #[test]
    fn data_one_symbol_addend_round_trips_through_override() {
        for &addend in &[0i64, 5, -5, 300, -300, 70_000, -70_000, 20_000_000, -20_000_000] {
            let reloc = Relocation::new(0, RelocKind::DataOneSymbol)
                .with_symbol(9)
                .with_addend(addend);
            let out = encode(&[reloc], 4).unwrap();
            if addend != 0 {
                assert!((opcodes::DATA_OVERRIDE..opcodes::DATA_OVERRIDE + 4).contains(&out[0]));
            }
            let decoded = decode_to_vec(&out).unwrap();
            assert_eq!(decoded.len(), 1);
            assert_eq!(decoded[0].symbol, Some(9));
            assert_eq!(decoded[0].addend, addend, "addend {} did not round-trip", addend);
        }
    }

    #[test]
    fn repeated_override_addend_shares_queue_slot() {
        let relocs = alloc::vec![
            Relocation::new(0, RelocKind::DataOneSymbol).with_symbol(4).with_addend(70_000),
            Relocation::new(4, RelocKind::DataOneSymbol).with_symbol(4).with_addend(70_000),
        ];
        let out = encode(&relocs, 8).unwrap();
        assert!(out
            .iter()
            .any(|&b| (opcodes::PREV_FIXUP..=opcodes::PREV_FIXUP_END).contains(&b)));
        let decoded = decode_to_vec(&out).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].addend, 70_000);
        assert_eq!(decoded[1].addend, 70_000);
    }

    #[test]
    fn repeated_override_survives_when_the_symbol_opcode_is_also_queued() {
        // symbol=40 is too big for the inline form, so its own encoding is
        // multi-byte and gets a R_PREV_FIXUP on repeat too — the override
        // then has to survive being consumed through *two* nested replays.
        let relocs = alloc::vec![
            Relocation::new(0, RelocKind::DataOneSymbol).with_symbol(40).with_addend(70_000),
            Relocation::new(4, RelocKind::DataOneSymbol).with_symbol(40).with_addend(70_000),
        ];
        let out = encode(&relocs, 8).unwrap();
        let decoded = decode_to_vec(&out).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].symbol, Some(40));
        assert_eq!(decoded[0].addend, 70_000);
        assert_eq!(decoded[1].symbol, Some(40));
        assert_eq!(decoded[1].addend, 70_000);
    }
}
