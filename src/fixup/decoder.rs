//! Fixup stream decoding (§4.4).
//!
//! A single loop walks the opcode stream, dispatching on [`classify`]
//! and feeding whatever it decodes to a [`RelocSink`] — the same loop
//! serves both the counting pass and the materializing pass (§9). A
//! `R_PREV_FIXUP+idx` opcode is resolved by looking up the cached bytes
//! in the [`RelocQueue`] and recursively decoding them in place, so the
//! rest of the loop never has to special-case where an opcode's bytes
//! came from. A `R_DATA_OVERRIDE` carries no relocation of its own; it
//! sets the addend the next opcode consumes if that opcode turns out
//! to be a `R_DATA_ONE_SYMBOL` (§4.3, §4.4).

use alloc::vec::Vec;

use crate::error::Result;
use crate::reloc_queue::RelocQueue;

use super::{bad_value, classify, opcodes, CallMode, RelocKind, RelocSink, Relocation, RoundingMode};

fn read_u24(bytes: &[u8], pos: usize) -> Result<(u32, usize)> {
    if pos + 3 > bytes.len() {
        return Err(bad_value("truncated fixup stream: expected 3-byte symbol index"));
    }
    let v = (bytes[pos] as u32) << 16 | (bytes[pos + 1] as u32) << 8 | bytes[pos + 2] as u32;
    Ok((v, pos + 3))
}

fn take<'a>(bytes: &'a [u8], pos: usize, n: usize) -> Result<(&'a [u8], usize)> {
    if pos + n > bytes.len() {
        return Err(bad_value("truncated fixup stream"));
    }
    Ok((&bytes[pos..pos + n], pos + n))
}

struct EntryFrame {
    t: u32,
    u: u32,
}

/// Shared mutable decode state, so a `R_PREV_FIXUP` replay can reuse
/// exactly the same operand-decoding logic as the primary loop.
struct DecodeState<'c> {
    queue: RelocQueue,
    rounding: RoundingMode,
    call_mode: CallMode,
    entry_stack: Vec<EntryFrame>,
    /// Gap in bytes the last-decoded `R_NO_RELOCATION` opcode covers;
    /// read by the caller instead of deriving it from the opcode byte,
    /// since the skip encoding is no longer a flat 1-byte-per-unit form.
    last_skip: u32,
    /// Addend from a `R_DATA_OVERRIDE` that has not yet been consumed
    /// by the `R_DATA_ONE_SYMBOL` it precedes (§4.3 "Addend override").
    /// Taken (cleared) by every opcode, whether or not it uses it.
    pending_override: Option<i64>,
    /// Subspace contents, for the implicit addend a `R_DATA_ONE_SYMBOL`
    /// with no preceding override falls back to (§4.4).
    contents: Option<&'c [u8]>,
}

/// Sign-extends a 1-4 byte big-endian two's-complement payload.
fn sign_extend(bytes: &[u8]) -> i64 {
    match bytes.len() {
        1 => bytes[0] as i8 as i64,
        2 => i16::from_be_bytes(bytes.try_into().unwrap()) as i64,
        3 => {
            let v = (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32;
            (((v << 8) as i32) >> 8) as i64
        }
        4 => i32::from_be_bytes(bytes.try_into().unwrap()) as i64,
        _ => unreachable!("R_DATA_OVERRIDE payload is always 1-4 bytes"),
    }
}

/// Reads the implicit 4-byte addend for a `R_DATA_ONE_SYMBOL` with no
/// preceding `R_DATA_OVERRIDE`, from the subspace's own contents at the
/// relocation's address.
fn read_implicit_addend(contents: &[u8], addr: u32) -> Option<i64> {
    let start = addr as usize;
    let bytes = contents.get(start..start.checked_add(4)?)?;
    Some(i32::from_be_bytes(bytes.try_into().unwrap()) as i64)
}

/// Inverse of `encoder::emit_skip`'s size-class selection: parses the
/// tail bytes (if any) of a `R_NO_RELOCATION` opcode and returns the
/// gap it covers plus the new stream position.
fn decode_skip(bytes: &[u8], pos: usize, op: u8) -> Result<(u32, usize)> {
    if op <= opcodes::NO_RELOCATION_1BYTE_END {
        let units = (op - opcodes::NO_RELOCATION) as u32;
        Ok(((units + 1) * 4, pos))
    } else if (opcodes::NO_RELOCATION_2BYTE..=opcodes::NO_RELOCATION_2BYTE_END).contains(&op) {
        let (b, next) = take(bytes, pos, 1)?;
        let band = (op - opcodes::NO_RELOCATION_2BYTE) as u32;
        let units = band * 256 + b[0] as u32;
        Ok(((units + 1) * 4, next))
    } else if (opcodes::NO_RELOCATION_3BYTE..=opcodes::NO_RELOCATION_3BYTE_END).contains(&op) {
        let (b, next) = take(bytes, pos, 2)?;
        let band = (op - opcodes::NO_RELOCATION_3BYTE) as u32;
        let tail = u16::from_be_bytes(b.try_into().unwrap()) as u32;
        let units = band * 65536 + tail;
        Ok(((units + 1) * 4, next))
    } else {
        let (v, next) = read_u24(bytes, pos)?;
        Ok((v + 1, next))
    }
}

/// Decodes the single opcode (and its operand bytes, if any) starting
/// at `bytes[0]`. Returns the produced relocation (`None` for the meta
/// opcodes that carry no independent record) and how many bytes of
/// `bytes` were consumed. Does not resolve `R_PREV_FIXUP`; the caller
/// handles that since it alone knows whether it's in a replay.
fn decode_opcode(
    bytes: &[u8],
    addr: u32,
    state: &mut DecodeState<'_>,
) -> Result<(Option<Relocation>, usize)> {
    if bytes.is_empty() {
        return Err(bad_value("empty opcode"));
    }
    let op = bytes[0];
    let mut pos = 1usize;
    let kind = classify(op);
    // A `R_PREV_FIXUP` is a meta-opcode standing in for whatever it
    // replays; its own dispatch must not disturb the pending override,
    // or a `R_DATA_ONE_SYMBOL` reached only through the replay would see
    // it already cleared. Let the recursive call's own dispatch (on the
    // *resolved* kind) take it instead.
    let pending_override = match kind {
        RelocKind::DataOverride | RelocKind::PrevFixup(_) => None,
        _ => state.pending_override.take(),
    };

    macro_rules! bare {
        ($k:expr) => {
            Ok((Some(Relocation::new(addr, $k)), pos))
        };
    }

    match kind {
        RelocKind::NoRelocation => {
            let (gap, next) = decode_skip(bytes, pos, op)?;
            state.last_skip = gap;
            Ok((None, next))
        }
        RelocKind::Reserved => Ok((None, pos)),
        RelocKind::DataOverride => {
            let width = (op - opcodes::DATA_OVERRIDE) as usize + 1;
            let (b, next) = take(bytes, pos, width)?;
            pos = next;
            state.pending_override = Some(sign_extend(b));
            Ok((None, pos))
        }
        RelocKind::PrevFixup(idx) => {
            let cached = state
                .queue
                .get(idx as usize)
                .ok_or_else(|| bad_value("R_PREV_FIXUP references an empty queue slot"))?
                .to_vec();
            state.queue.promote(idx as usize);
            let (reloc, consumed) = decode_opcode(&cached, addr, state)?;
            debug_assert_eq!(consumed, cached.len());
            Ok((reloc, pos))
        }
        RelocKind::CodeOneSymbol | RelocKind::DpRelative | RelocKind::DataOneSymbol => {
            let (inline_base, inline_end, byte_op, _triple_op) = match kind {
                RelocKind::CodeOneSymbol => (
                    opcodes::CODE_ONE_SYMBOL_INLINE,
                    opcodes::CODE_ONE_SYMBOL_INLINE_END,
                    opcodes::CODE_ONE_SYMBOL_BYTE,
                    opcodes::CODE_ONE_SYMBOL_TRIPLE,
                ),
                RelocKind::DpRelative => (
                    opcodes::DP_RELATIVE_INLINE,
                    opcodes::DP_RELATIVE_INLINE_END,
                    opcodes::DP_RELATIVE_BYTE,
                    opcodes::DP_RELATIVE_TRIPLE,
                ),
                _ => (
                    opcodes::DATA_ONE_SYMBOL_INLINE,
                    opcodes::DATA_ONE_SYMBOL_INLINE_END,
                    opcodes::DATA_ONE_SYMBOL_BYTE,
                    opcodes::DATA_ONE_SYMBOL_TRIPLE,
                ),
            };
            let symbol = if (inline_base..=inline_end).contains(&op) {
                (op - inline_base) as u32
            } else if op == byte_op {
                let (b, next) = take(bytes, pos, 1)?;
                pos = next;
                b[0] as u32
            } else {
                let (v, next) = read_u24(bytes, pos)?;
                pos = next;
                v
            };
            let mut reloc = Relocation::new(addr, kind).with_symbol(symbol);
            if kind == RelocKind::DataOneSymbol {
                let addend = match pending_override {
                    Some(v) => v,
                    None => state
                        .contents
                        .and_then(|c| read_implicit_addend(c, addr))
                        .unwrap_or(0),
                };
                if addend != 0 {
                    reloc = reloc.with_addend(addend);
                }
            }
            Ok((Some(reloc), pos))
        }
        RelocKind::DataPlabel | RelocKind::CodePlabel | RelocKind::DltRel | RelocKind::DataGprel => {
            let byte_op = match kind {
                RelocKind::DataPlabel => opcodes::DATA_PLABEL_BYTE,
                RelocKind::CodePlabel => opcodes::CODE_PLABEL_BYTE,
                RelocKind::DltRel => opcodes::DLT_REL_BYTE,
                _ => opcodes::DATA_GPREL_BYTE,
            };
            let symbol = if op == byte_op {
                let (b, next) = take(bytes, pos, 1)?;
                pos = next;
                b[0] as u32
            } else {
                let (v, next) = read_u24(bytes, pos)?;
                pos = next;
                v
            };
            Ok((Some(Relocation::new(addr, kind).with_symbol(symbol)), pos))
        }
        RelocKind::PcrelCall | RelocKind::AbsCall => {
            let (simple_base, simple_end, complex_short, _complex_long) = match kind {
                RelocKind::PcrelCall => (
                    opcodes::PCREL_CALL_SIMPLE,
                    opcodes::PCREL_CALL_SIMPLE_END,
                    opcodes::PCREL_CALL_COMPLEX_SHORT,
                    opcodes::PCREL_CALL_COMPLEX_LONG,
                ),
                _ => (
                    opcodes::ABS_CALL_SIMPLE,
                    opcodes::ABS_CALL_SIMPLE_END,
                    opcodes::ABS_CALL_COMPLEX_SHORT,
                    opcodes::ABS_CALL_COMPLEX_LONG,
                ),
            };
            if (simple_base..=simple_end).contains(&op) {
                let (ty, rtn) = super::argreloc::simple_offset_decode(op - simple_base);
                let arg_reloc = super::argreloc::from_simple(ty, rtn).to_word();
                let (b, next) = take(bytes, pos, 1)?;
                pos = next;
                let symbol = b[0] as u32;
                Ok((
                    Some(
                        Relocation::new(addr, kind)
                            .with_symbol(symbol)
                            .with_arg_reloc(arg_reloc),
                    ),
                    pos,
                ))
            } else {
                let (word_bytes, next) = take(bytes, pos, 2)?;
                let arg_reloc = (word_bytes[0] as u16) << 8 | word_bytes[1] as u16;
                pos = next;
                let (symbol, next) = read_u24(bytes, pos)?;
                pos = next;
                let mut reloc = Relocation::new(addr, kind)
                    .with_symbol(symbol)
                    .with_arg_reloc(arg_reloc);
                if op == complex_short {
                    Ok((Some(reloc), pos))
                } else {
                    let (addend_bytes, next) = take(bytes, pos, 4)?;
                    pos = next;
                    let addend = i32::from_be_bytes(addend_bytes.try_into().unwrap());
                    reloc = reloc.with_addend(addend as i64);
                    Ok((Some(reloc), pos))
                }
            }
        }
        RelocKind::Entry => {
            let (t_bytes, next) = take(bytes, pos, 4)?;
            pos = next;
            let (u_bytes, next) = take(bytes, pos, 4)?;
            pos = next;
            let t = u32::from_be_bytes(t_bytes.try_into().unwrap());
            let u = u32::from_be_bytes(u_bytes.try_into().unwrap());
            state.entry_stack.push(EntryFrame { t, u });
            let addend = ((t as i64) << 32) | u as i64;
            Ok((Some(Relocation::new(addr, RelocKind::Entry).with_addend(addend)), pos))
        }
        RelocKind::Exit => {
            let frame = state
                .entry_stack
                .pop()
                .ok_or_else(|| bad_value("R_EXIT with no matching R_ENTRY"))?;
            let (u_bytes, next) = take(bytes, pos, 4)?;
            pos = next;
            let delta = u32::from_be_bytes(u_bytes.try_into().unwrap());
            let addend = ((frame.t as i64) << 32) | (frame.u.wrapping_add(delta)) as i64;
            Ok((Some(Relocation::new(addr, RelocKind::Exit).with_addend(addend)), pos))
        }
        RelocKind::AltEntry => bare!(RelocKind::AltEntry),
        RelocKind::Fsel => bare!(RelocKind::Fsel),
        RelocKind::Lsel => bare!(RelocKind::Lsel),
        RelocKind::Rsel => bare!(RelocKind::Rsel),
        RelocKind::BeginBrtab => bare!(RelocKind::BeginBrtab),
        RelocKind::EndBrtab => bare!(RelocKind::EndBrtab),
        RelocKind::BeginTry => bare!(RelocKind::BeginTry),
        RelocKind::N0sel => bare!(RelocKind::N0sel),
        RelocKind::N1sel => bare!(RelocKind::N1sel),
        RelocKind::CodeExpr => bare!(RelocKind::CodeExpr),
        RelocKind::DataExpr => bare!(RelocKind::DataExpr),
        RelocKind::EndTry => {
            let len: u64 = if op == opcodes::END_TRY_1 {
                let (b, next) = take(bytes, pos, 1)?;
                pos = next;
                b[0] as u64
            } else if op == opcodes::END_TRY_2 {
                let (b, next) = take(bytes, pos, 2)?;
                pos = next;
                u16::from_be_bytes(b.try_into().unwrap()) as u64
            } else {
                let (b, next) = take(bytes, pos, 4)?;
                pos = next;
                u32::from_be_bytes(b.try_into().unwrap()) as u64
            };
            Ok((
                Some(Relocation::new(addr, RelocKind::EndTry).with_addend(len as i64)),
                pos,
            ))
        }
        RelocKind::NMode => {
            state.rounding = RoundingMode::N;
            bare!(RelocKind::NMode)
        }
        RelocKind::SMode => {
            state.rounding = RoundingMode::S;
            bare!(RelocKind::SMode)
        }
        RelocKind::DMode => {
            state.rounding = RoundingMode::D;
            bare!(RelocKind::DMode)
        }
        RelocKind::RMode => {
            state.rounding = RoundingMode::R;
            bare!(RelocKind::RMode)
        }
        RelocKind::ShortPcrelMode => {
            state.call_mode = CallMode::ShortPcrel;
            bare!(RelocKind::ShortPcrelMode)
        }
        RelocKind::LongPcrelMode => {
            state.call_mode = CallMode::LongPcrel;
            bare!(RelocKind::LongPcrelMode)
        }
        RelocKind::Comp1 | RelocKind::Comp2 => {
            let (b, next) = take(bytes, pos, 1)?;
            pos = next;
            Ok((
                Some(Relocation::new(addr, kind).with_addend(b[0] as i64)),
                pos,
            ))
        }
    }
}

/// Decodes a complete fixup stream, feeding every non-meta relocation
/// to `sink`. `addr` advances only across `R_NO_RELOCATION` runs, per
/// the offset invariant (§4.4): every other opcode reports the address
/// it was encountered at.
pub fn decode<S: RelocSink>(stream: &[u8], sink: &mut S) -> Result<()> {
    decode_impl(stream, None, sink)
}

/// Like [`decode`], but supplies the subspace's own contents so a
/// `R_DATA_ONE_SYMBOL` with no preceding `R_DATA_OVERRIDE` can recover
/// its implicit addend (§4.4).
pub fn decode_with_contents<S: RelocSink>(stream: &[u8], contents: &[u8], sink: &mut S) -> Result<()> {
    decode_impl(stream, Some(contents), sink)
}

fn decode_impl<S: RelocSink>(stream: &[u8], contents: Option<&[u8]>, sink: &mut S) -> Result<()> {
    let mut state = DecodeState {
        queue: RelocQueue::new(),
        rounding: RoundingMode::N,
        call_mode: CallMode::ShortPcrel,
        entry_stack: Vec::new(),
        last_skip: 0,
        pending_override: None,
        contents,
    };
    let mut pos = 0usize;
    let mut addr: u32 = 0;

    while pos < stream.len() {
        let op = stream[pos];
        let is_skip = (opcodes::NO_RELOCATION..=opcodes::NO_RELOCATION_END).contains(&op);
        let is_prev_fixup = (opcodes::PREV_FIXUP..=opcodes::PREV_FIXUP_END).contains(&op);

        let (reloc, consumed) = decode_opcode(&stream[pos..], addr, &mut state)?;

        if is_skip {
            addr += state.last_skip;
        } else if !is_prev_fixup && consumed > 1 {
            // Keep the queue in sync with what the encoder would have
            // inserted for this literal multi-byte opcode.
            let _ = state.queue.try_prev_fixup(&stream[pos..pos + consumed]);
        }

        if let Some(reloc) = reloc {
            sink.record(reloc);
        }
        pos += consumed;
    }
    Ok(())
}

/// Convenience wrapper: decodes and materializes every relocation into
/// a `Vec`, in stream order.
pub fn decode_to_vec(stream: &[u8]) -> Result<Vec<Relocation>> {
    let mut sink = super::MaterializingSink::default();
    decode(stream, &mut sink)?;
    Ok(sink.relocs)
}

/// Convenience wrapper around [`decode_with_contents`].
pub fn decode_to_vec_with_contents(stream: &[u8], contents: &[u8]) -> Result<Vec<Relocation>> {
    let mut sink = super::MaterializingSink::default();
    decode_with_contents(stream, contents, &mut sink)?;
    Ok(sink.relocs)
}
