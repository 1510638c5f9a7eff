//! Wire format: decoding compiled streams into instruction records, and the
//! writer that produces them.
//!
//! Layout (little-endian):
//! - 0x00: 4-byte magic `KSTL`
//! - 0x04: u8 stream version
//! - 0x05..EOF: instruction records:
//!     - u8 opcode
//!     - u8 arg1 register
//!     - u8 arg1_offset
//!     - u8 arg2 register
//!     - extra: u64 immediate for immediate-form opcodes, else u8
//!       arg2_offset
//!     - symbol-form opcodes only: u8 name length + name bytes (UTF-8)
//!
//! Decoding is one-shot and deterministic: the same bytes always produce
//! the same instruction sequence, and instruction indices are the stable
//! addresses the rest of the system (function table, labels, debug records)
//! refers to.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::DecodeError;
use crate::opcode::Opcode;
use crate::register::Register;

pub const MAGIC: [u8; 4] = *b"KSTL";
pub const VERSION: u8 = 1;

/// The per-opcode `extra` field: a second-operand frame offset or a 64-bit
/// immediate. Exactly one form is valid per opcode
/// ([`Opcode::takes_immediate`]); the decoder guarantees the form matches,
/// so the accessors are total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extra {
    Offset(u8),
    Immediate(u64),
}

impl Extra {
    pub fn offset(self) -> u8 {
        match self {
            Extra::Offset(off) => off,
            Extra::Immediate(_) => 0,
        }
    }

    pub fn immediate(self) -> u64 {
        match self {
            Extra::Immediate(value) => value,
            Extra::Offset(off) => off as u64,
        }
    }
}

/// One decoded instruction. Field layout mirrors the wire record.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg1: Register,
    pub arg1_offset: u8,
    pub arg2: Register,
    pub extra: Extra,
    pub symbol: Option<String>,
}

impl Instruction {
    /// Operand column of a listing, one string per operand. An immediate is
    /// shown only when no register operand supersedes it, mirroring how the
    /// engine reads the record.
    pub fn operands(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.arg1.is_null() {
            out.push(fmt_operand(self.arg1, self.arg1_offset));
        }
        match self.extra {
            Extra::Immediate(raw) if self.arg1.is_null() => out.push(self.fmt_immediate(raw)),
            Extra::Immediate(_) => {}
            Extra::Offset(off) => {
                if !self.arg2.is_null() {
                    out.push(fmt_operand(self.arg2, off));
                }
            }
        }
        if let Some(name) = &self.symbol {
            out.push(format!("{name:?}"));
        }
        out
    }

    /// One listing line: zero-padded instruction index, mnemonic, operands.
    pub fn disassemble(&self, index: usize) -> String {
        let ops = self.operands().join(", ");
        if ops.is_empty() {
            format!("{index:08} {}", self.opcode.mnemonic())
        } else {
            format!("{index:08} {:<8} {}", self.opcode.mnemonic(), ops)
        }
    }

    fn fmt_immediate(&self, raw: u64) -> String {
        match self.opcode {
            Opcode::PushF => format!("{}", f64::from_bits(raw)),
            Opcode::PushL => format!("{}", raw as i64),
            _ => format!("{raw}"),
        }
    }
}

fn fmt_operand(reg: Register, offset: u8) -> String {
    if offset == 0 {
        reg.to_string()
    } else {
        format!("{reg}[{offset}]")
    }
}

fn read_u8(bytes: &[u8], off: &mut usize, what: &'static str) -> Result<u8, DecodeError> {
    if *off + 1 > bytes.len() {
        return Err(DecodeError::Truncated { what, offset: *off });
    }
    let v = bytes[*off];
    *off += 1;
    Ok(v)
}

fn read_u64_le(bytes: &[u8], off: &mut usize, what: &'static str) -> Result<u64, DecodeError> {
    if *off + 8 > bytes.len() {
        return Err(DecodeError::Truncated { what, offset: *off });
    }
    let v = LittleEndian::read_u64(&bytes[*off..*off + 8]);
    *off += 8;
    Ok(v)
}

fn read_register(
    bytes: &[u8],
    off: &mut usize,
    what: &'static str,
) -> Result<Register, DecodeError> {
    let raw = read_u8(bytes, off, what)?;
    Register::decode(raw).ok_or(DecodeError::BadRegister {
        register: raw,
        offset: *off - 1,
    })
}

fn decode_record(bytes: &[u8], off: &mut usize) -> Result<Instruction, DecodeError> {
    let opcode_off = *off;
    let raw_opcode = read_u8(bytes, off, "opcode")?;
    let opcode = Opcode::decode(raw_opcode).ok_or(DecodeError::UnknownOpcode {
        opcode: raw_opcode,
        offset: opcode_off,
    })?;

    let arg1 = read_register(bytes, off, "arg1 register")?;
    let arg1_offset = read_u8(bytes, off, "arg1 offset")?;
    let arg2 = read_register(bytes, off, "arg2 register")?;

    let extra = if opcode.takes_immediate() {
        Extra::Immediate(read_u64_le(bytes, off, "immediate")?)
    } else {
        Extra::Offset(read_u8(bytes, off, "arg2 offset")?)
    };

    let symbol = if opcode.takes_symbol() {
        let len = read_u8(bytes, off, "symbol length")? as usize;
        let start = *off;
        if start + len > bytes.len() {
            return Err(DecodeError::Truncated {
                what: "symbol bytes",
                offset: start,
            });
        }
        let name = std::str::from_utf8(&bytes[start..start + len])
            .map_err(|_| DecodeError::BadSymbol { offset: start })?;
        *off = start + len;
        Some(name.to_owned())
    } else {
        None
    };

    Ok(Instruction {
        opcode,
        arg1,
        arg1_offset,
        arg2,
        extra,
        symbol,
    })
}

/// Decode a full stream (header + records to EOF).
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    if bytes.len() < 4 {
        return Err(DecodeError::Truncated {
            what: "stream magic",
            offset: 0,
        });
    }
    let found = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if found != MAGIC {
        return Err(DecodeError::BadMagic { found });
    }

    let mut off = 4;
    let version = read_u8(bytes, &mut off, "stream version")?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion {
            version,
            supported: VERSION,
        });
    }

    let mut instructions = Vec::new();
    while off < bytes.len() {
        instructions.push(decode_record(bytes, &mut off)?);
    }
    Ok(instructions)
}

/// Programmatic stream builder, the inverse of [`decode_stream`].
///
/// The assembler front end that normally produces streams lives outside
/// this crate; the writer is how hosts and tests construct routines
/// directly.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    bytes: Vec<u8>,
}

impl StreamWriter {
    pub fn new() -> Self {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        StreamWriter { bytes }
    }

    /// Append one record. The extra form and symbol presence must match the
    /// opcode's declared shape.
    pub fn emit(
        &mut self,
        opcode: Opcode,
        arg1: Register,
        arg1_offset: u8,
        arg2: Register,
        extra: Extra,
        symbol: Option<&str>,
    ) -> &mut Self {
        debug_assert_eq!(
            opcode.takes_immediate(),
            matches!(extra, Extra::Immediate(_)),
            "{} uses the {} extra form",
            opcode.mnemonic(),
            if opcode.takes_immediate() { "immediate" } else { "offset" },
        );
        debug_assert_eq!(
            opcode.takes_symbol(),
            symbol.is_some(),
            "{} and symbol operand disagree",
            opcode.mnemonic(),
        );

        self.bytes.push(opcode.encode());
        self.bytes.push(arg1.encode());
        self.bytes.push(arg1_offset);
        self.bytes.push(arg2.encode());
        match extra {
            Extra::Offset(off) => self.bytes.push(off),
            Extra::Immediate(value) => self.bytes.extend_from_slice(&value.to_le_bytes()),
        }
        if let Some(name) = symbol {
            debug_assert!(name.len() <= u8::MAX as usize, "symbol name too long");
            self.bytes.push(name.len() as u8);
            self.bytes.extend_from_slice(name.as_bytes());
        }
        self
    }

    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.emit(opcode, Register::Null, 0, Register::Null, Extra::Offset(0), None)
    }

    pub fn op_reg(&mut self, opcode: Opcode, reg: Register) -> &mut Self {
        self.emit(opcode, reg, 0, Register::Null, Extra::Offset(0), None)
    }

    pub fn op_reg_reg(&mut self, opcode: Opcode, a: Register, b: Register) -> &mut Self {
        self.emit(opcode, a, 0, b, Extra::Offset(0), None)
    }

    /// Two operands with frame offsets, for base-relative addressing.
    pub fn op_frame(
        &mut self,
        opcode: Opcode,
        a: Register,
        a_offset: u8,
        b: Register,
        b_offset: u8,
    ) -> &mut Self {
        self.emit(opcode, a, a_offset, b, Extra::Offset(b_offset), None)
    }

    pub fn push_byte(&mut self, value: u8) -> &mut Self {
        self.push_immediate(Opcode::PushC, value as u64)
    }

    pub fn push_uint(&mut self, value: u64) -> &mut Self {
        self.push_immediate(Opcode::PushU, value)
    }

    pub fn push_int(&mut self, value: i64) -> &mut Self {
        self.push_immediate(Opcode::PushL, value as u64)
    }

    pub fn push_float(&mut self, value: f64) -> &mut Self {
        self.push_immediate(Opcode::PushF, value.to_bits())
    }

    fn push_immediate(&mut self, opcode: Opcode, raw: u64) -> &mut Self {
        self.emit(
            opcode,
            Register::Null,
            0,
            Register::Null,
            Extra::Immediate(raw),
            None,
        )
    }

    /// Push a register or frame slot; the opcode suffix follows the operand
    /// kind.
    pub fn push_reg(&mut self, reg: Register) -> &mut Self {
        let kind = reg.data_kind().or(reg.frame_kind());
        debug_assert!(kind.is_some(), "cannot push through NULL");
        let opcode = match kind {
            Some(crate::register::Kind::Byte) => Opcode::PushC,
            Some(crate::register::Kind::Int) => Opcode::PushL,
            Some(crate::register::Kind::Float) => Opcode::PushF,
            _ => Opcode::PushU,
        };
        self.emit(opcode, reg, 0, Register::Null, Extra::Immediate(0), None)
    }

    pub fn pop_into(&mut self, reg: Register) -> &mut Self {
        self.op_reg(Opcode::Pop, reg)
    }

    /// Register-to-register move; the opcode suffix follows the destination
    /// kind.
    pub fn mov(&mut self, dst: Register, src: Register) -> &mut Self {
        let kind = dst.data_kind().or(dst.frame_kind());
        debug_assert!(kind.is_some(), "cannot move into NULL");
        let opcode = match kind {
            Some(crate::register::Kind::Byte) => Opcode::MovC,
            Some(crate::register::Kind::Int) => Opcode::MovL,
            Some(crate::register::Kind::Float) => Opcode::MovF,
            _ => Opcode::MovU,
        };
        self.op_reg_reg(opcode, dst, src)
    }

    pub fn call_id(&mut self, id: u64) -> &mut Self {
        self.emit(
            Opcode::Call,
            Register::Null,
            0,
            Register::Null,
            Extra::Immediate(id),
            None,
        )
    }

    pub fn jmp_id(&mut self, id: u64) -> &mut Self {
        self.emit(
            Opcode::Jmp,
            Register::Null,
            0,
            Register::Null,
            Extra::Immediate(id),
            None,
        )
    }

    pub fn symbol(&mut self, id: u64, name: &str) -> &mut Self {
        self.emit(
            Opcode::Symbol,
            Register::Null,
            0,
            Register::Null,
            Extra::Immediate(id),
            Some(name),
        )
    }

    pub fn extern_fn(&mut self, name: &str) -> &mut Self {
        self.emit(
            Opcode::Extern,
            Register::Null,
            0,
            Register::Null,
            Extra::Offset(0),
            Some(name),
        )
    }

    pub fn start(&mut self, name: &str) -> &mut Self {
        self.emit(
            Opcode::Start,
            Register::Null,
            0,
            Register::Null,
            Extra::Offset(0),
            Some(name),
        )
    }

    pub fn label(&mut self, name: &str) -> &mut Self {
        self.emit(
            Opcode::Label,
            Register::Null,
            0,
            Register::Null,
            Extra::Offset(0),
            Some(name),
        )
    }

    pub fn end_routine(&mut self) -> &mut Self {
        self.op(Opcode::End)
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

impl Default for StreamWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::register::Register::*;

    fn sample_stream() -> Vec<u8> {
        let mut w = StreamWriter::new();
        w.symbol(1, "main")
            .start("main")
            .push_uint(41)
            .pop_into(U0)
            .op_frame(Opcode::MovU, U1, 0, Usp, 2)
            .op_reg_reg(Opcode::Add, U0, U1)
            .push_float(2.5)
            .push_reg(F0)
            .op_reg_reg(Opcode::Grt0, U0, U1)
            .op(Opcode::If)
            .op(Opcode::Else)
            .label("out")
            .jmp_id(1)
            .end_routine();
        w.finish()
    }

    #[test]
    fn writer_and_decoder_are_inverse() {
        let bytes = sample_stream();
        let insts = decode_stream(&bytes).unwrap();
        assert_eq!(insts.len(), 14);

        assert_eq!(insts[0].opcode, Opcode::Symbol);
        assert_eq!(insts[0].extra, Extra::Immediate(1));
        assert_eq!(insts[0].symbol.as_deref(), Some("main"));

        assert_eq!(insts[1].opcode, Opcode::Start);
        assert_eq!(insts[2].extra, Extra::Immediate(41));
        assert_eq!(insts[3], Instruction {
            opcode: Opcode::Pop,
            arg1: U0,
            arg1_offset: 0,
            arg2: Null,
            extra: Extra::Offset(0),
            symbol: None,
        });
        assert_eq!(insts[4].arg2, Usp);
        assert_eq!(insts[4].extra, Extra::Offset(2));
        assert_eq!(insts[6].extra, Extra::Immediate(2.5f64.to_bits()));
        assert_eq!(insts[7].arg1, F0);
        assert_eq!(insts[13].opcode, Opcode::End);
    }

    #[test]
    fn decoding_is_deterministic() {
        let bytes = sample_stream();
        let first = decode_stream(&bytes).unwrap();
        let second = decode_stream(&bytes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = decode_stream(b"XSTL\x01").unwrap_err();
        assert_eq!(err, DecodeError::BadMagic { found: *b"XSTL" });
    }

    #[test]
    fn rejects_unsupported_version() {
        let err = decode_stream(b"KSTL\x07").unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnsupportedVersion {
                version: 7,
                supported: VERSION
            }
        );
    }

    #[test]
    fn names_offset_of_truncation() {
        // Header + PUSHU record cut in the middle of its immediate.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.push(Opcode::PushU.encode());
        bytes.extend_from_slice(&[Null.encode(), 0, Null.encode()]);
        bytes.extend_from_slice(&[0, 0, 0]);
        let err = decode_stream(&bytes).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                what: "immediate",
                offset: 9
            }
        );
    }

    #[test]
    fn rejects_unknown_opcode_and_register() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.push(200);
        let err = decode_stream(&bytes).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownOpcode {
                opcode: 200,
                offset: 5
            }
        );

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&[Opcode::Add.encode(), 77, 0, 0, 0]);
        let err = decode_stream(&bytes).unwrap_err();
        assert_eq!(
            err,
            DecodeError::BadRegister {
                register: 77,
                offset: 6
            }
        );
    }

    #[test]
    fn rejects_invalid_symbol_utf8() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.push(Opcode::Start.encode());
        bytes.extend_from_slice(&[Null.encode(), 0, Null.encode(), 0]);
        bytes.push(2);
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        let err = decode_stream(&bytes).unwrap_err();
        assert_eq!(err, DecodeError::BadSymbol { offset: 11 });
    }

    #[test]
    fn disassembly_renders_operands() {
        let bytes = sample_stream();
        let insts = decode_stream(&bytes).unwrap();
        assert_eq!(insts[2].disassemble(2), "00000002 PUSHU    41");
        assert_eq!(insts[4].disassemble(4), "00000004 MOVU     U1, USP[2]");
        assert_eq!(insts[7].disassemble(7), "00000007 PUSHF    F0");
        assert_eq!(insts[11].disassemble(11), "00000011 LABEL    \"out\"");
        assert_eq!(insts[13].disassemble(13), "00000013 END");
    }
}
