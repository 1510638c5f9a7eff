//! Registers, value kinds, and the kind-tagged value type.
//!
//! Register storage is a tagged scalar rather than an untyped 8-byte cell:
//! every stored value carries its kind, and all reads and writes are checked
//! against the register family.

use std::fmt;

use crate::error::Fault;

/// The four storage kinds a register or stack span can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Byte,
    Uint,
    Int,
    Float,
}

impl Kind {
    /// Stack transfer width in bytes. Register storage is 8 bytes for every
    /// kind; only the byte kind travels narrower on the stack.
    pub fn width(self) -> usize {
        match self {
            Kind::Byte => 1,
            Kind::Uint | Kind::Int | Kind::Float => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Byte => "byte",
            Kind::Uint => "uint",
            Kind::Int => "int",
            Kind::Float => "float",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A VM scalar. The active variant always matches the family of the
/// register or stack span it came from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Uint(u64),
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn kind(self) -> Kind {
        match self {
            Value::Byte(_) => Kind::Byte,
            Value::Uint(_) => Kind::Uint,
            Value::Int(_) => Kind::Int,
            Value::Float(_) => Kind::Float,
        }
    }

    pub fn zero(kind: Kind) -> Value {
        match kind {
            Kind::Byte => Value::Byte(0),
            Kind::Uint => Value::Uint(0),
            Kind::Int => Value::Int(0),
            Kind::Float => Value::Float(0.0),
        }
    }

    /// Reinterpret a wire immediate as a value of `kind`.
    ///
    /// Immediates are stored as raw u64 on the wire: the byte kind takes the
    /// low byte, the signed kind the two's-complement bits, the float kind
    /// the IEEE bit pattern.
    pub fn from_immediate(kind: Kind, raw: u64) -> Value {
        match kind {
            Kind::Byte => Value::Byte(raw as u8),
            Kind::Uint => Value::Uint(raw),
            Kind::Int => Value::Int(raw as i64),
            Kind::Float => Value::Float(f64::from_bits(raw)),
        }
    }

    /// The little-endian byte image of this value: a fixed buffer and the
    /// live length (`kind().width()`).
    pub fn to_le_bytes(self) -> ([u8; 8], usize) {
        match self {
            Value::Byte(b) => {
                let mut buf = [0u8; 8];
                buf[0] = b;
                (buf, 1)
            }
            Value::Uint(u) => (u.to_le_bytes(), 8),
            Value::Int(i) => (i.to_le_bytes(), 8),
            Value::Float(f) => (f.to_bits().to_le_bytes(), 8),
        }
    }

    /// Rebuild a value of `kind` from a little-endian span of exactly
    /// `kind.width()` bytes.
    pub fn from_le_bytes(kind: Kind, bytes: &[u8]) -> Value {
        debug_assert_eq!(bytes.len(), kind.width());
        match kind {
            Kind::Byte => Value::Byte(bytes[0]),
            Kind::Uint => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Value::Uint(u64::from_le_bytes(buf))
            }
            Kind::Int => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Value::Int(i64::from_le_bytes(buf))
            }
            Kind::Float => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Value::Float(f64::from_bits(u64::from_le_bytes(buf)))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(b) => write!(f, "{b}"),
            Value::Uint(u) => write!(f, "{u}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
        }
    }
}

/// Register identifiers, encodings 0..=19 in declaration order: four data
/// registers per kind family, three stack-base pointers (one per non-byte
/// kind), and the NULL sentinel meaning "operand unused".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    C0 = 0,
    C1,
    C2,
    C3,
    U0,
    U1,
    U2,
    U3,
    L0,
    L1,
    L2,
    L3,
    F0,
    F1,
    F2,
    F3,
    Usp,
    Lsp,
    Fsp,
    Null,
}

impl Register {
    pub fn decode(byte: u8) -> Option<Register> {
        use Register::*;
        Some(match byte {
            0 => C0,
            1 => C1,
            2 => C2,
            3 => C3,
            4 => U0,
            5 => U1,
            6 => U2,
            7 => U3,
            8 => L0,
            9 => L1,
            10 => L2,
            11 => L3,
            12 => F0,
            13 => F1,
            14 => F2,
            15 => F3,
            16 => Usp,
            17 => Lsp,
            18 => Fsp,
            19 => Null,
            _ => return None,
        })
    }

    pub fn encode(self) -> u8 {
        self as u8
    }

    /// The kind a data register stores. `None` for bases and NULL.
    pub fn data_kind(self) -> Option<Kind> {
        use Register::*;
        match self {
            C0 | C1 | C2 | C3 => Some(Kind::Byte),
            U0 | U1 | U2 | U3 => Some(Kind::Uint),
            L0 | L1 | L2 | L3 => Some(Kind::Int),
            F0 | F1 | F2 | F3 => Some(Kind::Float),
            Usp | Lsp | Fsp | Null => None,
        }
    }

    /// The kind addressed *through* a stack-base register. `None` for
    /// everything else.
    pub fn frame_kind(self) -> Option<Kind> {
        match self {
            Register::Usp => Some(Kind::Uint),
            Register::Lsp => Some(Kind::Int),
            Register::Fsp => Some(Kind::Float),
            _ => None,
        }
    }

    pub fn is_base(self) -> bool {
        matches!(self, Register::Usp | Register::Lsp | Register::Fsp)
    }

    pub fn is_null(self) -> bool {
        self == Register::Null
    }

    pub fn name(self) -> &'static str {
        use Register::*;
        match self {
            C0 => "C0",
            C1 => "C1",
            C2 => "C2",
            C3 => "C3",
            U0 => "U0",
            U1 => "U1",
            U2 => "U2",
            U3 => "U3",
            L0 => "L0",
            L1 => "L1",
            L2 => "L2",
            L3 => "L3",
            F0 => "F0",
            F1 => "F1",
            F2 => "F2",
            F3 => "F3",
            Usp => "USP",
            Lsp => "LSP",
            Fsp => "FSP",
            Null => "NULL",
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The 20-slot register file.
///
/// Data slots are kind-checked on write. Base slots hold stack-pointer
/// snapshots and are written only through the engine's frame setup; the
/// public `write` rejects them. The NULL slot reads as zero and rejects
/// writes.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    slots: [Value; 20],
}

impl RegisterFile {
    pub fn new() -> Self {
        let mut slots = [Value::Uint(0); 20];
        for idx in 0..20u8 {
            if let Some(reg) = Register::decode(idx) {
                if let Some(kind) = reg.data_kind() {
                    slots[idx as usize] = Value::zero(kind);
                }
            }
        }
        RegisterFile { slots }
    }

    pub fn read(&self, reg: Register) -> Value {
        self.slots[reg.encode() as usize]
    }

    /// Kind-checked write to a data register.
    pub fn write(&mut self, reg: Register, value: Value) -> Result<(), Fault> {
        let Some(kind) = reg.data_kind() else {
            if reg.is_base() {
                return Err(Fault::type_mismatch(format!(
                    "{reg} is a stack-base register, written only by frame setup"
                )));
            }
            return Err(Fault::type_mismatch("NULL rejects writes"));
        };
        if value.kind() != kind {
            return Err(Fault::type_mismatch(format!(
                "{reg} holds {kind}, got {}",
                value.kind()
            )));
        }
        self.slots[reg.encode() as usize] = value;
        Ok(())
    }

    /// Frame setup: store a stack-pointer snapshot in a base register.
    pub(crate) fn set_base(&mut self, reg: Register, sp: usize) {
        debug_assert!(reg.is_base());
        self.slots[reg.encode() as usize] = Value::Uint(sp as u64);
    }

    /// The snapshot held by a base register. Bases are engine-written and
    /// always hold a uint.
    pub(crate) fn base(&self, reg: Register) -> usize {
        match self.slots[reg.encode() as usize] {
            Value::Uint(sp) => sp as usize,
            _ => 0,
        }
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}
