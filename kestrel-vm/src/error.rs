//! Error taxonomy: load-time errors prevent construction, runtime faults
//! abort the in-progress run and leave the engine faulted.

use crate::register::Kind;

/// Malformed stream. Raised while decoding; a stream that fails to decode
/// never becomes a VM.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bad magic {found:02X?} (not a kestrel bytecode stream)")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported stream version {version} (supported: {supported})")]
    UnsupportedVersion { version: u8, supported: u8 },

    #[error("unknown opcode 0x{opcode:02X} at offset 0x{offset:X}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("bad register encoding 0x{register:02X} at offset 0x{offset:X}")]
    BadRegister { register: u8, offset: usize },

    #[error("unexpected EOF while reading {what} at offset 0x{offset:X}")]
    Truncated { what: &'static str, offset: usize },

    #[error("symbol at offset 0x{offset:X} is not valid UTF-8")]
    BadSymbol { offset: usize },
}

/// Table-population errors, from the load-time link pass or from the host
/// registration API.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("symbol id {id} is already bound to {existing:?}")]
    DuplicateSymbol { id: u64, existing: String },

    #[error("duplicate definition of function {name:?}")]
    DuplicateDefinition { name: String },

    #[error("duplicate label {label:?} in routine {routine:?}")]
    DuplicateLabel { routine: String, label: String },

    #[error("cannot register {what} after execution has begun")]
    LinkAfterStart { what: String },
}

/// Umbrella for `Vm::new`: the stream either fails to decode or fails to
/// link.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Runtime fault. Any fault aborts the current `run` call and moves the
/// engine to the faulted state; there is no recovery or retry.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("type mismatch: {msg}")]
    TypeMismatch { msg: String },

    #[error("{op} does not support {kind} operands")]
    KindNotSupported { op: &'static str, kind: Kind },

    #[error("division by zero")]
    DivisionByZero,

    #[error("stack overflow: need {need} bytes, {free} free (capacity {capacity})")]
    StackOverflow {
        need: usize,
        free: usize,
        capacity: usize,
    },

    #[error("stack underflow: need {need} bytes, {have} available")]
    StackUnderflow { need: usize, have: usize },

    #[error("unknown {what}: {name}")]
    UnknownSymbol { what: &'static str, name: String },

    #[error("marshal error calling {function:?}: {msg}")]
    MarshalError { function: String, msg: String },

    #[error("native function {function:?} failed: {msg}")]
    NativeFailed { function: String, msg: String },

    #[error("vm is faulted; construct a fresh instance")]
    Faulted,
}

impl Fault {
    pub(crate) fn type_mismatch(msg: impl Into<String>) -> Self {
        Fault::TypeMismatch { msg: msg.into() }
    }
}
