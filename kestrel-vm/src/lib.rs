//! An embeddable bytecode interpreter with typed registers, a byte-oriented
//! value stack, and a stack-marshalled bridge to host functions.
//!
//! A compiled stream is decoded and linked once ([`Vm::new`]); the host may
//! then register further symbols, entry points, and native functions before
//! the first run. Execution is synchronous: [`Vm::run`] drives one routine
//! to halt or fault.
//!
//! ```
//! use kestrel_vm::{Opcode, Register, StreamWriter, Value, Vm};
//!
//! let mut w = StreamWriter::new();
//! w.start("main")
//!     .push_uint(40)
//!     .pop_into(Register::U0)
//!     .op_reg(Opcode::Inc, Register::U0)
//!     .op_reg(Opcode::Inc, Register::U0)
//!     .end_routine();
//!
//! let mut vm = Vm::new(&w.finish())?;
//! vm.run("main")?;
//! assert_eq!(vm.register(Register::U0), Value::Uint(42));
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod bridge;
pub mod bytecode;
pub mod debug;
pub mod error;
pub mod link;
pub mod opcode;
pub mod register;
pub mod stack;
pub mod vm;

pub use bridge::{NativeFn, NativeRegistry, Signature};
pub use bytecode::{decode_stream, Extra, Instruction, StreamWriter, MAGIC, VERSION};
pub use debug::{DebugData, DebugFunction};
pub use error::{DecodeError, Fault, LinkError, LoadError};
pub use link::{link, FunctionTable, FunctionTarget, LinkedProgram, Routine, SymbolTable};
pub use opcode::Opcode;
pub use register::{Kind, Register, RegisterFile, Value};
pub use stack::{ValueStack, DEFAULT_STACK_CAPACITY};
pub use vm::{State, Vm};
