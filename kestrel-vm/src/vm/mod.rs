//! The execution engine: fetch-decode-execute over a linked stream.
//!
//! One `Vm` owns everything a run touches: the instruction sequence, the
//! link tables, the register file, the value stack, the comparison flags,
//! and the call stack. Runs are synchronous; a `run` call drives the engine
//! until the entered routine halts or faults.

use std::cmp::Ordering;

use crate::bridge::{NativeFn, NativeRegistry, Signature};
use crate::bytecode::{decode_stream, Extra, Instruction};
use crate::debug::{DebugData, DebugFunction};
use crate::error::{Fault, LinkError, LoadError};
use crate::link::{self, FunctionTable, FunctionTarget, Routine, SymbolTable};
use crate::opcode::Opcode;
use crate::register::{Kind, Register, RegisterFile, Value};
use crate::stack::{ValueStack, DEFAULT_STACK_CAPACITY};

/// Engine lifecycle. `Faulted` is terminal: a faulted engine refuses
/// further runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Ready,
    Running,
    Halted,
    Faulted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepOutcome {
    Continue,
    Halt,
}

/// One suspended caller: where to resume and the bases to restore.
#[derive(Clone, Copy, Debug)]
struct Frame {
    return_pc: usize,
    prev_bases: [usize; 3],
    prev_routine: Option<usize>,
}

pub struct Vm {
    instructions: Vec<Instruction>,
    symbols: SymbolTable,
    functions: FunctionTable,
    routines: Vec<Routine>,
    natives: NativeRegistry,
    regs: RegisterFile,
    stack: ValueStack,
    flags: [bool; 2],
    pc: usize,
    current_routine: Option<usize>,
    frames: Vec<Frame>,
    state: State,
    started: bool,
    debug: DebugData,
}

impl Vm {
    /// Decode and link a stream into a ready engine.
    pub fn new(bytes: &[u8]) -> Result<Self, LoadError> {
        Self::with_stack_capacity(bytes, DEFAULT_STACK_CAPACITY)
    }

    pub fn with_stack_capacity(bytes: &[u8], capacity: usize) -> Result<Self, LoadError> {
        let instructions = decode_stream(bytes)?;
        let program = link::link(&instructions)?;
        log::debug!(
            "loaded {} instructions across {} routines",
            instructions.len(),
            program.routines.len()
        );
        Ok(Vm {
            instructions,
            symbols: program.symbols,
            functions: program.functions,
            routines: program.routines,
            natives: NativeRegistry::new(),
            regs: RegisterFile::new(),
            stack: ValueStack::new(capacity),
            flags: [false; 2],
            pc: 0,
            current_routine: None,
            frames: Vec::new(),
            state: State::Ready,
            started: false,
            debug: DebugData::new(),
        })
    }

    /// Bind a symbol id the stream left unbound. Refused once execution has
    /// begun.
    pub fn register_symbol(&mut self, id: u64, name: &str) -> Result<(), LinkError> {
        self.ensure_not_started("symbol registration")?;
        self.symbols.bind(id, name)
    }

    /// Register a code entry point the stream has no START marker for. The
    /// routine extent and its labels are scanned from `entry`.
    pub fn register_function(&mut self, name: &str, entry: usize) -> Result<(), LinkError> {
        self.ensure_not_started("function registration")?;
        let routine = Routine::scan(name, entry, &self.instructions)?;
        self.functions.define_code(name, entry, self.routines.len())?;
        self.routines.push(routine);
        Ok(())
    }

    /// Attach a native function to an EXTERN declaration (or declare it on
    /// the spot).
    pub fn bind_external(
        &mut self,
        name: &str,
        signature: Signature,
        func: NativeFn,
    ) -> Result<(), LinkError> {
        self.ensure_not_started("external binding")?;
        if let Some(FunctionTarget::Code { .. }) = self.functions.resolve(name) {
            return Err(LinkError::DuplicateDefinition {
                name: name.to_owned(),
            });
        }
        let slot = self.natives.bind(name, signature, func);
        self.functions.bind_native(name, slot)
    }

    fn ensure_not_started(&self, what: &str) -> Result<(), LinkError> {
        if self.started {
            return Err(LinkError::LinkAfterStart {
                what: what.to_owned(),
            });
        }
        Ok(())
    }

    /// Run a registered function to completion.
    ///
    /// An unknown name is reported without disturbing the engine; any fault
    /// raised during execution leaves the engine `Faulted`.
    pub fn run(&mut self, name: &str) -> Result<(), Fault> {
        self.run_with_arg_bytes(name, 0)
    }

    /// Typed call into a routine: push `args` left to right, run, pop the
    /// declared result. The pushed bytes are accounted to the callee's
    /// frame, so `USP[0]` addresses the first argument.
    pub fn call(
        &mut self,
        name: &str,
        args: &[Value],
        ret: Option<Kind>,
    ) -> Result<Option<Value>, Fault> {
        let mut arg_bytes = 0;
        for value in args {
            self.stack.push_value(*value)?;
            arg_bytes += value.kind().width();
        }
        self.run_with_arg_bytes(name, arg_bytes)?;
        match ret {
            Some(kind) => self.stack.pop_value(kind).map(Some),
            None => Ok(None),
        }
    }

    fn run_with_arg_bytes(&mut self, name: &str, arg_bytes: usize) -> Result<(), Fault> {
        if self.state == State::Faulted {
            return Err(Fault::Faulted);
        }
        let Some(target) = self.functions.resolve(name) else {
            return Err(Fault::UnknownSymbol {
                what: "function",
                name: name.to_owned(),
            });
        };

        self.started = true;
        self.state = State::Running;
        log::debug!("running {name:?}");

        match target {
            FunctionTarget::Native { slot: Some(slot) } => {
                match self.natives.invoke(slot, &mut self.stack) {
                    Ok(()) => {
                        self.state = State::Halted;
                        Ok(())
                    }
                    Err(fault) => self.fault(fault),
                }
            }
            FunctionTarget::Native { slot: None } => self.fault(Fault::UnknownSymbol {
                what: "native binding",
                name: name.to_owned(),
            }),
            FunctionTarget::Code { entry, routine } => {
                self.frames.clear();
                self.enter_routine(entry, routine, arg_bytes);
                loop {
                    match self.step() {
                        Ok(StepOutcome::Continue) => {}
                        Ok(StepOutcome::Halt) => {
                            self.state = State::Halted;
                            return Ok(());
                        }
                        Err(fault) => return self.fault(fault),
                    }
                }
            }
        }
    }

    fn fault(&mut self, fault: Fault) -> Result<(), Fault> {
        self.state = State::Faulted;
        log::warn!("fault at instruction {}: {fault}", self.pc);
        Err(fault)
    }

    /// Frame setup: position the instruction pointer and point all three
    /// bases at the callee's frame, which starts under any bytes accounted
    /// as arguments.
    fn enter_routine(&mut self, entry: usize, routine: usize, arg_bytes: usize) {
        self.pc = entry;
        self.current_routine = Some(routine);
        let base = self.stack.sp().saturating_sub(arg_bytes);
        self.regs.set_base(Register::Usp, base);
        self.regs.set_base(Register::Lsp, base);
        self.regs.set_base(Register::Fsp, base);
    }

    fn step(&mut self) -> Result<StepOutcome, Fault> {
        if self.pc >= self.instructions.len() {
            return Ok(StepOutcome::Halt);
        }
        let at = self.pc;
        let inst = &self.instructions[at];
        let opcode = inst.opcode;
        let arg1 = inst.arg1;
        let arg1_offset = inst.arg1_offset;
        let arg2 = inst.arg2;
        let extra = inst.extra;
        self.pc = at + 1;
        log::trace!("{}", self.instructions[at].disassemble(at));

        use Opcode::*;
        match opcode {
            Add | Sub | Mul | Div | Mod | Lshft | Rshft | And | Or | Xor => {
                let a = self.load(arg1, arg1_offset)?;
                let b = self.load(arg2, extra.offset())?;
                let out = arith(opcode, a, b)?;
                self.store(arg1, arg1_offset, out)?;
            }
            Inc | Dec | Cmpl => {
                let a = self.load(arg1, arg1_offset)?;
                let out = unary(opcode, a)?;
                self.store(arg1, arg1_offset, out)?;
            }

            Grt0 | Greq0 | Less0 | Lseq0 | Iseq0 | Neq0 => {
                let a = self.load(arg1, arg1_offset)?;
                let b = self.load(arg2, extra.offset())?;
                self.flags[0] = compare(opcode, a, b)?;
            }
            Grt1 | Greq1 | Less1 | Lseq1 | Iseq1 | Neq1 => {
                let a = self.load(arg1, arg1_offset)?;
                let b = self.load(arg2, extra.offset())?;
                self.flags[1] = compare(opcode, a, b)?;
            }
            Not0 => self.flags[0] = !self.flags[0],
            Not1 => self.flags[1] = !self.flags[1],
            Cand => self.flags[0] = self.flags[0] && self.flags[1],
            Cor => self.flags[0] = self.flags[0] || self.flags[1],

            If => {
                if !self.flags[0] {
                    self.pc = self.skip_false_branch(at);
                }
            }
            Else => self.pc = self.skip_else_branch(at),

            PushC => self.exec_push(opcode, Kind::Byte, arg1, arg1_offset, extra)?,
            PushU => self.exec_push(opcode, Kind::Uint, arg1, arg1_offset, extra)?,
            PushL => self.exec_push(opcode, Kind::Int, arg1, arg1_offset, extra)?,
            PushF => self.exec_push(opcode, Kind::Float, arg1, arg1_offset, extra)?,
            Pop => {
                let kind = self.operand_kind(arg1)?;
                let value = self.stack.pop_value(kind)?;
                self.store(arg1, arg1_offset, value)?;
            }
            MovC => self.exec_mov(opcode, Kind::Byte, arg1, arg1_offset, arg2, extra.offset())?,
            MovU => self.exec_mov(opcode, Kind::Uint, arg1, arg1_offset, arg2, extra.offset())?,
            MovL => self.exec_mov(opcode, Kind::Int, arg1, arg1_offset, arg2, extra.offset())?,
            MovF => self.exec_mov(opcode, Kind::Float, arg1, arg1_offset, arg2, extra.offset())?,

            Call => {
                let id = extra.immediate();
                let name = match self.symbols.lookup(id) {
                    Some(name) => name.to_owned(),
                    None => {
                        return Err(Fault::UnknownSymbol {
                            what: "symbol id",
                            name: id.to_string(),
                        })
                    }
                };
                match self.functions.resolve(&name) {
                    Some(FunctionTarget::Native { slot: Some(slot) }) => {
                        self.natives.invoke(slot, &mut self.stack)?;
                    }
                    Some(FunctionTarget::Native { slot: None }) => {
                        return Err(Fault::UnknownSymbol {
                            what: "native binding",
                            name,
                        });
                    }
                    Some(FunctionTarget::Code { entry, routine }) => {
                        self.frames.push(Frame {
                            return_pc: self.pc,
                            prev_bases: [
                                self.regs.base(Register::Usp),
                                self.regs.base(Register::Lsp),
                                self.regs.base(Register::Fsp),
                            ],
                            prev_routine: self.current_routine,
                        });
                        self.enter_routine(entry, routine, 0);
                    }
                    None => {
                        return Err(Fault::UnknownSymbol {
                            what: "function",
                            name,
                        });
                    }
                }
            }
            Jmp => {
                let id = extra.immediate();
                let name = match self.symbols.lookup(id) {
                    Some(name) => name.to_owned(),
                    None => {
                        return Err(Fault::UnknownSymbol {
                            what: "symbol id",
                            name: id.to_string(),
                        })
                    }
                };
                let target = self
                    .current_routine
                    .and_then(|index| self.routines.get(index))
                    .and_then(|routine| routine.label(&name));
                match target {
                    Some(index) => self.pc = index,
                    None => return Err(Fault::UnknownSymbol { what: "label", name }),
                }
            }

            // Consumed by the link pass; inert at execution time.
            Symbol | Extern | Start | Label => {}

            End => match self.frames.pop() {
                Some(frame) => {
                    self.pc = frame.return_pc;
                    self.regs.set_base(Register::Usp, frame.prev_bases[0]);
                    self.regs.set_base(Register::Lsp, frame.prev_bases[1]);
                    self.regs.set_base(Register::Fsp, frame.prev_bases[2]);
                    self.current_routine = frame.prev_routine;
                }
                None => return Ok(StepOutcome::Halt),
            },
        }
        Ok(StepOutcome::Continue)
    }

    /// IF with flag slot 0 false: resume just after the matching ELSE, or
    /// at the LABEL/END that terminates the block. Depth counts textual
    /// IF/ELSE pairing only.
    fn skip_false_branch(&self, from: usize) -> usize {
        let mut depth = 0usize;
        let mut index = from + 1;
        while index < self.instructions.len() {
            match self.instructions[index].opcode {
                Opcode::If => depth += 1,
                Opcode::Else if depth > 0 => depth -= 1,
                Opcode::Else => return index + 1,
                Opcode::Label | Opcode::End if depth == 0 => return index,
                _ => {}
            }
            index += 1;
        }
        index
    }

    /// ELSE reached with the then-branch done: resume at the terminating
    /// LABEL/END. A depth-0 ELSE reached first belongs to an enclosing
    /// block; resume at it so its own skip fires.
    fn skip_else_branch(&self, from: usize) -> usize {
        let mut depth = 0usize;
        let mut index = from + 1;
        while index < self.instructions.len() {
            match self.instructions[index].opcode {
                Opcode::If => depth += 1,
                Opcode::Else if depth > 0 => depth -= 1,
                Opcode::Else => return index,
                Opcode::Label | Opcode::End if depth == 0 => return index,
                _ => {}
            }
            index += 1;
        }
        index
    }

    fn exec_push(
        &mut self,
        opcode: Opcode,
        kind: Kind,
        reg: Register,
        offset: u8,
        extra: Extra,
    ) -> Result<(), Fault> {
        let value = if reg.is_null() {
            Value::from_immediate(kind, extra.immediate())
        } else {
            let held = self.load(reg, offset)?;
            if held.kind() != kind {
                return Err(Fault::KindNotSupported {
                    op: opcode.mnemonic(),
                    kind: held.kind(),
                });
            }
            held
        };
        self.stack.push_value(value)
    }

    fn exec_mov(
        &mut self,
        opcode: Opcode,
        kind: Kind,
        dst: Register,
        dst_offset: u8,
        src: Register,
        src_offset: u8,
    ) -> Result<(), Fault> {
        let dst_kind = self.operand_kind(dst)?;
        if dst_kind != kind {
            return Err(Fault::KindNotSupported {
                op: opcode.mnemonic(),
                kind: dst_kind,
            });
        }
        let value = self.load(src, src_offset)?;
        if value.kind() != kind {
            return Err(Fault::KindNotSupported {
                op: opcode.mnemonic(),
                kind: value.kind(),
            });
        }
        self.store(dst, dst_offset, value)
    }

    /// Resolve an operand to its value: a data register directly, a base
    /// register through its frame slot.
    fn load(&self, reg: Register, offset: u8) -> Result<Value, Fault> {
        if reg.data_kind().is_some() {
            if offset != 0 {
                return Err(Fault::type_mismatch(format!(
                    "data register {reg} takes no frame offset"
                )));
            }
            return Ok(self.regs.read(reg));
        }
        if let Some(kind) = reg.frame_kind() {
            let at = self.frame_addr(reg, offset);
            let bytes = self.stack.peek_at(at, kind.width())?;
            return Ok(Value::from_le_bytes(kind, bytes));
        }
        Err(Fault::type_mismatch("NULL carries no value"))
    }

    /// Write an operand: a data register directly, a base register through
    /// its frame slot in place.
    fn store(&mut self, reg: Register, offset: u8, value: Value) -> Result<(), Fault> {
        if reg.data_kind().is_some() {
            if offset != 0 {
                return Err(Fault::type_mismatch(format!(
                    "data register {reg} takes no frame offset"
                )));
            }
            return self.regs.write(reg, value);
        }
        if let Some(kind) = reg.frame_kind() {
            if value.kind() != kind {
                return Err(Fault::type_mismatch(format!(
                    "{reg} frame slots hold {kind}, got {}",
                    value.kind()
                )));
            }
            let at = self.frame_addr(reg, offset);
            let (bytes, len) = value.to_le_bytes();
            return self.stack.poke_at(at, &bytes[..len]);
        }
        Err(Fault::type_mismatch("NULL rejects writes"))
    }

    fn operand_kind(&self, reg: Register) -> Result<Kind, Fault> {
        reg.data_kind()
            .or(reg.frame_kind())
            .ok_or_else(|| Fault::type_mismatch("NULL names no kind"))
    }

    // Frame slots are 8 bytes wide for all three bases.
    fn frame_addr(&self, base: Register, offset: u8) -> usize {
        self.regs.base(base) + 8 * offset as usize
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Read a comparison flag.
    ///
    /// Two slots cover one level of nested condition evaluation; deeper
    /// nesting must be compiled to explicit jumps.
    ///
    /// # Panics
    /// There are exactly two slots; `slot > 1` panics.
    pub fn cmp_flag(&self, slot: usize) -> bool {
        self.flags[slot]
    }

    /// Write a comparison flag.
    ///
    /// # Panics
    /// There are exactly two slots; `slot > 1` panics.
    pub fn set_cmp_flag(&mut self, slot: usize, value: bool) {
        self.flags[slot] = value;
    }

    pub fn register(&self, reg: Register) -> Value {
        self.regs.read(reg)
    }

    pub fn set_register(&mut self, reg: Register, value: Value) -> Result<(), Fault> {
        self.regs.write(reg, value)
    }

    pub fn symbol_name(&self, id: u64) -> Option<&str> {
        self.symbols.lookup(id)
    }

    pub fn instruction_ptr(&self) -> usize {
        self.pc
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn stack_ptr(&self) -> usize {
        self.stack.sp()
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_byte(&mut self, value: u8) -> Result<(), Fault> {
        self.stack.push_value(Value::Byte(value))
    }

    pub fn push_uint(&mut self, value: u64) -> Result<(), Fault> {
        self.stack.push_value(Value::Uint(value))
    }

    pub fn push_int(&mut self, value: i64) -> Result<(), Fault> {
        self.stack.push_value(Value::Int(value))
    }

    pub fn push_float(&mut self, value: f64) -> Result<(), Fault> {
        self.stack.push_value(Value::Float(value))
    }

    pub fn pop_byte(&mut self) -> Result<u8, Fault> {
        match self.stack.pop_value(Kind::Byte)? {
            Value::Byte(v) => Ok(v),
            other => Err(Fault::type_mismatch(format!(
                "popped {}, wanted byte",
                other.kind()
            ))),
        }
    }

    pub fn pop_uint(&mut self) -> Result<u64, Fault> {
        match self.stack.pop_value(Kind::Uint)? {
            Value::Uint(v) => Ok(v),
            other => Err(Fault::type_mismatch(format!(
                "popped {}, wanted uint",
                other.kind()
            ))),
        }
    }

    pub fn pop_int(&mut self) -> Result<i64, Fault> {
        match self.stack.pop_value(Kind::Int)? {
            Value::Int(v) => Ok(v),
            other => Err(Fault::type_mismatch(format!(
                "popped {}, wanted int",
                other.kind()
            ))),
        }
    }

    pub fn pop_float(&mut self) -> Result<f64, Fault> {
        match self.stack.pop_value(Kind::Float)? {
            Value::Float(v) => Ok(v),
            other => Err(Fault::type_mismatch(format!(
                "popped {}, wanted float",
                other.kind()
            ))),
        }
    }

    pub fn debug_data(&self) -> &DebugData {
        &self.debug
    }

    pub fn debug_data_mut(&mut self) -> &mut DebugData {
        &mut self.debug
    }

    pub fn function_data(&self, signature: &str) -> Option<&DebugFunction> {
        self.debug.function(signature)
    }

    pub fn line_data(&self, address: u64) -> Option<(u64, &str)> {
        self.debug.line_record(address)
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("state", &self.state)
            .field("pc", &self.pc)
            .field("instructions", &self.instructions.len())
            .field("routines", &self.routines.len())
            .field("stack_ptr", &self.stack.sp())
            .field("call_depth", &self.frames.len())
            .finish()
    }
}

fn arith(op: Opcode, a: Value, b: Value) -> Result<Value, Fault> {
    match (a, b) {
        (Value::Byte(x), Value::Byte(y)) => byte_arith(op, x, y).map(Value::Byte),
        (Value::Uint(x), Value::Uint(y)) => uint_arith(op, x, y).map(Value::Uint),
        (Value::Int(x), Value::Int(y)) => int_arith(op, x, y).map(Value::Int),
        (Value::Float(x), Value::Float(y)) => float_arith(op, x, y).map(Value::Float),
        _ => Err(Fault::type_mismatch(format!(
            "{} operands disagree: {} vs {}",
            op.mnemonic(),
            a.kind(),
            b.kind()
        ))),
    }
}

fn byte_arith(op: Opcode, a: u8, b: u8) -> Result<u8, Fault> {
    use Opcode::*;
    Ok(match op {
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Mul => a.wrapping_mul(b),
        Div if b == 0 => return Err(Fault::DivisionByZero),
        Div => a / b,
        Mod if b == 0 => return Err(Fault::DivisionByZero),
        Mod => a % b,
        Lshft => a.wrapping_shl(b as u32),
        Rshft => a.wrapping_shr(b as u32),
        And => a & b,
        Or => a | b,
        Xor => a ^ b,
        other => {
            return Err(Fault::KindNotSupported {
                op: other.mnemonic(),
                kind: Kind::Byte,
            })
        }
    })
}

fn uint_arith(op: Opcode, a: u64, b: u64) -> Result<u64, Fault> {
    use Opcode::*;
    Ok(match op {
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Mul => a.wrapping_mul(b),
        Div if b == 0 => return Err(Fault::DivisionByZero),
        Div => a / b,
        Mod if b == 0 => return Err(Fault::DivisionByZero),
        Mod => a % b,
        Lshft => a.wrapping_shl(b as u32),
        Rshft => a.wrapping_shr(b as u32),
        And => a & b,
        Or => a | b,
        Xor => a ^ b,
        other => {
            return Err(Fault::KindNotSupported {
                op: other.mnemonic(),
                kind: Kind::Uint,
            })
        }
    })
}

fn int_arith(op: Opcode, a: i64, b: i64) -> Result<i64, Fault> {
    use Opcode::*;
    Ok(match op {
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Mul => a.wrapping_mul(b),
        Div if b == 0 => return Err(Fault::DivisionByZero),
        Div => a.wrapping_div(b),
        Mod if b == 0 => return Err(Fault::DivisionByZero),
        Mod => a.wrapping_rem(b),
        Lshft => a.wrapping_shl(b as u32),
        Rshft => a.wrapping_shr(b as u32),
        And => a & b,
        Or => a | b,
        Xor => a ^ b,
        other => {
            return Err(Fault::KindNotSupported {
                op: other.mnemonic(),
                kind: Kind::Int,
            })
        }
    })
}

fn float_arith(op: Opcode, a: f64, b: f64) -> Result<f64, Fault> {
    use Opcode::*;
    Ok(match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div if b == 0.0 => return Err(Fault::DivisionByZero),
        Div => a / b,
        Mod if b == 0.0 => return Err(Fault::DivisionByZero),
        Mod => a % b,
        other => {
            return Err(Fault::KindNotSupported {
                op: other.mnemonic(),
                kind: Kind::Float,
            })
        }
    })
}

fn unary(op: Opcode, a: Value) -> Result<Value, Fault> {
    use Opcode::*;
    use Value::*;
    Ok(match (op, a) {
        (Inc, Byte(x)) => Byte(x.wrapping_add(1)),
        (Inc, Uint(x)) => Uint(x.wrapping_add(1)),
        (Inc, Int(x)) => Int(x.wrapping_add(1)),
        (Inc, Float(x)) => Float(x + 1.0),
        (Dec, Byte(x)) => Byte(x.wrapping_sub(1)),
        (Dec, Uint(x)) => Uint(x.wrapping_sub(1)),
        (Dec, Int(x)) => Int(x.wrapping_sub(1)),
        (Dec, Float(x)) => Float(x - 1.0),
        (Cmpl, Byte(x)) => Byte(!x),
        (Cmpl, Uint(x)) => Uint(!x),
        (Cmpl, Int(x)) => Int(!x),
        (other, value) => {
            return Err(Fault::KindNotSupported {
                op: other.mnemonic(),
                kind: value.kind(),
            })
        }
    })
}

/// Kind-checked comparison. NaN compares false under every operator except
/// NEQ, which it satisfies.
fn compare(op: Opcode, a: Value, b: Value) -> Result<bool, Fault> {
    use Opcode::*;
    let ordering = match (a, b) {
        (Value::Byte(x), Value::Byte(y)) => Some(x.cmp(&y)),
        (Value::Uint(x), Value::Uint(y)) => Some(x.cmp(&y)),
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(&y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(&y),
        _ => {
            return Err(Fault::type_mismatch(format!(
                "{} operands disagree: {} vs {}",
                op.mnemonic(),
                a.kind(),
                b.kind()
            )))
        }
    };
    Ok(match ordering {
        Some(ord) => match op {
            Grt0 | Grt1 => ord == Ordering::Greater,
            Greq0 | Greq1 => ord != Ordering::Less,
            Less0 | Less1 => ord == Ordering::Less,
            Lseq0 | Lseq1 => ord != Ordering::Greater,
            Iseq0 | Iseq1 => ord == Ordering::Equal,
            Neq0 | Neq1 => ord != Ordering::Equal,
            _ => false,
        },
        None => matches!(op, Neq0 | Neq1),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bytecode::StreamWriter;
    use crate::register::Register::*;

    fn load_vm(build: impl FnOnce(&mut StreamWriter)) -> Vm {
        let mut w = StreamWriter::new();
        build(&mut w);
        Vm::new(&w.finish()).unwrap()
    }

    #[test]
    fn runs_a_trivial_routine_to_halt() {
        let mut vm = load_vm(|w| {
            w.start("main").push_uint(5).pop_into(U0).end_routine();
        });
        assert_eq!(vm.state(), State::Ready);
        vm.run("main").unwrap();
        assert_eq!(vm.state(), State::Halted);
        assert_eq!(vm.register(U0), Value::Uint(5));
        assert_eq!(vm.stack_ptr(), 0);
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn arithmetic_writes_back_to_the_left_operand() {
        let mut vm = load_vm(|w| {
            w.start("main").op_reg_reg(Opcode::Add, U0, U1).end_routine();
        });
        vm.set_register(U0, Value::Uint(7)).unwrap();
        vm.set_register(U1, Value::Uint(5)).unwrap();
        vm.run("main").unwrap();
        assert_eq!(vm.register(U0), Value::Uint(12));
        assert_eq!(vm.register(U1), Value::Uint(5));
    }

    #[test]
    fn integer_arithmetic_wraps() {
        let mut vm = load_vm(|w| {
            w.start("main").op_reg_reg(Opcode::Add, U0, U1).end_routine();
        });
        vm.set_register(U0, Value::Uint(u64::MAX)).unwrap();
        vm.set_register(U1, Value::Uint(1)).unwrap();
        vm.run("main").unwrap();
        assert_eq!(vm.register(U0), Value::Uint(0));
    }

    #[test]
    fn byte_family_arithmetic_wraps_at_eight_bits() {
        let mut vm = load_vm(|w| {
            w.start("main")
                .push_byte(200)
                .pop_into(C0)
                .push_byte(100)
                .pop_into(C1)
                .op_reg_reg(Opcode::Add, C0, C1)
                .end_routine();
        });
        vm.run("main").unwrap();
        assert_eq!(vm.register(C0), Value::Byte(44));
    }

    #[test]
    fn division_by_zero_faults_and_poisons_the_engine() {
        let mut vm = load_vm(|w| {
            w.start("main").op_reg_reg(Opcode::Div, U0, U1).end_routine();
        });
        vm.set_register(U0, Value::Uint(9)).unwrap();
        let fault = vm.run("main").unwrap_err();
        assert_eq!(fault, Fault::DivisionByZero);
        assert_eq!(vm.state(), State::Faulted);
        assert_eq!(vm.run("main").unwrap_err(), Fault::Faulted);
    }

    #[test]
    fn float_zero_divisor_faults() {
        let mut vm = load_vm(|w| {
            w.start("main").op_reg_reg(Opcode::Div, F0, F1).end_routine();
        });
        vm.set_register(F0, Value::Float(1.0)).unwrap();
        let fault = vm.run("main").unwrap_err();
        assert_eq!(fault, Fault::DivisionByZero);
    }

    #[test]
    fn bitwise_on_floats_is_not_supported() {
        let mut vm = load_vm(|w| {
            w.start("main").op_reg_reg(Opcode::And, F0, F1).end_routine();
        });
        let fault = vm.run("main").unwrap_err();
        assert_eq!(
            fault,
            Fault::KindNotSupported {
                op: "AND",
                kind: Kind::Float
            }
        );
    }

    #[test]
    fn mixed_kind_operands_are_a_type_mismatch() {
        let mut vm = load_vm(|w| {
            w.start("main").op_reg_reg(Opcode::Add, U0, L0).end_routine();
        });
        let fault = vm.run("main").unwrap_err();
        assert!(matches!(fault, Fault::TypeMismatch { .. }));
    }

    #[test]
    fn unary_ops_cover_all_integer_kinds() {
        let mut vm = load_vm(|w| {
            w.start("main")
                .op_reg(Opcode::Inc, U0)
                .op_reg(Opcode::Dec, L0)
                .op_reg(Opcode::Cmpl, U1)
                .op_reg(Opcode::Inc, F0)
                .end_routine();
        });
        vm.set_register(L0, Value::Int(0)).unwrap();
        vm.run("main").unwrap();
        assert_eq!(vm.register(U0), Value::Uint(1));
        assert_eq!(vm.register(L0), Value::Int(-1));
        assert_eq!(vm.register(U1), Value::Uint(u64::MAX));
        assert_eq!(vm.register(F0), Value::Float(1.0));
    }

    #[test]
    fn complement_on_floats_is_not_supported() {
        let mut vm = load_vm(|w| {
            w.start("main").op_reg(Opcode::Cmpl, F0).end_routine();
        });
        let fault = vm.run("main").unwrap_err();
        assert_eq!(
            fault,
            Fault::KindNotSupported {
                op: "CMPL",
                kind: Kind::Float
            }
        );
    }

    fn branch_program(w: &mut StreamWriter) {
        w.start("main")
            .op_reg_reg(Opcode::Iseq0, U0, U1)
            .op(Opcode::If)
            .push_uint(10)
            .op(Opcode::Else)
            .push_uint(20)
            .label("out")
            .pop_into(U2)
            .end_routine();
    }

    #[test]
    fn if_takes_the_then_branch_on_true() {
        let mut vm = load_vm(branch_program);
        vm.run("main").unwrap();
        assert_eq!(vm.register(U2), Value::Uint(10));
    }

    #[test]
    fn if_takes_the_else_branch_on_false() {
        let mut vm = load_vm(branch_program);
        vm.set_register(U1, Value::Uint(3)).unwrap();
        vm.run("main").unwrap();
        assert_eq!(vm.register(U2), Value::Uint(20));
    }

    fn nested_branch_program(w: &mut StreamWriter) {
        // if U0==0 { if U1==0 { push 1 } else { push 2 } } else { push 3 }
        w.start("main")
            .op_reg_reg(Opcode::Iseq0, U0, U3)
            .op(Opcode::If)
            .op_reg_reg(Opcode::Iseq0, U1, U3)
            .op(Opcode::If)
            .push_uint(1)
            .op(Opcode::Else)
            .push_uint(2)
            .op(Opcode::Else)
            .push_uint(3)
            .label("out")
            .pop_into(U2)
            .end_routine();
    }

    #[test]
    fn nested_blocks_resolve_by_textual_pairing() {
        let mut vm = load_vm(nested_branch_program);
        vm.run("main").unwrap();
        assert_eq!(vm.register(U2), Value::Uint(1));

        let mut vm = load_vm(nested_branch_program);
        vm.set_register(U1, Value::Uint(9)).unwrap();
        vm.run("main").unwrap();
        assert_eq!(vm.register(U2), Value::Uint(2));

        let mut vm = load_vm(nested_branch_program);
        vm.set_register(U0, Value::Uint(9)).unwrap();
        vm.run("main").unwrap();
        assert_eq!(vm.register(U2), Value::Uint(3));
    }

    #[test]
    fn jmp_loops_through_a_backward_label() {
        let mut vm = load_vm(|w| {
            w.symbol(1, "top")
                .start("main")
                .label("top")
                .op_reg(Opcode::Dec, U0)
                .op_reg_reg(Opcode::Grt0, U0, U1)
                .op(Opcode::If)
                .jmp_id(1)
                .label("done")
                .end_routine();
        });
        vm.set_register(U0, Value::Uint(3)).unwrap();
        vm.run("main").unwrap();
        assert_eq!(vm.register(U0), Value::Uint(0));
        assert_eq!(vm.state(), State::Halted);
    }

    #[test]
    fn jmp_to_a_label_of_another_routine_is_unknown() {
        let mut vm = load_vm(|w| {
            w.symbol(1, "elsewhere")
                .start("main")
                .jmp_id(1)
                .end_routine()
                .start("other")
                .label("elsewhere")
                .end_routine();
        });
        let fault = vm.run("main").unwrap_err();
        assert_eq!(
            fault,
            Fault::UnknownSymbol {
                what: "label",
                name: "elsewhere".to_owned()
            }
        );
    }

    #[test]
    fn call_pushes_a_frame_and_end_returns() {
        let mut vm = load_vm(|w| {
            w.symbol(2, "twice")
                .start("main")
                .push_uint(11)
                .call_id(2)
                .pop_into(U0)
                .end_routine()
                .start("twice")
                .pop_into(U1)
                .op_reg_reg(Opcode::Add, U1, U1)
                .push_reg(U1)
                .end_routine();
        });
        vm.run("main").unwrap();
        assert_eq!(vm.register(U0), Value::Uint(22));
        assert_eq!(vm.state(), State::Halted);
        assert_eq!(vm.call_depth(), 0);
        assert_eq!(vm.stack_ptr(), 0);
    }

    #[test]
    fn frame_slots_address_call_arguments() {
        let mut vm = load_vm(|w| {
            w.start("sum")
                .op_frame(Opcode::MovU, U0, 0, Usp, 0)
                .op_frame(Opcode::MovU, U1, 0, Usp, 1)
                .op_reg_reg(Opcode::Add, U0, U1)
                .push_reg(U0)
                .end_routine();
        });
        let result = vm
            .call("sum", &[Value::Uint(30), Value::Uint(12)], Some(Kind::Uint))
            .unwrap();
        assert_eq!(result, Some(Value::Uint(42)));
    }

    #[test]
    fn frame_slots_can_be_written_in_place() {
        let mut vm = load_vm(|w| {
            w.start("bump")
                .op_frame(Opcode::Inc, Usp, 0, Null, 0)
                .op_frame(Opcode::MovU, U0, 0, Usp, 0)
                .end_routine();
        });
        vm.call("bump", &[Value::Uint(41)], None).unwrap();
        assert_eq!(vm.register(U0), Value::Uint(42));
    }

    #[test]
    fn mov_enforces_the_suffix_kind_on_both_sides() {
        let mut vm = load_vm(|w| {
            w.start("main").op_reg_reg(Opcode::MovU, L0, U0).end_routine();
        });
        let fault = vm.run("main").unwrap_err();
        assert_eq!(
            fault,
            Fault::KindNotSupported {
                op: "MOVU",
                kind: Kind::Int
            }
        );

        let mut vm = load_vm(|w| {
            w.start("main").op_reg_reg(Opcode::MovU, U0, F0).end_routine();
        });
        let fault = vm.run("main").unwrap_err();
        assert_eq!(
            fault,
            Fault::KindNotSupported {
                op: "MOVU",
                kind: Kind::Float
            }
        );
    }

    #[test]
    fn pop_through_null_is_a_type_mismatch() {
        let mut vm = load_vm(|w| {
            w.start("main").push_uint(1).pop_into(Null).end_routine();
        });
        let fault = vm.run("main").unwrap_err();
        assert!(matches!(fault, Fault::TypeMismatch { .. }));
    }

    #[test]
    fn data_registers_take_no_frame_offset() {
        let mut vm = load_vm(|w| {
            w.start("main").op_frame(Opcode::Add, U0, 1, U1, 0).end_routine();
        });
        let fault = vm.run("main").unwrap_err();
        assert!(matches!(fault, Fault::TypeMismatch { .. }));
    }

    #[test]
    fn nan_comparisons_are_false_except_neq() {
        let mut vm = load_vm(|w| {
            w.start("main")
                .op_reg_reg(Opcode::Iseq0, F0, F1)
                .op_reg_reg(Opcode::Neq1, F0, F1)
                .end_routine();
        });
        vm.set_register(F0, Value::Float(f64::NAN)).unwrap();
        vm.set_register(F1, Value::Float(1.0)).unwrap();
        vm.run("main").unwrap();
        assert!(!vm.cmp_flag(0));
        assert!(vm.cmp_flag(1));
    }

    #[test]
    fn not_and_combinators_rewrite_slot_zero() {
        let mut vm = load_vm(|w| {
            w.start("main").op(Opcode::Not0).op(Opcode::Cand).end_routine();
        });
        vm.set_cmp_flag(1, true);
        vm.run("main").unwrap();
        // NOT0 turned slot 0 true; CAND kept it true via slot 1.
        assert!(vm.cmp_flag(0));

        let mut vm = load_vm(|w| {
            w.start("main").op(Opcode::Cor).end_routine();
        });
        vm.set_cmp_flag(1, true);
        vm.run("main").unwrap();
        assert!(vm.cmp_flag(0));
    }

    #[test]
    fn immediates_round_through_the_stack() {
        let mut vm = load_vm(|w| {
            w.start("main").push_int(-9).push_float(1.5).end_routine();
        });
        vm.run("main").unwrap();
        assert_eq!(vm.pop_float().unwrap(), 1.5);
        assert_eq!(vm.pop_int().unwrap(), -9);
    }

    #[test]
    fn call_dispatches_to_bound_natives() {
        let mut vm = load_vm(|w| {
            w.symbol(7, "double")
                .extern_fn("double")
                .start("main")
                .push_uint(21)
                .call_id(7)
                .pop_into(U0)
                .end_routine();
        });
        vm.bind_external(
            "double",
            Signature::new(vec![Kind::Uint], Some(Kind::Uint)),
            Box::new(|args| {
                let Value::Uint(v) = args[0] else {
                    anyhow::bail!("kind confusion");
                };
                Ok(Some(Value::Uint(v * 2)))
            }),
        )
        .unwrap();
        vm.run("main").unwrap();
        assert_eq!(vm.register(U0), Value::Uint(42));
    }

    #[test]
    fn calling_an_unbound_external_faults() {
        let mut vm = load_vm(|w| {
            w.symbol(7, "missing")
                .extern_fn("missing")
                .start("main")
                .call_id(7)
                .end_routine();
        });
        let fault = vm.run("main").unwrap_err();
        assert_eq!(
            fault,
            Fault::UnknownSymbol {
                what: "native binding",
                name: "missing".to_owned()
            }
        );
        assert_eq!(vm.state(), State::Faulted);
    }

    #[test]
    fn unknown_run_name_leaves_the_engine_untouched() {
        let mut vm = load_vm(|w| {
            w.start("main").end_routine();
        });
        let fault = vm.run("nope").unwrap_err();
        assert_eq!(
            fault,
            Fault::UnknownSymbol {
                what: "function",
                name: "nope".to_owned()
            }
        );
        assert_eq!(vm.state(), State::Ready);
        // Registration is still open; nothing ran.
        vm.register_symbol(1, "late").unwrap();
        vm.run("main").unwrap();
        assert_eq!(vm.state(), State::Halted);
    }

    #[test]
    fn registration_closes_once_execution_begins() {
        let mut vm = load_vm(|w| {
            w.start("main").end_routine();
        });
        vm.run("main").unwrap();

        let err = vm.register_symbol(1, "late").unwrap_err();
        assert!(matches!(err, LinkError::LinkAfterStart { .. }));
        let err = vm.register_function("late", 0).unwrap_err();
        assert!(matches!(err, LinkError::LinkAfterStart { .. }));
        let err = vm
            .bind_external(
                "late",
                Signature::default(),
                Box::new(|_| Ok(None)),
            )
            .unwrap_err();
        assert!(matches!(err, LinkError::LinkAfterStart { .. }));
    }

    #[test]
    fn halted_engine_services_another_run() {
        let mut vm = load_vm(|w| {
            w.start("main").op_reg(Opcode::Inc, U0).end_routine();
        });
        vm.run("main").unwrap();
        vm.run("main").unwrap();
        assert_eq!(vm.register(U0), Value::Uint(2));
    }

    #[test]
    fn running_off_the_stream_end_halts() {
        // No END marker at all; the routine extent runs to EOF.
        let mut vm = load_vm(|w| {
            w.start("main").push_uint(3).pop_into(U0);
        });
        vm.run("main").unwrap();
        assert_eq!(vm.state(), State::Halted);
        assert_eq!(vm.register(U0), Value::Uint(3));
    }

    #[test]
    fn host_registered_functions_run_like_stream_ones() {
        let mut vm = load_vm(|w| {
            w.push_uint(8).pop_into(U0).end_routine();
        });
        vm.register_function("hosted", 0).unwrap();
        vm.run("hosted").unwrap();
        assert_eq!(vm.register(U0), Value::Uint(8));
    }
}
