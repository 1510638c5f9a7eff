//! The closed operation set.
//!
//! Encodings are stable: `decode` accepts exactly the byte values declared
//! here, in declaration order, and the engine dispatches over the enum with
//! an exhaustive match rather than an opcode-indexed table.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Add = 0,
    Sub,
    Mul,
    Div,
    Mod,
    Inc,
    Dec,

    Lshft,
    Rshft,
    And,
    Or,
    Xor,
    Cmpl,

    If,
    Else,
    Grt0,
    Grt1,
    Greq0,
    Greq1,
    Less0,
    Less1,
    Lseq0,
    Lseq1,
    Iseq0,
    Iseq1,
    Neq0,
    Neq1,
    Not0,
    Not1,
    Cand,
    Cor,

    PushC,
    PushU,
    PushL,
    PushF,
    Pop,
    MovC,
    MovU,
    MovL,
    MovF,
    Call,
    Jmp,
    Symbol,
    Extern,
    Start,
    Label,
    End,
}

impl Opcode {
    /// Decode a wire byte. Returns `None` for anything outside the closed
    /// set.
    pub fn decode(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            0 => Add,
            1 => Sub,
            2 => Mul,
            3 => Div,
            4 => Mod,
            5 => Inc,
            6 => Dec,
            7 => Lshft,
            8 => Rshft,
            9 => And,
            10 => Or,
            11 => Xor,
            12 => Cmpl,
            13 => If,
            14 => Else,
            15 => Grt0,
            16 => Grt1,
            17 => Greq0,
            18 => Greq1,
            19 => Less0,
            20 => Less1,
            21 => Lseq0,
            22 => Lseq1,
            23 => Iseq0,
            24 => Iseq1,
            25 => Neq0,
            26 => Neq1,
            27 => Not0,
            28 => Not1,
            29 => Cand,
            30 => Cor,
            31 => PushC,
            32 => PushU,
            33 => PushL,
            34 => PushF,
            35 => Pop,
            36 => MovC,
            37 => MovU,
            38 => MovL,
            39 => MovF,
            40 => Call,
            41 => Jmp,
            42 => Symbol,
            43 => Extern,
            44 => Start,
            45 => Label,
            46 => End,
            _ => return None,
        })
    }

    pub fn encode(self) -> u8 {
        self as u8
    }

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Inc => "INC",
            Dec => "DEC",
            Lshft => "LSHFT",
            Rshft => "RSHFT",
            And => "AND",
            Or => "OR",
            Xor => "XOR",
            Cmpl => "CMPL",
            If => "IF",
            Else => "ELSE",
            Grt0 => "GRT0",
            Grt1 => "GRT1",
            Greq0 => "GREQ0",
            Greq1 => "GREQ1",
            Less0 => "LESS0",
            Less1 => "LESS1",
            Lseq0 => "LSEQ0",
            Lseq1 => "LSEQ1",
            Iseq0 => "ISEQ0",
            Iseq1 => "ISEQ1",
            Neq0 => "NEQ0",
            Neq1 => "NEQ1",
            Not0 => "NOT0",
            Not1 => "NOT1",
            Cand => "CAND",
            Cor => "COR",
            PushC => "PUSHC",
            PushU => "PUSHU",
            PushL => "PUSHL",
            PushF => "PUSHF",
            Pop => "POP",
            MovC => "MOVC",
            MovU => "MOVU",
            MovL => "MOVL",
            MovF => "MOVF",
            Call => "CALL",
            Jmp => "JMP",
            Symbol => "SYMBOL",
            Extern => "EXTERN",
            Start => "START",
            Label => "LABEL",
            End => "END",
        }
    }

    /// Whether `extra` is a 64-bit immediate on the wire.
    /// Every other opcode uses the one-byte second-operand offset form.
    /// Decoder, writer, and engine all share this mapping.
    pub fn takes_immediate(self) -> bool {
        use Opcode::*;
        matches!(self, PushC | PushU | PushL | PushF | Call | Jmp | Symbol)
    }

    /// Whether a length-prefixed name string trails the fixed fields.
    pub fn takes_symbol(self) -> bool {
        use Opcode::*;
        matches!(self, Symbol | Start | Label | Extern)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
