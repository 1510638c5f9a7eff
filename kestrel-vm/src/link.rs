//! Link pass: one scan over a decoded stream that collects SYMBOL bindings,
//! routine extents with their labels, and EXTERN declarations.
//!
//! The pass runs once at load time. CALL and JMP then resolve through the
//! tables built here; nothing is discovered lazily during execution.

use std::collections::HashMap;

use crate::bytecode::Instruction;
use crate::error::LinkError;
use crate::opcode::Opcode;

/// Numeric id to name bindings from SYMBOL markers.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    names: HashMap<u64, String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an id. Rebinding an id is always an error, even to the same
    /// name; streams are expected to bind each id exactly once.
    pub fn bind(&mut self, id: u64, name: &str) -> Result<(), LinkError> {
        if let Some(existing) = self.names.get(&id) {
            return Err(LinkError::DuplicateSymbol {
                id,
                existing: existing.clone(),
            });
        }
        self.names.insert(id, name.to_owned());
        Ok(())
    }

    pub fn lookup(&self, id: u64) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.names.iter().map(|(id, name)| (*id, name.as_str()))
    }
}

/// Where a named function lives: in the stream, or behind a host binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionTarget {
    /// Code in the loaded stream, entered at `entry` within routine
    /// `routine` (an index into [`LinkedProgram::routines`]).
    Code { entry: usize, routine: usize },
    /// Declared external. `slot` indexes the host's native registry once
    /// bound; `None` until then.
    Native { slot: Option<usize> },
}

impl FunctionTarget {
    pub fn is_external(&self) -> bool {
        matches!(self, FunctionTarget::Native { .. })
    }
}

/// Name to target bindings from START and EXTERN markers plus host
/// registrations.
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    entries: HashMap<String, FunctionTarget>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_code(
        &mut self,
        name: &str,
        entry: usize,
        routine: usize,
    ) -> Result<(), LinkError> {
        if self.entries.contains_key(name) {
            return Err(LinkError::DuplicateDefinition {
                name: name.to_owned(),
            });
        }
        self.entries
            .insert(name.to_owned(), FunctionTarget::Code { entry, routine });
        Ok(())
    }

    /// EXTERN declaration. Re-declaring an external is a no-op; clashing
    /// with a code definition is an error.
    pub fn declare_native(&mut self, name: &str) -> Result<(), LinkError> {
        match self.entries.get(name) {
            Some(FunctionTarget::Code { .. }) => Err(LinkError::DuplicateDefinition {
                name: name.to_owned(),
            }),
            Some(FunctionTarget::Native { .. }) => Ok(()),
            None => {
                self.entries
                    .insert(name.to_owned(), FunctionTarget::Native { slot: None });
                Ok(())
            }
        }
    }

    /// Attach a host registry slot to a name. Declares the name if no
    /// EXTERN marker did.
    pub fn bind_native(&mut self, name: &str, slot: usize) -> Result<(), LinkError> {
        match self.entries.get(name) {
            Some(FunctionTarget::Code { .. }) => Err(LinkError::DuplicateDefinition {
                name: name.to_owned(),
            }),
            _ => {
                self.entries
                    .insert(name.to_owned(), FunctionTarget::Native { slot: Some(slot) });
                Ok(())
            }
        }
    }

    pub fn resolve(&self, name: &str) -> Option<FunctionTarget> {
        self.entries.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FunctionTarget)> {
        self.entries.iter().map(|(name, t)| (name.as_str(), *t))
    }
}

/// One routine extent: entry instruction index plus the labels scoped to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routine {
    pub name: String,
    pub entry: usize,
    labels: HashMap<String, usize>,
}

impl Routine {
    fn new(name: &str, entry: usize) -> Self {
        Routine {
            name: name.to_owned(),
            entry,
            labels: HashMap::new(),
        }
    }

    /// Build a routine by scanning forward from `entry` to the next END or
    /// START marker, collecting labels. Used when the host registers an
    /// entry point the stream has no START marker for.
    pub fn scan(
        name: &str,
        entry: usize,
        instructions: &[Instruction],
    ) -> Result<Self, LinkError> {
        let mut routine = Routine::new(name, entry);
        for (index, inst) in instructions.iter().enumerate().skip(entry) {
            match inst.opcode {
                Opcode::Start if index > entry => break,
                Opcode::Label => {
                    if let Some(label) = inst.symbol.as_deref() {
                        routine.add_label(label, index)?;
                    }
                }
                Opcode::End => break,
                _ => {}
            }
        }
        Ok(routine)
    }

    fn add_label(&mut self, label: &str, index: usize) -> Result<(), LinkError> {
        if self.labels.contains_key(label) {
            return Err(LinkError::DuplicateLabel {
                routine: self.name.clone(),
                label: label.to_owned(),
            });
        }
        self.labels.insert(label.to_owned(), index);
        Ok(())
    }

    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }
}

/// The tables produced by [`link`].
#[derive(Debug, Clone, Default)]
pub struct LinkedProgram {
    pub symbols: SymbolTable,
    pub functions: FunctionTable,
    pub routines: Vec<Routine>,
}

/// Scan a decoded stream and build its tables.
///
/// A START marker opens a routine extent; the extent closes at END, at the
/// next START, or at end of stream. Labels bind inside the enclosing
/// extent only; a label outside any extent is inert.
pub fn link(instructions: &[Instruction]) -> Result<LinkedProgram, LinkError> {
    let mut program = LinkedProgram::default();
    let mut current: Option<Routine> = None;

    for (index, inst) in instructions.iter().enumerate() {
        match inst.opcode {
            Opcode::Symbol => {
                if let Some(name) = inst.symbol.as_deref() {
                    program.symbols.bind(inst.extra.immediate(), name)?;
                }
            }
            Opcode::Start => {
                if let Some(done) = current.take() {
                    program.routines.push(done);
                }
                if let Some(name) = inst.symbol.as_deref() {
                    program
                        .functions
                        .define_code(name, index, program.routines.len())?;
                    current = Some(Routine::new(name, index));
                }
            }
            Opcode::Label => {
                if let (Some(routine), Some(label)) = (current.as_mut(), inst.symbol.as_deref()) {
                    routine.add_label(label, index)?;
                }
            }
            Opcode::Extern => {
                if let Some(name) = inst.symbol.as_deref() {
                    program.functions.declare_native(name)?;
                }
            }
            Opcode::End => {
                if let Some(done) = current.take() {
                    program.routines.push(done);
                }
            }
            _ => {}
        }
    }
    if let Some(done) = current.take() {
        program.routines.push(done);
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bytecode::{decode_stream, StreamWriter};
    use crate::register::Register::U0;

    fn linked(build: impl FnOnce(&mut StreamWriter)) -> Result<LinkedProgram, LinkError> {
        let mut w = StreamWriter::new();
        build(&mut w);
        let insts = decode_stream(&w.finish()).unwrap();
        link(&insts)
    }

    #[test]
    fn collects_routines_labels_and_symbols() {
        let program = linked(|w| {
            w.symbol(1, "main")
                .symbol(2, "helper")
                .extern_fn("host_log")
                .start("main")
                .push_uint(1)
                .label("again")
                .pop_into(U0)
                .end_routine()
                .start("helper")
                .label("again")
                .end_routine();
        })
        .unwrap();

        assert_eq!(program.symbols.lookup(1), Some("main"));
        assert_eq!(program.symbols.lookup(2), Some("helper"));
        assert_eq!(program.symbols.lookup(3), None);

        assert_eq!(
            program.functions.resolve("main"),
            Some(FunctionTarget::Code {
                entry: 3,
                routine: 0
            })
        );
        assert_eq!(
            program.functions.resolve("host_log"),
            Some(FunctionTarget::Native { slot: None })
        );
        assert!(program.functions.resolve("host_log").unwrap().is_external());

        assert_eq!(program.routines.len(), 2);
        assert_eq!(program.routines[0].label("again"), Some(5));
        assert_eq!(program.routines[1].label("again"), Some(9));
        assert_eq!(program.routines[0].label("missing"), None);
    }

    #[test]
    fn routine_extent_closes_at_next_start() {
        let program = linked(|w| {
            w.start("first").push_uint(1).start("second").end_routine();
        })
        .unwrap();
        assert_eq!(program.routines.len(), 2);
        assert_eq!(program.routines[0].name, "first");
        assert_eq!(program.routines[1].entry, 2);
    }

    #[test]
    fn label_outside_any_routine_is_inert() {
        let program = linked(|w| {
            w.label("stray").start("main").end_routine();
        })
        .unwrap();
        assert_eq!(program.routines.len(), 1);
        assert_eq!(program.routines[0].label("stray"), None);
    }

    #[test]
    fn duplicate_symbol_id_is_rejected() {
        let err = linked(|w| {
            w.symbol(9, "a").symbol(9, "b");
        })
        .unwrap_err();
        assert_eq!(
            err,
            LinkError::DuplicateSymbol {
                id: 9,
                existing: "a".to_owned()
            }
        );
    }

    #[test]
    fn duplicate_function_name_is_rejected() {
        let err = linked(|w| {
            w.start("twice").end_routine().start("twice").end_routine();
        })
        .unwrap_err();
        assert_eq!(
            err,
            LinkError::DuplicateDefinition {
                name: "twice".to_owned()
            }
        );

        let err = linked(|w| {
            w.extern_fn("clash").start("clash").end_routine();
        })
        .unwrap_err();
        assert_eq!(
            err,
            LinkError::DuplicateDefinition {
                name: "clash".to_owned()
            }
        );
    }

    #[test]
    fn duplicate_label_is_scoped_to_its_routine() {
        let err = linked(|w| {
            w.start("main").label("x").label("x").end_routine();
        })
        .unwrap_err();
        assert_eq!(
            err,
            LinkError::DuplicateLabel {
                routine: "main".to_owned(),
                label: "x".to_owned()
            }
        );
    }

    #[test]
    fn binding_a_native_fills_its_slot() {
        let mut table = FunctionTable::new();
        table.declare_native("host_log").unwrap();
        table.bind_native("host_log", 3).unwrap();
        assert_eq!(
            table.resolve("host_log"),
            Some(FunctionTarget::Native { slot: Some(3) })
        );

        // Binding without a prior EXTERN declares on the spot.
        table.bind_native("host_rand", 4).unwrap();
        assert_eq!(
            table.resolve("host_rand"),
            Some(FunctionTarget::Native { slot: Some(4) })
        );
    }

    #[test]
    fn scan_builds_a_routine_from_an_arbitrary_entry() {
        let mut w = StreamWriter::new();
        w.push_uint(7)
            .label("top")
            .pop_into(U0)
            .end_routine()
            .start("other")
            .end_routine();
        let insts = decode_stream(&w.finish()).unwrap();

        let routine = Routine::scan("hosted", 0, &insts).unwrap();
        assert_eq!(routine.entry, 0);
        assert_eq!(routine.label("top"), Some(1));
        // The scan stopped at END; the later routine's body is not visible.
        assert_eq!(routine.label("missing"), None);
    }
}
