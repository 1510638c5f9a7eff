//! Debugger metadata sidecar.
//!
//! Compilers may ship source mappings next to a stream: instruction address
//! to source line records, and per-function records describing the frame
//! layout. The engine stores and serves them; it never interprets them.

use std::collections::{BTreeMap, HashMap};

/// Frame description of one compiled function, keyed by its signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugFunction {
    pub signature: String,
    pub start_line: u64,
    pub end_line: u64,
    /// Local name to (type name, frame slot offset).
    pub locals: HashMap<String, (String, u64)>,
}

impl DebugFunction {
    pub fn new(signature: &str, start_line: u64, end_line: u64) -> Self {
        DebugFunction {
            signature: signature.to_owned(),
            start_line,
            end_line,
            locals: HashMap::new(),
        }
    }

    pub fn add_local(&mut self, name: &str, type_name: &str, offset: u64) {
        self.locals
            .insert(name.to_owned(), (type_name.to_owned(), offset));
    }

    pub fn local(&self, name: &str) -> Option<(&str, u64)> {
        self.locals
            .get(name)
            .map(|(type_name, offset)| (type_name.as_str(), *offset))
    }
}

/// All metadata attached to one loaded stream.
#[derive(Debug, Clone, Default)]
pub struct DebugData {
    lines: BTreeMap<u64, (u64, String)>,
    functions: HashMap<String, DebugFunction>,
}

impl DebugData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_line_record(&mut self, address: u64, line: u64, file: &str) {
        self.lines.insert(address, (line, file.to_owned()));
    }

    /// Source position of an instruction address, if mapped.
    pub fn line_record(&self, address: u64) -> Option<(u64, &str)> {
        self.lines
            .get(&address)
            .map(|(line, file)| (*line, file.as_str()))
    }

    /// Line records in address order.
    pub fn line_records(&self) -> impl Iterator<Item = (u64, u64, &str)> {
        self.lines
            .iter()
            .map(|(address, (line, file))| (*address, *line, file.as_str()))
    }

    pub fn insert_function(&mut self, function: DebugFunction) {
        self.functions.insert(function.signature.clone(), function);
    }

    pub fn function(&self, signature: &str) -> Option<&DebugFunction> {
        self.functions.get(signature)
    }

    pub fn functions(&self) -> impl Iterator<Item = &DebugFunction> {
        self.functions.values()
    }
}
