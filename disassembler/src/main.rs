use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use kestrel_vm::{decode_stream, link, Instruction, LinkedProgram, Opcode};

#[derive(Debug, Serialize, Deserialize)]
pub struct Line {
    index: usize,
    mnemonic: String,
    operands: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoutineListing {
    name: String,
    entry: usize,
    insts: Vec<Line>,
}

/// Lines before the first START marker, then one group per routine.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Listing {
    preamble: Vec<Line>,
    routines: Vec<RoutineListing>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SymbolEntry {
    id: u64,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamInfo {
    symbols: Vec<SymbolEntry>,
    externs: Vec<String>,
}

pub struct Disassembler {
    instructions: Vec<Instruction>,
    program: LinkedProgram,
    listing: Listing,
}

impl Disassembler {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let instructions = decode_stream(bytes)?;
        let program = link(&instructions)?;
        Ok(Self {
            instructions,
            program,
            listing: Listing::default(),
        })
    }

    pub fn disassemble(&mut self) {
        for (index, inst) in self.instructions.iter().enumerate() {
            if inst.opcode == Opcode::Start {
                self.listing.routines.push(RoutineListing {
                    name: inst.symbol.clone().unwrap_or_default(),
                    entry: index,
                    insts: Vec::new(),
                });
            }
            let line = Line {
                index,
                mnemonic: inst.opcode.mnemonic().to_string(),
                operands: inst.operands(),
            };
            match self.listing.routines.last_mut() {
                Some(routine) => routine.insts.push(line),
                None => self.listing.preamble.push(line),
            }
        }
    }

    pub fn print_listing(&self) {
        for (index, inst) in self.instructions.iter().enumerate() {
            println!("{}", inst.disassemble(index));
        }
    }

    pub fn write_listing(&self, path: impl AsRef<Path>) -> Result<()> {
        let output = path.as_ref();
        if !output.exists() {
            fs::create_dir_all(output)?;
        }

        let disassembly_path = output.join("disassembly.yaml");
        let mut writer = fs::File::create(disassembly_path)?;
        serde_yaml::to_writer(&mut writer, &self.listing)?;

        let mut symbols: Vec<SymbolEntry> = self
            .program
            .symbols
            .iter()
            .map(|(id, name)| SymbolEntry {
                id,
                name: name.to_owned(),
            })
            .collect();
        symbols.sort_by_key(|entry| entry.id);

        let mut externs: Vec<String> = self
            .program
            .functions
            .iter()
            .filter(|(_, target)| target.is_external())
            .map(|(name, _)| name.to_owned())
            .collect();
        externs.sort();

        let info = StreamInfo { symbols, externs };
        let info_path = output.join("symbols.yaml");
        let mut writer = fs::File::create(info_path)?;
        serde_yaml::to_writer(&mut writer, &info)?;

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, required = true)]
    input: PathBuf,

    /// Directory for the YAML listing; printed to stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut disassembler = Disassembler::new(args.input)?;
    disassembler.disassemble();
    log::debug!(
        "{} instructions across {} routines",
        disassembler.instructions.len(),
        disassembler.listing.routines.len()
    );

    match args.output {
        Some(dir) => disassembler.write_listing(dir)?,
        None => disassembler.print_listing(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_vm::{Register, StreamWriter};

    #[test]
    fn groups_lines_by_routine() -> Result<()> {
        let mut w = StreamWriter::new();
        w.symbol(1, "main")
            .extern_fn("host_log")
            .start("main")
            .push_uint(7)
            .pop_into(Register::U0)
            .end_routine();

        let mut disassembler = Disassembler::from_bytes(&w.finish())?;
        disassembler.disassemble();

        assert_eq!(disassembler.listing.preamble.len(), 2);
        assert_eq!(disassembler.listing.routines.len(), 1);
        let routine = &disassembler.listing.routines[0];
        assert_eq!(routine.name, "main");
        assert_eq!(routine.entry, 2);
        assert_eq!(routine.insts.len(), 4);
        assert_eq!(routine.insts[1].mnemonic, "PUSHU");
        assert_eq!(routine.insts[1].operands, vec!["7".to_string()]);
        Ok(())
    }
}
