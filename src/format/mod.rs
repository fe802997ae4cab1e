//! Output format module implementation

mod json;
mod csv;

use crate::graph::{BlockGraph, InstructionBlock};
use crate::program::{Program, Section};
use crate::{Address, DisassemblyError, Insn};
use std::fmt;
use std::str::FromStr;
use clap::ValueEnum;

/// Supported output formats for disassembly results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Source-like listing (default)
    #[default]
    Text,
    /// JSON format (hierarchical)
    Json,
    /// JSON Lines format (one JSON object per line)
    JsonLines,
    /// CSV format (comma-separated values)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[
            OutputFormat::Text,
            OutputFormat::Json,
            OutputFormat::JsonLines,
            OutputFormat::Csv,
        ]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn DisassemblyFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for disassembly output
pub trait DisassemblyFormatter {
    /// Render the blocks of `graph`, decoded from `program`.
    fn format(&self, program: &Program, graph: &BlockGraph) -> Result<String, DisassemblyError>;
}

/// Format disassembly as a source-like listing
pub struct TextFormatter;

/// Format disassembly in JSON
pub struct JsonFormatter;

/// Format disassembly in JSON Lines
pub struct JsonLinesFormatter;

/// Format disassembly in CSV
pub struct CsvFormatter;

/// Raw bytes per `db` line
const DATA_LINE_BYTES: usize = 16;

/// Encoding as space-separated hex pairs
pub(crate) fn hex_bytes(insn: &Insn) -> String {
    insn.bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Dump `section` bytes in `[from, to)` as data directives.
fn push_data(output: &mut String, section: &Section, from: Address, to: Address) {
    let raw_end = section.base + section.data.len() as Address;
    let mut addr = from;
    while addr < to.min(raw_end) {
        let start = (addr - section.base) as usize;
        let end = ((to.min(raw_end) - section.base) as usize).min(start + DATA_LINE_BYTES);
        let bytes = section.data[start..end]
            .iter()
            .map(|b| format!("0x{:02x}", b))
            .collect::<Vec<_>>()
            .join(", ");
        output.push_str(&format!("0x{:08x}: db {}\n", addr, bytes));
        addr += (end - start) as Address;
    }
    if to > addr {
        output.push_str(&format!("0x{:08x}: db {} dup(?)\n", addr, to - addr));
    }
}

fn push_block(output: &mut String, section: &Section, block: &InstructionBlock) {
    for label in section.labels_at((block.start() - section.base) as usize) {
        output.push_str(&format!("{}:\n", label));
    }
    for (addr, di) in block.iter() {
        let line = format!(
            "0x{:08x}: {:<24} {:<8} {}",
            addr,
            hex_bytes(&di.insn),
            di.insn.mnemonic,
            di.insn.operands
        );
        output.push_str(line.trim_end());
        output.push('\n');
    }
    if block.successors().is_empty() {
        output.push_str("; no successors\n");
    } else {
        let succs = block
            .successors()
            .iter()
            .map(|succ| format!("0x{:x}", succ))
            .collect::<Vec<_>>()
            .join(", ");
        output.push_str(&format!("; to {}\n", succs));
    }
    output.push('\n');
}

impl DisassemblyFormatter for TextFormatter {
    fn format(&self, program: &Program, graph: &BlockGraph) -> Result<String, DisassemblyError> {
        let mut output = String::new();

        for section in &program.sections {
            let blocks: Vec<_> = graph.blocks().filter(|b| section.contains(b.start())).collect();
            if blocks.is_empty() {
                continue;
            }
            output.push_str(&format!("; section {} at 0x{:x}\n\n", section.name, section.base));

            let mut addr = section.base;
            for block in blocks {
                if block.start() > addr {
                    push_data(&mut output, section, addr, block.start());
                    output.push('\n');
                }
                push_block(&mut output, section, block);
                addr = addr.max(block.end());
            }
            if addr < section.end_address() {
                push_data(&mut output, section, addr, section.end_address());
                output.push('\n');
            }
        }

        Ok(output)
    }
}
