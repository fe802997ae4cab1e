//! JSON and JSON Lines output formatters

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::graph::{BlockGraph, InstructionBlock};
use crate::program::Program;
use crate::{Address, DecodedInstruction, DisassemblyError};
use super::{hex_bytes, DisassemblyFormatter};

/// Serializable instruction for JSON output
#[derive(Serialize, Deserialize)]
struct InstructionJson {
    /// Address of the instruction
    address: String,
    /// Size of the instruction in bytes
    size: u8,
    /// Mnemonic (e.g., "mov", "add")
    mnemonic: String,
    /// Operands
    operands: String,
    /// Bytes of the instruction as hex string
    bytes: String,
}

/// Serializable basic block for JSON output
#[derive(Serialize, Deserialize)]
struct BlockJson {
    /// Starting address of the block
    start: String,
    /// Labels exported at the block start
    labels: Vec<String>,
    /// Instructions in this block
    instructions: Vec<InstructionJson>,
    /// Addresses that transfer control into the block
    predecessors: Vec<String>,
    /// Addresses the block may continue at
    successors: Vec<String>,
}

/// Serializable disassembly result for JSON output
#[derive(Serialize, Deserialize)]
struct DisassemblyJson {
    architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry_point: Option<String>,
    blocks: Vec<BlockJson>,
}

fn hex(addr: Address) -> String {
    format!("0x{:x}", addr)
}

fn json_error(e: serde_json::Error) -> DisassemblyError {
    DisassemblyError::Generic(format!("JSON serialization error: {}", e))
}

impl DisassemblyFormatter for super::JsonFormatter {
    fn format(&self, program: &Program, graph: &BlockGraph) -> Result<String, DisassemblyError> {
        let result = DisassemblyJson {
            architecture: program.architecture.to_string(),
            entry_point: program.entry_point.map(hex),
            blocks: graph.blocks().map(|b| block_to_json(program, b)).collect(),
        };

        serde_json::to_string_pretty(&result).map_err(json_error)
    }
}

impl DisassemblyFormatter for super::JsonLinesFormatter {
    fn format(&self, program: &Program, graph: &BlockGraph) -> Result<String, DisassemblyError> {
        let mut output = String::new();

        for block in graph.blocks() {
            let block_json = json!({
                "type": "block",
                "start": hex(block.start()),
                "labels": program.labels_at(block.start()),
                "predecessors": block.predecessors().iter().copied().map(hex).collect::<Vec<_>>(),
                "successors": block.successors().iter().copied().map(hex).collect::<Vec<_>>()
            });
            output.push_str(&serde_json::to_string(&block_json).map_err(json_error)?);
            output.push('\n');

            for (addr, di) in block.iter() {
                let instruction = json!({
                    "type": "instruction",
                    "block_start": hex(block.start()),
                    "address": hex(addr),
                    "size": di.insn.size,
                    "mnemonic": di.insn.mnemonic,
                    "operands": di.insn.operands,
                    "bytes": hex_bytes(&di.insn)
                });
                output.push_str(&serde_json::to_string(&instruction).map_err(json_error)?);
                output.push('\n');
            }
        }

        Ok(output)
    }
}

fn instruction_to_json(addr: Address, di: &DecodedInstruction) -> InstructionJson {
    InstructionJson {
        address: hex(addr),
        size: di.insn.size,
        mnemonic: di.insn.mnemonic.clone(),
        operands: di.insn.operands.clone(),
        bytes: hex_bytes(&di.insn),
    }
}

fn block_to_json(program: &Program, block: &InstructionBlock) -> BlockJson {
    BlockJson {
        start: hex(block.start()),
        labels: program.labels_at(block.start()).into_iter().map(str::to_string).collect(),
        instructions: block.iter().map(|(addr, di)| instruction_to_json(addr, di)).collect(),
        predecessors: block.predecessors().iter().copied().map(hex).collect(),
        successors: block.successors().iter().copied().map(hex).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests::listing_fixture;
    use crate::format::{JsonFormatter, JsonLinesFormatter};
    use serde_json::Value;

    #[test]
    fn test_json_structure() {
        let (program, graph) = listing_fixture();
        let output = JsonFormatter.format(&program, &graph).unwrap();
        let parsed: DisassemblyJson = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed.blocks.len(), 2);
        let first = &parsed.blocks[0];
        assert_eq!(first.start, "0x1000");
        assert_eq!(first.labels, vec!["start".to_string()]);
        assert_eq!(first.instructions[0].mnemonic, "jmp");
        assert_eq!(first.instructions[0].bytes, "10 02");
        assert_eq!(first.successors, vec!["0x1004".to_string()]);
        assert_eq!(parsed.blocks[1].predecessors, vec!["0x1000".to_string()]);
    }

    #[test]
    fn test_json_lines_one_object_per_line() {
        let (program, graph) = listing_fixture();
        let output = JsonLinesFormatter.format(&program, &graph).unwrap();
        let lines: Vec<Value> = output.lines().map(|l| serde_json::from_str(l).unwrap()).collect();

        let kinds: Vec<_> = lines.iter().map(|v| v["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["block", "instruction", "block", "instruction"]);
        assert_eq!(lines[3]["address"], "0x1004");
        assert_eq!(lines[3]["block_start"], "0x1004");
    }
}
