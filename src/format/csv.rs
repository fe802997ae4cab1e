//! CSV output formatter

use serde::Serialize;

use crate::graph::BlockGraph;
use crate::program::Program;
use crate::DisassemblyError;
use super::{hex_bytes, DisassemblyFormatter};

/// One CSV row per decoded instruction
#[derive(Serialize)]
struct InstructionRow<'a> {
    block_address: String,
    address: String,
    size: u8,
    mnemonic: &'a str,
    operands: &'a str,
    bytes: String,
}

fn csv_error(e: impl std::fmt::Display) -> DisassemblyError {
    DisassemblyError::Generic(format!("CSV serialization error: {}", e))
}

impl DisassemblyFormatter for super::CsvFormatter {
    fn format(&self, _program: &Program, graph: &BlockGraph) -> Result<String, DisassemblyError> {
        let mut writer = ::csv::Writer::from_writer(Vec::new());

        for block in graph.blocks() {
            for (addr, di) in block.iter() {
                writer
                    .serialize(InstructionRow {
                        block_address: format!("0x{:x}", block.start()),
                        address: format!("0x{:x}", addr),
                        size: di.insn.size,
                        mnemonic: &di.insn.mnemonic,
                        operands: &di.insn.operands,
                        bytes: hex_bytes(&di.insn),
                    })
                    .map_err(csv_error)?;
            }
        }

        let bytes = writer.into_inner().map_err(csv_error)?;
        String::from_utf8(bytes).map_err(csv_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests::listing_fixture;
    use crate::format::CsvFormatter;

    #[test]
    fn test_csv_rows() {
        let (program, graph) = listing_fixture();
        let output = CsvFormatter.format(&program, &graph).unwrap();
        let lines: Vec<_> = output.lines().collect();

        assert_eq!(lines[0], "block_address,address,size,mnemonic,operands,bytes");
        assert_eq!(lines[1], "0x1000,0x1000,2,jmp,2,10 02");
        assert_eq!(lines[2], "0x1004,0x1004,1,ret,,c3");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_csv_quotes_operands_with_commas() {
        let program = crate::testing::program(0x1000, &[0x22, 1, 2, 0xc3]);
        let mut dasm = crate::disasm::Disassembler::new(&program, &crate::testing::ToyDecoder);
        dasm.disassemble(crate::disasm::Target::Address(0x1000));

        let output = CsvFormatter.format(&program, dasm.graph()).unwrap();
        assert!(output.contains("\"r1, r2\""));
    }
}
