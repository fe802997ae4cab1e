//! Core IR, traits, and error types for the Nuclide Flow disassembler.
//!
//! This library follows control flow from one or more entry points through a
//! set of loaded sections, decoding each reachable instruction exactly once
//! and grouping them into a graph of basic blocks. Branch targets that are not
//! immediate constants are recovered by a bounded backward walk that asks the
//! architecture decoder to rewrite the target through preceding instructions.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use nuclide_flow::{
//!     parser::GoblinParser,
//!     decoder::CapstoneDecoder,
//!     disasm::{Disassembler, Target},
//!     format::OutputFormat,
//! };
//!
//! let binary_data = fs::read("path/to/binary").unwrap();
//! let program = GoblinParser::new().parse(&binary_data).unwrap();
//! let decoder = CapstoneDecoder::for_architecture(program.architecture).unwrap();
//!
//! let mut dasm = Disassembler::new(&program, &decoder);
//! dasm.disassemble(Target::Label("main".into()));
//!
//! let listing = OutputFormat::Text
//!     .get_formatter()
//!     .format(&program, dasm.graph())
//!     .unwrap();
//! println!("{}", listing);
//! ```

pub mod expr;
pub mod program;
pub mod graph;
pub mod disasm;
pub mod decoder;
pub mod parser;
pub mod format;
#[cfg(test)]
mod testing;
#[cfg(feature = "extension-module")]
pub mod python;

/// Represents an address in memory
pub type Address = u64;

use std::fmt;

use crate::expr::Expr;
use crate::program::Cursor;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "add")
    pub mnemonic: String,
    /// Instruction operands as string representation
    pub operands: String,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
}

impl Insn {
    /// Build an instruction, copying at most MAX_INSTRUCTION_SIZE bytes of encoding.
    pub fn new(addr: Address, encoding: &[u8], mnemonic: &str, operands: &str) -> Self {
        let size = encoding.len().min(MAX_INSTRUCTION_SIZE);
        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        bytes[..size].copy_from_slice(&encoding[..size]);
        Self {
            addr,
            size: size as u8,
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
            bytes,
        }
    }

    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{}\t{}", self.mnemonic, self.operands)
        }
    }
}

/// Flow-relevant properties of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Opcode {
    /// Writes the instruction pointer (jump, branch, call)
    pub sets_ip: bool,
    /// Execution never continues at the next instruction
    pub stops_exec: bool,
    /// Pushes or links a return address (call)
    pub saves_ip: bool,
}

impl Opcode {
    /// Straight-line instruction
    pub const PLAIN: Opcode = Opcode { sets_ip: false, stops_exec: false, saves_ip: false };
    /// Unconditional jump
    pub const JUMP: Opcode = Opcode { sets_ip: true, stops_exec: true, saves_ip: false };
    /// Conditional branch
    pub const BRANCH: Opcode = Opcode { sets_ip: true, stops_exec: false, saves_ip: false };
    /// Subroutine call
    pub const CALL: Opcode = Opcode { sets_ip: true, stops_exec: false, saves_ip: true };
    /// Return, trap, halt
    pub const STOP: Opcode = Opcode { sets_ip: false, stops_exec: true, saves_ip: false };
}

/// The result of decoding one instruction at one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Architecture-specific rendering and encoding
    pub insn: Insn,
    /// `None` when the bytes are not a valid instruction
    pub opcode: Option<Opcode>,
}

impl DecodedInstruction {
    pub fn new(insn: Insn, opcode: Opcode) -> Self {
        Self { insn, opcode: Some(opcode) }
    }

    /// An undecodable encoding.
    pub fn invalid(insn: Insn) -> Self {
        Self { insn, opcode: None }
    }

    /// Byte length of the encoding
    pub fn byte_len(&self) -> Address {
        self.insn.size as Address
    }

    pub fn is_valid(&self) -> bool {
        self.opcode.is_some()
    }
}

/// Decoder trait: architecture-specific decoding and flow semantics.
pub trait Decoder: Send + Sync {
    /// Decode one instruction at the cursor and advance past it.
    ///
    /// Invalid encodings are reported through an absent opcode, never an error.
    fn decode(&self, cursor: &mut Cursor<'_>) -> DecodedInstruction;

    /// Candidate target expressions of a control-transfer instruction at `address`.
    fn jump_targets(&self, di: &DecodedInstruction, address: Address) -> Vec<Expr>;

    /// Rewrite `target` as it was before `di` (at `address`) executed.
    ///
    /// Returns the expression unchanged when `di` does not touch it, a refined
    /// expression when it does, and `None` when the instruction destroys the
    /// information the target depends on.
    fn backtrace(&self, di: &DecodedInstruction, address: Address, target: &Expr) -> Option<Expr>;
}

/// Supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// ARM (32-bit)
    Arm,
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// MIPS 32-bit
    Mips32,
    /// RISC-V 32-bit
    RiscV32,
    /// RISC-V 64-bit
    RiscV64,
    /// Unknown architecture
    #[default]
    Unknown,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::Mips32 => write!(f, "MIPS32"),
            Architecture::RiscV32 => write!(f, "RISC-V 32"),
            Architecture::RiscV64 => write!(f, "RISC-V 64"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Error type for disassembly operations
#[derive(Debug, thiserror::Error)]
pub enum DisassemblyError {
    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    ParsingError(String),

    /// Decoder error
    #[error("Decoder error: {0}")]
    DecoderError(String),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The block graph broke one of its structural invariants
    #[error("Block graph invariant violated: {0}")]
    InvariantViolation(String),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insn_bytes() {
        let insn = Insn::new(0x1000, &[0x01, 0xd8], "add", "eax, ebx");
        assert_eq!(insn.bytes(), &[0x01, 0xd8]);
        assert_eq!(insn.size, 2);
        assert_eq!(insn.to_string(), "add\teax, ebx");
    }

    #[test]
    fn test_insn_truncates_long_encoding() {
        let insn = Insn::new(0, &[0x90; 20], "nop", "");
        assert_eq!(insn.size as usize, MAX_INSTRUCTION_SIZE);
        assert_eq!(insn.to_string(), "nop");
    }

    #[test]
    fn test_decoded_instruction_validity() {
        let good = DecodedInstruction::new(Insn::new(0, &[0xc3], "ret", ""), Opcode::STOP);
        let bad = DecodedInstruction::invalid(Insn::new(0, &[0xff], "db", "0xff"));
        assert!(good.is_valid());
        assert!(!bad.is_valid());
        assert_eq!(good.byte_len(), 1);
    }

    #[test]
    fn test_architecture_display() {
        assert_eq!(Architecture::X86_64.to_string(), "x86-64");
        assert_eq!(Architecture::default(), Architecture::Unknown);
    }
}
