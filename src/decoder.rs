//! Capstone-based x86 decoder with flow and backtracking semantics.

use std::fmt;

use capstone::arch::x86::{ArchMode as X86Mode, X86OpMem, X86Operand, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;

use crate::expr::{BinaryOp, Bindings, Endianness, Expr, IntType, Symbol};
use crate::program::Cursor;
use crate::{Address, Architecture, DecodedInstruction, Decoder, Insn, Opcode, MAX_INSTRUCTION_SIZE};

/// Errors that can occur while setting up a decoder
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),
}

impl From<DecoderError> for crate::DisassemblyError {
    fn from(e: DecoderError) -> Self {
        match e {
            DecoderError::UnsupportedArchitecture(arch) => crate::DisassemblyError::UnsupportedArchitecture(arch),
            other => crate::DisassemblyError::DecoderError(other.to_string()),
        }
    }
}

/// A Capstone-backed decoder for the x86 family.
#[derive(Debug)]
pub enum CapstoneDecoder {
    X86_32(Capstone),
    X86_64(Capstone),
}

// SAFETY: Capstone's C‐API handle is thread‐safe if you never call
// `disasm_*` concurrently on the *same* handle; the disassembler drives one
// decoder from a single thread.
unsafe impl Send for CapstoneDecoder {}
unsafe impl Sync for CapstoneDecoder {}

impl CapstoneDecoder {
    /// Create a decoder for a specific architecture
    pub fn for_architecture(arch: Architecture) -> Result<Self, DecoderError> {
        match arch {
            Architecture::X86_32 => Ok(CapstoneDecoder::X86_32(Self::build_x86(X86Mode::Mode32)?)),
            Architecture::X86_64 => Ok(CapstoneDecoder::X86_64(Self::build_x86(X86Mode::Mode64)?)),
            other => Err(DecoderError::UnsupportedArchitecture(other)),
        }
    }

    /// Build an x86 decoder with operand details enabled
    fn build_x86(mode: X86Mode) -> Result<Capstone, DecoderError> {
        Ok(Capstone::new().x86().mode(mode).detail(true).build()?)
    }

    /// Get the architecture of this decoder
    pub fn architecture(&self) -> Architecture {
        match self {
            CapstoneDecoder::X86_32(_) => Architecture::X86_32,
            CapstoneDecoder::X86_64(_) => Architecture::X86_64,
        }
    }

    fn cs(&self) -> &Capstone {
        match self {
            CapstoneDecoder::X86_32(cs) | CapstoneDecoder::X86_64(cs) => cs,
        }
    }

    /// Pointer-sized integer type
    fn word(&self) -> IntType {
        match self {
            CapstoneDecoder::X86_32(_) => IntType::U32,
            CapstoneDecoder::X86_64(_) => IntType::U64,
        }
    }

    fn is_wide(&self) -> bool {
        matches!(self, CapstoneDecoder::X86_64(_))
    }

    /// Registers a call may leave holding something else on return.
    fn call_clobbered(&self) -> &'static [&'static str] {
        if self.is_wide() {
            &["rax", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11"]
        } else {
            &["eax", "ecx", "edx"]
        }
    }

    /// Re-decode `insn` with details and return its x86 operands.
    fn operands(&self, insn: &Insn) -> Option<Vec<X86Operand>> {
        self.details(insn).map(|(ops, _)| ops)
    }

    /// Re-decode `insn` with details: its x86 operands and the registers it
    /// writes implicitly.
    fn details(&self, insn: &Insn) -> Option<(Vec<X86Operand>, Vec<RegId>)> {
        let cs = self.cs();
        let decoded = cs.disasm_count(insn.bytes(), insn.addr, 1).ok()?;
        let first = decoded.iter().next()?;
        let detail = cs.insn_detail(&first).ok()?;
        let ops = detail
            .arch_detail()
            .operands()
            .into_iter()
            .filter_map(|op| match op {
                ArchOperand::X86Operand(op) => Some(op),
                _ => None,
            })
            .collect();
        Some((ops, detail.regs_write().to_vec()))
    }

    fn reg_name(&self, reg: RegId) -> Option<String> {
        if reg.0 == 0 {
            return None;
        }
        self.cs().reg_name(reg)
    }

    /// Value of register `name`, expressed over its full-width register.
    fn read_register(&self, name: &str) -> Expr {
        let (full, part) = widen(name, self.is_wide());
        let reg = Expr::register(&full);
        match part {
            Part::Full => reg,
            Part::Low32 => mask(reg, 0xffff_ffff),
            Part::Low16 => mask(reg, 0xffff),
            Part::Low8 => mask(reg, 0xff),
            Part::High8 => mask(Expr::binary(BinaryOp::Shr, reg, Expr::constant(8)), 0xff),
        }
    }

    /// Address computed by a memory operand; RIP-relative operands fold to a constant.
    fn address_expr(&self, mem: &X86OpMem, next: Address) -> Expr {
        let mut expr = Expr::constant(mem.disp());
        if let Some(base) = self.reg_name(mem.base()) {
            let base = if base == "rip" || base == "eip" {
                Expr::constant(next as i64)
            } else {
                self.read_register(&base)
            };
            expr = base + expr;
        }
        if let Some(index) = self.reg_name(mem.index()) {
            let scaled = Expr::binary(
                BinaryOp::Mul,
                self.read_register(&index),
                Expr::constant(mem.scale() as i64),
            );
            expr = expr + scaled;
        }
        expr.reduce()
    }

    /// Value an operand denotes when read.
    fn operand_value(&self, op: &X86Operand, next: Address) -> Option<Expr> {
        match &op.op_type {
            X86OperandType::Imm(v) => Some(Expr::constant(*v)),
            X86OperandType::Reg(r) => self.reg_name(*r).map(|n| self.read_register(&n)),
            X86OperandType::Mem(mem) => {
                let width = IntType::unsigned(op.size as usize).unwrap_or(self.word());
                Some(Expr::mem(self.address_expr(mem, next), width, Endianness::Little))
            }
            _ => None,
        }
    }
}

/// Portion of a full-width register that a register name covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Full,
    Low32,
    Low16,
    Low8,
    High8,
}

/// Full-width register behind `name` and the part of it `name` covers.
///
/// In 32-bit mode the `e` registers are full width. Names that are not
/// general purpose registers map to themselves.
fn widen(name: &str, wide: bool) -> (String, Part) {
    // r8..r15 and their d/w/b forms
    if let Some(rest) = name.strip_prefix('r') {
        let digits = rest.trim_end_matches(['d', 'w', 'b']);
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            let part = match &rest[digits.len()..] {
                "d" => Part::Low32,
                "w" => Part::Low16,
                "b" => Part::Low8,
                _ => Part::Full,
            };
            return (format!("r{}", digits), part);
        }
    }

    let dword = if wide { Part::Low32 } else { Part::Full };
    let (base, part) = match name {
        "rax" | "rbx" | "rcx" | "rdx" | "rsi" | "rdi" | "rbp" | "rsp" => (&name[1..], Part::Full),
        "eax" | "ebx" | "ecx" | "edx" | "esi" | "edi" | "ebp" | "esp" => (&name[1..], dword),
        "ax" | "bx" | "cx" | "dx" | "si" | "di" | "bp" | "sp" => (name, Part::Low16),
        "sil" | "dil" | "bpl" | "spl" => (&name[..2], Part::Low8),
        "al" => ("ax", Part::Low8),
        "bl" => ("bx", Part::Low8),
        "cl" => ("cx", Part::Low8),
        "dl" => ("dx", Part::Low8),
        "ah" => ("ax", Part::High8),
        "bh" => ("bx", Part::High8),
        "ch" => ("cx", Part::High8),
        "dh" => ("dx", Part::High8),
        _ => return (name.to_string(), Part::Full),
    };
    let prefix = if wide { 'r' } else { 'e' };
    (format!("{}{}", prefix, base), part)
}

fn mask(expr: Expr, bits: i64) -> Expr {
    Expr::binary(BinaryOp::And, expr, Expr::constant(bits))
}

/// Mnemonic without `bnd`, `notrack` or `rep` style prefixes.
fn base_mnemonic(mnemonic: &str) -> &str {
    mnemonic.split_whitespace().last().unwrap_or(mnemonic)
}

/// Flow class of an x86 mnemonic.
fn classify(mnemonic: &str) -> Opcode {
    match base_mnemonic(mnemonic) {
        "jmp" | "ljmp" => Opcode::JUMP,
        "call" | "lcall" => Opcode::CALL,
        "ret" | "retf" | "iret" | "iretd" | "iretq" | "hlt" | "ud2" | "int3" => Opcode::STOP,
        m if m.starts_with('j') || m.starts_with("loop") => Opcode::BRANCH,
        _ => Opcode::PLAIN,
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.architecture())
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&self, cursor: &mut Cursor<'_>) -> DecodedInstruction {
        let at = cursor.address();
        let window = cursor.peek(MAX_INSTRUCTION_SIZE);

        let decoded = self.cs().disasm_count(&window, at, 1).ok();
        let Some(i) = decoded.as_ref().and_then(|d| d.iter().next()) else {
            cursor.advance(1);
            let byte = window.first().copied().unwrap_or(0);
            return DecodedInstruction::invalid(Insn::new(at, &[byte], "db", &format!("0x{:02x}", byte)));
        };

        let mnemonic = i.mnemonic().unwrap_or("");
        let insn = Insn::new(at, i.bytes(), mnemonic, i.op_str().unwrap_or(""));
        cursor.advance(insn.size as usize);
        DecodedInstruction::new(insn, classify(mnemonic))
    }

    fn jump_targets(&self, di: &DecodedInstruction, address: Address) -> Vec<Expr> {
        let next = address + di.byte_len();
        self.operands(&di.insn)
            .and_then(|ops| ops.first().and_then(|op| self.operand_value(op, next)))
            .into_iter()
            .collect()
    }

    fn backtrace(&self, di: &DecodedInstruction, address: Address, target: &Expr) -> Option<Expr> {
        let wide = self.is_wide();
        let mentions = |name: &str| target.mentions(&Symbol::register(name));

        if let Some(opcode) = di.opcode.filter(|op| op.sets_ip) {
            if opcode.saves_ip && self.call_clobbered().iter().any(|&r| mentions(r)) {
                return None;
            }
            return Some(target.clone());
        }

        let Some((ops, implicit)) = self.details(&di.insn) else {
            return Some(target.clone());
        };
        let implicit_hit = implicit
            .iter()
            .filter_map(|r| self.reg_name(*r))
            .any(|r| mentions(widen(&r, wide).0.as_str()));
        if implicit_hit {
            return None;
        }

        let mnemonic = base_mnemonic(&di.insn.mnemonic);
        let Some(first) = ops.first() else {
            return Some(target.clone());
        };
        let written = match first.access {
            Some(access) => access.is_writable(),
            None => !matches!(mnemonic, "cmp" | "test" | "push" | "bt"),
        };
        let X86OperandType::Reg(dest) = &first.op_type else {
            return Some(target.clone());
        };
        let Some(dest) = self.reg_name(*dest) else {
            return Some(target.clone());
        };
        let (full, part) = widen(&dest, wide);
        if !written || !mentions(&full) {
            return Some(target.clone());
        }

        let next = address + di.byte_len();
        let src = ops.get(1);
        let value = match (mnemonic, src.map(|op| &op.op_type)) {
            ("mov" | "movzx", Some(_)) => src.and_then(|op| self.operand_value(op, next))?,
            ("movsx" | "movsxd", Some(X86OperandType::Imm(v))) => Expr::constant(*v),
            ("movsx" | "movsxd", Some(X86OperandType::Mem(mem))) => {
                let size = src.map_or(0, |op| op.size as usize);
                let width = signed(IntType::unsigned(size)?);
                Expr::mem(self.address_expr(mem, next), width, Endianness::Little)
            }
            ("lea", Some(X86OperandType::Mem(mem))) => self.address_expr(mem, next),
            ("add", Some(X86OperandType::Imm(v))) => self.read_register(&dest) + Expr::constant(*v),
            ("sub", Some(X86OperandType::Imm(v))) => self.read_register(&dest) - Expr::constant(*v),
            ("xor", Some(X86OperandType::Reg(r))) if self.reg_name(*r).as_deref() == Some(dest.as_str()) => {
                Expr::constant(0)
            }
            _ => return None,
        };
        // 32-bit writes zero the upper half; narrower writes keep bits we do not track
        let value = match part {
            Part::Full => value,
            Part::Low32 => mask(value, 0xffff_ffff),
            Part::Low16 | Part::Low8 | Part::High8 => return None,
        };

        let mut bindings = Bindings::new();
        bindings.insert(Symbol::register(&full), value);
        Some(target.bind(&bindings).reduce())
    }
}

/// Signed counterpart of an unsigned width.
fn signed(width: IntType) -> IntType {
    match width {
        IntType::U8 => IntType::I8,
        IntType::U16 => IntType::I16,
        IntType::U32 => IntType::I32,
        IntType::U64 => IntType::I64,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{Disassembler, Target};
    use crate::program::{Program, Section};
    use rstest::rstest;

    fn decode_one(arch: Architecture, bytes: &[u8], base: Address) -> (CapstoneDecoder, DecodedInstruction) {
        let decoder = CapstoneDecoder::for_architecture(arch).unwrap();
        let program = Program::new(arch).with_section(Section::new(".text", base, bytes.to_vec()));
        let mut cursor = program.cursor_at(base).unwrap();
        let di = decoder.decode(&mut cursor);
        (decoder, di)
    }

    #[test]
    fn test_architecture_mapping() {
        let decoder = CapstoneDecoder::for_architecture(Architecture::X86_64).unwrap();
        assert_eq!(decoder.architecture(), Architecture::X86_64);
        assert!(matches!(
            CapstoneDecoder::for_architecture(Architecture::Mips32),
            Err(DecoderError::UnsupportedArchitecture(Architecture::Mips32))
        ));
    }

    #[rstest]
    #[case(&[0xb8, 0x01, 0x00, 0x00, 0x00], "mov", Opcode::PLAIN)]
    #[case(&[0xeb, 0x00], "jmp", Opcode::JUMP)]
    #[case(&[0x74, 0x02], "je", Opcode::BRANCH)]
    #[case(&[0xe8, 0x00, 0x00, 0x00, 0x00], "call", Opcode::CALL)]
    #[case(&[0xc3], "ret", Opcode::STOP)]
    fn test_x86_decode_flow(#[case] bytes: &[u8], #[case] mnemonic: &str, #[case] opcode: Opcode) {
        let (_, di) = decode_one(Architecture::X86_32, bytes, 0x1000);
        assert_eq!(di.insn.mnemonic, mnemonic);
        assert_eq!(di.byte_len(), bytes.len() as Address);
        assert_eq!(di.opcode, Some(opcode));
    }

    #[rstest]
    #[case(&[0xf2, 0xff, 0x25, 0x00, 0x00, 0x00, 0x00], "bnd jmp", Opcode::JUMP)]
    #[case(&[0xf2, 0xe8, 0x00, 0x00, 0x00, 0x00], "bnd call", Opcode::CALL)]
    #[case(&[0xf2, 0xc3], "bnd ret", Opcode::STOP)]
    fn test_prefixed_branches_keep_their_flow(#[case] bytes: &[u8], #[case] mnemonic: &str, #[case] opcode: Opcode) {
        let (_, di) = decode_one(Architecture::X86_64, bytes, 0x1000);
        assert_eq!(di.insn.mnemonic, mnemonic);
        assert_eq!(di.opcode, Some(opcode));
    }

    #[test]
    fn test_register_widening() {
        assert_eq!(widen("eax", true), ("rax".to_string(), Part::Low32));
        assert_eq!(widen("eax", false), ("eax".to_string(), Part::Full));
        assert_eq!(widen("al", true), ("rax".to_string(), Part::Low8));
        assert_eq!(widen("ah", false), ("eax".to_string(), Part::High8));
        assert_eq!(widen("sil", true), ("rsi".to_string(), Part::Low8));
        assert_eq!(widen("r10d", true), ("r10".to_string(), Part::Low32));
        assert_eq!(widen("r8", true), ("r8".to_string(), Part::Full));
        assert_eq!(widen("rbp", true), ("rbp".to_string(), Part::Full));
        assert_eq!(widen("rip", true), ("rip".to_string(), Part::Full));
    }

    #[test]
    fn test_direct_jump_target() {
        // jmp +2
        let (decoder, di) = decode_one(Architecture::X86_32, &[0xeb, 0x02], 0x1000);
        let targets = decoder.jump_targets(&di, 0x1000);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].as_const(), Some(0x1004));
    }

    #[test]
    fn test_rip_relative_jump_target() {
        // jmp qword ptr [rip + 0x10]
        let (decoder, di) = decode_one(Architecture::X86_64, &[0xff, 0x25, 0x10, 0x00, 0x00, 0x00], 0x1000);
        let targets = decoder.jump_targets(&di, 0x1000);
        assert_eq!(
            targets,
            vec![Expr::mem(Expr::constant(0x1016), IntType::U64, Endianness::Little)]
        );
    }

    #[test]
    fn test_register_jump_backtraced_through_mov() {
        // jmp eax, preceded by mov eax, 0x2000
        let (decoder, jmp) = decode_one(Architecture::X86_32, &[0xff, 0xe0], 0x1005);
        let targets = decoder.jump_targets(&jmp, 0x1005);
        assert_eq!(targets, vec![Expr::register("eax")]);

        let (_, mov) = decode_one(Architecture::X86_32, &[0xb8, 0x00, 0x20, 0x00, 0x00], 0x1000);
        let refined = decoder.backtrace(&mov, 0x1000, &targets[0]).unwrap();
        assert_eq!(refined.as_const(), Some(0x2000));
    }

    #[test]
    fn test_unrelated_instruction_leaves_target() {
        // nop
        let (decoder, nop) = decode_one(Architecture::X86_32, &[0x90], 0x1000);
        let target = Expr::register("eax");
        assert_eq!(decoder.backtrace(&nop, 0x1000, &target), Some(target));
    }

    #[test]
    fn test_compare_keeps_target() {
        // cmp eax, 1
        let (decoder, cmp) = decode_one(Architecture::X86_32, &[0x83, 0xf8, 0x01], 0x1000);
        let target = Expr::register("eax");
        assert_eq!(decoder.backtrace(&cmp, 0x1000, &target), Some(target));
    }

    #[test]
    fn test_unknown_write_loses_target() {
        // imul eax, ebx
        let (decoder, imul) = decode_one(Architecture::X86_32, &[0x0f, 0xaf, 0xc3], 0x1000);
        assert_eq!(decoder.backtrace(&imul, 0x1000, &Expr::register("eax")), None);
    }

    #[test]
    fn test_dword_write_reaches_full_register() {
        // mov eax, 0x3000 zero-extends into rax
        let (decoder, mov) = decode_one(Architecture::X86_64, &[0xb8, 0x00, 0x30, 0x00, 0x00], 0x1000);
        let refined = decoder.backtrace(&mov, 0x1000, &Expr::register("rax")).unwrap();
        assert_eq!(refined.as_const(), Some(0x3000));
    }

    #[test]
    fn test_latest_partial_write_decides_jump() {
        // mov rax, 0x1020 ; mov eax, 0x1030 ; jmp rax
        let mut code = vec![
            0x48, 0xc7, 0xc0, 0x20, 0x10, 0x00, 0x00, 0xb8, 0x30, 0x10, 0x00, 0x00, 0xff, 0xe0,
        ];
        code.resize(0x31, 0xc3);
        let program = Program::new(Architecture::X86_64).with_section(Section::new(".text", 0x1000, code));
        let decoder = CapstoneDecoder::for_architecture(Architecture::X86_64).unwrap();
        let mut dasm = Disassembler::new(&program, &decoder);
        dasm.disassemble(Target::Address(0x1000));

        let block = dasm.graph().block(0x1000).unwrap();
        assert_eq!(block.successors().iter().copied().collect::<Vec<_>>(), vec![0x1030]);
        assert!(!dasm.graph().is_decoded(0x1020));
    }

    #[test]
    fn test_byte_write_loses_full_register() {
        // mov al, 1
        let (decoder, mov) = decode_one(Architecture::X86_64, &[0xb0, 0x01], 0x1000);
        assert_eq!(decoder.backtrace(&mov, 0x1000, &Expr::register("rax")), None);
    }

    #[test]
    fn test_call_clobbers_return_register() {
        // call +0
        let (decoder, call) = decode_one(Architecture::X86_64, &[0xe8, 0x00, 0x00, 0x00, 0x00], 0x1000);
        assert_eq!(decoder.backtrace(&call, 0x1000, &Expr::register("rax")), None);

        let target = Expr::register("rbx");
        assert_eq!(decoder.backtrace(&call, 0x1000, &target), Some(target));
    }

    #[test]
    fn test_read_only_operand_keeps_target() {
        // test eax, eax
        let (decoder, test) = decode_one(Architecture::X86_32, &[0x85, 0xc0], 0x1000);
        let target = Expr::register("eax");
        assert_eq!(decoder.backtrace(&test, 0x1000, &target), Some(target));
    }

    #[test]
    fn test_pop_loses_target() {
        // pop rax
        let (decoder, pop) = decode_one(Architecture::X86_64, &[0x58], 0x1000);
        assert_eq!(decoder.backtrace(&pop, 0x1000, &Expr::register("rax")), None);
    }

    #[test]
    fn test_implicit_write_loses_target() {
        // cdq writes edx without naming it
        let (decoder, cdq) = decode_one(Architecture::X86_32, &[0x99], 0x1000);
        assert_eq!(decoder.backtrace(&cdq, 0x1000, &Expr::register("edx")), None);
    }

    #[test]
    fn test_invalid_encoding() {
        // push es has no 64-bit encoding
        let (_, di) = decode_one(Architecture::X86_64, &[0x06], 0x1000);
        assert!(!di.is_valid());
        assert_eq!(di.byte_len(), 1);
    }
}
