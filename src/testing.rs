//! A tiny fixed-encoding architecture for exercising the flow builder.
//!
//! | bytes             | instruction          | flow                 |
//! |-------------------|----------------------|----------------------|
//! | `00`              | `nop`                |                      |
//! | `10 rr`           | `jmp rel8`           | jump                 |
//! | `11 rr`           | `jz rel8`            | branch               |
//! | `12 rr`           | `call rel8`          | call                 |
//! | `13 n`            | `jmp rN`             | jump                 |
//! | `14 n`            | `call [rN]`          | call, u32 indirect   |
//! | `15 a a a a`      | `jmp [abs32]`        | jump, u32 indirect   |
//! | `20 n i i i i`    | `mov rN, imm32`      |                      |
//! | `21 n a a a a`    | `mov rN, [abs32]`    |                      |
//! | `22 n m`          | `mov rN, rM`         |                      |
//! | `23 n`            | `clobber rN`         |                      |
//! | `c3`              | `ret`                | stop                 |
//! | `cc`              | `trap`               | stop                 |
//!
//! Relative offsets count from the end of the instruction. Everything else is
//! an invalid one-byte encoding.

use crate::expr::{Bindings, Endianness, Expr, IntType, Symbol};
use crate::program::{Cursor, Program, Section};
use crate::{Address, Architecture, DecodedInstruction, Decoder, Insn, Opcode};

pub(crate) struct ToyDecoder;

fn reg(n: u8) -> String {
    format!("r{}", n)
}

fn le32(b: &[u8]) -> i64 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64
}

impl Decoder for ToyDecoder {
    fn decode(&self, cursor: &mut Cursor<'_>) -> DecodedInstruction {
        let addr = cursor.address();
        let window = cursor.peek(6);
        let op = window.first().copied().unwrap_or(0xff);
        let need = match op {
            0x00 | 0xc3 | 0xcc => 1,
            0x10..=0x14 | 0x23 => 2,
            0x22 => 3,
            0x15 => 5,
            0x20 | 0x21 => 6,
            _ => 0,
        };
        if need == 0 || window.len() < need {
            cursor.advance(1);
            return DecodedInstruction::invalid(Insn::new(addr, &window[..window.len().min(1)], "db", ""));
        }
        let b = &window[..need];
        let (mnemonic, operands, opcode) = match op {
            0x00 => ("nop", String::new(), Opcode::PLAIN),
            0x10 => ("jmp", format!("{}", b[1] as i8), Opcode::JUMP),
            0x11 => ("jz", format!("{}", b[1] as i8), Opcode::BRANCH),
            0x12 => ("call", format!("{}", b[1] as i8), Opcode::CALL),
            0x13 => ("jmp", reg(b[1]), Opcode::JUMP),
            0x14 => ("call", format!("[{}]", reg(b[1])), Opcode::CALL),
            0x15 => ("jmp", format!("[0x{:x}]", le32(&b[1..])), Opcode::JUMP),
            0x20 => ("mov", format!("{}, 0x{:x}", reg(b[1]), le32(&b[2..])), Opcode::PLAIN),
            0x21 => ("mov", format!("{}, [0x{:x}]", reg(b[1]), le32(&b[2..])), Opcode::PLAIN),
            0x22 => ("mov", format!("{}, {}", reg(b[1]), reg(b[2])), Opcode::PLAIN),
            0x23 => ("clobber", reg(b[1]), Opcode::PLAIN),
            0xc3 => ("ret", String::new(), Opcode::STOP),
            _ => ("trap", String::new(), Opcode::STOP),
        };
        cursor.advance(need);
        DecodedInstruction::new(Insn::new(addr, b, mnemonic, &operands), opcode)
    }

    fn jump_targets(&self, di: &DecodedInstruction, address: Address) -> Vec<Expr> {
        let b = di.insn.bytes();
        let next = (address + di.byte_len()) as i64;
        match b[0] {
            0x10..=0x12 => vec![Expr::constant(next) + Expr::constant(b[1] as i8 as i64)],
            0x13 => vec![Expr::register(&reg(b[1]))],
            0x14 => vec![Expr::mem(Expr::register(&reg(b[1])), IntType::U32, Endianness::Little)],
            0x15 => vec![Expr::mem(Expr::constant(le32(&b[1..])), IntType::U32, Endianness::Little)],
            _ => Vec::new(),
        }
    }

    fn backtrace(&self, di: &DecodedInstruction, _address: Address, target: &Expr) -> Option<Expr> {
        let b = di.insn.bytes();
        let (dest, value) = match b[0] {
            0x20 => (reg(b[1]), Expr::constant(le32(&b[2..]))),
            0x21 => (reg(b[1]), Expr::mem(Expr::constant(le32(&b[2..])), IntType::U32, Endianness::Little)),
            0x22 => (reg(b[1]), Expr::register(&reg(b[2]))),
            0x23 if target.mentions(&Symbol::register(&reg(b[1]))) => return None,
            _ => return Some(target.clone()),
        };
        let mut bindings = Bindings::new();
        bindings.insert(Symbol::register(&dest), value);
        Some(target.bind(&bindings))
    }
}

/// A one-section program at `base` holding `code`.
pub(crate) fn program(base: Address, code: &[u8]) -> Program {
    Program::new(Architecture::Unknown).with_section(Section::new(".text", base, code.to_vec()))
}
