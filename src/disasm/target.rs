//! Jump targets and their immediate (no backtracking) resolution.

use std::fmt;

use crate::expr::Expr;
use crate::program::Program;
use crate::Address;

/// A resolved code reference: a concrete address or an exported label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Address(Address),
    Label(String),
}

impl Target {
    /// Absolute address of the target, if it lies in a loaded section.
    pub fn address_in(&self, program: &Program) -> Option<Address> {
        match self {
            Target::Address(addr) => program.section_at(*addr).map(|_| *addr),
            Target::Label(name) => program.label_address(name),
        }
    }
}

impl From<Address> for Target {
    fn from(addr: Address) -> Self {
        Target::Address(addr)
    }
}

impl From<&str> for Target {
    fn from(label: &str) -> Self {
        Target::Label(label.to_string())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Address(addr) => write!(f, "0x{:x}", addr),
            Target::Label(name) => write!(f, "{}", name),
        }
    }
}

/// Reduce `expr` to a target without looking at surrounding code.
///
/// Constants become addresses and bare labels stay labels. An indirection
/// whose address resolves is read from the section (relocations first) and
/// the value resolved again. Anything else is not resolved yet.
pub fn resolve(program: &Program, expr: &Expr) -> Option<Target> {
    if let Some(value) = expr.as_const() {
        return Some(Target::Address(value as Address));
    }
    if let Some(name) = expr.as_label() {
        return Some(Target::Label(name.to_string()));
    }
    let Expr::Mem(ind) = expr else {
        return None;
    };
    let mut cursor = match resolve(program, &ind.target)? {
        Target::Address(addr) => program.cursor_at(addr)?,
        Target::Label(name) => program.cursor_at_label(&name)?,
    };
    let value = cursor.read_expr(ind.width, ind.endianness)?;
    resolve(program, &value)
}
