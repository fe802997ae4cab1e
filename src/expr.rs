//! Symbolic integer expressions and memory indirections.
//!
//! Expressions are immutable trees whose children are shared through `Arc`,
//! so the same sub-expression can be reused across several candidate jump
//! targets and backtrace states without copying.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::Arc;

/// Integer width and signedness of a memory read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
}

impl IntType {
    /// Width in bits
    pub fn bits(self) -> u32 {
        match self {
            IntType::U8 | IntType::I8 => 8,
            IntType::U16 | IntType::I16 => 16,
            IntType::U32 | IntType::I32 => 32,
            IntType::U64 | IntType::I64 => 64,
        }
    }

    /// Width in bytes
    pub fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Whether values of this type are sign-extended
    pub fn is_signed(self) -> bool {
        matches!(self, IntType::I8 | IntType::I16 | IntType::I32 | IntType::I64)
    }

    /// Unsigned type of the given byte width, if there is one.
    pub fn unsigned(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(IntType::U8),
            2 => Some(IntType::U16),
            4 => Some(IntType::U32),
            8 => Some(IntType::U64),
            _ => None,
        }
    }
}

impl fmt::Display for IntType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_signed() { 'i' } else { 'u' };
        write!(f, "{}{}", sign, self.bits())
    }
}

/// Byte order of a memory read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endianness::Little => write!(f, "le"),
            Endianness::Big => write!(f, "be"),
        }
    }
}

/// A named reference inside an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    /// External label, resolved against section export tables
    Label(Arc<str>),
    /// Architecture register, bound by backtracking
    Register(Arc<str>),
}

impl Symbol {
    pub fn label(name: &str) -> Self {
        Symbol::Label(Arc::from(name))
    }

    pub fn register(name: &str) -> Self {
        Symbol::Register(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        match self {
            Symbol::Label(n) | Symbol::Register(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BinaryOp {
    fn apply(self, l: i64, r: i64) -> i64 {
        match self {
            BinaryOp::Add => l.wrapping_add(r),
            BinaryOp::Sub => l.wrapping_sub(r),
            BinaryOp::Mul => l.wrapping_mul(r),
            BinaryOp::And => l & r,
            BinaryOp::Or => l | r,
            BinaryOp::Xor => l ^ r,
            BinaryOp::Shl => l.wrapping_shl(r as u32),
            BinaryOp::Shr => ((l as u64).wrapping_shr(r as u32)) as i64,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }
}

/// "Read `width` bits, in `endianness` order, from the address `target`".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Indirection {
    pub target: Arc<Expr>,
    pub width: IntType,
    pub endianness: Endianness,
}

impl Indirection {
    pub fn new(target: Expr, width: IntType, endianness: Endianness) -> Self {
        Self {
            target: Arc::new(target),
            width,
            endianness,
        }
    }

    /// Substitute symbols inside the address expression.
    pub fn bind(&self, bindings: &Bindings) -> Self {
        Self {
            target: Arc::new(self.target.bind(bindings)),
            width: self.width,
            endianness: self.endianness,
        }
    }
}

/// Symbol substitutions applied by [`Expr::bind`].
pub type Bindings = HashMap<Symbol, Expr>;

/// A symbolic integer expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Expr {
    Const(i64),
    Symbol(Symbol),
    Unary(UnaryOp, Arc<Expr>),
    Binary(BinaryOp, Arc<Expr>, Arc<Expr>),
    Mem(Indirection),
}

impl Expr {
    pub fn constant(value: i64) -> Self {
        Expr::Const(value)
    }

    pub fn label(name: &str) -> Self {
        Expr::Symbol(Symbol::label(name))
    }

    pub fn register(name: &str) -> Self {
        Expr::Symbol(Symbol::register(name))
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary(op, Arc::new(operand))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Arc::new(lhs), Arc::new(rhs))
    }

    pub fn mem(target: Expr, width: IntType, endianness: Endianness) -> Self {
        Expr::Mem(Indirection::new(target, width, endianness))
    }

    /// Fold every constant sub-tree and drop additive identities.
    ///
    /// Symbols and indirections are left in place, so the result is a
    /// constant only when nothing unbound remains.
    pub fn reduce(&self) -> Expr {
        match self {
            Expr::Const(_) | Expr::Symbol(_) => self.clone(),
            Expr::Mem(ind) => Expr::Mem(Indirection {
                target: Arc::new(ind.target.reduce()),
                width: ind.width,
                endianness: ind.endianness,
            }),
            Expr::Unary(op, e) => match (op, e.reduce()) {
                (UnaryOp::Neg, Expr::Const(v)) => Expr::Const(v.wrapping_neg()),
                (UnaryOp::Not, Expr::Const(v)) => Expr::Const(!v),
                (_, r) => Expr::unary(*op, r),
            },
            Expr::Binary(op, l, r) => match (l.reduce(), r.reduce()) {
                (Expr::Const(a), Expr::Const(b)) => Expr::Const(op.apply(a, b)),
                (x, Expr::Const(0)) if matches!(op, BinaryOp::Add | BinaryOp::Sub) => x,
                (Expr::Const(0), x) if *op == BinaryOp::Add => x,
                (a, b) => Expr::binary(*op, a, b),
            },
        }
    }

    /// Value of the expression when it reduces to a constant.
    pub fn as_const(&self) -> Option<i64> {
        match self.reduce() {
            Expr::Const(v) => Some(v),
            _ => None,
        }
    }

    /// Name of the label when the expression is nothing but a label.
    pub fn as_label(&self) -> Option<Arc<str>> {
        match self.reduce() {
            Expr::Symbol(Symbol::Label(name)) => Some(name),
            _ => None,
        }
    }

    /// Replace bound symbols by their expressions, recursing into indirections.
    pub fn bind(&self, bindings: &Bindings) -> Expr {
        match self {
            Expr::Const(_) => self.clone(),
            Expr::Symbol(s) => bindings.get(s).cloned().unwrap_or_else(|| self.clone()),
            Expr::Unary(op, e) => Expr::unary(*op, e.bind(bindings)),
            Expr::Binary(op, l, r) => Expr::binary(*op, l.bind(bindings), r.bind(bindings)),
            Expr::Mem(ind) => Expr::Mem(ind.bind(bindings)),
        }
    }

    /// Whether `symbol` occurs anywhere in the tree.
    pub fn mentions(&self, symbol: &Symbol) -> bool {
        match self {
            Expr::Const(_) => false,
            Expr::Symbol(s) => s == symbol,
            Expr::Unary(_, e) => e.mentions(symbol),
            Expr::Binary(_, l, r) => l.mentions(symbol) || r.mentions(symbol),
            Expr::Mem(ind) => ind.target.mentions(symbol),
        }
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Const(value)
    }
}

impl From<Symbol> for Expr {
    fn from(symbol: Symbol) -> Self {
        Expr::Symbol(symbol)
    }
}

impl From<Indirection> for Expr {
    fn from(ind: Indirection) -> Self {
        Expr::Mem(ind)
    }
}

impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Add, self, rhs)
    }
}

impl Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Sub, self, rhs)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) if *v < 0 => write!(f, "-0x{:x}", v.unsigned_abs()),
            Expr::Const(v) => write!(f, "0x{:x}", v),
            Expr::Symbol(s) => write!(f, "{}", s.name()),
            Expr::Unary(UnaryOp::Neg, e) => write!(f, "-{}", e),
            Expr::Unary(UnaryOp::Not, e) => write!(f, "~{}", e),
            Expr::Binary(op, l, r) => write!(f, "({} {} {})", l, op.symbol(), r),
            Expr::Mem(ind) => write!(f, "{}{}[{}]", ind.width, ind.endianness, ind.target),
        }
    }
}
