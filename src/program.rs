//! Loaded sections and the byte/label access layer the disassembler reads through.

use std::collections::BTreeMap;

use crate::expr::{Endianness, Expr, IntType};
use crate::{Address, Architecture};

/// A pending substitution: reading `width` bytes at this offset yields `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub width: IntType,
    pub endianness: Endianness,
    pub target: Expr,
}

impl Relocation {
    pub fn new(width: IntType, endianness: Endianness, target: Expr) -> Self {
        Self {
            width,
            endianness,
            target,
        }
    }
}

/// A contiguous loaded byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Load address of the first byte
    pub base: Address,
    /// Raw bytes present in the image
    pub data: Vec<u8>,
    /// Mapped size; bytes past `data` up to this size read as zero
    pub virtual_size: usize,
    /// Whether this section contains executable code
    pub executable: bool,
    /// Label name to byte offset
    pub exports: BTreeMap<String, usize>,
    /// Byte offset to pending relocation
    pub relocations: BTreeMap<usize, Relocation>,
}

impl Section {
    /// Create a section whose virtual size equals its raw size.
    pub fn new(name: impl Into<String>, base: Address, data: Vec<u8>) -> Self {
        let virtual_size = data.len();
        Self {
            name: name.into(),
            base,
            data,
            virtual_size,
            executable: true,
            exports: BTreeMap::new(),
            relocations: BTreeMap::new(),
        }
    }

    /// Extend (never shrink) the mapped size.
    pub fn with_virtual_size(mut self, size: usize) -> Self {
        self.virtual_size = size.max(self.data.len());
        self
    }

    pub fn with_executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    /// Add a label at `offset`.
    pub fn export(mut self, name: impl Into<String>, offset: usize) -> Self {
        self.exports.insert(name.into(), offset);
        self
    }

    /// Add a relocation at `offset`.
    pub fn relocate(mut self, offset: usize, relocation: Relocation) -> Self {
        self.relocations.insert(offset, relocation);
        self
    }

    /// One past the last mapped address
    pub fn end_address(&self) -> Address {
        self.base + self.virtual_size as Address
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.end_address()
    }

    /// Labels sitting at `offset`, in name order.
    pub fn labels_at(&self, offset: usize) -> impl Iterator<Item = &str> {
        self.exports
            .iter()
            .filter(move |(_, &off)| off == offset)
            .map(|(name, _)| name.as_str())
    }
}

/// The sections of one image plus what the container told us about it.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Detected architecture
    pub architecture: Architecture,
    /// Entry point address, if available
    pub entry_point: Option<Address>,
    /// Loaded sections
    pub sections: Vec<Section>,
}

impl Program {
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            entry_point: None,
            sections: Vec::new(),
        }
    }

    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    /// Section mapping `addr`.
    pub fn section_at(&self, addr: Address) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(addr))
    }

    /// Section whose export table holds `label`.
    pub fn section_exporting(&self, label: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.exports.contains_key(label))
    }

    /// Absolute address of `label`.
    pub fn label_address(&self, label: &str) -> Option<Address> {
        let section = self.section_exporting(label)?;
        section.exports.get(label).map(|&off| section.base + off as Address)
    }

    /// Every label exported at `addr`.
    pub fn labels_at(&self, addr: Address) -> Vec<&str> {
        match self.section_at(addr) {
            Some(s) => s.labels_at((addr - s.base) as usize).collect(),
            None => Vec::new(),
        }
    }

    /// Absolute addresses of every exported label.
    pub fn label_addresses(&self) -> Vec<Address> {
        self.sections
            .iter()
            .flat_map(|s| s.exports.values().map(move |&off| s.base + off as Address))
            .collect()
    }

    /// Return a label for `addr`, exporting `"{prefix}_{addr:x}"` when none exists.
    pub fn make_label(&mut self, addr: Address, prefix: &str) -> Option<String> {
        let section = self.sections.iter_mut().find(|s| s.contains(addr))?;
        let offset = (addr - section.base) as usize;
        if let Some(existing) = section.labels_at(offset).next() {
            return Some(existing.to_string());
        }
        let label = format!("{}_{:x}", prefix, addr);
        section.exports.insert(label.clone(), offset);
        Some(label)
    }

    /// Read cursor positioned at `addr`.
    pub fn cursor_at(&self, addr: Address) -> Option<Cursor<'_>> {
        let section = self.section_at(addr)?;
        Some(Cursor {
            section,
            ptr: (addr - section.base) as usize,
        })
    }

    /// Read cursor positioned at `label`.
    pub fn cursor_at_label(&self, label: &str) -> Option<Cursor<'_>> {
        let section = self.section_exporting(label)?;
        Some(Cursor {
            section,
            ptr: *section.exports.get(label)?,
        })
    }
}

/// A read position inside one section.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    section: &'a Section,
    ptr: usize,
}

impl<'a> Cursor<'a> {
    pub fn section(&self) -> &'a Section {
        self.section
    }

    /// Offset of the next byte from the section base
    pub fn offset(&self) -> usize {
        self.ptr
    }

    /// Absolute address of the next byte
    pub fn address(&self) -> Address {
        self.section.base + self.ptr as Address
    }

    pub fn advance(&mut self, count: usize) {
        self.ptr += count;
    }

    fn byte_at(&self, offset: usize) -> Option<u8> {
        if offset < self.section.data.len() {
            Some(self.section.data[offset])
        } else if offset < self.section.virtual_size {
            Some(0)
        } else {
            None
        }
    }

    /// Up to `count` bytes from the cursor, without moving it.
    ///
    /// Stops at the end of the mapped range; uninitialised bytes read as zero.
    pub fn peek(&self, count: usize) -> Vec<u8> {
        (self.ptr..self.ptr + count)
            .map_while(|off| self.byte_at(off))
            .collect()
    }

    /// Read one byte, `None` past the mapped range.
    pub fn read_u8(&mut self) -> Option<u8> {
        let b = self.byte_at(self.ptr)?;
        self.ptr += 1;
        Some(b)
    }

    /// Read a raw integer, sign-extending signed widths.
    pub fn read_int(&mut self, width: IntType, endianness: Endianness) -> Option<i64> {
        let bytes = width.bytes();
        let raw = self.peek(bytes);
        if raw.len() < bytes {
            return None;
        }
        let mut val: u64 = 0;
        match endianness {
            Endianness::Little => {
                for (i, b) in raw.iter().enumerate() {
                    val |= (*b as u64) << (8 * i);
                }
            }
            Endianness::Big => {
                for b in &raw {
                    val = (val << 8) | *b as u64;
                }
            }
        }
        self.ptr += bytes;
        let bits = width.bits();
        if width.is_signed() && bits < 64 && (val >> (bits - 1)) & 1 == 1 {
            val |= u64::MAX << bits;
        }
        Some(val as i64)
    }

    /// Read an expression, preferring a relocation recorded at the cursor.
    ///
    /// A relocation is used only when its width and byte order match the
    /// request; otherwise the raw bytes are decoded.
    pub fn read_expr(&mut self, width: IntType, endianness: Endianness) -> Option<Expr> {
        if let Some(rel) = self.section.relocations.get(&self.ptr) {
            if rel.width.bytes() == width.bytes() && rel.endianness == endianness {
                self.ptr += width.bytes();
                return Some(rel.target.clone());
            }
            log::warn!(
                "ignoring relocation {} at 0x{:x}: wanted {}{}, found {}{}",
                rel.target,
                self.address(),
                width,
                endianness,
                rel.width,
                rel.endianness
            );
        }
        self.read_int(width, endianness).map(Expr::Const)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample() -> Program {
        Program::new(Architecture::Unknown)
            .with_section(
                Section::new(".text", 0x1000, vec![0x78, 0x56, 0x34, 0x12, 0xff, 0xfe])
                    .with_virtual_size(0x10)
                    .export("start", 0)
                    .export("tail", 4)
                    .relocate(
                        8,
                        Relocation::new(IntType::U32, Endianness::Little, Expr::label("puts")),
                    ),
            )
            .with_section(Section::new(".data", 0x2000, vec![0; 4]).with_executable(false))
    }

    #[rstest]
    #[case(0x1000, IntType::U32, Endianness::Little, Some(0x1234_5678))]
    #[case(0x1000, IntType::U32, Endianness::Big, Some(0x7856_3412))]
    #[case(0x1004, IntType::I8, Endianness::Little, Some(-1))]
    #[case(0x1004, IntType::I16, Endianness::Little, Some(-257))]
    #[case(0x1004, IntType::U16, Endianness::Little, Some(0xfeff))]
    #[case(0x1006, IntType::U32, Endianness::Little, Some(0))]
    #[case(0x100e, IntType::U32, Endianness::Little, None)]
    fn test_read_int(
        #[case] addr: Address,
        #[case] width: IntType,
        #[case] endianness: Endianness,
        #[case] expected: Option<i64>,
    ) {
        let program = sample();
        let mut cursor = program.cursor_at(addr).unwrap();
        assert_eq!(cursor.read_int(width, endianness), expected);
    }

    #[test]
    fn test_read_expr_uses_matching_relocation() {
        let program = sample();
        let mut cursor = program.cursor_at(0x1008).unwrap();
        assert_eq!(cursor.read_expr(IntType::U32, Endianness::Little), Some(Expr::label("puts")));
        assert_eq!(cursor.address(), 0x100c);

        // signedness does not matter, size and byte order do
        let mut cursor = program.cursor_at(0x1008).unwrap();
        assert_eq!(cursor.read_expr(IntType::I32, Endianness::Little), Some(Expr::label("puts")));

        let mut cursor = program.cursor_at(0x1008).unwrap();
        assert_eq!(cursor.read_expr(IntType::U32, Endianness::Big), Some(Expr::Const(0)));
    }

    #[test]
    fn test_label_lookup() {
        let program = sample();
        assert_eq!(program.label_address("tail"), Some(0x1004));
        assert_eq!(program.label_address("missing"), None);
        assert_eq!(program.labels_at(0x1000), vec!["start"]);
        assert_eq!(program.section_at(0x2002).map(|s| s.name.as_str()), Some(".data"));
        assert!(program.section_at(0x1010).is_none());
        assert_eq!(program.cursor_at_label("tail").map(|c| c.address()), Some(0x1004));
    }

    #[test]
    fn test_make_label() {
        let mut program = sample();
        assert_eq!(program.make_label(0x1000, "loc").as_deref(), Some("start"));
        assert_eq!(program.make_label(0x1002, "loc").as_deref(), Some("loc_1002"));
        assert_eq!(program.label_address("loc_1002"), Some(0x1002));
        assert_eq!(program.make_label(0x9000, "loc"), None);
    }

    #[test]
    fn test_peek_stops_at_virtual_size() {
        let program = sample();
        let cursor = program.cursor_at(0x100c).unwrap();
        assert_eq!(cursor.peek(16), vec![0, 0, 0, 0]);
    }
}
