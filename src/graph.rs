//! Basic blocks and the two indices that make up a disassembly result.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use crate::{Address, DecodedInstruction, DisassemblyError};

/// A straight-line run of consecutively decoded instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionBlock {
    start: Address,
    instructions: Vec<DecodedInstruction>,
    /// Addresses that transferred control here
    from: BTreeSet<Address>,
    /// Addresses control may reach from the last instruction
    to: BTreeSet<Address>,
}

impl InstructionBlock {
    fn new(start: Address) -> Self {
        Self {
            start,
            instructions: Vec::new(),
            from: BTreeSet::new(),
            to: BTreeSet::new(),
        }
    }

    /// Address of the first instruction
    pub fn start(&self) -> Address {
        self.start
    }

    pub fn instructions(&self) -> &[DecodedInstruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Size of the block in bytes
    pub fn byte_len(&self) -> Address {
        self.instructions.iter().map(DecodedInstruction::byte_len).sum()
    }

    /// One past the last byte of the block
    pub fn end(&self) -> Address {
        self.start + self.byte_len()
    }

    pub fn predecessors(&self) -> &BTreeSet<Address> {
        &self.from
    }

    pub fn successors(&self) -> &BTreeSet<Address> {
        &self.to
    }

    /// Instructions paired with their addresses.
    pub fn iter(&self) -> impl Iterator<Item = (Address, &DecodedInstruction)> {
        self.instructions.iter().scan(self.start, |addr, di| {
            let at = *addr;
            *addr += di.byte_len();
            Some((at, di))
        })
    }

    /// Index of the instruction starting at `addr`.
    pub fn position_of(&self, addr: Address) -> Option<usize> {
        self.iter().position(|(at, _)| at == addr)
    }
}

/// Block-start index plus decoded-address index.
///
/// Every decoded address maps to the start of the one block holding its
/// instruction; every block start with at least one instruction maps to
/// itself. Blocks opened at an invalid encoding have no instructions and
/// appear only in the block-start index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockGraph {
    blocks: BTreeMap<Address, InstructionBlock>,
    decoded: BTreeMap<Address, Address>,
}

impl BlockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block starting at `start`.
    pub fn block(&self, start: Address) -> Option<&InstructionBlock> {
        self.blocks.get(&start)
    }

    /// All blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = &InstructionBlock> {
        self.blocks.values()
    }

    /// Start of the block owning the instruction at `addr`.
    pub fn owner_of(&self, addr: Address) -> Option<Address> {
        self.decoded.get(&addr).copied()
    }

    /// Block owning the instruction at `addr`.
    pub fn block_containing(&self, addr: Address) -> Option<&InstructionBlock> {
        self.owner_of(addr).and_then(|start| self.blocks.get(&start))
    }

    pub fn is_decoded(&self, addr: Address) -> bool {
        self.decoded.contains_key(&addr)
    }

    pub fn is_block_start(&self, addr: Address) -> bool {
        self.blocks.contains_key(&addr)
    }

    /// Decoded, or a block was opened there.
    pub fn is_visited(&self, addr: Address) -> bool {
        self.is_decoded(addr) || self.is_block_start(addr)
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of decoded instructions
    pub fn instruction_count(&self) -> usize {
        self.decoded.len()
    }

    pub(crate) fn open_block(&mut self, start: Address, origin: Option<Address>) {
        let block = self.blocks.entry(start).or_insert_with(|| InstructionBlock::new(start));
        block.from.extend(origin);
    }

    pub(crate) fn push_instruction(&mut self, block: Address, addr: Address, di: DecodedInstruction) {
        let Some(b) = self.blocks.get_mut(&block) else {
            panic!("no open block at 0x{:x}", block);
        };
        b.instructions.push(di);
        self.decoded.insert(addr, block);
    }

    pub(crate) fn add_successor(&mut self, block: Address, target: Address) {
        if let Some(b) = self.blocks.get_mut(&block) {
            b.to.insert(target);
        }
    }

    pub(crate) fn add_predecessor(&mut self, block: Address, origin: Address) {
        if let Some(b) = self.blocks.get_mut(&block) {
            b.from.insert(origin);
        }
    }

    /// Make the decoded address `addr` a block start, splitting its owner.
    ///
    /// Does nothing if `addr` already starts a block.
    ///
    /// # Panics
    /// When `addr` was never decoded.
    pub fn split_at(&mut self, addr: Address) {
        if self.is_block_start(addr) {
            return;
        }
        let Some(owner) = self.owner_of(addr) else {
            panic!("cannot split at undecoded address 0x{:x}", addr);
        };
        self.split_block(owner, addr);
    }

    /// Split at `addr` when it is decoded but not yet a block start.
    pub(crate) fn split_at_if_decoded(&mut self, addr: Address) {
        if self.is_decoded(addr) && !self.is_block_start(addr) {
            self.split_at(addr);
        }
    }

    /// Split the block starting at `old` so that `new` starts its own block.
    ///
    /// The head keeps `old`'s predecessors and falls through to `new`; the tail
    /// inherits `old`'s successors.
    ///
    /// # Panics
    /// When `old` is not a block or `new` is not an instruction boundary
    /// strictly inside it.
    pub fn split_block(&mut self, old: Address, new: Address) {
        let Some(head) = self.blocks.get_mut(&old) else {
            panic!("no block at 0x{:x} to split", old);
        };

        let mut at = old;
        let mut index = None;
        for (i, di) in head.instructions.iter().enumerate() {
            if at == new {
                index = Some(i);
                break;
            }
            at += di.byte_len();
        }
        let index = match index {
            Some(i) if i > 0 => i,
            _ => panic!(
                "0x{:x} is not an instruction boundary inside block 0x{:x}",
                new, old
            ),
        };

        let mut tail = InstructionBlock::new(new);
        tail.instructions = head.instructions.split_off(index);
        tail.to = std::mem::replace(&mut head.to, BTreeSet::from([new]));
        tail.from.insert(old);

        let mut at = new;
        for di in &tail.instructions {
            self.decoded.insert(at, new);
            at += di.byte_len();
        }
        log::trace!("split block 0x{:x} at 0x{:x}", old, new);
        self.blocks.insert(new, tail);
    }

    /// Verify the structural invariants of the two indices.
    ///
    /// Blocks are checked in parallel; the first violation found is reported.
    pub fn check_invariants(&self) -> Result<(), DisassemblyError> {
        let covered: usize = self.blocks.values().map(InstructionBlock::len).sum();
        if covered != self.decoded.len() {
            return Err(DisassemblyError::InvariantViolation(format!(
                "{} instructions in blocks but {} decoded addresses",
                covered,
                self.decoded.len()
            )));
        }

        self.blocks
            .par_iter()
            .map(|(&start, block)| {
                if block.start != start {
                    return Err(format!("block 0x{:x} is indexed at 0x{:x}", block.start, start));
                }
                if !block.is_empty() && self.owner_of(start) != Some(start) {
                    return Err(format!("block start 0x{:x} does not own itself", start));
                }
                for (addr, _) in block.iter() {
                    if self.owner_of(addr) != Some(start) {
                        return Err(format!(
                            "0x{:x} lies in block 0x{:x} but is indexed to {:?}",
                            addr,
                            start,
                            self.owner_of(addr)
                        ));
                    }
                }
                Ok(())
            })
            .collect::<Result<Vec<()>, String>>()
            .map(|_| ())
            .map_err(DisassemblyError::InvariantViolation)
    }
}
