//! Flow-following disassembly into a block graph.

use std::collections::VecDeque;

use crate::expr::Expr;
use crate::graph::BlockGraph;
use crate::program::Program;
use crate::{Address, DecodedInstruction, Decoder};

mod backtrace;
mod target;

pub use self::target::{resolve, Target};
use self::backtrace::Backtracer;

/// Default number of backward steps a single backtrace may take.
pub const DEFAULT_BACKTRACE_DEPTH: usize = 500;

/// Tuning knobs for a disassembly pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisasmOptions {
    /// Backward steps allowed per unresolved jump target
    pub backtrace_depth: usize,
    /// Split blocks so that every exported label starts one
    pub split_at_labels: bool,
}

impl Default for DisasmOptions {
    fn default() -> Self {
        Self {
            backtrace_depth: DEFAULT_BACKTRACE_DEPTH,
            split_at_labels: true,
        }
    }
}

/// A pending decode: `target`, reached from the instruction at `origin`.
#[derive(Debug, Clone)]
struct WorkItem {
    target: Target,
    origin: Option<Address>,
}

/// Builds and owns the block graph of one program.
pub struct Disassembler<'a> {
    program: &'a Program,
    decoder: &'a dyn Decoder,
    options: DisasmOptions,
    graph: BlockGraph,
}

impl<'a> Disassembler<'a> {
    pub fn new(program: &'a Program, decoder: &'a dyn Decoder) -> Self {
        Self::with_options(program, decoder, DisasmOptions::default())
    }

    pub fn with_options(program: &'a Program, decoder: &'a dyn Decoder, options: DisasmOptions) -> Self {
        Self {
            program,
            decoder,
            options,
            graph: BlockGraph::new(),
        }
    }

    pub fn graph(&self) -> &BlockGraph {
        &self.graph
    }

    pub fn into_graph(self) -> BlockGraph {
        self.graph
    }

    /// Disassemble from each entry in turn, sharing one graph.
    pub fn disassemble_all<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = Target>,
    {
        for entry in entries {
            self.disassemble(entry);
        }
    }

    /// Decode everything reachable from `entry` that is not decoded yet.
    ///
    /// Branch targets are queued at the front and fall-through at the back,
    /// and items are taken from the back, so a block is decoded to its end
    /// before any other target is looked at.
    pub fn disassemble(&mut self, entry: Target) {
        log::debug!("Starting flow disassembly from {}", entry);

        let mut work = VecDeque::from([WorkItem { target: entry, origin: None }]);
        let mut current: Option<Address> = None;

        while let Some(WorkItem { target, origin }) = work.pop_back() {
            let Some(addr) = target.address_in(self.program) else {
                log::debug!("dropping unresolved target {}", target);
                current = None;
                continue;
            };

            if self.graph.is_visited(addr) {
                if let Some(block) = current.take() {
                    self.graph.add_successor(block, addr);
                }
                self.graph.split_at_if_decoded(addr);
                if let Some(from) = origin {
                    self.graph.add_predecessor(addr, from);
                }
                continue;
            }

            let Some(di) = self.decode_at(addr) else {
                current = None;
                continue;
            };

            let block = match current {
                Some(block) => block,
                None => {
                    self.graph.open_block(addr, origin);
                    addr
                }
            };

            let Some(opcode) = di.opcode else {
                log::debug!("invalid opcode at 0x{:x}", addr);
                current = None;
                continue;
            };
            let next = addr + di.byte_len();
            self.graph.push_instruction(block, addr, di);
            current = Some(block);

            if opcode.sets_ip {
                for t in self.jump_targets(addr) {
                    if let Some(to) = t.address_in(self.program) {
                        self.graph.add_successor(block, to);
                    }
                    work.push_front(WorkItem { target: t, origin: Some(addr) });
                }
                if !opcode.stops_exec {
                    self.graph.add_successor(block, next);
                }
                current = None;
            }

            if opcode.stops_exec {
                current = None;
            } else {
                work.push_back(WorkItem {
                    target: Target::Address(next),
                    origin: Some(addr),
                });
            }
        }

        if self.options.split_at_labels {
            for addr in self.program.label_addresses() {
                self.graph.split_at_if_decoded(addr);
            }
        }

        log::debug!(
            "Flow disassembly complete: {} basic blocks, {} instructions",
            self.graph.len(),
            self.graph.instruction_count()
        );
    }

    fn decode_at(&self, addr: Address) -> Option<DecodedInstruction> {
        let mut cursor = self.program.cursor_at(addr)?;
        Some(self.decoder.decode(&mut cursor))
    }

    /// Targets of the control transfer at `addr`: immediate ones first, then
    /// whatever backtracking recovers for the rest.
    fn jump_targets(&self, addr: Address) -> Vec<Target> {
        let Some(di) = self.graph.block_containing(addr).and_then(|b| {
            b.position_of(addr).map(|i| &b.instructions()[i])
        }) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        let mut pending: Vec<Expr> = Vec::new();
        for candidate in self.decoder.jump_targets(di, addr) {
            match resolve(self.program, &candidate) {
                Some(t) if !found.contains(&t) => found.push(t),
                Some(_) => {}
                None => pending.push(candidate),
            }
        }

        if !pending.is_empty() {
            let tracer = Backtracer {
                program: self.program,
                decoder: self.decoder,
                graph: &self.graph,
                max_depth: self.options.backtrace_depth,
            };
            for t in tracer.run(addr, pending) {
                if !found.contains(&t) {
                    found.push(t);
                }
            }
        }
        found
    }
}
