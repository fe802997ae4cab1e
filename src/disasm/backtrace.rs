//! Bounded backward search for branch targets that are not immediate.

use std::collections::{HashSet, VecDeque};

use crate::disasm::target::{resolve, Target};
use crate::expr::Expr;
use crate::graph::BlockGraph;
use crate::program::Program;
use crate::{Address, Decoder};

/// One pending walk: `target` as it stands just before `block.instructions[index]`,
/// which sits at `address`.
#[derive(Debug, Clone)]
struct Trace {
    depth: usize,
    address: Address,
    block: Address,
    index: usize,
    target: Expr,
}

pub(crate) struct Backtracer<'a> {
    pub program: &'a Program,
    pub decoder: &'a dyn Decoder,
    pub graph: &'a BlockGraph,
    pub max_depth: usize,
}

impl Backtracer<'_> {
    /// Resolve `candidates` of the control transfer at `origin` by walking backwards.
    ///
    /// Traces run breadth-first and fan out to predecessors in address order.
    /// Every distinct target found is returned in discovery order; traces
    /// that run out of depth, predecessors or information yield nothing.
    pub fn run(&self, origin: Address, candidates: Vec<Expr>) -> Vec<Target> {
        let mut found = Vec::new();
        let Some(block) = self.graph.owner_of(origin) else {
            return found;
        };
        let Some(index) = self.graph.block(block).and_then(|b| b.position_of(origin)) else {
            return found;
        };

        let mut queue: VecDeque<Trace> = candidates
            .into_iter()
            .map(|target| Trace {
                depth: self.max_depth,
                address: origin,
                block,
                index,
                target,
            })
            .collect();
        let mut seen: HashSet<(Address, usize, Expr)> = HashSet::new();

        while let Some(trace) = queue.pop_front() {
            if trace.depth == 0 {
                log::trace!("backtrace of {} from 0x{:x}: depth exhausted", trace.target, origin);
                continue;
            }
            if !seen.insert((trace.block, trace.index, trace.target.clone())) {
                continue;
            }
            let Some(current) = self.graph.block(trace.block) else {
                continue;
            };

            if trace.index == 0 {
                for &from in current.predecessors() {
                    let Some(pred) = self.graph.block_containing(from) else {
                        continue;
                    };
                    log::trace!("backtracking: up to 0x{:x}", from);
                    queue.push_back(Trace {
                        depth: trace.depth,
                        address: pred.end(),
                        block: pred.start(),
                        index: pred.len(),
                        target: trace.target.clone(),
                    });
                }
                continue;
            }

            let di = &current.instructions()[trace.index - 1];
            let address = trace.address - di.byte_len();
            log::trace!("backtracking: eval {} in {} at 0x{:x}", trace.target, di.insn, address);
            let Some(refined) = self.decoder.backtrace(di, address, &trace.target) else {
                log::trace!("backtracking: {} lost at 0x{:x}", trace.target, address);
                continue;
            };

            if let Some(t) = resolve(self.program, &refined) {
                log::trace!("backtracking: found {}", t);
                if !found.contains(&t) {
                    found.push(t);
                }
            } else {
                queue.push_back(Trace {
                    depth: trace.depth - 1,
                    address,
                    block: trace.block,
                    index: trace.index - 1,
                    target: refined,
                });
            }
        }

        found
    }
}
