// cfg.rs - control-flow discovery
//
// Discovers basic blocks reachable from the entry PC with a FIFO worklist.
// Discovery never fails: undecodable or unmapped addresses terminate their
// block with a Trap and the traversal moves on.

use crate::decoder::{self, DecodedInst, Opcode, Operand};
use crate::elf::Memory;
use log::debug;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

/// How a basic block ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    None,
    /// Implicit fallthrough into an already-known leader
    Fallthrough,
    /// Conditional branch, two successors (taken first)
    Branch,
    /// Direct jump (JAL)
    Jump,
    /// JALR to a runtime-computed target
    IndirectJump,
    /// JALR x0, 0(ra)
    Return,
    /// ECALL/EBREAK or decode failure
    Trap,
}

/// A basic block of decoded instructions
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Start address (leader PC)
    pub start: u64,
    /// Instructions in this block
    pub instrs: Vec<DecodedInst>,
    /// Terminator classification
    pub term: TermKind,
    /// 0, 1 or 2 successor leader PCs depending on `term`
    pub succs: Vec<u64>,
}

/// Control flow graph over basic blocks
#[derive(Debug)]
pub struct Cfg {
    /// Entry point PC
    pub entry: u64,
    /// Blocks in discovery order
    pub blocks: Vec<BasicBlock>,
    /// Leader PC -> index into `blocks`
    pub index_by_addr: HashMap<u64, usize>,
}

impl Cfg {
    /// Leader PCs in ascending address order
    pub fn addrs_in_order(&self) -> Vec<u64> {
        let mut addrs: Vec<u64> = self.index_by_addr.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    pub fn block_at(&self, addr: u64) -> Option<&BasicBlock> {
        self.index_by_addr.get(&addr).map(|&i| &self.blocks[i])
    }
}

fn branch_offset(inst: &DecodedInst) -> i64 {
    match inst.operands.last() {
        Some(Operand::Imm { value }) => *value,
        _ => 0,
    }
}

/// Discover all reachable basic blocks starting at `entry`.
pub fn build(mem: &dyn Memory, entry: u64) -> Cfg {
    let mut cfg = Cfg {
        entry,
        blocks: Vec::new(),
        index_by_addr: HashMap::new(),
    };

    let mut worklist = VecDeque::new();
    let mut leaders = HashSet::new();
    // Non-leader PC -> leader of the block that decoded it. Lets a late
    // leader split the block it lands inside of, keeping ranges disjoint.
    let mut interior: HashMap<u64, u64> = HashMap::new();
    worklist.push_back(entry);
    leaders.insert(entry);

    while let Some(start) = worklist.pop_front() {
        if cfg.index_by_addr.contains_key(&start) {
            continue;
        }
        if let Some(owner) = interior.get(&start).copied() {
            split_block(&mut cfg, &mut interior, owner, start);
        }

        let mut bb = BasicBlock {
            start,
            instrs: Vec::new(),
            term: TermKind::None,
            succs: Vec::new(),
        };

        let mut pc = start;
        loop {
            // Running into another leader splits the block.
            if pc != start && (leaders.contains(&pc) || cfg.index_by_addr.contains_key(&pc)) {
                bb.term = TermKind::Fallthrough;
                bb.succs.push(pc);
                if leaders.insert(pc) {
                    worklist.push_back(pc);
                }
                break;
            }

            let inst = match decoder::decode(mem, pc) {
                Ok(inst) => inst,
                Err(_) => {
                    bb.term = TermKind::Trap;
                    break;
                }
            };
            let inst_pc = inst.pc;
            let opcode = inst.opcode;
            let is_return = inst.is_return();
            let is_indirect = inst.is_indirect_jump();
            let off = branch_offset(&inst);
            if inst_pc != start {
                interior.insert(inst_pc, start);
            }
            bb.instrs.push(inst);

            if opcode.is_cond_branch() {
                let taken = inst_pc.wrapping_add(off as u64);
                let fall = inst_pc + 4;
                bb.term = TermKind::Branch;
                bb.succs = vec![taken, fall];
                for t in [taken, fall] {
                    if leaders.insert(t) {
                        worklist.push_back(t);
                    }
                }
                break;
            }
            if opcode == Opcode::JAL {
                let target = inst_pc.wrapping_add(off as u64);
                bb.term = TermKind::Jump;
                bb.succs = vec![target];
                if leaders.insert(target) {
                    worklist.push_back(target);
                }
                break;
            }
            if is_indirect {
                bb.term = TermKind::IndirectJump;
                break;
            }
            if is_return {
                bb.term = TermKind::Return;
                break;
            }
            if opcode.is_trap() {
                bb.term = TermKind::Trap;
                break;
            }

            pc += 4;
        }

        cfg.index_by_addr.insert(bb.start, cfg.blocks.len());
        cfg.blocks.push(bb);
    }

    debug!(
        "cfg: {} blocks discovered from entry 0x{:x}",
        cfg.blocks.len(),
        entry
    );
    cfg
}

/// Truncate `owner` at `at` so the new leader starts its own block. The
/// tail is re-decoded when the new leader is built; the truncated block
/// falls through into it.
fn split_block(cfg: &mut Cfg, interior: &mut HashMap<u64, u64>, owner: u64, at: u64) {
    let idx = cfg.index_by_addr[&owner];
    let bb = &mut cfg.blocks[idx];
    let keep = match bb.instrs.iter().position(|i| i.pc == at) {
        Some(pos) => pos,
        None => return,
    };
    for inst in &bb.instrs[keep..] {
        interior.remove(&inst.pc);
    }
    bb.instrs.truncate(keep);
    bb.term = TermKind::Fallthrough;
    bb.succs = vec![at];
}

/// Render one block for the `--cfg` dump.
pub fn format_block(bb: &BasicBlock) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "block @0x{:x}", bb.start);
    for inst in &bb.instrs {
        let _ = writeln!(out, "  0x{:x}: {}", inst.pc, inst);
    }
    let succs: Vec<String> = bb.succs.iter().map(|s| format!("0x{s:x}")).collect();
    let _ = writeln!(out, "  term {:?} [{}]", bb.term, succs.join(", "));
    out
}
