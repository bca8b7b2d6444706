// liveness.rs - per-block live intervals
//
// One forward walk. Positions count instructions from 0; the terminator
// occupies position instrs.len(). An interval is inclusive on both ends,
// so a defined-but-unused vreg occupies exactly its definition position.

use crate::machine::{Block, Operand, Terminator, VReg};
use std::collections::HashMap;

/// Inclusive live interval within a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: u32,
    pub end: u32,
}

pub type LivenessMap = HashMap<VReg, LiveRange>;

fn touch(map: &mut LivenessMap, v: VReg, pos: u32) {
    // VReg 0 is the state pointer, not an allocatable register.
    if v == 0 {
        return;
    }
    let lr = map.entry(v).or_insert(LiveRange {
        start: pos,
        end: pos,
    });
    lr.start = lr.start.min(pos);
    lr.end = lr.end.max(pos);
}

/// Compute the live interval of every virtual register in the block.
pub fn analyze(b: &Block) -> LivenessMap {
    let mut map = LivenessMap::new();

    for (pos, inst) in b.instrs.iter().enumerate() {
        let pos = pos as u32;
        for op in &inst.operands {
            match op {
                Operand::VReg(v) => touch(&mut map, *v, pos),
                Operand::Mem { base, .. } => touch(&mut map, *base, pos),
                Operand::PReg(_) | Operand::Imm(_) | Operand::Label(_) => {}
            }
        }
    }

    let term_pos = b.instrs.len() as u32;
    match &b.term {
        Terminator::CBr { cond, .. } => touch(&mut map, *cond, term_pos),
        Terminator::BrIndirect { target } => touch(&mut map, *target, term_pos),
        _ => {}
    }

    map
}
