// regalloc.rs - block-local linear scan
//
// Classical linear scan over intervals sorted by start. No spill path:
// running out of registers is a translator defect or a block beyond the
// supported subset, and both are fatal.

use crate::liveness::{LiveRange, LivenessMap};
use crate::machine::{Block, PReg, VReg};
use std::collections::HashMap;

/// Allocatable pool. x0 (state), x1 (indirect-jump argument), x19 (saved
/// return address), x21 (memory base), x29 (frame), x30 (link) and x31
/// (sp/zero) stay reserved.
pub const POOL: [PReg; 25] = [
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 20, 22, 23, 24, 25, 26, 27, 28,
];

/// VReg -> PReg mapping, valid only for the block it was computed for
#[derive(Debug, Default)]
pub struct RegAssignment {
    pub v2p: HashMap<VReg, PReg>,
}

impl RegAssignment {
    pub fn get(&self, v: VReg) -> Option<PReg> {
        self.v2p.get(&v).copied()
    }
}

/// Allocate physical registers for every live interval of `b`.
pub fn allocate(b: &Block, live: &LivenessMap) -> RegAssignment {
    allocate_from_pool(b, live, &POOL)
}

/// Linear scan against an explicit pool (tests shrink it).
pub fn allocate_from_pool(b: &Block, live: &LivenessMap, pool: &[PReg]) -> RegAssignment {
    struct Item {
        v: VReg,
        lr: LiveRange,
    }

    let mut items: Vec<Item> = live
        .iter()
        .map(|(&v, &lr)| Item { v, lr })
        .collect();
    items.sort_by_key(|it| (it.lr.start, it.v));

    struct Active {
        p: PReg,
        lr: LiveRange,
    }

    let mut free: Vec<PReg> = pool.to_vec();
    let mut active: Vec<Active> = Vec::new();
    let mut asg = RegAssignment::default();

    for it in items {
        // Expired intervals return their register to the pool.
        active.retain(|a| {
            if a.lr.end <= it.lr.start {
                free.push(a.p);
                false
            } else {
                true
            }
        });

        let p = free.pop().unwrap_or_else(|| {
            panic!(
                "regalloc: out of physical registers in block 0x{:x}; v{} cannot be assigned",
                b.guest_pc, it.v
            )
        });
        asg.v2p.insert(it.v, p);
        active.push(Active { p, lr: it.lr });
    }

    asg
}
