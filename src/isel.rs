// isel.rs - instruction selection
//
// Lowers an IR block to AArch64 machine instructions over virtual
// registers. Guest registers live in the state block behind the sentinel
// base (VReg 0); guest memory accesses add the reserved memory-base
// register into a fresh address vreg and keep the IR displacement.

use crate::ir::{self, BinOpKind, CmpCond, Payload, Type};
use crate::machine::{self, block_label, Cond, Inst, Op, Operand, VReg, MEM_BASE_REG};

fn guest_reg_offset(reg: u8) -> i32 {
    i32::from(reg) * 8
}

/// ValueId -> VReg table. Fresh vregs are handed out on first touch; 0 is
/// reserved for the state pointer and never produced.
struct VRegMap {
    map: Vec<Option<VReg>>,
    next: VReg,
}

impl VRegMap {
    fn new(len: usize) -> Self {
        VRegMap {
            map: vec![None; len],
            next: 1,
        }
    }

    fn vreg_of(&mut self, id: ir::ValueId) -> VReg {
        let slot = self
            .map
            .get_mut(id as usize)
            .unwrap_or_else(|| panic!("isel: value %{id} out of range"));
        *slot.get_or_insert_with(|| {
            let v = self.next;
            self.next += 1;
            v
        })
    }

    /// Temporary vreg with no IR value behind it (address computations)
    fn fresh(&mut self) -> VReg {
        let v = self.next;
        self.next += 1;
        v
    }
}

fn dest_of(inst: &ir::Inst) -> ir::ValueId {
    inst.dest
        .unwrap_or_else(|| panic!("isel: missing dest on {:?}", inst.payload))
}

/// Materialise a 64-bit constant: one `mov` when it fits in 16 bits,
/// otherwise movz for the low half-word and movk for each non-zero slice.
fn emit_const(instrs: &mut Vec<Inst>, vd: VReg, value: u64) {
    if value >> 16 == 0 {
        instrs.push(Inst::new(Op::Mov, vec![Operand::VReg(vd), Operand::Imm(value)]));
        return;
    }
    instrs.push(Inst::new(
        Op::MovZ,
        vec![Operand::VReg(vd), Operand::Imm(value & 0xffff)],
    ));
    for shift in [16u64, 32, 48] {
        let slice = (value >> shift) & 0xffff;
        if slice != 0 {
            instrs.push(Inst::new(
                Op::MovK,
                vec![Operand::VReg(vd), Operand::Imm(slice), Operand::Imm(shift)],
            ));
        }
    }
}

fn binop_op(kind: BinOpKind, ty: Type) -> Op {
    let wide = ty != Type::I32;
    match kind {
        BinOpKind::Add => {
            if wide {
                Op::Add
            } else {
                Op::AddW
            }
        }
        BinOpKind::Sub => {
            if wide {
                Op::Sub
            } else {
                Op::SubW
            }
        }
        BinOpKind::Shl => {
            if wide {
                Op::Lsl
            } else {
                Op::LslW
            }
        }
        BinOpKind::LShr => {
            if wide {
                Op::Lsr
            } else {
                Op::LsrW
            }
        }
        BinOpKind::AShr => {
            if wide {
                Op::Asr
            } else {
                Op::AsrW
            }
        }
        BinOpKind::And => Op::And,
        BinOpKind::Or => Op::Orr,
        BinOpKind::Xor => Op::Eor,
    }
}

fn cset_cond(cond: CmpCond) -> Cond {
    match cond {
        CmpCond::Eq => Cond::Eq,
        CmpCond::Ne => Cond::Ne,
        CmpCond::Ult => Cond::Lo,
        CmpCond::Ule => Cond::Ls,
        CmpCond::Ugt => Cond::Hi,
        CmpCond::Uge => Cond::Hs,
        CmpCond::Slt => Cond::Lt,
        CmpCond::Sle => Cond::Le,
        CmpCond::Sgt => Cond::Gt,
        CmpCond::Sge => Cond::Ge,
    }
}

fn load_op(ty: Type) -> Op {
    match ty {
        Type::I64 => Op::LdrX,
        Type::I32 => Op::LdrW,
        Type::I16 => Op::LdrH,
        Type::I1 | Type::I8 => Op::LdrB,
    }
}

fn store_op(ty: Type) -> Op {
    match ty {
        Type::I64 => Op::StrX,
        Type::I32 => Op::StrW,
        Type::I16 => Op::StrH,
        Type::I1 | Type::I8 => Op::StrB,
    }
}

/// Sign-extension width depends on what produced the source; a narrow load
/// keeps only its low bits meaningful. ValueIds are dense indices, so the
/// defining instruction is a direct lookup.
fn sext_op(bb: &ir::Block, src: ir::ValueId) -> Op {
    match bb.insts.get(src as usize).map(|i| &i.payload) {
        Some(Payload::Load { ty: Type::I8, .. }) => Op::Sxtb,
        Some(Payload::Load { ty: Type::I16, .. }) => Op::Sxth,
        _ => Op::Sxtw,
    }
}

/// Select one IR block into a machine block over virtual registers.
pub fn select(bb: &ir::Block) -> machine::Block {
    let mut out = machine::Block {
        guest_pc: bb.start,
        instrs: Vec::new(),
        term: machine::Terminator::None,
    };
    let mut vmap = VRegMap::new(bb.insts.len());

    for inst in &bb.insts {
        match &inst.payload {
            Payload::Const { value, .. } => {
                let vd = vmap.vreg_of(dest_of(inst));
                emit_const(&mut out.instrs, vd, *value);
            }
            Payload::ReadReg { reg } => {
                let vd = vmap.vreg_of(dest_of(inst));
                out.instrs.push(Inst::new(
                    Op::LdrX,
                    vec![
                        Operand::VReg(vd),
                        Operand::Mem {
                            base: 0,
                            offset: guest_reg_offset(*reg),
                        },
                    ],
                ));
            }
            Payload::WriteReg { reg, value } => {
                let vs = vmap.vreg_of(*value);
                out.instrs.push(Inst::new(
                    Op::StrX,
                    vec![
                        Operand::VReg(vs),
                        Operand::Mem {
                            base: 0,
                            offset: guest_reg_offset(*reg),
                        },
                    ],
                ));
            }
            Payload::BinOp { kind, lhs, rhs, ty } => {
                let vd = vmap.vreg_of(dest_of(inst));
                let va = vmap.vreg_of(*lhs);
                let vb = vmap.vreg_of(*rhs);
                out.instrs.push(Inst::new(
                    binop_op(*kind, *ty),
                    vec![Operand::VReg(vd), Operand::VReg(va), Operand::VReg(vb)],
                ));
            }
            Payload::ICmp { cond, lhs, rhs } => {
                let va = vmap.vreg_of(*lhs);
                let vb = vmap.vreg_of(*rhs);
                out.instrs.push(Inst::new(
                    Op::Cmp,
                    vec![Operand::VReg(va), Operand::VReg(vb)],
                ));
                let vd = vmap.vreg_of(dest_of(inst));
                out.instrs.push(Inst::new(
                    Op::Cset(cset_cond(*cond)),
                    vec![Operand::VReg(vd)],
                ));
            }
            Payload::ZExt { src, to } => {
                let vd = vmap.vreg_of(dest_of(inst));
                let vs = vmap.vreg_of(*src);
                let op = if *to == Type::I64 { Op::Uxtw } else { Op::Mov };
                out.instrs
                    .push(Inst::new(op, vec![Operand::VReg(vd), Operand::VReg(vs)]));
            }
            Payload::SExt { src, to } => {
                let vd = vmap.vreg_of(dest_of(inst));
                let vs = vmap.vreg_of(*src);
                let op = if *to == Type::I64 {
                    sext_op(bb, *src)
                } else {
                    Op::Mov
                };
                out.instrs
                    .push(Inst::new(op, vec![Operand::VReg(vd), Operand::VReg(vs)]));
            }
            Payload::Trunc { src, .. } => {
                let vd = vmap.vreg_of(dest_of(inst));
                let vs = vmap.vreg_of(*src);
                out.instrs
                    .push(Inst::new(Op::Mov, vec![Operand::VReg(vd), Operand::VReg(vs)]));
            }
            Payload::Load { base, offset, ty } => {
                let vd = vmap.vreg_of(dest_of(inst));
                let vbase = vmap.vreg_of(*base);
                let vaddr = vmap.fresh();
                out.instrs.push(Inst::new(
                    Op::Add,
                    vec![
                        Operand::VReg(vaddr),
                        Operand::VReg(vbase),
                        Operand::PReg(MEM_BASE_REG),
                    ],
                ));
                out.instrs.push(Inst::new(
                    load_op(*ty),
                    vec![
                        Operand::VReg(vd),
                        Operand::Mem {
                            base: vaddr,
                            offset: *offset as i32,
                        },
                    ],
                ));
            }
            Payload::Store {
                value,
                base,
                offset,
                ty,
            } => {
                let vs = vmap.vreg_of(*value);
                let vbase = vmap.vreg_of(*base);
                let vaddr = vmap.fresh();
                out.instrs.push(Inst::new(
                    Op::Add,
                    vec![
                        Operand::VReg(vaddr),
                        Operand::VReg(vbase),
                        Operand::PReg(MEM_BASE_REG),
                    ],
                ));
                out.instrs.push(Inst::new(
                    store_op(*ty),
                    vec![
                        Operand::VReg(vs),
                        Operand::Mem {
                            base: vaddr,
                            offset: *offset as i32,
                        },
                    ],
                ));
            }
            Payload::GetPC => {
                let vd = vmap.vreg_of(dest_of(inst));
                emit_const(&mut out.instrs, vd, bb.start);
            }
        }
    }

    out.term = match &bb.term {
        ir::Terminator::None => machine::Terminator::None,
        ir::Terminator::Br { target } => machine::Terminator::Br {
            target: block_label(*target),
        },
        ir::Terminator::CBr { cond, t, f } => machine::Terminator::CBr {
            cond: vmap.vreg_of(*cond),
            t: block_label(*t),
            f: block_label(*f),
        },
        ir::Terminator::BrIndirect { target } => machine::Terminator::BrIndirect {
            target: vmap.vreg_of(*target),
        },
        ir::Terminator::Ret => machine::Terminator::Ret,
        ir::Terminator::Trap => machine::Terminator::Trap,
    };

    out
}
