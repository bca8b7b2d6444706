// emit.rs - AArch64 assembly emission
//
// Produces a single translation unit: an entry thunk, the dispatch tables
// consumed by the runtime helper, and one labelled body per block.
//
// Runtime contract: x0 holds the guest state pointer (32 guest registers
// at offsets 0..255, then the memory base pointer at offset 256). The
// entry symbol and the indirect-jump helper take (state, target PC) in
// x0/x1. Block bodies clobber only pool registers, x1 and x21.

use crate::machine::{Block, Inst, Op, Operand, Terminator, VReg, MEM_BASE_STATE_OFFSET};
use crate::regalloc::RegAssignment;
use std::fmt::Write;

/// Entry symbol defined by the emitted unit
pub const ENTRY_SYMBOL: &str = "rv2a64_entry";
/// Runtime helper resolving indirect jumps
pub const INDIRECT_JUMP_SYMBOL: &str = "rv2a64_indirect_jump";

fn rx(p: i32) -> String {
    format!("x{p}")
}

fn rw(p: i32) -> String {
    format!("w{p}")
}

fn map_v(asg: &RegAssignment, v: VReg) -> i32 {
    asg.get(v)
        .unwrap_or_else(|| panic!("emit: v{v} has no assigned physical register"))
}

fn map_reg(asg: &RegAssignment, op: &Operand) -> i32 {
    match op {
        Operand::VReg(v) => map_v(asg, *v),
        Operand::PReg(p) => *p,
        other => panic!("emit: expected register operand, got {other:?}"),
    }
}

fn mem_str(asg: &RegAssignment, op: &Operand) -> String {
    match op {
        // Base 0 is the state pointer, pinned to x0.
        Operand::Mem { base: 0, offset } => format!("[x0, #{offset}]"),
        Operand::Mem { base, offset } => format!("[{}, #{offset}]", rx(map_v(asg, *base))),
        other => panic!("emit: expected memory operand, got {other:?}"),
    }
}

fn imm_of(op: &Operand) -> u64 {
    match op {
        Operand::Imm(v) => *v,
        other => panic!("emit: expected immediate operand, got {other:?}"),
    }
}

fn emit_inst(out: &mut String, inst: &Inst, asg: &RegAssignment) {
    let ops = &inst.operands;
    match inst.op {
        Op::Mov => {
            let pd = map_v(asg, match &ops[0] {
                Operand::VReg(v) => *v,
                other => panic!("emit: mov destination must be a vreg, got {other:?}"),
            });
            match &ops[1] {
                Operand::VReg(_) | Operand::PReg(_) => {
                    let ps = map_reg(asg, &ops[1]);
                    let _ = writeln!(out, "  mov {}, {}", rx(pd), rx(ps));
                }
                Operand::Imm(v) => {
                    let _ = writeln!(out, "  mov {}, #{v}", rx(pd));
                }
                other => panic!("emit: bad mov source {other:?}"),
            }
        }
        Op::MovZ => {
            let pd = map_reg(asg, &ops[0]);
            let _ = writeln!(out, "  movz {}, #{}", rx(pd), imm_of(&ops[1]));
        }
        Op::MovK => {
            let pd = map_reg(asg, &ops[0]);
            let _ = writeln!(
                out,
                "  movk {}, #{}, lsl #{}",
                rx(pd),
                imm_of(&ops[1]),
                imm_of(&ops[2])
            );
        }
        Op::Add | Op::Sub | Op::And | Op::Orr | Op::Eor | Op::Lsl | Op::Lsr | Op::Asr => {
            let mn = match inst.op {
                Op::Add => "add",
                Op::Sub => "sub",
                Op::And => "and",
                Op::Orr => "orr",
                Op::Eor => "eor",
                Op::Lsl => "lsl",
                Op::Lsr => "lsr",
                _ => "asr",
            };
            let pd = map_reg(asg, &ops[0]);
            let pa = map_reg(asg, &ops[1]);
            let pb = map_reg(asg, &ops[2]);
            let _ = writeln!(out, "  {mn} {}, {}, {}", rx(pd), rx(pa), rx(pb));
        }
        Op::AddW | Op::SubW | Op::LslW | Op::LsrW | Op::AsrW => {
            let mn = match inst.op {
                Op::AddW => "add",
                Op::SubW => "sub",
                Op::LslW => "lsl",
                Op::LsrW => "lsr",
                _ => "asr",
            };
            let pd = map_reg(asg, &ops[0]);
            let pa = map_reg(asg, &ops[1]);
            let pb = map_reg(asg, &ops[2]);
            let _ = writeln!(out, "  {mn} {}, {}, {}", rw(pd), rw(pa), rw(pb));
        }
        Op::LdrX | Op::LdrW | Op::LdrH | Op::LdrB => {
            let pd = map_reg(asg, &ops[0]);
            let (mn, reg) = match inst.op {
                Op::LdrX => ("ldr", rx(pd)),
                Op::LdrW => ("ldr", rw(pd)),
                Op::LdrH => ("ldrh", rw(pd)),
                _ => ("ldrb", rw(pd)),
            };
            let _ = writeln!(out, "  {mn} {reg}, {}", mem_str(asg, &ops[1]));
        }
        Op::StrX | Op::StrW | Op::StrH | Op::StrB => {
            let pv = map_reg(asg, &ops[0]);
            let (mn, reg) = match inst.op {
                Op::StrX => ("str", rx(pv)),
                Op::StrW => ("str", rw(pv)),
                Op::StrH => ("strh", rw(pv)),
                _ => ("strb", rw(pv)),
            };
            let _ = writeln!(out, "  {mn} {reg}, {}", mem_str(asg, &ops[1]));
        }
        Op::Cmp => {
            let pa = map_reg(asg, &ops[0]);
            let pb = map_reg(asg, &ops[1]);
            let _ = writeln!(out, "  cmp {}, {}", rx(pa), rx(pb));
        }
        Op::Cset(cond) => {
            let pd = map_reg(asg, &ops[0]);
            let _ = writeln!(out, "  cset {}, {}", rx(pd), cond.mnemonic());
        }
        Op::Sxtb | Op::Sxth | Op::Sxtw => {
            let mn = match inst.op {
                Op::Sxtb => "sxtb",
                Op::Sxth => "sxth",
                _ => "sxtw",
            };
            let pd = map_reg(asg, &ops[0]);
            let ps = map_reg(asg, &ops[1]);
            let _ = writeln!(out, "  {mn} {}, {}", rx(pd), rw(ps));
        }
        Op::Uxtw => {
            // Writing a w-register zero-extends into the full x-register.
            let pd = map_reg(asg, &ops[0]);
            let ps = map_reg(asg, &ops[1]);
            let _ = writeln!(out, "  mov {}, {}", rw(pd), rw(ps));
        }
    }
}

fn emit_terminator(out: &mut String, term: &Terminator, asg: &RegAssignment) {
    match term {
        Terminator::Br { target } => {
            let _ = writeln!(out, "  b {target}");
        }
        Terminator::CBr { cond, t, f } => {
            let pc = map_v(asg, *cond);
            let _ = writeln!(out, "  cmp {}, #0", rx(pc));
            let _ = writeln!(out, "  b.ne {t}");
            let _ = writeln!(out, "  b {f}");
        }
        Terminator::BrIndirect { target } => {
            let pt = map_v(asg, *target);
            let _ = writeln!(out, "  mov x1, {}", rx(pt));
            let _ = writeln!(out, "  bl {INDIRECT_JUMP_SYMBOL}");
        }
        Terminator::Ret => {
            let _ = writeln!(out, "  ret");
        }
        Terminator::Trap => {
            let _ = writeln!(out, "  brk #0");
        }
        Terminator::None => {}
    }
}

/// Emit the whole translation unit. `assignments` parallels `blocks`.
pub fn emit(blocks: &[Block], assignments: &[RegAssignment], entry_pc: u64) -> String {
    let mut s = String::new();

    let _ = writeln!(s, ".text");
    let _ = writeln!(s, ".global {ENTRY_SYMBOL}");
    let _ = writeln!(s, "// x0 = guest state pointer; x1 = start guest PC");
    let _ = writeln!(s, "{ENTRY_SYMBOL}:");
    let _ = writeln!(s, "  mov x19, x30");
    let _ = writeln!(s, "  bl {INDIRECT_JUMP_SYMBOL}");
    let _ = writeln!(s, "  ret x19");
    let _ = writeln!(s);

    let _ = writeln!(s, ".data");
    let _ = writeln!(s, ".align 3");
    let _ = writeln!(s, ".global rv2a64_entry_pc");
    let _ = writeln!(s, "rv2a64_entry_pc:");
    let _ = writeln!(s, "  .quad 0x{entry_pc:x}");
    let _ = writeln!(s, ".global rv2a64_num_blocks");
    let _ = writeln!(s, "rv2a64_num_blocks:");
    let _ = writeln!(s, "  .quad {}", blocks.len());
    let _ = writeln!(s, ".global rv2a64_block_addrs");
    let _ = writeln!(s, "rv2a64_block_addrs:");
    for b in blocks {
        let _ = writeln!(s, "  .quad 0x{:x}", b.guest_pc);
    }
    let _ = writeln!(s, ".global rv2a64_block_ptrs");
    let _ = writeln!(s, "rv2a64_block_ptrs:");
    for b in blocks {
        let _ = writeln!(s, "  .quad __block_{:x}", b.guest_pc);
    }
    let _ = writeln!(s);
    let _ = writeln!(s, ".text");

    for (b, asg) in blocks.iter().zip(assignments) {
        let _ = writeln!(s, "__block_{:x}:", b.guest_pc);
        // Reload the guest memory base; blocks may be entered from the
        // dispatcher with x21 clobbered.
        let _ = writeln!(s, "  ldr x21, [x0, #{MEM_BASE_STATE_OFFSET}]");
        for inst in &b.instrs {
            emit_inst(&mut s, inst, asg);
        }
        emit_terminator(&mut s, &b.term, asg);
        let _ = writeln!(s);
    }

    s
}
