// rv2a64 - RISC-V to AArch64 static binary translator
//
// This library translates RV64I ELF executables into a single AArch64
// assembly translation unit that, linked against the small C runtime in
// runtime/, executes the guest program natively.
//
// # Architecture
//
// The translator works in several phases:
//
// 1. **ELF loading** (`elf.rs`): parse the binary, expose instruction
//    bytes at guest virtual addresses
// 2. **Decoding** (`decoder.rs`): 32-bit words to structured instructions
// 3. **CFG discovery** (`cfg.rs`): worklist traversal from the entry PC
// 4. **Lifting** (`lifter.rs`): basic blocks to typed, block-local IR
// 5. **Selection** (`isel.rs`): IR to AArch64 over virtual registers
// 6. **Liveness + allocation** (`liveness.rs`, `regalloc.rs`): per-block
//    linear scan onto a fixed physical pool
// 7. **Emission** (`emit.rs`): one assembly unit with dispatch tables
//
// # Runtime model
//
// Emitted code receives a guest-state pointer in x0: the 32 guest
// registers as 8-byte words at offsets 0..255, then the guest memory base
// at offset 256. Indirect jumps funnel through the runtime's
// `rv2a64_indirect_jump(state, target_pc)`, which resolves the target in
// the emitted block tables. Traps execute `brk #0`.

pub mod cfg;
pub mod decoder;
pub mod elf;
pub mod emit;
pub mod ir;
pub mod isel;
pub mod lifter;
pub mod liveness;
pub mod machine;
pub mod regalloc;

#[cfg(test)]
mod testutil;

pub use cfg::{BasicBlock, Cfg, TermKind};
pub use decoder::{DecodeError, DecodedInst, Opcode, Operand};
pub use elf::{ElfImage, Memory, SpanMemory};

use anyhow::Result;

/// Translate everything reachable from `entry` into one assembly unit.
pub fn translate(mem: &dyn Memory, entry: u64) -> String {
    let graph = cfg::build(mem, entry);

    let mut blocks = Vec::with_capacity(graph.blocks.len());
    let mut assignments = Vec::with_capacity(graph.blocks.len());
    for addr in graph.addrs_in_order() {
        let bb = graph.block_at(addr).expect("leader has a block");
        let irbb = lifter::lift(bb);
        let mb = isel::select(&irbb);
        let live = liveness::analyze(&mb);
        let asg = regalloc::allocate(&mb, &live);
        blocks.push(mb);
        assignments.push(asg);
    }

    emit::emit(&blocks, &assignments, entry)
}

/// Translate a RISC-V ELF binary to AArch64 assembly.
pub fn translate_elf(data: &[u8]) -> Result<String> {
    let image = elf::parse(data)?;
    let entry = image.entry;
    Ok(translate(&image, entry))
}
