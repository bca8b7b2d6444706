// elf.rs - ELF binary loading for RISC-V executables
//
// Uses goblin for parsing. The translator only needs instruction bytes at
// guest virtual addresses, so the image is reduced to the executable
// sections plus the entry PC.

use anyhow::{Context, Result};
use goblin::elf::Elf;

/// Byte-addressable source of 32-bit instruction words, little-endian.
pub trait Memory {
    /// Read one 32-bit word at `addr`. `None` if the address is unmapped.
    fn read32(&self, addr: u64) -> Option<u32>;
}

/// An executable section mapped at a guest virtual address
#[derive(Debug, Clone)]
pub struct ExecSection {
    /// Virtual address of the first byte
    pub vaddr: u64,
    /// Section bytes
    pub data: Vec<u8>,
    /// Section name (".text" etc.)
    pub name: String,
}

/// A loaded RISC-V executable image
#[derive(Debug)]
pub struct ElfImage {
    /// Entry point PC
    pub entry: u64,
    /// Executable sections, in file order
    pub sections: Vec<ExecSection>,
}

/// Parse an ELF buffer into an image
pub fn parse(data: &[u8]) -> Result<ElfImage> {
    let elf = Elf::parse(data).context("Invalid ELF format")?;

    if elf.header.e_machine != goblin::elf::header::EM_RISCV {
        anyhow::bail!(
            "Not a RISC-V binary (e_machine=0x{:x})",
            elf.header.e_machine
        );
    }
    if !elf.is_64 {
        anyhow::bail!("Only 64-bit RISC-V (RV64) is supported");
    }
    if !elf.little_endian {
        anyhow::bail!("Only little-endian RISC-V is supported");
    }

    // Collect executable sections (SHF_EXECINSTR)
    let mut sections = Vec::new();
    for section in &elf.section_headers {
        if section.sh_flags & u64::from(goblin::elf::section_header::SHF_EXECINSTR) == 0 {
            continue;
        }
        let start = section.sh_offset as usize;
        let end = start + section.sh_size as usize;
        if end > data.len() {
            continue;
        }
        let name = elf
            .shdr_strtab
            .get_at(section.sh_name)
            .unwrap_or("")
            .to_string();
        sections.push(ExecSection {
            vaddr: section.sh_addr,
            data: data[start..end].to_vec(),
            name,
        });
    }

    if sections.is_empty() {
        anyhow::bail!("No executable sections found");
    }

    Ok(ElfImage {
        entry: elf.entry,
        sections,
    })
}

impl ElfImage {
    fn read(&self, addr: u64, n: usize) -> Option<&[u8]> {
        for s in &self.sections {
            if addr < s.vaddr {
                continue;
            }
            let off = (addr - s.vaddr) as usize;
            if off + n > s.data.len() {
                continue;
            }
            return Some(&s.data[off..off + n]);
        }
        None
    }
}

impl Memory for ElfImage {
    fn read32(&self, addr: u64) -> Option<u32> {
        let b = self.read(addr, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Buffer-backed memory at a fixed base address, for tests and raw images
#[derive(Debug, Clone)]
pub struct SpanMemory {
    base: u64,
    data: Vec<u8>,
}

impl SpanMemory {
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        SpanMemory { base, data }
    }
}

impl Memory for SpanMemory {
    fn read32(&self, addr: u64) -> Option<u32> {
        if addr < self.base {
            return None;
        }
        let off = (addr - self.base) as usize;
        if off + 4 > self.data.len() {
            return None;
        }
        let b = &self.data[off..off + 4];
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
