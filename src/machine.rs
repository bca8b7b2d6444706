// machine.rs - AArch64 machine instruction data model
//
// Machine blocks carry virtual registers until allocation. VReg 0 is a
// sentinel for the guest-state pointer (the first argument register) and
// is never allocated.

/// Virtual register id; 0 is the state-pointer sentinel
pub type VReg = u32;

/// Physical register index, 0..30 for x0..x30
pub type PReg = i32;

/// State pointer lives in x0 for the whole block
pub const STATE_REG: PReg = 0;
/// Indirect-jump target argument
pub const INDIRECT_ARG_REG: PReg = 1;
/// Holds the host return address across the entry thunk
pub const RA_SAVE_REG: PReg = 19;
/// Guest-to-host memory addressing base, reloaded in every block prologue
pub const MEM_BASE_REG: PReg = 21;

/// Byte offset of the memory base pointer in the guest state, right after
/// the 32 guest registers.
pub const MEM_BASE_STATE_OFFSET: i32 = 256;

/// AArch64 condition codes used by cset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lo,
    Ls,
    Hi,
    Hs,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cond {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lo => "lo",
            Cond::Ls => "ls",
            Cond::Hi => "hi",
            Cond::Hs => "hs",
            Cond::Lt => "lt",
            Cond::Le => "le",
            Cond::Gt => "gt",
            Cond::Ge => "ge",
        }
    }
}

/// Target mnemonics. W-suffixed forms operate on 32-bit views and exist
/// for the RISC-V W-form instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Mov,
    MovZ,
    MovK,
    Add,
    Sub,
    And,
    Orr,
    Eor,
    Lsl,
    Lsr,
    Asr,
    AddW,
    SubW,
    LslW,
    LsrW,
    AsrW,
    LdrX,
    LdrW,
    LdrH,
    LdrB,
    StrX,
    StrW,
    StrH,
    StrB,
    Cmp,
    Cset(Cond),
    Sxtb,
    Sxth,
    Sxtw,
    Uxtw,
}

/// Machine operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Virtual register (0 = state-pointer sentinel)
    VReg(VReg),
    /// Pre-assigned physical register
    PReg(PReg),
    /// Immediate
    Imm(u64),
    /// [base, #offset]; base 0 emits the state register
    Mem { base: VReg, offset: i32 },
    /// Branch label
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub op: Op,
    pub operands: Vec<Operand>,
}

impl Inst {
    pub fn new(op: Op, operands: Vec<Operand>) -> Self {
        Inst { op, operands }
    }
}

/// Machine-level terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    None,
    Br { target: String },
    CBr { cond: VReg, t: String, f: String },
    BrIndirect { target: VReg },
    Ret,
    Trap,
}

/// One translated block over virtual registers
#[derive(Debug, Clone)]
pub struct Block {
    /// Guest PC this block was translated from
    pub guest_pc: u64,
    pub instrs: Vec<Inst>,
    pub term: Terminator,
}

/// Label of the emitted block for a guest PC
pub fn block_label(pc: u64) -> String {
    format!("__block_{pc:x}")
}
