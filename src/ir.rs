// ir.rs - block-local intermediate representation
//
// Values are referenced by dense ValueIds indexing the block's instruction
// vector, so a ValueId doubles as the position of its defining instruction.
// Everything is block-local; nothing crosses block boundaries.

use std::fmt;

/// IR value types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    I1,
    I8,
    I16,
    I32,
    I64,
}

/// Block-local value id; also the index of the defining instruction
pub type ValueId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpCond {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

/// Instruction payload. Producing variants must carry a dest in their
/// `Inst`; WriteReg and Store must not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Const {
        ty: Type,
        value: u64,
    },
    ReadReg {
        reg: u8,
    },
    WriteReg {
        reg: u8,
        value: ValueId,
    },
    BinOp {
        kind: BinOpKind,
        lhs: ValueId,
        rhs: ValueId,
        ty: Type,
    },
    /// Produces i1
    ICmp {
        cond: CmpCond,
        lhs: ValueId,
        rhs: ValueId,
    },
    ZExt {
        src: ValueId,
        to: Type,
    },
    SExt {
        src: ValueId,
        to: Type,
    },
    Trunc {
        src: ValueId,
        to: Type,
    },
    /// addr = base + offset
    Load {
        base: ValueId,
        offset: i64,
        ty: Type,
    },
    Store {
        value: ValueId,
        base: ValueId,
        offset: i64,
        ty: Type,
    },
    /// Yields the block's starting PC
    GetPC,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub dest: Option<ValueId>,
    pub payload: Payload,
}

/// The single control-transferring element at the end of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    None,
    Br { target: u64 },
    CBr { cond: ValueId, t: u64, f: u64 },
    BrIndirect { target: ValueId },
    Ret,
    Trap,
}

#[derive(Debug, Clone)]
pub struct Block {
    /// Guest PC of the block's first instruction
    pub start: u64,
    pub insts: Vec<Inst>,
    pub term: Terminator,
}

fn ty_str(ty: Type) -> &'static str {
    match ty {
        Type::I1 => "i1",
        Type::I8 => "i8",
        Type::I16 => "i16",
        Type::I32 => "i32",
        Type::I64 => "i64",
    }
}

fn binop_str(kind: BinOpKind) -> &'static str {
    match kind {
        BinOpKind::Add => "add",
        BinOpKind::Sub => "sub",
        BinOpKind::And => "and",
        BinOpKind::Or => "or",
        BinOpKind::Xor => "xor",
        BinOpKind::Shl => "shl",
        BinOpKind::LShr => "lshr",
        BinOpKind::AShr => "ashr",
    }
}

fn cond_str(cond: CmpCond) -> &'static str {
    match cond {
        CmpCond::Eq => "eq",
        CmpCond::Ne => "ne",
        CmpCond::Ult => "ult",
        CmpCond::Ule => "ule",
        CmpCond::Ugt => "ugt",
        CmpCond::Uge => "uge",
        CmpCond::Slt => "slt",
        CmpCond::Sle => "sle",
        CmpCond::Sgt => "sgt",
        CmpCond::Sge => "sge",
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block @0x{:x}", self.start)?;
        for inst in &self.insts {
            write!(f, "  ")?;
            if let Some(d) = inst.dest {
                write!(f, "%{d} = ")?;
            }
            match &inst.payload {
                Payload::Const { ty, value } => write!(f, "const {} {}", ty_str(*ty), value)?,
                Payload::ReadReg { reg } => write!(f, "readreg x{reg}")?,
                Payload::WriteReg { reg, value } => write!(f, "writereg x{reg}, %{value}")?,
                Payload::BinOp { kind, lhs, rhs, ty } => {
                    write!(f, "{} {} %{lhs}, %{rhs}", binop_str(*kind), ty_str(*ty))?
                }
                Payload::ICmp { cond, lhs, rhs } => {
                    write!(f, "icmp {} %{lhs}, %{rhs}", cond_str(*cond))?
                }
                Payload::ZExt { src, to } => write!(f, "zext %{src} to {}", ty_str(*to))?,
                Payload::SExt { src, to } => write!(f, "sext %{src} to {}", ty_str(*to))?,
                Payload::Trunc { src, to } => write!(f, "trunc %{src} to {}", ty_str(*to))?,
                Payload::Load { base, offset, ty } => {
                    write!(f, "load {}, base=%{base}, off={offset}", ty_str(*ty))?
                }
                Payload::Store {
                    value,
                    base,
                    offset,
                    ty,
                } => write!(
                    f,
                    "store {}, %{value}, base=%{base}, off={offset}",
                    ty_str(*ty)
                )?,
                Payload::GetPC => write!(f, "get_pc")?,
            }
            writeln!(f)?;
        }
        match &self.term {
            Terminator::None => writeln!(f, "  term none"),
            Terminator::Br { target } => writeln!(f, "  term br @0x{target:x}"),
            Terminator::CBr { cond, t, f: fl } => {
                writeln!(f, "  term cbr %{cond}, @0x{t:x}, @0x{fl:x}")
            }
            Terminator::BrIndirect { target } => writeln!(f, "  term br_indirect %{target}"),
            Terminator::Ret => writeln!(f, "  term ret"),
            Terminator::Trap => writeln!(f, "  term trap"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_values_and_term() {
        let bb = Block {
            start: 0x1000,
            insts: vec![
                Inst {
                    dest: Some(0),
                    payload: Payload::ReadReg { reg: 6 },
                },
                Inst {
                    dest: Some(1),
                    payload: Payload::Const {
                        ty: Type::I64,
                        value: 42,
                    },
                },
                Inst {
                    dest: Some(2),
                    payload: Payload::BinOp {
                        kind: BinOpKind::Add,
                        lhs: 0,
                        rhs: 1,
                        ty: Type::I64,
                    },
                },
                Inst {
                    dest: None,
                    payload: Payload::WriteReg { reg: 5, value: 2 },
                },
            ],
            term: Terminator::Br { target: 0x1004 },
        };
        let s = bb.to_string();
        assert!(s.contains("block @0x1000"));
        assert!(s.contains("%0 = readreg x6"));
        assert!(s.contains("%1 = const i64 42"));
        assert!(s.contains("%2 = add i64 %0, %1"));
        assert!(s.contains("writereg x5, %2"));
        assert!(s.contains("term br @0x1004"));
    }
}
