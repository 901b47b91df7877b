// Bytecode model: opcode set, operand encodings, the builder and the
// executable CodeBlock with its trailing metadata.
//
// Every bytecode is a 1-byte opcode followed by fixed-position operands,
// little-endian, unaligned:
//
//   slot            u16     frame-relative value slot
//   constant        u16     ordinal into the function's 64-bit constant table
//   literal         as declared (u8 / i16 / u16)
//   branch offset   i16 (conditional and near unconditional) or i32 (far),
//                   relative to the start of the branching bytecode
//   metadata field  u32     patched at link time to an offset into the
//                           CodeBlock trailing region

pub mod builder;
pub mod code_block;
pub mod loader;

pub use builder::{BytecodeBuilder, Operand};
pub use code_block::{CodeBlock, UnlinkedCodeBlock, UpvalueMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Mov,              // src:u16 dst:u16
    LoadConstant,     // cst:u16 dst:u16
    SetConstInt16,    // imm:i16 dst:u16
    RangeFillNils,    // base:u16 num:u16

    // Arithmetic: VV {lhs:u16 rhs:u16 dst:u16}, VC {lhs:u16 cst:u16 dst:u16},
    // CV {cst:u16 rhs:u16 dst:u16}
    AddVV, AddVC, AddCV,
    SubVV, SubVC, SubCV,
    MulVV, MulVC, MulCV,
    DivVV, DivVC, DivCV,
    ModVV, ModVC, ModCV,
    PowVV, PowVC, PowCV,

    UnaryMinus,       // src:u16 dst:u16
    LogicalNot,       // src:u16 dst:u16
    LengthOf,         // src:u16 dst:u16
    Concat,           // base:u16 num:u16 dst:u16

    // Comparison branches: {lhs:u16 rhs:u16 br:i16} / VC {lhs:u16 cst:u16 br:i16}
    BrIfLT, BrIfNotLT, BrIfLE, BrIfNotLE,
    BrIfEqVV, BrIfNotEqVV, BrIfEqVC, BrIfNotEqVC,

    BrIfTruthy,           // src:u16 br:i16
    BrIfFalsy,            // src:u16 br:i16
    SelectAndBrIfTruthy,  // src:u16 dst:u16 br:i16
    SelectAndBrIfFalsy,   // src:u16 dst:u16 br:i16

    Branch,           // br:i16
    BranchFar,        // br:i32

    TableNew,              // inline_cap:u8 array_hint:u16 dst:u16
    TableDup,              // cst:u16 dst:u16
    TableGetById,          // base:u16 cst:u16 dst:u16 ic:u32
    TableGetByIdIcHitInline,
    TableGetByIdIcHitOutlined,
    TablePutById,          // base:u16 cst:u16 src:u16 ic:u32
    TablePutByIdIcHitInline,
    TablePutByIdIcHitOutlined,
    TableGetByImm,         // base:u16 imm:i16 dst:u16
    TablePutByImm,         // base:u16 imm:i16 src:u16
    TableGetByVal,         // base:u16 key:u16 dst:u16
    TablePutByVal,         // base:u16 key:u16 src:u16
    TableVariadicPutBySeq, // base:u16 cst:u16
    GlobalGet,             // cst:u16 dst:u16 ic:u32
    GlobalPut,             // cst:u16 src:u16 ic:u32

    UpvalueGet,       // ord:u16 dst:u16
    UpvaluePut,       // ord:u16 src:u16
    UpvalueClose,     // base:u16 br:i16

    NewClosure,       // cst:u16 dst:u16

    StoreVarArgsAsVariadicResults,
    GetVarArgsPrefix, // base:u16 num:u16

    Call,             // base:u16 num_args:u16 num_rets:i16
    CallM,            // base:u16 num_args:u16 num_rets:i16
    CallT,            // base:u16 num_args:u16
    CallMT,           // base:u16 num_args:u16

    Ret0,
    Ret,              // base:u16 num:u16
    RetM,             // base:u16 num:u16

    ForLoopInit,      // base:u16 br:i16
    ForLoopStep,      // base:u16 br:i16
    ForLoopIter,      // base:u16 num_rets:u16 br:i16
    KVLoopIter,       // base:u16 num_rets:u8 br:i16
    ValidateIsNextAndBranch, // base:u16 br:i16
}

impl Opcode {
    #[inline(always)]
    pub fn from_u8(byte: u8) -> Opcode {
        debug_assert!(byte <= Opcode::ValidateIsNextAndBranch as u8);
        unsafe { std::mem::transmute(byte) }
    }

    /// Total encoded length, opcode byte included.
    pub fn encoded_length(self) -> usize {
        use Opcode::*;
        match self {
            Nop | Ret0 | StoreVarArgsAsVariadicResults => 1,
            Branch => 3,
            BranchFar => 5,
            Mov | LoadConstant | SetConstInt16 | RangeFillNils | UnaryMinus | LogicalNot
            | LengthOf | TableDup | UpvalueGet | UpvaluePut | UpvalueClose | NewClosure
            | GetVarArgsPrefix | Ret | RetM | CallT | CallMT | ForLoopInit | ForLoopStep
            | BrIfTruthy | BrIfFalsy | TableVariadicPutBySeq => 5,
            AddVV | AddVC | AddCV | SubVV | SubVC | SubCV | MulVV | MulVC | MulCV | DivVV
            | DivVC | DivCV | ModVV | ModVC | ModCV | PowVV | PowVC | PowCV | Concat
            | BrIfLT | BrIfNotLT | BrIfLE | BrIfNotLE | BrIfEqVV | BrIfNotEqVV | BrIfEqVC
            | BrIfNotEqVC | SelectAndBrIfTruthy | SelectAndBrIfFalsy | TableGetByImm
            | TablePutByImm | TableGetByVal | TablePutByVal | Call | CallM | ForLoopIter => 7,
            TableNew | KVLoopIter => 6,
            ValidateIsNextAndBranch => 5,
            TableGetById | TableGetByIdIcHitInline | TableGetByIdIcHitOutlined | TablePutById
            | TablePutByIdIcHitInline | TablePutByIdIcHitOutlined => 11,
            GlobalGet | GlobalPut => 9,
        }
    }

    /// Byte offset of the branch operand inside the encoding, with its
    /// width, for branch-target patching.
    pub fn branch_operand(self) -> Option<(usize, BranchWidth)> {
        use Opcode::*;
        match self {
            Branch => Some((1, BranchWidth::Narrow)),
            BranchFar => Some((1, BranchWidth::Wide)),
            BrIfTruthy | BrIfFalsy => Some((3, BranchWidth::Narrow)),
            BrIfLT | BrIfNotLT | BrIfLE | BrIfNotLE | BrIfEqVV | BrIfNotEqVV | BrIfEqVC
            | BrIfNotEqVC | SelectAndBrIfTruthy | SelectAndBrIfFalsy => {
                Some((5, BranchWidth::Narrow))
            }
            UpvalueClose | ForLoopInit | ForLoopStep | ValidateIsNextAndBranch => {
                Some((3, BranchWidth::Narrow))
            }
            ForLoopIter => Some((5, BranchWidth::Narrow)),
            KVLoopIter => Some((4, BranchWidth::Narrow)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchWidth {
    Narrow, // i16
    Wide,   // i32
}

// Bytecode metadata struct kinds stored in the CodeBlock trailing array.
pub const X_METADATA_KIND_GET_BY_ID_IC: usize = 0;
pub const X_METADATA_KIND_PUT_BY_ID_IC: usize = 1;
pub const X_NUM_BYTECODE_METADATA_KINDS: usize = 2;

/// (size, log2 alignment) per metadata kind; alignment is capped at 8
/// because the trailing array itself is 8-aligned.
pub const X_METADATA_KIND_LAYOUT: [(usize, u32); X_NUM_BYTECODE_METADATA_KINDS] = [
    (
        std::mem::size_of::<crate::lua_vm::inline_cache::GetByIdIcSite>(),
        2,
    ),
    (
        std::mem::size_of::<crate::lua_vm::inline_cache::PutByIdIcSite>(),
        2,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for b in 0..=Opcode::ValidateIsNextAndBranch as u8 {
            assert_eq!(Opcode::from_u8(b) as u8, b);
        }
    }

    #[test]
    fn test_branch_operand_within_encoding() {
        for b in 0..=Opcode::ValidateIsNextAndBranch as u8 {
            let op = Opcode::from_u8(b);
            if let Some((off, width)) = op.branch_operand() {
                let w = match width {
                    BranchWidth::Narrow => 2,
                    BranchWidth::Wide => 4,
                };
                assert!(off + w <= op.encoded_length(), "{:?}", op);
            }
        }
    }
}
