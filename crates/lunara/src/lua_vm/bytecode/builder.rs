// Bytecode builder: emits the linear stream, deduplicates the 64-bit
// constant table, records metadata-field patch locations, and patches
// forward branches once targets are known.

use hashbrown::HashMap;

use super::{BranchWidth, Opcode, X_NUM_BYTECODE_METADATA_KINDS};
use crate::lua_value::tvalue::TValue;

/// A value operand: either a frame slot or a constant-table ordinal.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    Slot(u16),
    Cst(u16),
}

#[derive(Debug, Clone, Copy)]
pub struct MetadataFieldPatch {
    pub bytecode_offset: u32,
    pub kind: u8,
    pub index: u16,
}

pub struct BuiltBytecode {
    pub bytecode: Vec<u8>,
    pub constants: Vec<u64>,
    pub metadata_counts: [u16; X_NUM_BYTECODE_METADATA_KINDS],
    pub metadata_patches: Vec<MetadataFieldPatch>,
}

#[derive(Default)]
pub struct BytecodeBuilder {
    bytecode: Vec<u8>,
    constants: Vec<u64>,
    cst_dedup: HashMap<u64, u16>,
    metadata_counts: [u16; X_NUM_BYTECODE_METADATA_KINDS],
    metadata_patches: Vec<MetadataFieldPatch>,
}

impl BytecodeBuilder {
    pub fn new() -> BytecodeBuilder {
        BytecodeBuilder::default()
    }

    #[inline]
    pub fn cur_length(&self) -> usize {
        self.bytecode.len()
    }

    /// Interns a raw 64-bit constant (a TValue bit pattern, or a child
    /// code-block reference) and returns its ordinal.
    pub fn add_constant(&mut self, raw: u64) -> u16 {
        if let Some(&ord) = self.cst_dedup.get(&raw) {
            return ord;
        }
        let ord = u16::try_from(self.constants.len()).expect("constant table overflow");
        self.constants.push(raw);
        self.cst_dedup.insert(raw, ord);
        ord
    }

    pub fn add_constant_value(&mut self, v: TValue) -> u16 {
        self.add_constant(v.raw())
    }

    // ---- raw emit helpers ----

    #[inline]
    fn op(&mut self, op: Opcode) -> usize {
        let pos = self.bytecode.len();
        self.bytecode.push(op as u8);
        pos
    }

    #[inline]
    fn u8_(&mut self, v: u8) {
        self.bytecode.push(v);
    }

    #[inline]
    fn u16_(&mut self, v: u16) {
        self.bytecode.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn i16_(&mut self, v: i16) {
        self.bytecode.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn i32_(&mut self, v: i32) {
        self.bytecode.extend_from_slice(&v.to_le_bytes());
    }

    /// Emits a metadata-field placeholder, recording the patch.
    fn metadata_field(&mut self, kind: usize) {
        let index = self.metadata_counts[kind];
        self.metadata_counts[kind] = index.checked_add(1).expect("metadata index overflow");
        self.metadata_patches.push(MetadataFieldPatch {
            bytecode_offset: self.bytecode.len() as u32,
            kind: kind as u8,
            index,
        });
        self.bytecode.extend_from_slice(&0u32.to_le_bytes());
    }

    // ---- bytecode constructors ----

    pub fn create_nop(&mut self) {
        self.op(Opcode::Nop);
    }

    pub fn create_mov(&mut self, src: Operand, dst: u16) {
        match src {
            Operand::Slot(s) => {
                self.op(Opcode::Mov);
                self.u16_(s);
            }
            Operand::Cst(c) => {
                self.op(Opcode::LoadConstant);
                self.u16_(c);
            }
        }
        self.u16_(dst);
    }

    pub fn create_set_const_int16(&mut self, imm: i16, dst: u16) {
        self.op(Opcode::SetConstInt16);
        self.i16_(imm);
        self.u16_(dst);
    }

    pub fn create_range_fill_nils(&mut self, base: u16, num: u16) {
        self.op(Opcode::RangeFillNils);
        self.u16_(base);
        self.u16_(num);
    }

    fn arith(&mut self, vv: Opcode, vc: Opcode, cv: Opcode, lhs: Operand, rhs: Operand, dst: u16) {
        match (lhs, rhs) {
            (Operand::Slot(a), Operand::Slot(b)) => {
                self.op(vv);
                self.u16_(a);
                self.u16_(b);
            }
            (Operand::Slot(a), Operand::Cst(b)) => {
                self.op(vc);
                self.u16_(a);
                self.u16_(b);
            }
            (Operand::Cst(a), Operand::Slot(b)) => {
                self.op(cv);
                self.u16_(a);
                self.u16_(b);
            }
            (Operand::Cst(_), Operand::Cst(_)) => {
                unreachable!("constant-folded operands never reach the builder")
            }
        }
        self.u16_(dst);
    }

    pub fn create_add(&mut self, lhs: Operand, rhs: Operand, dst: u16) {
        self.arith(Opcode::AddVV, Opcode::AddVC, Opcode::AddCV, lhs, rhs, dst);
    }

    pub fn create_sub(&mut self, lhs: Operand, rhs: Operand, dst: u16) {
        self.arith(Opcode::SubVV, Opcode::SubVC, Opcode::SubCV, lhs, rhs, dst);
    }

    pub fn create_mul(&mut self, lhs: Operand, rhs: Operand, dst: u16) {
        self.arith(Opcode::MulVV, Opcode::MulVC, Opcode::MulCV, lhs, rhs, dst);
    }

    pub fn create_div(&mut self, lhs: Operand, rhs: Operand, dst: u16) {
        self.arith(Opcode::DivVV, Opcode::DivVC, Opcode::DivCV, lhs, rhs, dst);
    }

    pub fn create_mod(&mut self, lhs: Operand, rhs: Operand, dst: u16) {
        self.arith(Opcode::ModVV, Opcode::ModVC, Opcode::ModCV, lhs, rhs, dst);
    }

    pub fn create_pow(&mut self, lhs: Operand, rhs: Operand, dst: u16) {
        self.arith(Opcode::PowVV, Opcode::PowVC, Opcode::PowCV, lhs, rhs, dst);
    }

    pub fn create_unary_minus(&mut self, src: u16, dst: u16) {
        self.op(Opcode::UnaryMinus);
        self.u16_(src);
        self.u16_(dst);
    }

    pub fn create_logical_not(&mut self, src: u16, dst: u16) {
        self.op(Opcode::LogicalNot);
        self.u16_(src);
        self.u16_(dst);
    }

    pub fn create_length_of(&mut self, src: u16, dst: u16) {
        self.op(Opcode::LengthOf);
        self.u16_(src);
        self.u16_(dst);
    }

    pub fn create_concat(&mut self, base: u16, num: u16, dst: u16) {
        self.op(Opcode::Concat);
        self.u16_(base);
        self.u16_(num);
        self.u16_(dst);
    }

    fn cmp_branch(&mut self, op: Opcode, lhs: u16, rhs: u16) {
        self.op(op);
        self.u16_(lhs);
        self.u16_(rhs);
        self.i16_(0);
    }

    pub fn create_branch_if_lt(&mut self, lhs: u16, rhs: u16) {
        self.cmp_branch(Opcode::BrIfLT, lhs, rhs);
    }

    pub fn create_branch_if_nlt(&mut self, lhs: u16, rhs: u16) {
        self.cmp_branch(Opcode::BrIfNotLT, lhs, rhs);
    }

    pub fn create_branch_if_le(&mut self, lhs: u16, rhs: u16) {
        self.cmp_branch(Opcode::BrIfLE, lhs, rhs);
    }

    pub fn create_branch_if_nle(&mut self, lhs: u16, rhs: u16) {
        self.cmp_branch(Opcode::BrIfNotLE, lhs, rhs);
    }

    pub fn create_branch_if_eq(&mut self, lhs: u16, rhs: Operand) {
        match rhs {
            Operand::Slot(s) => self.cmp_branch(Opcode::BrIfEqVV, lhs, s),
            Operand::Cst(c) => self.cmp_branch(Opcode::BrIfEqVC, lhs, c),
        }
    }

    pub fn create_branch_if_not_eq(&mut self, lhs: u16, rhs: Operand) {
        match rhs {
            Operand::Slot(s) => self.cmp_branch(Opcode::BrIfNotEqVV, lhs, s),
            Operand::Cst(c) => self.cmp_branch(Opcode::BrIfNotEqVC, lhs, c),
        }
    }

    pub fn create_branch_if_truthy(&mut self, src: u16) {
        self.op(Opcode::BrIfTruthy);
        self.u16_(src);
        self.i16_(0);
    }

    pub fn create_branch_if_falsy(&mut self, src: u16) {
        self.op(Opcode::BrIfFalsy);
        self.u16_(src);
        self.i16_(0);
    }

    pub fn create_select_and_branch_if_truthy(&mut self, src: u16, dst: u16) {
        self.op(Opcode::SelectAndBrIfTruthy);
        self.u16_(src);
        self.u16_(dst);
        self.i16_(0);
    }

    pub fn create_select_and_branch_if_falsy(&mut self, src: u16, dst: u16) {
        self.op(Opcode::SelectAndBrIfFalsy);
        self.u16_(src);
        self.u16_(dst);
        self.i16_(0);
    }

    pub fn create_branch(&mut self) {
        self.op(Opcode::Branch);
        self.i16_(0);
    }

    pub fn create_branch_far(&mut self) {
        self.op(Opcode::BranchFar);
        self.i32_(0);
    }

    pub fn create_table_new(&mut self, inline_cap: u8, array_hint: u16, dst: u16) {
        self.op(Opcode::TableNew);
        self.u8_(inline_cap);
        self.u16_(array_hint);
        self.u16_(dst);
    }

    pub fn create_table_dup(&mut self, cst: u16, dst: u16) {
        self.op(Opcode::TableDup);
        self.u16_(cst);
        self.u16_(dst);
    }

    pub fn create_table_get_by_id(&mut self, base: u16, index_cst: u16, dst: u16) {
        self.op(Opcode::TableGetById);
        self.u16_(base);
        self.u16_(index_cst);
        self.u16_(dst);
        self.metadata_field(super::X_METADATA_KIND_GET_BY_ID_IC);
    }

    pub fn create_table_put_by_id(&mut self, base: u16, index_cst: u16, src: u16) {
        self.op(Opcode::TablePutById);
        self.u16_(base);
        self.u16_(index_cst);
        self.u16_(src);
        self.metadata_field(super::X_METADATA_KIND_PUT_BY_ID_IC);
    }

    pub fn create_table_get_by_imm(&mut self, base: u16, index: i16, dst: u16) {
        self.op(Opcode::TableGetByImm);
        self.u16_(base);
        self.i16_(index);
        self.u16_(dst);
    }

    pub fn create_table_put_by_imm(&mut self, base: u16, index: i16, src: u16) {
        self.op(Opcode::TablePutByImm);
        self.u16_(base);
        self.i16_(index);
        self.u16_(src);
    }

    pub fn create_table_get_by_val(&mut self, base: u16, key: u16, dst: u16) {
        self.op(Opcode::TableGetByVal);
        self.u16_(base);
        self.u16_(key);
        self.u16_(dst);
    }

    pub fn create_table_put_by_val(&mut self, base: u16, key: u16, src: u16) {
        self.op(Opcode::TablePutByVal);
        self.u16_(base);
        self.u16_(key);
        self.u16_(src);
    }

    pub fn create_table_variadic_put_by_seq(&mut self, base: u16, index_cst: u16) {
        self.op(Opcode::TableVariadicPutBySeq);
        self.u16_(base);
        self.u16_(index_cst);
    }

    pub fn create_global_get(&mut self, index_cst: u16, dst: u16) {
        self.op(Opcode::GlobalGet);
        self.u16_(index_cst);
        self.u16_(dst);
        self.metadata_field(super::X_METADATA_KIND_GET_BY_ID_IC);
    }

    pub fn create_global_put(&mut self, index_cst: u16, src: u16) {
        self.op(Opcode::GlobalPut);
        self.u16_(index_cst);
        self.u16_(src);
        self.metadata_field(super::X_METADATA_KIND_PUT_BY_ID_IC);
    }

    pub fn create_upvalue_get(&mut self, ord: u16, dst: u16) {
        self.op(Opcode::UpvalueGet);
        self.u16_(ord);
        self.u16_(dst);
    }

    pub fn create_upvalue_put(&mut self, ord: u16, src: u16) {
        self.op(Opcode::UpvaluePut);
        self.u16_(ord);
        self.u16_(src);
    }

    pub fn create_upvalue_close(&mut self, base: u16) {
        self.op(Opcode::UpvalueClose);
        self.u16_(base);
        self.i16_(0);
    }

    pub fn create_new_closure(&mut self, ucb_cst: u16, dst: u16) {
        self.op(Opcode::NewClosure);
        self.u16_(ucb_cst);
        self.u16_(dst);
    }

    pub fn create_store_varargs_as_variadic_results(&mut self) {
        self.op(Opcode::StoreVarArgsAsVariadicResults);
    }

    pub fn create_get_varargs_prefix(&mut self, base: u16, num_to_put: u16) {
        self.op(Opcode::GetVarArgsPrefix);
        self.u16_(base);
        self.u16_(num_to_put);
    }

    pub fn create_call(&mut self, base: u16, num_args: u16, num_rets: i16) {
        self.op(Opcode::Call);
        self.u16_(base);
        self.u16_(num_args);
        self.i16_(num_rets);
    }

    pub fn create_call_m(&mut self, base: u16, num_args: u16, num_rets: i16) {
        self.op(Opcode::CallM);
        self.u16_(base);
        self.u16_(num_args);
        self.i16_(num_rets);
    }

    pub fn create_call_t(&mut self, base: u16, num_args: u16) {
        self.op(Opcode::CallT);
        self.u16_(base);
        self.u16_(num_args);
    }

    pub fn create_call_mt(&mut self, base: u16, num_args: u16) {
        self.op(Opcode::CallMT);
        self.u16_(base);
        self.u16_(num_args);
    }

    pub fn create_ret0(&mut self) {
        self.op(Opcode::Ret0);
    }

    pub fn create_ret(&mut self, base: u16, num: u16) {
        self.op(Opcode::Ret);
        self.u16_(base);
        self.u16_(num);
    }

    pub fn create_ret_m(&mut self, base: u16, num: u16) {
        self.op(Opcode::RetM);
        self.u16_(base);
        self.u16_(num);
    }

    pub fn create_for_loop_init(&mut self, base: u16) {
        self.op(Opcode::ForLoopInit);
        self.u16_(base);
        self.i16_(0);
    }

    pub fn create_for_loop_step(&mut self, base: u16) {
        self.op(Opcode::ForLoopStep);
        self.u16_(base);
        self.i16_(0);
    }

    pub fn create_for_loop_iter(&mut self, base: u16, num_rets: u16) {
        self.op(Opcode::ForLoopIter);
        self.u16_(base);
        self.u16_(num_rets);
        self.i16_(0);
    }

    pub fn create_kv_loop_iter(&mut self, base: u16, num_rets: u8) {
        self.op(Opcode::KVLoopIter);
        self.u16_(base);
        self.u8_(num_rets);
        self.i16_(0);
    }

    pub fn create_validate_is_next_and_branch(&mut self, base: u16) {
        self.op(Opcode::ValidateIsNextAndBranch);
        self.u16_(base);
        self.i16_(0);
    }

    // ---- branch patching ----

    /// Patches the branch of the bytecode starting at `bytecode_pos` to
    /// target the bytecode starting at `target_offset`. Returns false when
    /// the displacement does not fit the variant's width; the caller must
    /// re-emit with a wider variant or give up.
    pub fn set_branch_target(&mut self, bytecode_pos: usize, target_offset: usize) -> bool {
        let op = Opcode::from_u8(self.bytecode[bytecode_pos]);
        let (operand_off, width) = op
            .branch_operand()
            .unwrap_or_else(|| panic!("{:?} has no branch operand", op));
        let displacement = target_offset as i64 - bytecode_pos as i64;
        let at = bytecode_pos + operand_off;
        match width {
            BranchWidth::Narrow => {
                let Ok(d) = i16::try_from(displacement) else {
                    return false;
                };
                self.bytecode[at..at + 2].copy_from_slice(&d.to_le_bytes());
            }
            BranchWidth::Wide => {
                let Ok(d) = i32::try_from(displacement) else {
                    return false;
                };
                self.bytecode[at..at + 4].copy_from_slice(&d.to_le_bytes());
            }
        }
        true
    }

    pub fn finish(self) -> BuiltBytecode {
        BuiltBytecode {
            bytecode: self.bytecode,
            constants: self.constants,
            metadata_counts: self.metadata_counts,
            metadata_patches: self.metadata_patches,
        }
    }
}
