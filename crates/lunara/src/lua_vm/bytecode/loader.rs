// Bytecode module loader.
//
// A module arrives as JSON produced by the external front-end: a chunk
// name plus one prototype per function, each carrying fixed-arg/vararg
// info, frame size, upvalue metadata, number and object constants, and a
// LuaJIT-opcode instruction list. The translator lowers those opcodes
// onto the builder, fusing the JMP that trails every comparison and the
// ITERL that trails every ITERC/ITERN, and patches branch targets once
// all offsets are known. Each prototype becomes an UnlinkedCodeBlock; the
// last one is the chunk entry.

use serde::Deserialize;
use smol_str::SmolStr;

use crate::gc::SystemHeapPtr;
use crate::lua_value::function_object::FunctionObject;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;
use crate::lua_vm::{ModuleLoadError, Vm};

use super::builder::{BytecodeBuilder, Operand};
use super::code_block::{UnlinkedCodeBlock, UnlinkedCodeBlockDesc, UpvalueMetadata};

#[derive(Debug)]
pub struct ScriptModule {
    pub name: SmolStr,
    pub unlinked_code_blocks: Vec<SystemHeapPtr<UnlinkedCodeBlock>>,
    /// FunctionObject of the chunk entry.
    pub entry_function: TValue,
}

#[derive(Deserialize)]
struct ModuleJson {
    #[serde(rename = "ChunkName")]
    chunk_name: String,
    #[serde(rename = "FunctionPrototypes")]
    prototypes: Vec<ProtoJson>,
}

#[derive(Deserialize)]
struct ProtoJson {
    #[serde(rename = "NumFixedParams")]
    num_fixed_params: u32,
    #[serde(rename = "TakesVarArg")]
    takes_vararg: bool,
    #[serde(rename = "MaxFrameSize")]
    max_frame_size: u32,
    #[serde(rename = "Upvalues")]
    upvalues: Vec<UpvalueJson>,
    #[serde(rename = "NumberConstants")]
    number_constants: Vec<TaggedConstJson>,
    #[serde(rename = "ObjectConstants")]
    object_constants: Vec<ObjectConstJson>,
    #[serde(rename = "Bytecode")]
    bytecode: Vec<BcJson>,
}

#[derive(Deserialize)]
struct UpvalueJson {
    #[serde(rename = "IsParentLocal")]
    is_parent_local: bool,
    #[serde(rename = "IsImmutable", default)]
    is_immutable: bool,
    #[serde(rename = "ParentLocalOrdinal", default)]
    parent_local_ordinal: u32,
    #[serde(rename = "ParentUpvalueOrdinal", default)]
    parent_upvalue_ordinal: u32,
}

#[derive(Deserialize)]
struct TaggedConstJson {
    #[serde(rename = "Type")]
    ty: String,
    #[serde(rename = "Value")]
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct ObjectConstJson {
    #[serde(rename = "Type")]
    ty: String,
    #[serde(rename = "Value")]
    value: serde_json::Value,
    #[serde(rename = "AdditionalNamedKeys", default)]
    additional_named_keys: u32,
}

#[derive(Deserialize)]
struct BcJson {
    #[serde(rename = "OpCode")]
    opcode: String,
    #[serde(rename = "OpData")]
    opdata: Vec<i64>,
}

fn err(msg: impl Into<String>) -> ModuleLoadError {
    ModuleLoadError::new(msg)
}

/// Object-constant entry after materialization.
#[derive(Clone, Copy)]
enum ObjConst {
    Value(TValue),
    Prototype(SystemHeapPtr<UnlinkedCodeBlock>),
}

pub fn parse_module_from_json(vm: &mut Vm, content: &str) -> Result<ScriptModule, ModuleLoadError> {
    let module: ModuleJson =
        serde_json::from_str(content).map_err(|e| err(format!("bad module JSON: {}", e)))?;
    if module.prototypes.is_empty() {
        return Err(err("module carries no function prototypes"));
    }

    let mut ucbs: Vec<SystemHeapPtr<UnlinkedCodeBlock>> = Vec::new();
    for proto in &module.prototypes {
        let ucb = translate_prototype(vm, proto, &ucbs)?;
        ucbs.push(ucb);
    }

    let chunk = *ucbs.last().unwrap();
    {
        let c = unsafe { chunk.as_ref() };
        if c.num_fixed_arguments != 0 || c.num_upvalues != 0 {
            return Err(err("chunk entry prototype must take no parameters or upvalues"));
        }
    }
    let global_object = vm.global_object;
    let cb = UnlinkedCodeBlock::get_code_block(chunk, &mut vm.layout, global_object);
    let entry = FunctionObject::create(&mut vm.layout, cb.cast(), 0);

    tracing::debug!(
        chunk = %module.chunk_name,
        prototypes = ucbs.len(),
        "loaded bytecode module"
    );

    Ok(ScriptModule {
        name: SmolStr::new(&module.chunk_name),
        unlinked_code_blocks: ucbs,
        entry_function: TValue::pointer(entry),
    })
}

fn number_constant(c: &TaggedConstJson) -> Result<TValue, ModuleLoadError> {
    // All number constants load as doubles in this dialect.
    match c.ty.as_str() {
        "Int32" => {
            let v = c.value.as_i64().ok_or_else(|| err("Int32 constant is not an integer"))?;
            Ok(TValue::double(v as f64))
        }
        "Double" => {
            let v = c.value.as_f64().ok_or_else(|| err("Double constant is not a number"))?;
            Ok(TValue::double(v))
        }
        other => Err(err(format!("bad number constant type '{}'", other))),
    }
}

fn table_entry_value(vm: &mut Vm, e: &serde_json::Value) -> Result<TValue, ModuleLoadError> {
    let ty = e
        .get("Type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| err("table entry without Type"))?;
    let value = e.get("Value").ok_or_else(|| err("table entry without Value"))?;
    match ty {
        "Boolean" => Ok(TValue::boolean(value.as_bool().ok_or_else(|| err("bad Boolean"))?)),
        "String" => {
            let s = value.as_str().ok_or_else(|| err("bad String"))?;
            Ok(vm.create_string(s.as_bytes()))
        }
        "Int32" => Ok(TValue::double(
            value.as_i64().ok_or_else(|| err("bad Int32"))? as f64
        )),
        "Double" => Ok(TValue::double(value.as_f64().ok_or_else(|| err("bad Double"))?)),
        other => Err(err(format!("bad table entry type '{}'", other))),
    }
}

/// Materializes a table constant: string keys in sorted order (maximizing
/// structure sharing), then boolean keys through their sentinels, then
/// positive integer indices ascending (preserving continuity), then the
/// rest.
fn materialize_table_constant(
    vm: &mut Vm,
    c: &ObjectConstJson,
) -> Result<TValue, ModuleLoadError> {
    let entries = c.value.as_array().ok_or_else(|| err("Table constant is not an array"))?;

    let mut named: Vec<(String, TValue)> = Vec::new();
    let mut boolean_values: [Option<TValue>; 2] = [None, None];
    let mut positive: Vec<(i64, TValue)> = Vec::new();
    let mut rest: Vec<(f64, TValue)> = Vec::new();
    let mut initial_array_size: u32 = 0;

    for entry in entries {
        let key = entry.get("EntryKey").ok_or_else(|| err("table entry without EntryKey"))?;
        let val = entry.get("EntryValue").ok_or_else(|| err("table entry without EntryValue"))?;
        let kty = key
            .get("Type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| err("table key without Type"))?;
        let kval = key.get("Value").ok_or_else(|| err("table key without Value"))?;
        let v = table_entry_value(vm, val)?;
        match kty {
            "String" => {
                let s = kval.as_str().ok_or_else(|| err("bad String key"))?;
                named.push((s.to_string(), v));
            }
            "Boolean" => {
                let b = kval.as_bool().ok_or_else(|| err("bad Boolean key"))?;
                boolean_values[b as usize] = Some(v);
            }
            "Int32" => {
                let k = kval.as_i64().ok_or_else(|| err("bad Int32 key"))?;
                if k > 0 {
                    if k <= crate::lua_value::table_object::X_ALWAYS_VECTOR_CUTOFF {
                        initial_array_size = initial_array_size.max(k as u32);
                    }
                    positive.push((k, v));
                } else {
                    rest.push((k as f64, v));
                }
            }
            "Double" => {
                let k = kval.as_f64().ok_or_else(|| err("bad Double key"))?;
                rest.push((k, v));
            }
            other => return Err(err(format!("bad table key type '{}'", other))),
        }
    }

    named.sort_by(|a, b| a.0.cmp(&b.0));
    positive.sort_by_key(|&(k, _)| k);

    let num_named = named.len()
        + boolean_values.iter().filter(|v| v.is_some()).count()
        + c.additional_named_keys as usize;
    let table_v = vm.create_table(num_named as u32, initial_array_size);
    let table = table_v.as_pointer::<TableObject>();

    for (name, v) in named {
        let key = vm.interner.intern(&mut vm.layout, name.as_bytes());
        TableObject::put_by_id(table, &mut vm.layout, key, v);
    }
    for b in [false, true] {
        if let Some(v) = boolean_values[b as usize] {
            let key = vm.interner.special_key_for_boolean(b);
            TableObject::put_by_id(table, &mut vm.layout, key, v);
        }
    }
    for (k, v) in positive {
        TableObject::raw_put_by_integer_index(table, &mut vm.layout, k, v);
    }
    for (k, v) in rest {
        if k.is_nan() {
            return Err(err("table constant key is NaN"));
        }
        TableObject::raw_put_by_double_index(table, &mut vm.layout, k, v);
    }
    Ok(table_v)
}

fn translate_prototype(
    vm: &mut Vm,
    proto: &ProtoJson,
    siblings: &[SystemHeapPtr<UnlinkedCodeBlock>],
) -> Result<SystemHeapPtr<UnlinkedCodeBlock>, ModuleLoadError> {
    // Constants.
    let mut num_csts: Vec<TValue> = Vec::with_capacity(proto.number_constants.len());
    for c in &proto.number_constants {
        num_csts.push(number_constant(c)?);
    }
    let mut obj_csts: Vec<ObjConst> = Vec::with_capacity(proto.object_constants.len());
    for c in &proto.object_constants {
        match c.ty.as_str() {
            "String" => {
                let s = c.value.as_str().ok_or_else(|| err("String constant is not a string"))?;
                obj_csts.push(ObjConst::Value(vm.create_string(s.as_bytes())));
            }
            "FunctionPrototype" => {
                let ord = c.value.as_u64().ok_or_else(|| err("bad prototype ordinal"))? as usize;
                let child =
                    *siblings.get(ord).ok_or_else(|| err("prototype ordinal out of range"))?;
                obj_csts.push(ObjConst::Prototype(child));
            }
            "Table" => {
                obj_csts.push(ObjConst::Value(materialize_table_constant(vm, c)?));
            }
            other => return Err(err(format!("bad object constant type '{}'", other))),
        }
    }

    // Upvalue metadata.
    let upvalues: Vec<UpvalueMetadata> = proto
        .upvalues
        .iter()
        .map(|u| UpvalueMetadata {
            is_parent_local: u.is_parent_local,
            is_immutable: u.is_parent_local && u.is_immutable,
            slot: if u.is_parent_local { u.parent_local_ordinal } else { u.parent_upvalue_ordinal },
        })
        .collect();

    // One slot past the declared frame is reserved as the constant-store
    // scratch for USETS/USETN/USETP lowering.
    let scratch_slot = proto.max_frame_size as u16;
    let frame_slots = proto.max_frame_size + 1;

    let mut bw = BytecodeBuilder::new();
    let mut bytecode_location: Vec<usize> = Vec::with_capacity(proto.bytecode.len());
    let mut jump_patches: Vec<(usize, usize)> = Vec::new(); // (target ordinal, builder pos)

    let check_slot = |ord: i64| -> Result<u16, ModuleLoadError> {
        if ord < 0 || ord >= frame_slots as i64 {
            return Err(err(format!("local ordinal {} out of range", ord)));
        }
        Ok(ord as u16)
    };

    let mut i = 0usize;
    let list = &proto.bytecode;
    while i < list.len() {
        bytecode_location.push(bw.cur_length());
        let b = &list[i];
        let d = &b.opdata;
        let get = |k: usize| -> Result<i64, ModuleLoadError> {
            d.get(k).copied().ok_or_else(|| err(format!("{}: missing operand {}", b.opcode, k)))
        };
        let local = |k: usize| -> Result<u16, ModuleLoadError> { check_slot(get(k)?) };
        let num_cst = |k: usize| -> Result<TValue, ModuleLoadError> {
            let ord = get(k)? as usize;
            num_csts.get(ord).copied().ok_or_else(|| err("number constant out of range"))
        };
        let obj_cst = |k: usize| -> Result<ObjConst, ModuleLoadError> {
            let ord = get(k)? as usize;
            obj_csts.get(ord).copied().ok_or_else(|| err("object constant out of range"))
        };
        let obj_value = |k: usize| -> Result<TValue, ModuleLoadError> {
            match obj_cst(k)? {
                ObjConst::Value(v) => Ok(v),
                ObjConst::Prototype(_) => Err(err("expected value constant, got prototype")),
            }
        };
        let pri_cst = |k: usize| -> Result<TValue, ModuleLoadError> {
            match get(k)? {
                0 => Ok(TValue::nil()),
                1 => Ok(TValue::boolean(false)),
                2 => Ok(TValue::boolean(true)),
                other => Err(err(format!("bad primitive constant {}", other))),
            }
        };
        // Target ordinal of a relative jump operand at position k.
        let jump_target = |k: usize, cur: usize| -> Result<usize, ModuleLoadError> {
            let off = get(k)?;
            let target = cur as i64 + 1 + off;
            if target < 0 {
                return Err(err("jump target before function start"));
            }
            Ok(target as usize)
        };

        // The JMP trailing every comparison is part of the comparison in
        // this bytecode set; decode and skip it.
        macro_rules! fused_jump {
            () => {{
                let next = list
                    .get(i + 1)
                    .ok_or_else(|| err("comparison without trailing JMP"))?;
                if next.opcode != "JMP" {
                    return Err(err("comparison without trailing JMP"));
                }
                let off = next
                    .opdata
                    .get(1)
                    .copied()
                    .ok_or_else(|| err("JMP without offset"))?;
                let target = (i + 1) as i64 + 1 + off;
                i += 1;
                bytecode_location.push(usize::MAX); // never a jump target
                target as usize
            }};
        }
        macro_rules! fused_iterl {
            () => {{
                let next = list
                    .get(i + 1)
                    .ok_or_else(|| err("ITERC/ITERN without trailing ITERL"))?;
                if next.opcode != "ITERL" {
                    return Err(err("ITERC/ITERN without trailing ITERL"));
                }
                let off = next
                    .opdata
                    .get(1)
                    .copied()
                    .ok_or_else(|| err("ITERL without offset"))?;
                let target = (i + 1) as i64 + 1 + off;
                i += 1;
                bytecode_location.push(usize::MAX);
                target as usize
            }};
        }

        match b.opcode.as_str() {
            // ---- constants & moves ----
            "MOV" => bw.create_mov(Operand::Slot(local(1)?), local(0)?),
            "KSTR" => {
                let ord = bw.add_constant_value(obj_value(1)?);
                bw.create_mov(Operand::Cst(ord), local(0)?);
            }
            "KNUM" => {
                let ord = bw.add_constant_value(num_cst(1)?);
                bw.create_mov(Operand::Cst(ord), local(0)?);
            }
            "KPRI" => {
                let ord = bw.add_constant_value(pri_cst(1)?);
                bw.create_mov(Operand::Cst(ord), local(0)?);
            }
            "KSHORT" => {
                let imm = get(1)?;
                let imm = i16::try_from(imm).map_err(|_| err("KSHORT operand out of range"))?;
                bw.create_set_const_int16(imm, local(0)?);
            }
            "KNIL" => {
                let lo = get(0)?;
                let hi = get(1)?;
                if hi < lo {
                    return Err(err("KNIL range is inverted"));
                }
                bw.create_range_fill_nils(check_slot(lo)?, (hi - lo + 1) as u16);
            }
            "KCDATA" => return Err(err("KCDATA is never emitted by the front-end")),

            // ---- arithmetic ----
            "ADDVV" | "SUBVV" | "MULVV" | "DIVVV" | "MODVV" => {
                let lhs = Operand::Slot(local(1)?);
                let rhs = Operand::Slot(local(2)?);
                emit_arith(&mut bw, &b.opcode[..3], lhs, rhs, local(0)?);
            }
            "ADDVN" | "SUBVN" | "MULVN" | "DIVVN" | "MODVN" => {
                let lhs = Operand::Slot(local(1)?);
                let rhs = Operand::Cst(bw.add_constant_value(num_cst(2)?));
                emit_arith(&mut bw, &b.opcode[..3], lhs, rhs, local(0)?);
            }
            "ADDNV" | "SUBNV" | "MULNV" | "DIVNV" | "MODNV" => {
                let lhs = Operand::Cst(bw.add_constant_value(num_cst(2)?));
                let rhs = Operand::Slot(local(1)?);
                emit_arith(&mut bw, &b.opcode[..3], lhs, rhs, local(0)?);
            }
            "POW" => {
                bw.create_pow(Operand::Slot(local(1)?), Operand::Slot(local(2)?), local(0)?);
            }
            "CAT" => {
                let lo = get(1)?;
                let hi = get(2)?;
                if hi < lo {
                    return Err(err("CAT range is inverted"));
                }
                bw.create_concat(check_slot(lo)?, (hi - lo + 1) as u16, local(0)?);
            }
            "NOT" => bw.create_logical_not(local(1)?, local(0)?),
            "UNM" => bw.create_unary_minus(local(1)?, local(0)?),
            "LEN" => bw.create_length_of(local(1)?, local(0)?),

            // ---- comparisons (fused with the trailing JMP) ----
            "ISLT" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                bw.create_branch_if_lt(local(0)?, local(1)?);
            }
            "ISGE" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                bw.create_branch_if_nlt(local(0)?, local(1)?);
            }
            "ISLE" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                bw.create_branch_if_le(local(0)?, local(1)?);
            }
            "ISGT" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                bw.create_branch_if_nle(local(0)?, local(1)?);
            }
            "ISEQV" | "ISNEV" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                let rhs = Operand::Slot(local(1)?);
                if b.opcode == "ISEQV" {
                    bw.create_branch_if_eq(local(0)?, rhs);
                } else {
                    bw.create_branch_if_not_eq(local(0)?, rhs);
                }
            }
            "ISEQS" | "ISNES" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                let rhs = Operand::Cst(bw.add_constant_value(obj_value(1)?));
                if b.opcode == "ISEQS" {
                    bw.create_branch_if_eq(local(0)?, rhs);
                } else {
                    bw.create_branch_if_not_eq(local(0)?, rhs);
                }
            }
            "ISEQN" | "ISNEN" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                let rhs = Operand::Cst(bw.add_constant_value(num_cst(1)?));
                if b.opcode == "ISEQN" {
                    bw.create_branch_if_eq(local(0)?, rhs);
                } else {
                    bw.create_branch_if_not_eq(local(0)?, rhs);
                }
            }
            "ISEQP" | "ISNEP" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                let rhs = Operand::Cst(bw.add_constant_value(pri_cst(1)?));
                if b.opcode == "ISEQP" {
                    bw.create_branch_if_eq(local(0)?, rhs);
                } else {
                    bw.create_branch_if_not_eq(local(0)?, rhs);
                }
            }
            "ISTC" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                bw.create_select_and_branch_if_truthy(local(1)?, local(0)?);
            }
            "ISFC" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                bw.create_select_and_branch_if_falsy(local(1)?, local(0)?);
            }
            "IST" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                bw.create_branch_if_truthy(local(1)?);
            }
            "ISF" => {
                let target = fused_jump!();
                jump_patches.push((target, bw.cur_length()));
                bw.create_branch_if_falsy(local(1)?);
            }

            // ---- globals, upvalues, closures ----
            "GGET" => {
                let ord = bw.add_constant_value(obj_value(1)?);
                bw.create_global_get(ord, local(0)?);
            }
            "GSET" => {
                let ord = bw.add_constant_value(obj_value(1)?);
                bw.create_global_put(ord, local(0)?);
            }
            "UGET" => {
                let ord = get(1)?;
                bw.create_upvalue_get(ord as u16, local(0)?);
            }
            "USETV" => {
                bw.create_upvalue_put(get(0)? as u16, local(1)?);
            }
            "USETS" => {
                let ord = bw.add_constant_value(obj_value(1)?);
                bw.create_mov(Operand::Cst(ord), scratch_slot);
                bw.create_upvalue_put(get(0)? as u16, scratch_slot);
            }
            "USETN" => {
                let ord = bw.add_constant_value(num_cst(1)?);
                bw.create_mov(Operand::Cst(ord), scratch_slot);
                bw.create_upvalue_put(get(0)? as u16, scratch_slot);
            }
            "USETP" => {
                let ord = bw.add_constant_value(pri_cst(1)?);
                bw.create_mov(Operand::Cst(ord), scratch_slot);
                bw.create_upvalue_put(get(0)? as u16, scratch_slot);
            }
            "UCLO" => {
                let target = jump_target(1, i)?;
                jump_patches.push((target, bw.cur_length()));
                bw.create_upvalue_close(local(0)?);
            }
            "FNEW" => {
                let child = match obj_cst(1)? {
                    ObjConst::Prototype(p) => p,
                    _ => return Err(err("FNEW expects a prototype constant")),
                };
                // The child reference is its system-heap offset: inert as
                // a TValue, decodable by NewClosure.
                let ord = bw.add_constant(child.raw() as u64);
                bw.create_new_closure(ord, local(0)?);
            }

            // ---- tables ----
            "TNEW" => {
                let packed = get(1)?;
                let array_size = (packed & 0x7FF) as u16;
                let hash_log2 = (packed >> 11) as u32;
                let inline_cap = if hash_log2 == 0 { 0 } else { (1u32 << hash_log2).min(32) } as u8;
                bw.create_table_new(inline_cap, array_size, local(0)?);
            }
            "TDUP" => {
                let template = obj_value(1)?;
                if !template.is_table() {
                    return Err(err("TDUP expects a table constant"));
                }
                let ord = bw.add_constant_value(template);
                bw.create_table_dup(ord, local(0)?);
            }
            "TGETV" => bw.create_table_get_by_val(local(1)?, local(2)?, local(0)?),
            "TGETS" => {
                let ord = bw.add_constant_value(obj_value(2)?);
                bw.create_table_get_by_id(local(1)?, ord, local(0)?);
            }
            "TGETB" => {
                let imm = i16::try_from(get(2)?).map_err(|_| err("TGETB index out of range"))?;
                bw.create_table_get_by_imm(local(1)?, imm, local(0)?);
            }
            "TSETV" => bw.create_table_put_by_val(local(1)?, local(2)?, local(0)?),
            "TSETS" => {
                let ord = bw.add_constant_value(obj_value(2)?);
                bw.create_table_put_by_id(local(1)?, ord, local(0)?);
            }
            "TSETB" => {
                let imm = i16::try_from(get(2)?).map_err(|_| err("TSETB index out of range"))?;
                bw.create_table_put_by_imm(local(1)?, imm, local(0)?);
            }
            "TSETM" => {
                // Reads from slot A-1; the real start index hides in the
                // low 32 bits of the number constant.
                let a = get(0)?;
                if a < 1 {
                    return Err(err("TSETM base underflow"));
                }
                let tv = num_cst(1)?;
                let idx = tv.raw() as u32 as i32;
                let ord = bw.add_constant_value(TValue::int32(idx));
                bw.create_table_variadic_put_by_seq(check_slot(a - 1)?, ord);
            }
            "TGETR" | "TSETR" => return Err(err(format!("{} is never emitted", b.opcode))),

            // ---- calls & returns ----
            "CALL" => {
                let b_field = get(1)?;
                let c_field = get(2)?;
                let num_rets = if b_field == 0 { -1 } else { (b_field - 1) as i16 };
                bw.create_call(local(0)?, (c_field - 1).max(0) as u16, num_rets);
            }
            "CALLM" => {
                let b_field = get(1)?;
                let c_field = get(2)?;
                let num_rets = if b_field == 0 { -1 } else { (b_field - 1) as i16 };
                bw.create_call_m(local(0)?, c_field.max(0) as u16, num_rets);
            }
            "CALLT" => {
                let d_field = get(1)?;
                bw.create_call_t(local(0)?, (d_field - 1).max(0) as u16);
            }
            "CALLMT" => {
                let d_field = get(1)?;
                bw.create_call_mt(local(0)?, d_field.max(0) as u16);
            }
            "RET0" => bw.create_ret0(),
            "RET1" => bw.create_ret(local(0)?, 1),
            "RET" => {
                let d_field = get(1)?;
                bw.create_ret(local(0)?, (d_field - 1).max(0) as u16);
            }
            "RETM" => {
                let d_field = get(1)?;
                bw.create_ret_m(local(0)?, d_field.max(0) as u16);
            }

            // ---- varargs ----
            "VARG" => {
                let b_field = get(1)?;
                if b_field == 0 {
                    bw.create_store_varargs_as_variadic_results();
                } else {
                    bw.create_get_varargs_prefix(local(0)?, (b_field - 1) as u16);
                }
            }
            "VARGPREP" | "FUNCF" | "IFUNCF" | "JFUNCF" | "FUNCV" | "IFUNCV" | "JFUNCV"
            | "FUNCC" | "FUNCCW" | "JFORI" | "IFORL" | "JFORL" | "IITERL" | "JITERL"
            | "ILOOP" | "JLOOP" | "ISTYPE" | "ISNUM" => {
                return Err(err(format!("{} is never emitted by the front-end", b.opcode)));
            }

            // ---- loops & branches ----
            "FORI" => {
                let target = jump_target(1, i)?;
                jump_patches.push((target, bw.cur_length()));
                bw.create_for_loop_init(local(0)?);
            }
            "FORL" => {
                let target = jump_target(1, i)?;
                jump_patches.push((target, bw.cur_length()));
                bw.create_for_loop_step(local(0)?);
            }
            "ITERC" => {
                let a = get(0)?;
                let b_field = get(1)?;
                if a < 3 || b_field < 2 {
                    return Err(err("ITERC operand underflow"));
                }
                let target = fused_iterl!();
                jump_patches.push((target, bw.cur_length()));
                bw.create_for_loop_iter(check_slot(a - 3)?, (b_field - 1) as u16);
            }
            "ITERN" => {
                let a = get(0)?;
                let b_field = get(1)?;
                if a < 3 || !(2..=3).contains(&b_field) {
                    return Err(err("ITERN operand underflow"));
                }
                let target = fused_iterl!();
                jump_patches.push((target, bw.cur_length()));
                bw.create_kv_loop_iter(check_slot(a - 3)?, (b_field - 1) as u8);
            }
            "ITERL" => return Err(err("ITERL must directly follow ITERC/ITERN")),
            "ISNEXT" => {
                let a = get(0)?;
                if a < 3 {
                    return Err(err("ISNEXT operand underflow"));
                }
                let target = jump_target(1, i)?;
                jump_patches.push((target, bw.cur_length()));
                bw.create_validate_is_next_and_branch(check_slot(a - 3)?);
            }
            "LOOP" => {
                // Profiling no-op in the source format.
            }
            "JMP" => {
                let target = jump_target(1, i)?;
                jump_patches.push((target, bw.cur_length()));
                bw.create_branch();
            }
            other => return Err(err(format!("bad opcode \"{}\"", other))),
        }
        i += 1;
    }

    if bytecode_location.len() != list.len() {
        return Err(err("internal: bytecode location map out of sync"));
    }

    for (target_ordinal, builder_pos) in jump_patches {
        let target_offset = *bytecode_location
            .get(target_ordinal)
            .ok_or_else(|| err("jump target out of range"))?;
        if target_offset == usize::MAX {
            return Err(err("jump targets a fused bytecode"));
        }
        if !bw.set_branch_target(builder_pos, target_offset) {
            return Err(err(
                "branch bytecode exceeded the maximum branch offset limit",
            ));
        }
    }

    let desc = UnlinkedCodeBlockDesc {
        built: bw.finish(),
        upvalues,
        num_fixed_arguments: proto.num_fixed_params,
        has_variadic_arguments: proto.takes_vararg,
        stack_frame_num_slots: frame_slots,
    };
    Ok(UnlinkedCodeBlock::create(&mut vm.layout, desc, vm.global_object))
}

fn emit_arith(bw: &mut BytecodeBuilder, op: &str, lhs: Operand, rhs: Operand, dst: u16) {
    match op {
        "ADD" => bw.create_add(lhs, rhs, dst),
        "SUB" => bw.create_sub(lhs, rhs, dst),
        "MUL" => bw.create_mul(lhs, rhs, dst),
        "DIV" => bw.create_div(lhs, rhs, dst),
        _ => bw.create_mod(lhs, rhs, dst),
    }
}
