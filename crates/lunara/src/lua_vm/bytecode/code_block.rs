// UnlinkedCodeBlock and CodeBlock.
//
// An UnlinkedCodeBlock uniquely corresponds to a function prototype: the
// master bytecode, the constant table, upvalue metadata and the metadata
// use counts. Each (UnlinkedCodeBlock, GlobalObject) pair lazily
// materializes one CodeBlock: the executable instance, owning a private
// copy of the bytecode (runtime opcode patching specializes per instance)
// and the trailing metadata array the in-bytecode metadata fields index.
//
// Constant-table entries are raw 64-bit words: either TValue bit patterns
// or, for child-prototype references, the child's system-heap offset.
// Such an offset reads back as a denormal-range double under any TValue
// interpretation, so nothing that scans the table can mistake it for a
// heap reference.

use hashbrown::HashMap;

use crate::gc::gc_header::HeapEntityType;
use crate::gc::{SystemHeapGcHeader, SystemHeapPtr, UserHeapPtr, VmLayout};
use crate::lua_value::function_object::ExecutableCode;
use crate::lua_value::table_object::TableObject;

use super::builder::{BuiltBytecode, MetadataFieldPatch};
use super::{X_METADATA_KIND_LAYOUT, X_NUM_BYTECODE_METADATA_KINDS};

#[derive(Clone, Copy)]
#[repr(C)]
pub struct UpvalueMetadata {
    /// True: `slot` is a parent stack slot; false: a parent upvalue ordinal.
    pub is_parent_local: bool,
    /// Only meaningful for parent locals.
    pub is_immutable: bool,
    pub slot: u32,
}

fn alloc_sys_array<T: Copy>(layout: &mut VmLayout, data: &[T]) -> SystemHeapPtr<T> {
    if data.is_empty() {
        return SystemHeapPtr::null();
    }
    let addr = layout.alloc_from_system_heap(std::mem::size_of_val(data));
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut T, data.len());
    }
    SystemHeapPtr::from_addr(addr)
}

#[repr(C)]
pub struct UnlinkedCodeBlock {
    pub hdr: SystemHeapGcHeader,
    pub has_variadic_arguments: bool,
    pub num_fixed_arguments: u32,
    pub num_upvalues: u32,
    pub stack_frame_num_slots: u32,
    pub bytecode_length: u32,
    pub cst_table_length: u32,
    pub num_metadata_patches: u32,
    pub bytecode: SystemHeapPtr<u8>,
    pub cst_table: SystemHeapPtr<u64>,
    pub upvalue_info: SystemHeapPtr<UpvalueMetadata>,
    pub metadata_patches: SystemHeapPtr<MetadataFieldPatch>,
    pub metadata_counts: [u16; X_NUM_BYTECODE_METADATA_KINDS],
    pub parent: SystemHeapPtr<UnlinkedCodeBlock>,
    pub default_global_object: UserHeapPtr<TableObject>,
    pub default_code_block: SystemHeapPtr<CodeBlock>,
    // Rare: non-default global objects. Never dropped (system heap).
    rare_go_to_cb_map: Option<Box<HashMap<i64, u32>>>,
}

pub struct UnlinkedCodeBlockDesc {
    pub built: BuiltBytecode,
    pub upvalues: Vec<UpvalueMetadata>,
    pub num_fixed_arguments: u32,
    pub has_variadic_arguments: bool,
    pub stack_frame_num_slots: u32,
}

impl UnlinkedCodeBlock {
    pub fn create(
        layout: &mut VmLayout,
        desc: UnlinkedCodeBlockDesc,
        default_global_object: UserHeapPtr<TableObject>,
    ) -> SystemHeapPtr<UnlinkedCodeBlock> {
        let bytecode = alloc_sys_array(layout, &desc.built.bytecode);
        let cst_table = alloc_sys_array(layout, &desc.built.constants);
        let upvalue_info = alloc_sys_array(layout, &desc.upvalues);
        let metadata_patches = alloc_sys_array(layout, &desc.built.metadata_patches);

        let addr = layout.alloc_from_system_heap(std::mem::size_of::<UnlinkedCodeBlock>());
        let ucb: SystemHeapPtr<UnlinkedCodeBlock> = SystemHeapPtr::from_addr(addr);
        unsafe {
            std::ptr::write(
                ucb.as_ptr(),
                UnlinkedCodeBlock {
                    hdr: SystemHeapGcHeader::new(HeapEntityType::UnlinkedCodeBlock),
                    has_variadic_arguments: desc.has_variadic_arguments,
                    num_fixed_arguments: desc.num_fixed_arguments,
                    num_upvalues: desc.upvalues.len() as u32,
                    stack_frame_num_slots: desc.stack_frame_num_slots,
                    bytecode_length: desc.built.bytecode.len() as u32,
                    cst_table_length: desc.built.constants.len() as u32,
                    num_metadata_patches: desc.built.metadata_patches.len() as u32,
                    bytecode,
                    cst_table,
                    upvalue_info,
                    metadata_patches,
                    metadata_counts: desc.built.metadata_counts,
                    parent: SystemHeapPtr::null(),
                    default_global_object,
                    default_code_block: SystemHeapPtr::null(),
                    rare_go_to_cb_map: None,
                },
            );
        }
        ucb
    }

    #[inline(always)]
    pub fn constant(&self, ord: u16) -> u64 {
        debug_assert!((ord as u32) < self.cst_table_length);
        unsafe { *self.cst_table.as_ptr().add(ord as usize) }
    }

    #[inline]
    pub fn upvalue_metadata(&self, ord: u32) -> UpvalueMetadata {
        debug_assert!(ord < self.num_upvalues);
        unsafe { *self.upvalue_info.as_ptr().add(ord as usize) }
    }

    /// The CodeBlock for (self, global_object), materialized lazily; the
    /// default global object's instance is cached in a dedicated field.
    pub fn get_code_block(
        this: SystemHeapPtr<UnlinkedCodeBlock>,
        layout: &mut VmLayout,
        global_object: UserHeapPtr<TableObject>,
    ) -> SystemHeapPtr<CodeBlock> {
        let ucb = unsafe { this.as_mut() };
        if global_object == ucb.default_global_object {
            if ucb.default_code_block.is_null() {
                ucb.default_code_block = CodeBlock::create(layout, this, global_object);
            }
            return ucb.default_code_block;
        }
        let map = ucb.rare_go_to_cb_map.get_or_insert_with(|| Box::new(HashMap::new()));
        if let Some(&raw) = map.get(&global_object.raw()) {
            return SystemHeapPtr::from_raw(raw);
        }
        let cb = CodeBlock::create(layout, this, global_object);
        unsafe { this.as_mut() }
            .rare_go_to_cb_map
            .as_mut()
            .unwrap()
            .insert(global_object.raw(), cb.raw());
        cb
    }
}

#[repr(C)]
pub struct CodeBlock {
    pub base: ExecutableCode,
    pub global_object: UserHeapPtr<TableObject>,
    pub stack_frame_num_slots: u32,
    pub num_upvalues: u32,
    pub bytecode_length: u32,
    pub bytecode_metadata_length: u32,
    pub owner: SystemHeapPtr<UnlinkedCodeBlock>,
    // trailing: metadata regions, each kind aligned per its declared
    // log2 alignment, total rounded up to 8
}

pub const X_CODE_BLOCK_TRAILING_OFFSET: usize = std::mem::size_of::<CodeBlock>();

impl CodeBlock {
    pub fn create(
        layout: &mut VmLayout,
        ucb_ptr: SystemHeapPtr<UnlinkedCodeBlock>,
        global_object: UserHeapPtr<TableObject>,
    ) -> SystemHeapPtr<CodeBlock> {
        let ucb = unsafe { ucb_ptr.as_ref() };

        // Lay out the metadata regions after the CodeBlock fields. This
        // must agree with how the interpreter reads the patched fields:
        // offsets are relative to the CodeBlock base address.
        let mut cur = X_CODE_BLOCK_TRAILING_OFFSET;
        let mut base_offset = [0usize; X_NUM_BYTECODE_METADATA_KINDS];
        for kind in 0..X_NUM_BYTECODE_METADATA_KINDS {
            let (size, log2_align) = X_METADATA_KIND_LAYOUT[kind];
            debug_assert!(log2_align <= 3);
            let align = 1usize << log2_align;
            cur = (cur + align - 1) & !(align - 1);
            base_offset[kind] = cur;
            cur += size * ucb.metadata_counts[kind] as usize;
        }
        let total_size = (cur + 7) & !7;
        let trailing_size = total_size - X_CODE_BLOCK_TRAILING_OFFSET;

        // Private bytecode copy: runtime opcode patching must not leak
        // into other (UCB, GlobalObject) instances.
        let bc_len = ucb.bytecode_length as usize;
        let bc_addr = layout.alloc_from_system_heap(bc_len.max(1));
        unsafe {
            std::ptr::copy_nonoverlapping(ucb.bytecode.as_ptr(), bc_addr as *mut u8, bc_len);
        }

        let cb_addr = layout.alloc_from_system_heap(total_size);
        let cb: SystemHeapPtr<CodeBlock> = SystemHeapPtr::from_addr(cb_addr);
        unsafe {
            let c = cb.as_mut();
            c.base = ExecutableCode {
                hdr: SystemHeapGcHeader::new(HeapEntityType::CodeBlock),
                reserved: 0,
                has_variadic_arguments: ucb.has_variadic_arguments,
                num_fixed_arguments: ucb.num_fixed_arguments,
                bytecode: bc_addr as i64,
                best_entry_point: 0,
            };
            c.global_object = global_object;
            c.stack_frame_num_slots = ucb.stack_frame_num_slots;
            c.num_upvalues = ucb.num_upvalues;
            c.bytecode_length = ucb.bytecode_length;
            c.bytecode_metadata_length = trailing_size as u32;
            c.owner = ucb_ptr;
            std::ptr::write_bytes((cb_addr + X_CODE_BLOCK_TRAILING_OFFSET) as *mut u8, 0, trailing_size);

            // Patch the in-bytecode metadata fields to their final offsets.
            for i in 0..ucb.num_metadata_patches as usize {
                let patch = *ucb.metadata_patches.as_ptr().add(i);
                let kind = patch.kind as usize;
                let (size, _) = X_METADATA_KIND_LAYOUT[kind];
                let offset = base_offset[kind] + size * patch.index as usize;
                let field = (bc_addr + patch.bytecode_offset as usize) as *mut u8;
                std::ptr::copy_nonoverlapping(
                    (offset as u32).to_le_bytes().as_ptr(),
                    field,
                    4,
                );
            }
        }

        tracing::trace!(
            bytecode_len = bc_len,
            metadata_len = trailing_size,
            "materialized code block"
        );
        cb
    }

    #[inline(always)]
    pub fn bytecode_ptr(&self) -> *mut u8 {
        self.base.bytecode as usize as *mut u8
    }

    /// Resolves a patched metadata field value to the metadata struct.
    #[inline(always)]
    pub fn metadata_ptr<T>(this: SystemHeapPtr<CodeBlock>, offset: u32) -> *mut T {
        debug_assert!(
            offset as usize >= X_CODE_BLOCK_TRAILING_OFFSET
                && (offset as usize) < X_CODE_BLOCK_TRAILING_OFFSET
                    + unsafe { this.as_ref() }.bytecode_metadata_length as usize
        );
        unsafe { (this.as_ptr() as *mut u8).add(offset as usize) as *mut T }
    }

    #[inline(always)]
    pub fn constant(&self, ord: u16) -> u64 {
        unsafe { self.owner.as_ref() }.constant(ord)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::bytecode::builder::BytecodeBuilder;
    use crate::lua_vm::bytecode::{Opcode, X_METADATA_KIND_GET_BY_ID_IC};
    use crate::lua_vm::inline_cache::GetByIdIcSite;
    use crate::lua_value::tvalue::TValue;

    fn make_ucb(layout: &mut VmLayout) -> SystemHeapPtr<UnlinkedCodeBlock> {
        let mut bw = BytecodeBuilder::new();
        let k = bw.add_constant_value(TValue::double(1.0));
        bw.create_table_get_by_id(0, k, 1);
        bw.create_table_get_by_id(0, k, 2);
        bw.create_ret0();
        UnlinkedCodeBlock::create(
            layout,
            UnlinkedCodeBlockDesc {
                built: bw.finish(),
                upvalues: vec![],
                num_fixed_arguments: 1,
                has_variadic_arguments: false,
                stack_frame_num_slots: 8,
            },
            UserHeapPtr::null(),
        )
    }

    #[test]
    fn test_metadata_layout_and_patching() {
        let mut layout = VmLayout::reserve();
        let ucb = make_ucb(&mut layout);
        let cb = CodeBlock::create(&mut layout, ucb, UserHeapPtr::null());
        let c = unsafe { cb.as_ref() };
        assert_eq!(c.stack_frame_num_slots, 8);

        // Both sites must resolve into the trailing region, at distinct,
        // properly aligned offsets one struct apart.
        unsafe {
            let bc = c.bytecode_ptr();
            let read_field = |pos: usize| -> u32 {
                let mut b = [0u8; 4];
                std::ptr::copy_nonoverlapping(bc.add(pos), b.as_mut_ptr(), 4);
                u32::from_le_bytes(b)
            };
            let first = read_field(7);
            let second = read_field(Opcode::TableGetById.encoded_length() + 7);
            assert!(first as usize >= X_CODE_BLOCK_TRAILING_OFFSET);
            assert_eq!(
                second - first,
                std::mem::size_of::<GetByIdIcSite>() as u32
            );
            assert_eq!(first % 4, 0);
            let site: *mut GetByIdIcSite = CodeBlock::metadata_ptr(cb, first);
            assert_eq!((*site).keys, [0; 4]);
            let _ = X_METADATA_KIND_GET_BY_ID_IC;
        }
    }

    #[test]
    fn test_code_block_per_global_object() {
        let mut layout = VmLayout::reserve();
        let ucb = make_ucb(&mut layout);
        let go1: UserHeapPtr<TableObject> =
            UserHeapPtr::<()>::from_addr(layout.alloc_from_user_heap(16)).cast();
        let go2: UserHeapPtr<TableObject> =
            UserHeapPtr::<()>::from_addr(layout.alloc_from_user_heap(16)).cast();
        unsafe { ucb.as_mut() }.default_global_object = go1;

        let a = UnlinkedCodeBlock::get_code_block(ucb, &mut layout, go1);
        let b = UnlinkedCodeBlock::get_code_block(ucb, &mut layout, go1);
        let c = UnlinkedCodeBlock::get_code_block(ucb, &mut layout, go2);
        let d = UnlinkedCodeBlock::get_code_block(ucb, &mut layout, go2);
        assert_eq!(a, b);
        assert_eq!(c, d);
        assert!(a != c);
        // Private bytecode copies.
        assert!(unsafe { a.as_ref() }.base.bytecode != unsafe { c.as_ref() }.base.bytecode);
    }
}
