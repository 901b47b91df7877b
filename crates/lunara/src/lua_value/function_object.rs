// Executables and function objects.
//
// ExecutableCode is the system-heap description of something callable. The
// three kinds are discriminated by the tag of the `bytecode` field rather
// than a vtable:
//
//   bytecode == 0   intrinsic
//   bytecode  < 0   library (native) function; bitwise-NOT recovers the
//                   function pointer
//   bytecode  > 0   interpreted function; the raw address of the owning
//                   CodeBlock's private bytecode copy
//
// A FunctionObject pairs an executable with captured upvalues in a
// trailing array.

use crate::gc::gc_header::{HeapEntityType, X_HIDDEN_CLASS_FOR_FUNCTION};
use crate::gc::{
    write_barrier_user, GeneralHeapPtr, SystemHeapGcHeader, SystemHeapPtr, UserHeapGcHeader,
    UserHeapPtr, VmLayout,
};
use crate::lua_value::upvalue::Upvalue;

/// Native library function, identified by its registry ordinal. The
/// concrete call protocol lives in the library harness.
pub type LibFnOrdinal = u32;

#[repr(C)]
pub struct ExecutableCode {
    pub hdr: SystemHeapGcHeader,
    pub reserved: u8,
    pub has_variadic_arguments: bool,
    pub num_fixed_arguments: u32,
    pub bytecode: i64,
    /// Interpreter entry for bytecode functions (unused: single tier);
    /// for library functions, the registry ordinal.
    pub best_entry_point: u64,
}

impl ExecutableCode {
    #[inline(always)]
    pub fn is_intrinsic(&self) -> bool {
        self.bytecode == 0
    }

    #[inline(always)]
    pub fn is_library_function(&self) -> bool {
        self.bytecode < 0
    }

    #[inline(always)]
    pub fn is_bytecode_function(&self) -> bool {
        self.bytecode > 0
    }

    /// Registry ordinal of a library function, recovered from the negated
    /// tag.
    #[inline(always)]
    pub fn library_fn_ordinal(&self) -> LibFnOrdinal {
        debug_assert!(self.is_library_function());
        (!self.bytecode) as LibFnOrdinal
    }

    #[inline(always)]
    pub fn bytecode_addr(&self) -> usize {
        debug_assert!(self.is_bytecode_function());
        self.bytecode as usize
    }

    /// Creates the executable record for a library function. Library
    /// functions take no fixed arguments and accept varargs.
    pub fn create_library_function(
        layout: &mut VmLayout,
        ordinal: LibFnOrdinal,
    ) -> SystemHeapPtr<ExecutableCode> {
        let addr = layout.alloc_from_system_heap(std::mem::size_of::<ExecutableCode>());
        let e: SystemHeapPtr<ExecutableCode> = SystemHeapPtr::from_addr(addr);
        unsafe {
            let r = e.as_mut();
            r.hdr = SystemHeapGcHeader::new(HeapEntityType::ExecutableCode);
            r.reserved = 0;
            r.has_variadic_arguments = true;
            r.num_fixed_arguments = 0;
            r.bytecode = !(ordinal as i64);
            r.best_entry_point = ordinal as u64;
        }
        e
    }
}

#[repr(C)]
pub struct FunctionObject {
    pub hdr: UserHeapGcHeader,
    pub executable: SystemHeapPtr<ExecutableCode>,
    pub num_upvalues: u16,
    _pad: u16,
    // trailing: [GeneralHeapPtr<Upvalue>; num_upvalues]
}

pub const X_FUNCTION_TRAILING_OFFSET: usize = 16;

impl FunctionObject {
    fn create_impl(layout: &mut VmLayout, num_upvalues: u16) -> UserHeapPtr<FunctionObject> {
        let size = X_FUNCTION_TRAILING_OFFSET + num_upvalues as usize * 4;
        let addr = layout.alloc_from_user_heap(size);
        let f: UserHeapPtr<FunctionObject> = UserHeapPtr::from_addr(addr);
        unsafe {
            let r = f.as_mut();
            r.hdr = UserHeapGcHeader::new(X_HIDDEN_CLASS_FOR_FUNCTION, HeapEntityType::Function);
            r.executable = SystemHeapPtr::null();
            r.num_upvalues = num_upvalues;
            r._pad = 0;
            for i in 0..num_upvalues {
                *Self::upvalue_slot_ptr(f, i) = GeneralHeapPtr::null();
            }
        }
        f
    }

    pub fn create(
        layout: &mut VmLayout,
        executable: SystemHeapPtr<ExecutableCode>,
        num_upvalues: u16,
    ) -> UserHeapPtr<FunctionObject> {
        let f = Self::create_impl(layout, num_upvalues);
        unsafe { f.as_mut() }.executable = executable;
        f
    }

    #[inline(always)]
    fn upvalue_slot_ptr(
        this: UserHeapPtr<FunctionObject>,
        ord: u16,
    ) -> *mut GeneralHeapPtr<Upvalue> {
        unsafe {
            (this.as_ptr() as *mut u8).add(X_FUNCTION_TRAILING_OFFSET + ord as usize * 4)
                as *mut GeneralHeapPtr<Upvalue>
        }
    }

    #[inline]
    pub fn get_upvalue(this: UserHeapPtr<FunctionObject>, ord: u16) -> GeneralHeapPtr<Upvalue> {
        debug_assert!(ord < unsafe { this.as_ref() }.num_upvalues);
        unsafe { *Self::upvalue_slot_ptr(this, ord) }
    }

    #[inline]
    pub fn set_upvalue(
        this: UserHeapPtr<FunctionObject>,
        ord: u16,
        upvalue: GeneralHeapPtr<Upvalue>,
    ) {
        debug_assert!(ord < unsafe { this.as_ref() }.num_upvalues);
        unsafe {
            *Self::upvalue_slot_ptr(this, ord) = upvalue;
            write_barrier_user(this.as_ptr() as usize);
        }
    }

    #[inline(always)]
    pub fn executable_ref<'a>(this: UserHeapPtr<FunctionObject>) -> &'a ExecutableCode {
        unsafe { this.as_ref().executable.as_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_value::tvalue::TValue;

    #[test]
    fn test_executable_discriminant() {
        let mut layout = VmLayout::reserve();
        let e = ExecutableCode::create_library_function(&mut layout, 17);
        let er = unsafe { e.as_ref() };
        assert!(er.is_library_function());
        assert!(!er.is_bytecode_function());
        assert!(!er.is_intrinsic());
        assert_eq!(er.library_fn_ordinal(), 17);
    }

    #[test]
    fn test_function_upvalue_array() {
        let mut layout = VmLayout::reserve();
        let e = ExecutableCode::create_library_function(&mut layout, 0);
        let f = FunctionObject::create(&mut layout, e, 2);
        let u0 = Upvalue::create_closed(&mut layout, TValue::double(1.0));
        let u1 = Upvalue::create_closed(&mut layout, TValue::double(2.0));
        FunctionObject::set_upvalue(f, 0, GeneralHeapPtr::from_user(u0));
        FunctionObject::set_upvalue(f, 1, GeneralHeapPtr::from_user(u1));
        let got = FunctionObject::get_upvalue(f, 1);
        assert_eq!(unsafe { got.to_user().as_ref() }.get().as_double(), 2.0);
    }
}
