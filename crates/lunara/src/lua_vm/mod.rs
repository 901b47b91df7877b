// VM global state: the heap, the string conser, pinned strings, cached
// root structures, the global object and the coroutine of record.

pub mod bytecode;
mod const_string;
pub mod coroutine;
pub mod execute;
pub mod inline_cache;
mod lua_error;
pub mod numeric;

pub use bytecode::{BytecodeBuilder, CodeBlock, Opcode, UnlinkedCodeBlock};
pub use const_string::ConstStrings;
pub use coroutine::{
    CoroutineRuntimeContext, CoroutineStatus, StackFrameHeader, X_DEFAULT_STACK_SLOTS,
    X_MIN_NIL_FILL_RETURN_VALUES, X_NUM_SLOTS_FOR_STACK_FRAME_HEADER,
};
pub use lua_error::{ModuleLoadError, VmError, VmResult};

use crate::gc::{GeneralHeapPtr, StringInterner, SystemHeapPtr, UserHeapPtr, VmLayout};
use crate::hidden_class::metamethod_kind::LuaMetamethodKind;
use crate::hidden_class::structure::Structure;
use crate::lib_registry::LibFnRecord;
use crate::lua_value::heap_string::HeapString;
use crate::lua_value::table_iterator::IterationSentinels;
use crate::lua_value::table_object::TableObject;
use crate::lua_value::TValue;

/// Largest inline named-storage capacity handed to fresh tables; larger
/// property counts spill to the butterfly through normal transitions.
pub const X_MAX_INLINE_CAPACITY: u8 = 32;

pub struct Vm {
    pub layout: Box<VmLayout>,
    pub interner: StringInterner,
    pub const_strings: ConstStrings,

    initial_structures: [SystemHeapPtr<Structure>; X_MAX_INLINE_CAPACITY as usize + 1],

    pub global_object: UserHeapPtr<TableObject>,
    pub root_coroutine: UserHeapPtr<CoroutineRuntimeContext>,
    pub current_coroutine: UserHeapPtr<CoroutineRuntimeContext>,

    /// Error object of the most recent raise (see VmError::Raised).
    pub error_object: TValue,

    /// Registered library functions, indexed by ExecutableCode ordinal.
    pub lib_registry: Vec<LibFnRecord>,

    /// The true `base.next` FunctionObject: the KV-loop bytecodes compare
    /// the loop's iterator function against this to take the fast path.
    pub true_base_next_function: TValue,
    /// `base.error`, used by xpcall's non-callable-callee path.
    pub base_error_function: TValue,
    /// The iterator function ipairs hands out.
    pub ipairs_iterator_function: TValue,
    /// Prototype of the closures coroutine.wrap hands out.
    pub coroutine_wrap_invoke_function: TValue,

    /// Shared metatable of all string values (string library methods).
    pub string_metatable: UserHeapPtr<TableObject>,

    /// math.random state (xorshift-multiplied, seeded by randomseed).
    pub random_state: u64,

    /// Scratch for number formatting and concat assembly.
    pub tostring_scratch: Vec<u8>,
}

impl Vm {
    pub fn new() -> Box<Vm> {
        let mut layout = VmLayout::reserve();
        let mut interner = StringInterner::new(&mut layout);
        let const_strings = ConstStrings::new(&mut layout, &mut interner);

        let mut initial_structures =
            [SystemHeapPtr::null(); X_MAX_INLINE_CAPACITY as usize + 1];
        for (cap, slot) in initial_structures.iter_mut().enumerate() {
            *slot = Structure::create_initial(&mut layout, cap as u8);
        }

        let global_object =
            TableObject::create_empty(&mut layout, initial_structures[16], 0);
        let root_coroutine = CoroutineRuntimeContext::create(&mut layout, global_object);
        unsafe { root_coroutine.as_mut() }
            .set_status(crate::lua_vm::coroutine::CoroutineStatus::Active);

        let mut vm = Box::new(Vm {
            layout,
            interner,
            const_strings,
            initial_structures,
            global_object,
            root_coroutine,
            current_coroutine: root_coroutine,
            error_object: TValue::nil(),
            lib_registry: Vec::new(),
            true_base_next_function: TValue::nil(),
            base_error_function: TValue::nil(),
            ipairs_iterator_function: TValue::nil(),
            coroutine_wrap_invoke_function: TValue::nil(),
            string_metatable: UserHeapPtr::null(),
            random_state: 0x2545_F491_4F6C_DD1D,
            tostring_scratch: Vec::with_capacity(64),
        });
        crate::stdlib::install_all(&mut vm);
        vm
    }

    // ============ object creation ============

    #[inline]
    pub fn create_string(&mut self, bytes: &[u8]) -> TValue {
        TValue::pointer(self.interner.intern(&mut self.layout, bytes))
    }

    pub fn create_string_from_str(&mut self, s: &str) -> TValue {
        self.create_string(s.as_bytes())
    }

    pub fn initial_structure_for_inline_capacity(&self, cap: u32) -> SystemHeapPtr<Structure> {
        // Round up to the next cached step so shapes converge.
        let cap = cap.min(X_MAX_INLINE_CAPACITY as u32);
        let stepped = match cap {
            0..=4 => cap,
            5..=8 => 8,
            9..=16 => 16,
            17..=24 => 24,
            _ => 32,
        };
        self.initial_structures[stepped as usize]
    }

    pub fn create_table(&mut self, inline_capacity: u32, array_hint: u32) -> TValue {
        let structure = self.initial_structure_for_inline_capacity(inline_capacity);
        TValue::pointer(TableObject::create_empty(&mut self.layout, structure, array_hint))
    }

    pub fn stringify_double_value(&mut self, d: f64) -> TValue {
        self.tostring_scratch.clear();
        let mut scratch = std::mem::take(&mut self.tostring_scratch);
        numeric::stringify_double(&mut scratch, d);
        let s = self.create_string(&scratch);
        self.tostring_scratch = scratch;
        s
    }

    pub fn stringify_int32_value(&mut self, v: i32) -> TValue {
        self.tostring_scratch.clear();
        let mut scratch = std::mem::take(&mut self.tostring_scratch);
        numeric::stringify_int32(&mut scratch, v);
        let s = self.create_string(&scratch);
        self.tostring_scratch = scratch;
        s
    }

    // ============ globals ============

    pub fn set_global(&mut self, name: &str, value: TValue) {
        let key = self.interner.intern(&mut self.layout, name.as_bytes());
        TableObject::put_by_id(self.global_object, &mut self.layout, key, value);
    }

    pub fn get_global(&mut self, name: &str) -> TValue {
        let key = self.interner.intern(&mut self.layout, name.as_bytes());
        TableObject::get_by_id(self.global_object, key)
    }

    // ============ misc plumbing ============

    #[inline]
    pub fn metamethod_name_string(&self, kind: LuaMetamethodKind) -> UserHeapPtr<HeapString> {
        self.const_strings.metamethod_name(kind).as_pointer()
    }

    #[inline]
    pub fn iteration_sentinels(&self) -> IterationSentinels {
        IterationSentinels {
            metatable_slot: GeneralHeapPtr::from_user(
                self.interner.special_key_for_metatable_slot(),
            ),
            boolean_false: GeneralHeapPtr::from_user(self.interner.special_key_for_boolean(false)),
            boolean_true: GeneralHeapPtr::from_user(self.interner.special_key_for_boolean(true)),
        }
    }

    /// Parks the error object and produces the raise signal.
    #[inline]
    pub fn throw_value(&mut self, obj: TValue) -> VmError {
        self.error_object = obj;
        VmError::Raised
    }

    /// Raises a VM-produced message (a Lua string).
    pub fn throw_str(&mut self, msg: &str) -> VmError {
        let obj = self.create_string_from_str(msg);
        self.throw_value(obj)
    }

    pub fn throw_fmt(&mut self, msg: String) -> VmError {
        let obj = self.create_string(msg.as_bytes());
        self.throw_value(obj)
    }

    /// Formats the parked error object for diagnostics.
    pub fn error_message(&self) -> String {
        crate::lua_vm::execute::display_value(self.error_object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_bootstrap() {
        let mut vm = Vm::new();
        // The base library populated the global object.
        assert!(vm.get_global("print").is_function());
        assert!(vm.get_global("pairs").is_function());
        assert!(vm.get_global("_G").is_table());
        assert!(vm.get_global("no_such_global").is_nil());
    }

    #[test]
    fn test_global_roundtrip() {
        let mut vm = Vm::new();
        let v = vm.create_string(b"hello");
        vm.set_global("greeting", v);
        assert_eq!(vm.get_global("greeting"), v);
    }

    #[test]
    fn test_metamethod_names_pinned_with_ordinals() {
        let vm = Vm::new();
        let idx = vm.const_strings.metamethod_name(LuaMetamethodKind::Index);
        let s = unsafe { idx.as_pointer::<HeapString>().as_ref() };
        assert_eq!(s.metamethod_ordinal(), Some(LuaMetamethodKind::Index as u8));
        assert_eq!(s.as_bytes(), b"__index");
    }
}
