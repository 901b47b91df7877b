// Pre-created, pinned strings: metamethod names (tagged with their ordinal
// in the header opaque byte so structures can maintain the known-absent
// masks with one byte compare), type names, and coroutine status names.

use crate::gc::{StringInterner, VmLayout};
use crate::hidden_class::metamethod_kind::{
    LuaMetamethodKind, X_METAMETHOD_NAMES, X_NUM_METAMETHOD_KINDS,
};
use crate::lua_value::TValue;

pub struct ConstStrings {
    pub tm_names: [TValue; X_NUM_METAMETHOD_KINDS],

    pub str_nil: TValue,
    pub str_boolean: TValue,
    pub str_number: TValue,
    pub str_string: TValue,
    pub str_table: TValue,
    pub str_function: TValue,
    pub str_userdata: TValue,
    pub str_thread: TValue,
    pub str_true: TValue,
    pub str_false: TValue,

    pub str_suspended: TValue,
    pub str_running: TValue,
    pub str_normal: TValue,
    pub str_dead: TValue,

    pub str_empty: TValue,
}

impl ConstStrings {
    pub fn new(layout: &mut VmLayout, interner: &mut StringInterner) -> ConstStrings {
        let mut tm_names = [TValue::nil(); X_NUM_METAMETHOD_KINDS];
        for (i, name) in X_METAMETHOD_NAMES.iter().enumerate() {
            let s = interner.intern(layout, name.as_bytes());
            unsafe { s.as_mut() }.hdr.opaque = i as u8 + 1;
            tm_names[i] = TValue::pointer(s);
        }

        let mut mk = |bytes: &[u8]| TValue::pointer(interner.intern(layout, bytes));
        ConstStrings {
            tm_names,
            str_nil: mk(b"nil"),
            str_boolean: mk(b"boolean"),
            str_number: mk(b"number"),
            str_string: mk(b"string"),
            str_table: mk(b"table"),
            str_function: mk(b"function"),
            str_userdata: mk(b"userdata"),
            str_thread: mk(b"thread"),
            str_true: mk(b"true"),
            str_false: mk(b"false"),
            str_suspended: mk(b"suspended"),
            str_running: mk(b"running"),
            str_normal: mk(b"normal"),
            str_dead: mk(b"dead"),
            str_empty: mk(b""),
        }
    }

    #[inline(always)]
    pub fn metamethod_name(&self, kind: LuaMetamethodKind) -> TValue {
        self.tm_names[kind as usize]
    }
}
