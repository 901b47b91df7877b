// Upvalues: 32-byte cells that are either open (ptr aims at a live stack
// slot) or closed (ptr aims at the embedded tv).
//
// Open upvalues of a coroutine are linked through `prev` in strictly
// decreasing stack-address order, and no two open upvalues share a slot;
// find-or-create walks the list to the insertion point, close walks the
// prefix at or above the closing base.

use crate::gc::gc_header::{HeapEntityType, UserHeapGcHeader, X_HIDDEN_CLASS_FOR_UPVALUE};
use crate::gc::{write_barrier_user, UserHeapPtr, VmLayout};
use crate::lua_value::tvalue::TValue;

const OPAQUE_BIT_CLOSED: u8 = 1;
const OPAQUE_BIT_IMMUTABLE: u8 = 2;

#[repr(C)]
pub struct Upvalue {
    pub hdr: UserHeapGcHeader,
    pub ptr: *mut TValue,
    pub tv: TValue,
    pub prev: UserHeapPtr<Upvalue>,
}

impl Upvalue {
    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.hdr.opaque & OPAQUE_BIT_CLOSED != 0
    }

    #[inline(always)]
    pub fn is_immutable(&self) -> bool {
        self.hdr.opaque & OPAQUE_BIT_IMMUTABLE != 0
    }

    #[inline(always)]
    pub fn get(&self) -> TValue {
        unsafe { *self.ptr }
    }

    #[inline(always)]
    pub fn set(&mut self, v: TValue) {
        unsafe { *self.ptr = v };
        if v.is_pointer() {
            unsafe { write_barrier_user(self as *mut Upvalue as usize) };
        }
    }

    fn create_raw(
        layout: &mut VmLayout,
        dst: *mut TValue,
        prev: UserHeapPtr<Upvalue>,
        immutable: bool,
    ) -> UserHeapPtr<Upvalue> {
        let addr = layout.alloc_from_user_heap(std::mem::size_of::<Upvalue>());
        let u: UserHeapPtr<Upvalue> = UserHeapPtr::from_addr(addr);
        unsafe {
            let r = u.as_mut();
            r.hdr = UserHeapGcHeader::new(X_HIDDEN_CLASS_FOR_UPVALUE, HeapEntityType::Upvalue);
            if immutable {
                r.hdr.opaque |= OPAQUE_BIT_IMMUTABLE;
            }
            r.ptr = dst;
            r.tv = TValue::nil();
            r.prev = prev;
        }
        u
    }

    /// A closed upvalue born closed (immutable parent locals are snapshot
    /// at closure creation).
    pub fn create_closed(layout: &mut VmLayout, value: TValue) -> UserHeapPtr<Upvalue> {
        let u = Self::create_raw(layout, std::ptr::null_mut(), UserHeapPtr::null(), true);
        unsafe {
            let r = u.as_mut();
            r.tv = value;
            r.ptr = &mut r.tv;
            r.hdr.opaque |= OPAQUE_BIT_CLOSED;
        }
        u
    }

    /// Finds the open upvalue for `dst` in the coroutine's list, creating
    /// and linking one if absent. `list_head` is the coroutine's field.
    pub fn find_or_create_open(
        layout: &mut VmLayout,
        list_head: &mut UserHeapPtr<Upvalue>,
        dst: *mut TValue,
        immutable: bool,
    ) -> UserHeapPtr<Upvalue> {
        if list_head.is_null() || unsafe { list_head.as_ref() }.ptr < dst {
            // Empty list, or the new cell becomes the head.
            let fresh = Self::create_raw(layout, dst, *list_head, immutable);
            *list_head = fresh;
            return fresh;
        }

        // Invariant: the cell is inserted between cur and prev.
        let mut cur = *list_head;
        loop {
            let cur_ref = unsafe { cur.as_ref() };
            debug_assert!(!cur_ref.is_closed());
            debug_assert!(dst <= cur_ref.ptr);
            if cur_ref.ptr == dst {
                return cur;
            }
            let prev = cur_ref.prev;
            if prev.is_null() {
                break;
            }
            let prev_ref = unsafe { prev.as_ref() };
            debug_assert!(prev_ref.ptr < cur_ref.ptr);
            if prev_ref.ptr < dst {
                break;
            }
            cur = prev;
        }

        let cur_ref = unsafe { cur.as_mut() };
        let fresh = Self::create_raw(layout, dst, cur_ref.prev, immutable);
        cur_ref.prev = fresh;
        unsafe { write_barrier_user(cur.as_ptr() as usize) };
        fresh
    }

    #[inline]
    fn close(&mut self) {
        debug_assert!(!self.is_closed());
        self.tv = unsafe { *self.ptr };
        self.ptr = &mut self.tv;
        self.hdr.opaque |= OPAQUE_BIT_CLOSED;
    }

    /// Closes every open upvalue with `ptr >= base` and unlinks it.
    pub fn close_upvalues(list_head: &mut UserHeapPtr<Upvalue>, base: *mut TValue) {
        let mut cur = *list_head;
        while !cur.is_null() {
            let uv = unsafe { cur.as_mut() };
            if uv.ptr < base {
                break;
            }
            debug_assert!(!uv.is_closed());
            cur = uv.prev;
            uv.close();
        }
        *list_head = cur;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_list_sorted_descending_no_dup() {
        let mut layout = VmLayout::reserve();
        let mut stack = [TValue::nil(); 8];
        let base = stack.as_mut_ptr();
        let mut head = UserHeapPtr::null();

        let slots = [3usize, 1, 5, 2, 5];
        let mut created = Vec::new();
        for &s in &slots {
            created.push(Upvalue::find_or_create_open(
                &mut layout,
                &mut head,
                unsafe { base.add(s) },
                false,
            ));
        }
        // Same slot yields the same cell.
        assert_eq!(created[2], created[4]);

        // Walk: strictly decreasing addresses.
        let mut cur = head;
        let mut last: Option<*mut TValue> = None;
        let mut count = 0;
        while !cur.is_null() {
            let uv = unsafe { cur.as_ref() };
            if let Some(prev_ptr) = last {
                assert!(uv.ptr < prev_ptr);
            }
            last = Some(uv.ptr);
            cur = uv.prev;
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn test_close_prefix() {
        let mut layout = VmLayout::reserve();
        let mut stack = [TValue::nil(); 8];
        for (i, s) in stack.iter_mut().enumerate() {
            *s = TValue::double(i as f64);
        }
        let base = stack.as_mut_ptr();
        let mut head = UserHeapPtr::null();
        let low = Upvalue::find_or_create_open(&mut layout, &mut head, unsafe { base.add(1) }, false);
        let high = Upvalue::find_or_create_open(&mut layout, &mut head, unsafe { base.add(5) }, false);

        Upvalue::close_upvalues(&mut head, unsafe { base.add(3) });
        let high_ref = unsafe { high.as_ref() };
        assert!(high_ref.is_closed());
        assert_eq!(high_ref.get().as_double(), 5.0);
        let low_ref = unsafe { low.as_ref() };
        assert!(!low_ref.is_closed());
        assert_eq!(head, low);

        // Closed cell keeps its value even when the stack slot changes.
        stack[5] = TValue::double(99.0);
        assert_eq!(unsafe { high.as_ref() }.get().as_double(), 5.0);
    }

    #[test]
    fn test_closed_upvalue_roundtrip() {
        let mut layout = VmLayout::reserve();
        let u = Upvalue::create_closed(&mut layout, TValue::double(7.0));
        let uv = unsafe { u.as_mut() };
        assert!(uv.is_closed());
        assert_eq!(uv.get().as_double(), 7.0);
        uv.set(TValue::double(8.0));
        assert_eq!(uv.get().as_double(), 8.0);
    }
}
