// Common heap-object headers.
//
// Every user-heap object starts with the same 8-byte header:
//
//   { hidden_class: u32, ty: u8, cell_state: u8, opaque: u8, array_type: u8 }
//
// `hidden_class` is a SystemHeapPtr to the object's Structure for tables;
// for every other object kind it is a fixed constant below
// X_MINIMUM_VALID_HEAP_ADDRESS, so hidden class alone determines the type.
// `array_type` is X_INVALID_ARRAY_TYPE (0xFF) for every non-table object:
// an inline cache keyed on hidden class may therefore test "is a table"
// with a single byte compare and no extra type check.
//
// System-heap objects carry a narrower 2-byte header { ty, cell_state }.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeapEntityType {
    String = 0,
    Function,
    Userdata,
    Thread,
    Table,
    Upvalue,
    ArraySparseMap,
    // System-heap kinds
    Structure,
    CacheableDictionary,
    UncacheableDictionary,
    StructureAnchorHashTable,
    ExecutableCode,
    CodeBlock,
    UnlinkedCodeBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcCellState {
    Black = 0,
    Grey = 1,
    White = 2,
}

pub const X_DEFAULT_CELL_STATE: GcCellState = GcCellState::White;

/// `array_type` value carried by every non-table heap object.
pub const X_INVALID_ARRAY_TYPE: u8 = 0xFF;

// Fixed hidden-class constants for non-table user-heap objects. All below
// X_MINIMUM_VALID_HEAP_ADDRESS, so they can never collide with a real
// Structure pointer.
pub const X_HIDDEN_CLASS_FOR_STRING: u32 = 0x08;
pub const X_HIDDEN_CLASS_FOR_COROUTINE: u32 = 0x10;
pub const X_HIDDEN_CLASS_FOR_UPVALUE: u32 = 0x18;
pub const X_HIDDEN_CLASS_FOR_FUNCTION: u32 = 0x20;
pub const X_HIDDEN_CLASS_FOR_USERDATA: u32 = 0x28;
pub const X_HIDDEN_CLASS_FOR_SPARSE_MAP: u32 = 0x30;

#[derive(Clone, Copy)]
#[repr(C)]
pub struct UserHeapGcHeader {
    pub hidden_class: u32,
    pub ty: HeapEntityType,
    pub cell_state: GcCellState,
    pub opaque: u8,
    pub array_type: u8,
}

impl UserHeapGcHeader {
    #[inline(always)]
    pub fn new(hidden_class: u32, ty: HeapEntityType) -> Self {
        UserHeapGcHeader {
            hidden_class,
            ty,
            cell_state: X_DEFAULT_CELL_STATE,
            opaque: 0,
            array_type: X_INVALID_ARRAY_TYPE,
        }
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct SystemHeapGcHeader {
    pub ty: HeapEntityType,
    pub cell_state: GcCellState,
}

impl SystemHeapGcHeader {
    #[inline(always)]
    pub fn new(ty: HeapEntityType) -> Self {
        SystemHeapGcHeader { ty, cell_state: X_DEFAULT_CELL_STATE }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(std::mem::size_of::<UserHeapGcHeader>(), 8);
        assert_eq!(std::mem::size_of::<SystemHeapGcHeader>(), 2);
    }

    #[test]
    fn test_header_field_offsets() {
        // The write barrier addresses cell_state by byte offset.
        assert_eq!(std::mem::offset_of!(UserHeapGcHeader, cell_state), 5);
        assert_eq!(std::mem::offset_of!(SystemHeapGcHeader, cell_state), 1);
    }

    #[test]
    fn test_fixed_hidden_classes_below_valid_range() {
        for c in [
            X_HIDDEN_CLASS_FOR_STRING,
            X_HIDDEN_CLASS_FOR_COROUTINE,
            X_HIDDEN_CLASS_FOR_UPVALUE,
            X_HIDDEN_CLASS_FOR_FUNCTION,
            X_HIDDEN_CLASS_FOR_USERDATA,
        ] {
            assert!(c < crate::gc::vm_layout::X_MINIMUM_VALID_HEAP_ADDRESS);
        }
    }
}
