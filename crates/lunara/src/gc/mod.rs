// Heap layout, pointer kinds, object headers, the store barrier and the
// global string conser. Collection itself is an external collaborator; this
// module owns the memory and the contracts the collector relies on.

pub mod gc_header;
pub mod heap_ptr;
pub mod string_interner;
pub mod vm_layout;
pub mod write_barrier;

pub use gc_header::{GcCellState, HeapEntityType, SystemHeapGcHeader, UserHeapGcHeader};
pub use heap_ptr::{GeneralHeapPtr, SpdsPtr, SystemHeapPtr, UserHeapPtr};
pub use string_interner::StringInterner;
pub use vm_layout::{vm_base, VmLayout};
pub use write_barrier::{write_barrier_system, write_barrier_user};
