// Value representation and the user-heap object model.

pub mod butterfly;
pub mod function_object;
pub mod heap_string;
pub mod sparse_map;
pub mod table_iterator;
pub mod table_object;
pub mod tvalue;
pub mod type_mask;
pub mod upvalue;

pub use function_object::{ExecutableCode, FunctionObject};
pub use heap_string::HeapString;
pub use table_object::TableObject;
pub use tvalue::{MiscImmediateValue, TValue};
pub use type_mask::TypeMask;
pub use upvalue::Upvalue;
