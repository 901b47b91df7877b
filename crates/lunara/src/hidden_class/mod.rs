// Hidden classes: structures, their transition DAG, the shared anchor
// tables for large shapes, and the dictionary fallback classes.

pub mod anchor_table;
pub mod array_type;
pub mod dictionary;
pub mod metamethod_kind;
pub mod structure;

pub use anchor_table::StructureAnchorHashTable;
pub use array_type::{ArrayElementKind, ArrayType};
pub use dictionary::DictionaryHiddenClass;
pub use metamethod_kind::{LuaMetamethodKind, X_METAMETHOD_NAMES, X_NUM_METAMETHOD_KINDS};
pub use structure::{
    AddPropertyResult, SetMetatableResult, Structure, StructureMetatableKind, TransitionKey,
    TransitionKind, X_MAX_STRUCTURE_SLOTS,
};
