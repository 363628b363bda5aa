//! IL2CPP runtime access from inside the game process
//!
//! Resolves the embedding API exported by GameAssembly, walks its metadata to
//! the networking class, and copies managed byte arrays out of the heap.

pub mod offsets;
pub mod exports;
pub mod memory;
pub mod introspect;
pub mod array;

pub use exports::NativeExports;
pub use memory::SelfMemory;
pub use introspect::{MethodResolver, ResolvedMethod, RuntimeIntrospector};
pub use array::{ArrayLayout, ManagedArrayReader, ManagedArrayView};
