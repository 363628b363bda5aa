//! Backend abstraction over the IL2CPP runtime

pub mod traits;
pub mod detection;

pub use traits::*;
pub use detection::{find_process_by_name, locate_module, ModuleHandle};
