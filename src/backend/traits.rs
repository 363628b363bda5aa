//! Core traits for the IL2CPP runtime surface
//!
//! The agent only talks to the runtime through [`RuntimeApi`] and reads raw
//! object memory through [`MemorySource`]. Introspection and array extraction
//! are written against these traits so they run the same way against the
//! live runtime and against a fake one.

use std::ffi::CStr;
use std::io;

use thiserror::Error;

macro_rules! runtime_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub usize);

        impl $name {
            /// Raw address inside the runtime's memory
            pub fn addr(self) -> usize {
                self.0
            }
        }
    };
}

runtime_handle!(
    /// `Il2CppDomain*`
    DomainHandle
);
runtime_handle!(
    /// `const Il2CppAssembly*`
    AssemblyHandle
);
runtime_handle!(
    /// `const Il2CppImage*`
    ImageHandle
);
runtime_handle!(
    /// `Il2CppClass*`
    ClassHandle
);
runtime_handle!(
    /// `const MethodInfo*`
    MethodHandle
);

/// Failure to resolve a module, export, class or method
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("runtime module not loaded: {0}")]
    ModuleNotFound(String),
    #[error("runtime export missing: {0}")]
    ExportMissing(&'static str),
    #[error("root domain unavailable")]
    NoDomain,
    #[error("class not found: {namespace}.{name}")]
    ClassNotFound { namespace: String, name: String },
    #[error("method not found: {name}/{arg_count}")]
    MethodNotFound { name: String, arg_count: i32 },
    #[error("method {0} has no native entry point")]
    NoEntryPoint(String),
    #[error("name contains an interior NUL: {0:?}")]
    InvalidName(String),
}

/// Failure to snapshot a managed array
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("array handle 0x{0:x} is not a plausible object address")]
    NullHandle(usize),
    #[error("array header at 0x{0:x} is not readable")]
    UnreadableHeader(usize),
    #[error("array length {0} outside (0, 50 MiB]")]
    LengthOutOfBounds(u32),
    #[error("runtime returned no element data")]
    NoElementData,
    #[error("reading {len} bytes at 0x{addr:x} faulted: {source}")]
    ReadFault {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
}

/// The slice of the IL2CPP embedding API the agent relies on
pub trait RuntimeApi: Send + Sync {
    /// `il2cpp_domain_get`
    fn domain(&self) -> Option<DomainHandle>;

    /// `il2cpp_domain_get_assemblies`
    fn assemblies(&self, domain: DomainHandle) -> Vec<AssemblyHandle>;

    /// `il2cpp_assembly_get_image`
    fn assembly_image(&self, assembly: AssemblyHandle) -> Option<ImageHandle>;

    /// `il2cpp_class_from_name`
    fn class_from_name(&self, image: ImageHandle, namespace: &CStr, name: &CStr)
        -> Option<ClassHandle>;

    /// `il2cpp_class_get_method_from_name`
    fn method_from_name(&self, class: ClassHandle, name: &CStr, arg_count: i32)
        -> Option<MethodHandle>;

    /// `il2cpp_array_length`
    fn array_length(&self, array: usize) -> u32;

    /// Whether `il2cpp_array_addr_with_size` is exported by this build
    fn has_array_addr_accessor(&self) -> bool;

    /// `il2cpp_array_addr_with_size`
    fn array_addr_with_size(&self, array: usize, element_size: i32, index: usize) -> Option<usize>;

    fn runtime_name(&self) -> &'static str {
        "IL2CPP"
    }
}

/// Fault-tolerant access to raw memory
///
/// Implementations must report an unmapped or protected address as an error
/// rather than faulting.
pub trait MemorySource: Send + Sync {
    /// Copy `len` bytes starting at `addr` into a fresh buffer
    fn copy_bytes(&self, addr: usize, len: usize) -> io::Result<Vec<u8>>;

    /// Read a native pointer
    fn read_ptr(&self, addr: usize) -> io::Result<usize> {
        let bytes = self.copy_bytes(addr, std::mem::size_of::<usize>())?;
        let mut raw = [0u8; std::mem::size_of::<usize>()];
        raw.copy_from_slice(&bytes);
        Ok(usize::from_ne_bytes(raw))
    }

    /// Check that `len` bytes at `addr` can be read
    fn is_readable(&self, addr: usize, len: usize) -> bool {
        self.copy_bytes(addr, len).is_ok()
    }
}
