//! IL2CPP layout constants and export names
//!
//! Only the few layout facts the agent cannot get from the embedding API
//! live here. They vary between Unity/IL2CPP versions.

/// Pointer size of the running process
pub const SIZE_OF_PTR: usize = std::mem::size_of::<usize>();

/// Name of the IL2CPP library on different platforms
#[cfg(target_os = "windows")]
pub const IL2CPP_LIBRARY: &str = "GameAssembly.dll";

#[cfg(target_os = "linux")]
pub const IL2CPP_LIBRARY: &str = "GameAssembly.so";

#[cfg(target_os = "macos")]
pub const IL2CPP_LIBRARY: &str = "GameAssembly.dylib";

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
pub const IL2CPP_LIBRARY: &str = "GameAssembly";

// Il2CppArray: klass, monitor, bounds, max_length, then elements
/// Offset of the first element in Il2CppArray (0x20 on 64-bit)
pub const ARRAY_ELEMENTS: usize = 4 * SIZE_OF_PTR;

/// `MethodInfo::methodPointer` is the first field
pub const METHOD_POINTER: usize = 0x0;

/// Largest byte array the agent will copy out
pub const MAX_ARRAY_BYTES: usize = 50 * 1024 * 1024;

/// Anything below this is a small integer, not an object
pub const MIN_OBJECT_ADDRESS: usize = 0x10000;

/// Upper bound on the assembly count returned by the domain
pub const MAX_ASSEMBLIES: usize = 0x10000;

/// Exported embedding API names
pub mod exports {
    pub const DOMAIN_GET: &str = "il2cpp_domain_get";
    pub const DOMAIN_GET_ASSEMBLIES: &str = "il2cpp_domain_get_assemblies";
    pub const ASSEMBLY_GET_IMAGE: &str = "il2cpp_assembly_get_image";
    pub const CLASS_FROM_NAME: &str = "il2cpp_class_from_name";
    pub const CLASS_GET_METHOD_FROM_NAME: &str = "il2cpp_class_get_method_from_name";
    pub const ARRAY_LENGTH: &str = "il2cpp_array_length";
    pub const ARRAY_ADDR_WITH_SIZE: &str = "il2cpp_array_addr_with_size";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_array_layout_64() {
        assert_eq!(ARRAY_ELEMENTS, 0x20);
    }
}
