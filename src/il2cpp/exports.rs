//! Native IL2CPP embedding API, resolved from the loaded module

use std::ffi::{c_char, c_int, c_void, CStr};

use crate::backend::{
    AssemblyHandle, ClassHandle, DomainHandle, ImageHandle, MethodHandle, ModuleHandle,
    ResolveError, RuntimeApi,
};
use super::offsets::{exports, MAX_ASSEMBLIES};

type DomainGetFn = unsafe extern "C" fn() -> *mut c_void;
type DomainGetAssembliesFn = unsafe extern "C" fn(*const c_void, *mut usize) -> *const *const c_void;
type AssemblyGetImageFn = unsafe extern "C" fn(*const c_void) -> *const c_void;
type ClassFromNameFn = unsafe extern "C" fn(*const c_void, *const c_char, *const c_char) -> *mut c_void;
type ClassGetMethodFromNameFn = unsafe extern "C" fn(*mut c_void, *const c_char, c_int) -> *const c_void;
type ArrayLengthFn = unsafe extern "C" fn(*mut c_void) -> u32;
type ArrayAddrWithSizeFn = unsafe extern "C" fn(*mut c_void, i32, usize) -> *mut c_char;

/// Function pointers into GameAssembly
///
/// Resolved once at attach. Owns the module reference, so the pointers stay
/// valid for as long as this value lives; installed hooks keep it alive for
/// the rest of the process.
pub struct NativeExports {
    module: ModuleHandle,
    domain_get: DomainGetFn,
    domain_get_assemblies: DomainGetAssembliesFn,
    assembly_get_image: AssemblyGetImageFn,
    class_from_name: ClassFromNameFn,
    class_get_method_from_name: ClassGetMethodFromNameFn,
    array_length: ArrayLengthFn,
    array_addr_with_size: Option<ArrayAddrWithSizeFn>,
}

impl std::fmt::Debug for NativeExports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeExports")
            .field("module", &self.module.name())
            .field("domain_get", &format!("{:p}", self.domain_get as *const ()))
            .field("array_addr_with_size", &self.array_addr_with_size.is_some())
            .finish()
    }
}

fn required<F: Copy>(module: &ModuleHandle, name: &'static str) -> Result<F, ResolveError> {
    optional(module, name).ok_or(ResolveError::ExportMissing(name))
}

fn optional<F: Copy>(module: &ModuleHandle, name: &'static str) -> Option<F> {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
    let addr = module.symbol(name)?;
    // Safety: F is always one of the fn pointer aliases above, and addr is the
    // non-null address of the export with that C signature.
    Some(unsafe { std::mem::transmute_copy::<usize, F>(&addr) })
}

impl NativeExports {
    /// Resolve every export the agent needs; the array address accessor is optional
    pub fn resolve(module: ModuleHandle) -> Result<Self, ResolveError> {
        let resolved = NativeExports {
            domain_get: required(&module, exports::DOMAIN_GET)?,
            domain_get_assemblies: required(&module, exports::DOMAIN_GET_ASSEMBLIES)?,
            assembly_get_image: required(&module, exports::ASSEMBLY_GET_IMAGE)?,
            class_from_name: required(&module, exports::CLASS_FROM_NAME)?,
            class_get_method_from_name: required(&module, exports::CLASS_GET_METHOD_FROM_NAME)?,
            array_length: required(&module, exports::ARRAY_LENGTH)?,
            array_addr_with_size: optional(&module, exports::ARRAY_ADDR_WITH_SIZE),
            module,
        };

        tracing::debug!(
            module = resolved.module.name(),
            array_accessor = resolved.array_addr_with_size.is_some(),
            "resolved IL2CPP exports"
        );
        Ok(resolved)
    }
}

impl RuntimeApi for NativeExports {
    fn domain(&self) -> Option<DomainHandle> {
        let domain = unsafe { (self.domain_get)() };
        (!domain.is_null()).then(|| DomainHandle(domain as usize))
    }

    fn assemblies(&self, domain: DomainHandle) -> Vec<AssemblyHandle> {
        let mut count: usize = 0;
        let list = unsafe { (self.domain_get_assemblies)(domain.addr() as *const c_void, &mut count) };
        if list.is_null() || count == 0 {
            return Vec::new();
        }
        if count > MAX_ASSEMBLIES {
            tracing::warn!(count, "implausible assembly count, ignoring domain");
            return Vec::new();
        }

        // Safety: the runtime hands out a contiguous array of `count` assembly pointers
        let slice = unsafe { std::slice::from_raw_parts(list, count) };
        slice
            .iter()
            .filter(|assembly| !assembly.is_null())
            .map(|assembly| AssemblyHandle(*assembly as usize))
            .collect()
    }

    fn assembly_image(&self, assembly: AssemblyHandle) -> Option<ImageHandle> {
        let image = unsafe { (self.assembly_get_image)(assembly.addr() as *const c_void) };
        (!image.is_null()).then(|| ImageHandle(image as usize))
    }

    fn class_from_name(&self, image: ImageHandle, namespace: &CStr, name: &CStr) -> Option<ClassHandle> {
        let class = unsafe {
            (self.class_from_name)(image.addr() as *const c_void, namespace.as_ptr(), name.as_ptr())
        };
        (!class.is_null()).then(|| ClassHandle(class as usize))
    }

    fn method_from_name(&self, class: ClassHandle, name: &CStr, arg_count: i32) -> Option<MethodHandle> {
        let method = unsafe {
            (self.class_get_method_from_name)(class.addr() as *mut c_void, name.as_ptr(), arg_count)
        };
        (!method.is_null()).then(|| MethodHandle(method as usize))
    }

    fn array_length(&self, array: usize) -> u32 {
        unsafe { (self.array_length)(array as *mut c_void) }
    }

    fn has_array_addr_accessor(&self) -> bool {
        self.array_addr_with_size.is_some()
    }

    fn array_addr_with_size(&self, array: usize, element_size: i32, index: usize) -> Option<usize> {
        let accessor = self.array_addr_with_size?;
        let data = unsafe { accessor(array as *mut c_void, element_size, index) };
        (!data.is_null()).then(|| data as usize)
    }
}
