//! Class and method resolution through the embedding API
//!
//! The walk is domain → assemblies → image → `class_from_name`. Assemblies
//! are not assumed to be uniquely named, so every one is scanned until the
//! first hit; a duplicate class in a later assembly is never seen.

use std::ffi::CString;

use crate::backend::{ClassHandle, MemorySource, MethodHandle, ResolveError, RuntimeApi};
use super::offsets::{METHOD_POINTER, MIN_OBJECT_ADDRESS};

fn c_name(name: &str) -> Result<CString, ResolveError> {
    CString::new(name).map_err(|_| ResolveError::InvalidName(name.to_string()))
}

/// Locates classes by namespace and name
pub struct RuntimeIntrospector<'a> {
    api: &'a dyn RuntimeApi,
}

impl<'a> RuntimeIntrospector<'a> {
    pub fn new(api: &'a dyn RuntimeApi) -> Self {
        RuntimeIntrospector { api }
    }

    /// Find a class by exact namespace + name in any loaded assembly
    pub fn find_class(&self, namespace: &str, name: &str) -> Result<ClassHandle, ResolveError> {
        let c_namespace = c_name(namespace)?;
        let c_class = c_name(name)?;

        let domain = self.api.domain().ok_or(ResolveError::NoDomain)?;
        let assemblies = self.api.assemblies(domain);
        tracing::debug!(
            runtime = self.api.runtime_name(),
            assemblies = assemblies.len(),
            "scanning assemblies for {}.{}",
            namespace,
            name
        );

        for assembly in assemblies {
            let Some(image) = self.api.assembly_image(assembly) else {
                continue;
            };
            if let Some(class) = self.api.class_from_name(image, &c_namespace, &c_class) {
                tracing::info!(
                    class = format!("0x{:x}", class.addr()),
                    image = format!("0x{:x}", image.addr()),
                    "found {}.{}",
                    namespace,
                    name
                );
                return Ok(class);
            }
        }

        Err(ResolveError::ClassNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

/// A method handle together with its native entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMethod {
    pub handle: MethodHandle,
    pub entry_point: usize,
}

/// Resolves methods of a located class
pub struct MethodResolver<'a> {
    api: &'a dyn RuntimeApi,
    memory: &'a dyn MemorySource,
}

impl<'a> MethodResolver<'a> {
    pub fn new(api: &'a dyn RuntimeApi, memory: &'a dyn MemorySource) -> Self {
        MethodResolver { api, memory }
    }

    /// Find a method by name and arity and read its `methodPointer`
    pub fn find_method(
        &self,
        class: ClassHandle,
        name: &str,
        arg_count: i32,
    ) -> Result<ResolvedMethod, ResolveError> {
        let c_method = c_name(name)?;

        let handle = self
            .api
            .method_from_name(class, &c_method, arg_count)
            .ok_or_else(|| ResolveError::MethodNotFound {
                name: name.to_string(),
                arg_count,
            })?;

        let entry_point = self
            .memory
            .read_ptr(handle.addr() + METHOD_POINTER)
            .map_err(|_| ResolveError::NoEntryPoint(name.to_string()))?;
        if entry_point < MIN_OBJECT_ADDRESS {
            return Err(ResolveError::NoEntryPoint(name.to_string()));
        }

        tracing::debug!(
            method = name,
            arg_count,
            entry_point = format!("0x{:x}", entry_point),
            "resolved method"
        );
        Ok(ResolvedMethod { handle, entry_point })
    }
}
