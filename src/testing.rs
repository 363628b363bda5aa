//! In-memory stand-ins for a live IL2CPP process

use std::collections::HashMap;
use std::ffi::CStr;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{
    AssemblyHandle, ClassHandle, DomainHandle, ImageHandle, MemorySource, MethodHandle, RuntimeApi,
};
use crate::hook::{run_site, Arguments, HookError, HookInstaller, HookTarget, InstalledHook, Interceptor};
use crate::il2cpp::offsets::ARRAY_ELEMENTS;
use crate::il2cpp::{ArrayLayout, ManagedArrayReader};

pub struct FakeRuntime {
    domain: Option<DomainHandle>,
    assemblies: Vec<(AssemblyHandle, Option<ImageHandle>)>,
    classes: Vec<(ImageHandle, String, String, ClassHandle)>,
    methods: Vec<(ClassHandle, String, i32, MethodHandle)>,
    accessor: bool,
    arrays: Mutex<HashMap<usize, u32>>,
    class_lookups: AtomicUsize,
    length_calls: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        FakeRuntime {
            domain: Some(DomainHandle(0xd000_0000)),
            assemblies: Vec::new(),
            classes: Vec::new(),
            methods: Vec::new(),
            accessor: false,
            arrays: Mutex::new(HashMap::new()),
            class_lookups: AtomicUsize::new(0),
            length_calls: AtomicUsize::new(0),
        }
    }

    pub fn without_domain(mut self) -> Self {
        self.domain = None;
        self
    }

    pub fn with_accessor(mut self, accessor: bool) -> Self {
        self.accessor = accessor;
        self
    }

    pub fn with_assembly(mut self, assembly: AssemblyHandle, image: Option<ImageHandle>) -> Self {
        self.assemblies.push((assembly, image));
        self
    }

    pub fn with_class(mut self, image: ImageHandle, namespace: &str, name: &str, class: ClassHandle) -> Self {
        self.classes.push((image, namespace.to_string(), name.to_string(), class));
        self
    }

    pub fn with_method(mut self, class: ClassHandle, name: &str, arg_count: i32, method: MethodHandle) -> Self {
        self.methods.push((class, name.to_string(), arg_count, method));
        self
    }

    pub fn set_array_length(&self, array: usize, length: u32) {
        self.arrays.lock().unwrap().insert(array, length);
    }

    pub fn class_lookups(&self) -> usize {
        self.class_lookups.load(Ordering::SeqCst)
    }

    pub fn length_calls(&self) -> usize {
        self.length_calls.load(Ordering::SeqCst)
    }
}

impl RuntimeApi for FakeRuntime {
    fn domain(&self) -> Option<DomainHandle> {
        self.domain
    }

    fn assemblies(&self, _domain: DomainHandle) -> Vec<AssemblyHandle> {
        self.assemblies.iter().map(|(assembly, _)| *assembly).collect()
    }

    fn assembly_image(&self, assembly: AssemblyHandle) -> Option<ImageHandle> {
        self.assemblies
            .iter()
            .find(|(candidate, _)| *candidate == assembly)
            .and_then(|(_, image)| *image)
    }

    fn class_from_name(&self, image: ImageHandle, namespace: &CStr, name: &CStr) -> Option<ClassHandle> {
        self.class_lookups.fetch_add(1, Ordering::SeqCst);
        let namespace = namespace.to_str().ok()?;
        let name = name.to_str().ok()?;
        self.classes
            .iter()
            .find(|(i, ns, n, _)| *i == image && ns == namespace && n == name)
            .map(|(_, _, _, class)| *class)
    }

    fn method_from_name(&self, class: ClassHandle, name: &CStr, arg_count: i32) -> Option<MethodHandle> {
        let name = name.to_str().ok()?;
        self.methods
            .iter()
            .find(|(c, n, argc, _)| *c == class && n == name && *argc == arg_count)
            .map(|(_, _, _, method)| *method)
    }

    fn array_length(&self, array: usize) -> u32 {
        self.length_calls.fetch_add(1, Ordering::SeqCst);
        self.arrays.lock().unwrap().get(&array).copied().unwrap_or(0)
    }

    fn has_array_addr_accessor(&self) -> bool {
        self.accessor
    }

    fn array_addr_with_size(&self, array: usize, element_size: i32, index: usize) -> Option<usize> {
        if !self.accessor {
            return None;
        }
        Some(array + ARRAY_ELEMENTS + element_size as usize * index)
    }
}

/// Sparse fake address space; anything outside a region faults
pub struct FakeMemory {
    regions: Mutex<Vec<(usize, Vec<u8>)>>,
    copies: AtomicUsize,
}

impl FakeMemory {
    pub fn new() -> Self {
        FakeMemory {
            regions: Mutex::new(Vec::new()),
            copies: AtomicUsize::new(0),
        }
    }

    pub fn with_region(self, addr: usize, bytes: Vec<u8>) -> Self {
        self.map(addr, bytes);
        self
    }

    pub fn map(&self, addr: usize, bytes: Vec<u8>) {
        let mut regions = self.regions.lock().unwrap();
        regions.retain(|(start, _)| *start != addr);
        regions.push((addr, bytes));
    }

    pub fn is_mapped(&self, addr: usize) -> bool {
        self.lookup(addr, 1).is_some()
    }

    pub fn overwrite(&self, addr: usize, bytes: &[u8]) {
        let mut regions = self.regions.lock().unwrap();
        for (start, data) in regions.iter_mut() {
            if addr >= *start && addr + bytes.len() <= *start + data.len() {
                let offset = addr - *start;
                data[offset..offset + bytes.len()].copy_from_slice(bytes);
                return;
            }
        }
        panic!("overwrite of unmapped memory at 0x{:x}", addr);
    }

    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    fn lookup(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let regions = self.regions.lock().unwrap();
        regions.iter().find_map(|(start, data)| {
            let end = addr.checked_add(len)?;
            (addr >= *start && end <= *start + data.len())
                .then(|| data[addr - start..end - start].to_vec())
        })
    }
}

impl MemorySource for FakeMemory {
    fn copy_bytes(&self, addr: usize, len: usize) -> io::Result<Vec<u8>> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.lookup(addr, len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, format!("fault at 0x{:x}", addr)))
    }

    fn read_ptr(&self, addr: usize) -> io::Result<usize> {
        let bytes = self
            .lookup(addr, std::mem::size_of::<usize>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, format!("fault at 0x{:x}", addr)))?;
        let mut raw = [0u8; std::mem::size_of::<usize>()];
        raw.copy_from_slice(&bytes);
        Ok(usize::from_ne_bytes(raw))
    }

    fn is_readable(&self, addr: usize, len: usize) -> bool {
        self.lookup(addr, len).is_some()
    }
}

/// A fake runtime and its address space, wired together
pub struct FakeProcess {
    pub runtime: Arc<FakeRuntime>,
    pub memory: Arc<FakeMemory>,
}

impl FakeProcess {
    pub fn new(accessor: bool) -> Self {
        FakeProcess::with_runtime(FakeRuntime::new().with_accessor(accessor))
    }

    pub fn with_runtime(runtime: FakeRuntime) -> Self {
        FakeProcess {
            runtime: Arc::new(runtime),
            memory: Arc::new(FakeMemory::new()),
        }
    }

    /// Lay out an Il2CppArray of bytes at `addr`
    pub fn add_byte_array(&mut self, addr: usize, data: &[u8]) {
        let mut object = vec![0u8; ARRAY_ELEMENTS];
        object.extend_from_slice(data);
        self.memory.map(addr, object);
        self.runtime.set_array_length(addr, data.len() as u32);
    }

    /// Register a header-only array that reports `length`
    pub fn add_array_with_length(&mut self, addr: usize, length: u32) {
        if !self.memory.is_mapped(addr) {
            self.memory.map(addr, vec![0u8; ARRAY_ELEMENTS]);
        }
        self.runtime.set_array_length(addr, length);
    }

    pub fn reader(&self) -> ManagedArrayReader {
        let layout = ArrayLayout::probe(self.runtime.as_ref(), None);
        ManagedArrayReader::new(self.runtime.clone(), self.memory.clone(), layout)
    }
}

struct RecordedHook {
    target: HookTarget,
    entry_point: usize,
    interceptor: Arc<dyn Interceptor>,
    enabled: Arc<Mutex<bool>>,
}

/// Installer that records installs and lets tests fire the hooks by hand
#[derive(Default)]
pub struct RecordingInstaller {
    hooks: Mutex<Vec<RecordedHook>>,
    failing: Vec<HookTarget>,
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make installs on `target` fail
    pub fn failing(mut self, target: HookTarget) -> Self {
        self.failing.push(target);
        self
    }

    /// `(target, entry point)` of every live hook
    pub fn installed(&self) -> Vec<(HookTarget, usize)> {
        self.hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|hook| *hook.enabled.lock().unwrap())
            .map(|hook| (hook.target, hook.entry_point))
            .collect()
    }

    /// Simulate one call through the hooked method; `None` if it is not hooked
    pub fn call(&self, target: HookTarget, args: [usize; 4], retval: usize) -> Option<usize> {
        let interceptor = self
            .hooks
            .lock()
            .unwrap()
            .iter()
            .find(|hook| hook.target == target && *hook.enabled.lock().unwrap())
            .map(|hook| hook.interceptor.clone())?;
        Some(run_site(interceptor.as_ref(), Arguments::new(args), |_| retval))
    }
}

struct RecordedHandle {
    target: HookTarget,
    enabled: Arc<Mutex<bool>>,
}

impl InstalledHook for RecordedHandle {
    fn target(&self) -> HookTarget {
        self.target
    }

    fn remove(&self) -> Result<(), HookError> {
        *self.enabled.lock().unwrap() = false;
        Ok(())
    }
}

impl HookInstaller for RecordingInstaller {
    fn install(
        &self,
        target: HookTarget,
        entry_point: usize,
        interceptor: Box<dyn Interceptor>,
    ) -> Result<Box<dyn InstalledHook>, HookError> {
        if self.failing.contains(&target) {
            return Err(HookError::InvalidTarget(entry_point));
        }
        let enabled = Arc::new(Mutex::new(true));
        self.hooks.lock().unwrap().push(RecordedHook {
            target,
            entry_point,
            interceptor: Arc::from(interceptor),
            enabled: enabled.clone(),
        });
        Ok(Box::new(RecordedHandle { target, enabled }))
    }
}
