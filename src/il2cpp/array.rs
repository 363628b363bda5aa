//! Snapshotting managed `byte[]` objects
//!
//! A managed array handed to a hook is only guaranteed to stay put until the
//! hook returns, so the reader always copies the elements out into an owned
//! buffer. Where the elements start depends on the runtime build: newer
//! builds export `il2cpp_array_addr_with_size`, older ones only leave the
//! fixed Il2CppArray header layout to go by.

use std::sync::Arc;

use crate::backend::{ExtractError, MemorySource, RuntimeApi};
use super::offsets::{ARRAY_ELEMENTS, MAX_ARRAY_BYTES, MIN_OBJECT_ADDRESS};

/// How to find the first element of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLayout {
    /// Ask the runtime via `il2cpp_array_addr_with_size(array, 1, 0)`
    Accessor,
    /// Assume the elements follow a header of this many bytes
    FixedOffset(usize),
}

impl ArrayLayout {
    /// Pick the layout once, based on what the runtime exports
    pub fn probe(api: &dyn RuntimeApi, fixed_offset: Option<usize>) -> Self {
        if api.has_array_addr_accessor() {
            ArrayLayout::Accessor
        } else {
            ArrayLayout::FixedOffset(fixed_offset.unwrap_or(ARRAY_ELEMENTS))
        }
    }

    fn data_start(self, api: &dyn RuntimeApi, array: usize) -> Option<usize> {
        match self {
            ArrayLayout::Accessor => api.array_addr_with_size(array, 1, 0),
            ArrayLayout::FixedOffset(offset) => array.checked_add(offset),
        }
    }
}

/// Transient view of a managed byte array, valid only inside a hook callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedArrayView {
    pub address: usize,
    pub length: usize,
}

/// Copies managed byte arrays out of the runtime
pub struct ManagedArrayReader {
    api: Arc<dyn RuntimeApi>,
    memory: Arc<dyn MemorySource>,
    layout: ArrayLayout,
}

impl std::fmt::Debug for ManagedArrayReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedArrayReader").field("layout", &self.layout).finish()
    }
}

impl ManagedArrayReader {
    pub fn new(api: Arc<dyn RuntimeApi>, memory: Arc<dyn MemorySource>, layout: ArrayLayout) -> Self {
        ManagedArrayReader { api, memory, layout }
    }

    pub fn layout(&self) -> ArrayLayout {
        self.layout
    }

    /// Validate the handle and locate the element data
    pub fn view(&self, array: usize) -> Result<ManagedArrayView, ExtractError> {
        if array < MIN_OBJECT_ADDRESS {
            return Err(ExtractError::NullHandle(array));
        }
        if !self.memory.is_readable(array, ARRAY_ELEMENTS) {
            return Err(ExtractError::UnreadableHeader(array));
        }

        let length = self.api.array_length(array);
        if length == 0 || length as usize > MAX_ARRAY_BYTES {
            return Err(ExtractError::LengthOutOfBounds(length));
        }

        let address = self
            .layout
            .data_start(self.api.as_ref(), array)
            .ok_or(ExtractError::NoElementData)?;

        Ok(ManagedArrayView {
            address,
            length: length as usize,
        })
    }

    /// Copy the array's bytes into a freshly owned buffer
    pub fn read(&self, array: usize) -> Result<Vec<u8>, ExtractError> {
        let view = self.view(array)?;
        self.memory
            .copy_bytes(view.address, view.length)
            .map_err(|source| ExtractError::ReadFault {
                addr: view.address,
                len: view.length,
                source,
            })
    }
}
