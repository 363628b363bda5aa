//! Fault-tolerant reads of the agent's own address space
//!
//! Goes through the same process-memory handle an external reader would use,
//! so a stale or garbage pointer surfaces as an `io::Error` (EFAULT /
//! ERROR_PARTIAL_COPY) instead of a crash inside the host's thread.

use std::io;

use process_memory::{copy_address, ProcessHandle, TryIntoProcessHandle};

use crate::backend::MemorySource;

/// Memory reader for the current process
pub struct SelfMemory {
    handle: ProcessHandle,
}

impl std::fmt::Debug for SelfMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfMemory").field("pid", &std::process::id()).finish()
    }
}

// Safety: the handle refers to our own process and is only used for
// read-only copies, which the OS allows from any thread.
unsafe impl Send for SelfMemory {}
unsafe impl Sync for SelfMemory {}

impl SelfMemory {
    pub fn open() -> io::Result<Self> {
        let handle = (std::process::id() as process_memory::Pid).try_into_process_handle()?;
        Ok(SelfMemory { handle })
    }
}

impl MemorySource for SelfMemory {
    fn copy_bytes(&self, addr: usize, len: usize) -> io::Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        copy_address(addr, len, &self.handle)
    }
}
