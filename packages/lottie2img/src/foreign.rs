//! The narrow ABI between the binding and a loaded conversion runtime.
//!
//! A [`ForeignRuntime`] owns a linear heap addressed by 32-bit offsets and
//! exposes allocation, raw memory access and the conversion entry points.
//! Everything above this trait (arenas, the task broker, sessions) is
//! independent of how the runtime is hosted.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::broker::TaskCallback;
use crate::error::{Error, Result};

/// An address in the runtime's linear memory. Zero is the null sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ptr(u32);

impl Ptr {
    /// The null address, used by the runtime to signal failure.
    pub const NULL: Ptr = Ptr(0);

    pub fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub fn addr(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Capability flags read from a runtime at load time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The runtime exposes `convertAsync` and can complete tasks off-thread.
    pub supports_async: bool,
    /// Completions are only delivered from inside [`ForeignRuntime::poll`].
    pub needs_polling: bool,
}

/// Arguments shared by both conversion entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertCall {
    /// NUL-terminated wire option string.
    pub options: Ptr,
    /// Input buffer.
    pub input: Ptr,
    /// Input length in bytes.
    pub input_len: u32,
    /// 4-byte slot the runtime writes the output length into.
    pub output_len: Ptr,
}

/// A loaded conversion runtime.
///
/// Implementations report traps and out-of-bounds accesses as
/// [`Error::Trap`]. Nothing here is reentrant: callers serialize access
/// through [`SharedRuntime`].
pub trait ForeignRuntime: Send {
    /// Capability flags, fixed for the lifetime of the runtime.
    fn capabilities(&self) -> Capabilities;

    /// Pointer to a NUL-terminated JSON record of component versions.
    ///
    /// The record is owned by the runtime and must not be freed.
    fn version(&mut self) -> Result<Ptr>;

    /// Allocate `size` bytes on the runtime heap.
    fn malloc(&mut self, size: u32) -> Result<Ptr>;

    /// Free a pointer previously returned by [`malloc`](Self::malloc) or
    /// handed out by a conversion.
    fn free(&mut self, ptr: Ptr) -> Result<()>;

    /// Copy `bytes` into runtime memory at `ptr`.
    fn write_bytes(&mut self, ptr: Ptr, bytes: &[u8]) -> Result<()>;

    /// Copy `len` bytes out of runtime memory at `ptr`.
    fn read_bytes(&mut self, ptr: Ptr, len: u32) -> Result<Vec<u8>>;

    /// Read a little-endian `u32` at `ptr`.
    fn read_u32(&mut self, ptr: Ptr) -> Result<u32> {
        let bytes = self.read_bytes(ptr, 4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes);
        Ok(u32::from_le_bytes(word))
    }

    /// Write a little-endian `u32` at `ptr`.
    fn write_u32(&mut self, ptr: Ptr, value: u32) -> Result<()> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    /// Read a NUL-terminated string at `ptr`, replacing invalid UTF-8.
    fn read_c_string(&mut self, ptr: Ptr) -> Result<String> {
        let mut bytes = Vec::new();
        let mut addr = ptr.addr();
        loop {
            let byte = self.read_bytes(Ptr::new(addr), 1)?[0];
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            addr = addr
                .checked_add(1)
                .ok_or_else(|| Error::Trap("unterminated string".to_string()))?;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Synchronous conversion. Returns the output buffer, or null on failure.
    fn convert(&mut self, call: &ConvertCall) -> Result<Ptr>;

    /// Schedule an asynchronous conversion.
    ///
    /// Returns `false` when the runtime could not schedule the task, in which
    /// case `callback` is never invoked. Otherwise `callback` is invoked
    /// exactly once, possibly from another thread and possibly before this
    /// method returns. Runtimes reporting `needs_polling` invoke it from a
    /// later [`poll`](Self::poll) instead. On failure the runtime stores a
    /// pointer to an error message (or null) into `error_slot`.
    fn convert_async(
        &mut self,
        call: &ConvertCall,
        callback: TaskCallback,
        error_slot: Ptr,
    ) -> Result<bool>;

    /// Let the runtime make progress on scheduled tasks and deliver the
    /// completions that are ready.
    fn poll(&mut self) -> Result<()> {
        Ok(())
    }

    /// Tear the runtime down and release its heap.
    fn exit(&mut self) -> Result<()>;
}

/// A runtime shared by every in-flight call of one session.
///
/// The lock is held for single foreign operations only, never across an
/// `.await`.
#[derive(Clone)]
pub struct SharedRuntime {
    inner: Arc<Mutex<Box<dyn ForeignRuntime>>>,
}

impl SharedRuntime {
    pub fn new(runtime: Box<dyn ForeignRuntime>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(runtime)),
        }
    }

    /// Lock the runtime for one foreign operation.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn ForeignRuntime>> {
        // A panic mid-operation leaves nothing half-written on our side.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for SharedRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRuntime").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;

    #[test]
    fn ptr_null_sentinel() {
        assert!(Ptr::NULL.is_null());
        assert!(Ptr::default().is_null());
        assert!(!Ptr::new(8).is_null());
        assert_eq!(Ptr::new(0x1234).to_string(), "0x00001234");
    }

    #[test]
    fn u32_round_trips_little_endian() {
        let mut runtime = MockRuntime::new();
        let slot = runtime.malloc(4).unwrap();
        runtime.write_u32(slot, 0x0102_0304).unwrap();
        assert_eq!(runtime.read_bytes(slot, 4).unwrap(), vec![4, 3, 2, 1]);
        assert_eq!(runtime.read_u32(slot).unwrap(), 0x0102_0304);
    }

    #[test]
    fn reads_nul_terminated_strings() {
        let mut runtime = MockRuntime::new();
        let ptr = runtime.malloc(8).unwrap();
        runtime.write_bytes(ptr, b"oops\0xyz").unwrap();
        assert_eq!(runtime.read_c_string(ptr).unwrap(), "oops");
    }

    #[test]
    fn out_of_bounds_reads_trap() {
        let mut runtime = MockRuntime::new();
        let err = runtime.read_bytes(Ptr::new(u32::MAX - 1), 4).unwrap_err();
        assert!(matches!(err, Error::Trap(_)));
    }
}
