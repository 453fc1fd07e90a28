//! Per-call ownership of runtime heap allocations.
//!
//! An [`Arena`] covers exactly one conversion call. Every pointer the call
//! allocates, and every buffer the runtime hands back to it, is recorded in
//! the arena and freed exactly once when the arena is dropped, whatever the
//! outcome of the call. Output is copied into owned memory before that
//! happens; no runtime address escapes the arena.
//!
//! Arena methods lock the shared runtime themselves, one operation at a
//! time. Callers must not hold the runtime lock while using an arena or
//! dropping it.

use tracing::warn;

use crate::error::{Error, Result};
use crate::foreign::{ConvertCall, ForeignRuntime, Ptr, SharedRuntime};

/// Size of the output length and error pointer slots (wasm32 `size_t` and
/// `char *`).
const SLOT_SIZE: u32 = 4;

/// Addresses handed to the runtime for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSlots {
    /// Option string, input and output length slot.
    pub call: ConvertCall,
    /// Slot receiving a pointer to the error message, for asynchronous calls.
    pub error: Option<Ptr>,
}

/// Scoped set of runtime allocations for one call.
pub struct Arena {
    runtime: SharedRuntime,
    live: Vec<Ptr>,
}

impl Arena {
    pub fn new(runtime: SharedRuntime) -> Self {
        Self {
            runtime,
            live: Vec::new(),
        }
    }

    /// Copy the input and option string into the runtime and allocate the
    /// result slots.
    pub fn acquire(
        &mut self,
        input: &[u8],
        options: &str,
        needs_error_slot: bool,
    ) -> Result<ArenaSlots> {
        let input_len = u32::try_from(input.len())
            .map_err(|_| Error::Trap(format!("input of {} bytes exceeds the heap", input.len())))?;

        let mut wire = Vec::with_capacity(options.len() + 1);
        wire.extend_from_slice(options.as_bytes());
        wire.push(0);

        let mut runtime = self.runtime.lock();
        let runtime: &mut dyn ForeignRuntime = &mut **runtime;

        let options = alloc(&mut self.live, runtime, wire.len() as u32)?;
        runtime.write_bytes(options, &wire)?;

        let input_ptr = alloc(&mut self.live, runtime, input_len.max(1))?;
        runtime.write_bytes(input_ptr, input)?;

        let output_len = alloc(&mut self.live, runtime, SLOT_SIZE)?;
        runtime.write_u32(output_len, 0)?;

        let error = if needs_error_slot {
            let slot = alloc(&mut self.live, runtime, SLOT_SIZE)?;
            runtime.write_u32(slot, 0)?;
            Some(slot)
        } else {
            None
        };

        Ok(ArenaSlots {
            call: ConvertCall {
                options,
                input: input_ptr,
                input_len,
                output_len,
            },
            error,
        })
    }

    /// Take ownership of a buffer the runtime allocated for this call.
    pub fn adopt(&mut self, ptr: Ptr) {
        if !ptr.is_null() && !self.live.contains(&ptr) {
            self.live.push(ptr);
        }
    }

    /// Copy the runtime's output into an owned buffer.
    ///
    /// The output buffer is adopted first, so it is freed even when reading
    /// it fails.
    pub fn read_output(&mut self, output: Ptr, output_len: Ptr) -> Result<Vec<u8>> {
        self.adopt(output);
        let mut runtime = self.runtime.lock();
        let len = runtime.read_u32(output_len)?;
        runtime.read_bytes(output, len)
    }

    /// Decode the error message the runtime stored in `error_slot`.
    ///
    /// An empty slot yields an empty message.
    pub fn take_error_message(&mut self, error_slot: Ptr) -> Result<String> {
        let message = {
            let mut runtime = self.runtime.lock();
            let message = Ptr::new(runtime.read_u32(error_slot)?);
            if message.is_null() {
                return Ok(String::new());
            }
            runtime.write_u32(error_slot, 0)?;
            message
        };
        self.adopt(message);
        self.runtime.lock().read_c_string(message)
    }

    /// Number of pointers still owned by the arena.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Forget every pointer without freeing it.
    ///
    /// Only valid once the runtime has been told to exit: its teardown
    /// reclaims the whole heap, and a worker may still be writing into these
    /// regions.
    pub fn abandon(mut self) {
        self.live.clear();
    }

    fn release(&mut self) {
        if self.live.is_empty() {
            return;
        }
        let mut runtime = self.runtime.lock();
        for ptr in self.live.drain(..) {
            if let Err(e) = runtime.free(ptr) {
                warn!(%ptr, error = %e, "failed to free runtime allocation");
            }
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.release();
    }
}

fn alloc(live: &mut Vec<Ptr>, runtime: &mut dyn ForeignRuntime, size: u32) -> Result<Ptr> {
    let ptr = runtime.malloc(size)?;
    if ptr.is_null() {
        return Err(Error::Trap(format!("runtime could not allocate {size} bytes")));
    }
    live.push(ptr);
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;

    fn shared() -> (SharedRuntime, crate::testing::MockStats) {
        let runtime = MockRuntime::new();
        let stats = runtime.stats();
        (SharedRuntime::new(Box::new(runtime)), stats)
    }

    #[test]
    fn acquire_copies_input_and_options() {
        let (runtime, stats) = shared();
        let mut arena = Arena::new(runtime.clone());
        let slots = arena.acquire(b"{\"v\":1}", "quality=80", true).unwrap();

        assert_eq!(arena.live(), 4);
        assert_eq!(stats.allocations(), 4);
        assert_eq!(slots.call.input_len, 7);

        let mut rt = runtime.lock();
        assert_eq!(rt.read_bytes(slots.call.input, 7).unwrap(), b"{\"v\":1}");
        assert_eq!(rt.read_c_string(slots.call.options).unwrap(), "quality=80");
        assert_eq!(rt.read_u32(slots.call.output_len).unwrap(), 0);
        assert_eq!(rt.read_u32(slots.error.unwrap()).unwrap(), 0);
    }

    #[test]
    fn sync_calls_get_no_error_slot() {
        let (runtime, stats) = shared();
        {
            let mut arena = Arena::new(runtime);
            let slots = arena.acquire(b"x", "", false).unwrap();
            assert_eq!(slots.error, None);
            assert_eq!(arena.live(), 3);
        }
        assert_eq!(stats.allocations(), 3);
        assert_eq!(stats.frees(), 3);
    }

    #[test]
    fn drop_frees_everything_once() {
        let (runtime, stats) = shared();
        let mut arena = Arena::new(runtime.clone());
        let slots = arena.acquire(b"abc", "level=2", true).unwrap();

        let output = {
            let mut rt = runtime.lock();
            let output = rt.malloc(3).unwrap();
            rt.write_bytes(output, b"out").unwrap();
            rt.write_u32(slots.call.output_len, 3).unwrap();
            output
        };

        assert_eq!(arena.read_output(output, slots.call.output_len).unwrap(), b"out");
        arena.adopt(output);
        drop(arena);

        assert_eq!(stats.allocations(), 5);
        assert_eq!(stats.frees(), 5);
        assert_eq!(stats.invalid_frees(), 0);
    }

    #[test]
    fn empty_input_still_gets_a_buffer() {
        let (runtime, _stats) = shared();
        let mut arena = Arena::new(runtime);
        let slots = arena.acquire(b"", "", false).unwrap();
        assert!(!slots.call.input.is_null());
        assert_eq!(slots.call.input_len, 0);
    }

    #[test]
    fn error_message_is_decoded_and_freed() {
        let (runtime, stats) = shared();
        let mut arena = Arena::new(runtime.clone());
        let slots = arena.acquire(b"abc", "", true).unwrap();
        let slot = slots.error.unwrap();

        {
            let mut rt = runtime.lock();
            let message = rt.malloc(13).unwrap();
            rt.write_bytes(message, b"Bad argument\0").unwrap();
            rt.write_u32(slot, message.addr()).unwrap();
        }

        assert_eq!(arena.take_error_message(slot).unwrap(), "Bad argument");
        assert_eq!(arena.take_error_message(slot).unwrap(), "");
        drop(arena);
        assert_eq!(stats.allocations(), stats.frees());
    }

    #[test]
    fn empty_error_slot_yields_empty_message() {
        let (runtime, _stats) = shared();
        let mut arena = Arena::new(runtime);
        let slots = arena.acquire(b"abc", "", true).unwrap();
        assert_eq!(arena.take_error_message(slots.error.unwrap()).unwrap(), "");
    }

    #[test]
    fn failed_read_still_releases_output() {
        let (runtime, stats) = shared();
        let mut arena = Arena::new(runtime.clone());
        let slots = arena.acquire(b"abc", "", false).unwrap();

        let output = {
            let mut rt = runtime.lock();
            let output = rt.malloc(3).unwrap();
            rt.write_u32(slots.call.output_len, u32::MAX).unwrap();
            output
        };

        assert!(matches!(
            arena.read_output(output, slots.call.output_len),
            Err(Error::Trap(_))
        ));
        drop(arena);
        assert_eq!(stats.allocations(), 4);
        assert_eq!(stats.frees(), 4);
    }

    #[test]
    fn abandon_frees_nothing() {
        let (runtime, stats) = shared();
        let mut arena = Arena::new(runtime);
        arena.acquire(b"abc", "", true).unwrap();
        arena.abandon();
        assert_eq!(stats.frees(), 0);
    }

    #[test]
    fn adopt_ignores_null_and_duplicates() {
        let (runtime, _stats) = shared();
        let mut arena = Arena::new(runtime);
        arena.adopt(Ptr::NULL);
        arena.adopt(Ptr::new(64));
        arena.adopt(Ptr::new(64));
        assert_eq!(arena.live(), 1);
        arena.abandon();
    }
}
