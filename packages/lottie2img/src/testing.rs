//! In-process runtime for exercising sessions without a wasm module.
//!
//! [`MockRuntime`] keeps a byte-vector heap with a bump allocator and counts
//! every allocation and free, so tests can check that each call releases
//! what it allocated. Its "conversion" is deterministic:
//!
//! - `trap` traps inside the entry point,
//! - an empty input fails with `empty input`,
//! - `fail:<message>` fails with `<message>`,
//! - anything else converts to `WEBP[<options>]` followed by the input.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::TaskCallback;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::foreign::{Capabilities, ConvertCall, ForeignRuntime, Ptr};
use crate::loader::RuntimeLoader;
use crate::logger::{LogLevel, Logger, SharedLogger};

const VERSION_ADDR: u32 = 16;
const HEAP_BASE: u32 = 1024;
const DEFAULT_VERSION: &str = r#"{"core":"0.0.0-mock","rlottie":"0.2","libwebp":"1.3.2"}"#;

/// The output the mock produces for a successful conversion.
pub fn expected_output(options: &str, input: &[u8]) -> Vec<u8> {
    let mut out = format!("WEBP[{options}]").into_bytes();
    out.extend_from_slice(input);
    out
}

/// When the mock reports asynchronous completions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Completion {
    /// Inside `convert_async`, before it returns.
    #[default]
    Immediate,
    /// From a separate thread after a short, token-dependent delay.
    Threaded,
    /// Only when the test calls [`DeferredCompletions::fire_all`].
    Deferred,
    /// From the next [`ForeignRuntime::poll`] after `convert_async` returned.
    Polled,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicUsize,
    frees: AtomicUsize,
    invalid_frees: AtomicUsize,
    foreign_calls: AtomicUsize,
    exits: AtomicUsize,
    tokens: Mutex<Vec<u32>>,
}

/// Counters shared between a mock runtime and the test observing it.
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    inner: Arc<Counters>,
}

impl MockStats {
    pub fn allocations(&self) -> usize {
        self.inner.allocations.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.inner.frees.load(Ordering::SeqCst)
    }

    /// Frees of pointers that were not live (double frees included).
    pub fn invalid_frees(&self) -> usize {
        self.inner.invalid_frees.load(Ordering::SeqCst)
    }

    /// Calls to `convert` or `convert_async`.
    pub fn foreign_calls(&self) -> usize {
        self.inner.foreign_calls.load(Ordering::SeqCst)
    }

    pub fn exits(&self) -> usize {
        self.inner.exits.load(Ordering::SeqCst)
    }

    /// Callback tokens passed to `convert_async`, in call order.
    pub fn tokens(&self) -> Vec<u32> {
        self.inner.tokens.lock().unwrap().clone()
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

type Deferred = (TaskCallback, Ptr, Ptr);

/// Completions held back by a [`Completion::Deferred`] mock.
#[derive(Clone, Default)]
pub struct DeferredCompletions {
    queued: Arc<Mutex<Vec<Deferred>>>,
    fired: Arc<Mutex<Vec<Deferred>>>,
}

impl DeferredCompletions {
    pub fn len(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every queued callback.
    pub fn fire_all(&self) -> Vec<Result<()>> {
        let queued: Vec<_> = self.queued.lock().unwrap().drain(..).collect();
        let results = queued
            .iter()
            .map(|(callback, error_slot, output)| callback.invoke(*error_slot, *output))
            .collect();
        self.fired.lock().unwrap().extend(queued);
        results
    }

    /// Invoke every already fired callback a second time.
    pub fn refire(&self) -> Vec<Result<()>> {
        self.fired
            .lock()
            .unwrap()
            .iter()
            .map(|(callback, error_slot, output)| callback.invoke(*error_slot, *output))
            .collect()
    }
}

/// A deterministic in-memory runtime.
pub struct MockRuntime {
    memory: Vec<u8>,
    next: u32,
    live: HashMap<u32, u32>,
    capabilities: Capabilities,
    completion: Completion,
    refuse_tasks: bool,
    latency: Duration,
    exited: bool,
    stats: MockStats,
    deferred: DeferredCompletions,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// An async-capable runtime that completes tasks immediately.
    pub fn new() -> Self {
        let mut runtime = Self {
            memory: vec![0; HEAP_BASE as usize],
            next: HEAP_BASE,
            live: HashMap::new(),
            capabilities: Capabilities {
                supports_async: true,
                needs_polling: false,
            },
            completion: Completion::Immediate,
            refuse_tasks: false,
            latency: Duration::ZERO,
            exited: false,
            stats: MockStats::default(),
            deferred: DeferredCompletions::default(),
        };
        runtime.set_version(DEFAULT_VERSION);
        runtime
    }

    /// Behave like a single-thread build.
    pub fn without_async(mut self) -> Self {
        self.capabilities.supports_async = false;
        self.capabilities.needs_polling = false;
        self
    }

    pub fn completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self.capabilities.needs_polling = completion == Completion::Polled;
        self
    }

    /// Block the calling thread for `latency` in every conversion.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Refuse to schedule every asynchronous task.
    pub fn refusing_tasks(mut self) -> Self {
        self.refuse_tasks = true;
        self
    }

    pub fn with_version(mut self, json: &str) -> Self {
        self.set_version(json);
        self
    }

    pub fn stats(&self) -> MockStats {
        self.stats.clone()
    }

    pub fn deferred(&self) -> DeferredCompletions {
        self.deferred.clone()
    }

    fn set_version(&mut self, json: &str) {
        let start = VERSION_ADDR as usize;
        let end = start + json.len();
        assert!(end < HEAP_BASE as usize, "version record too long for the mock");
        self.memory[start..end].copy_from_slice(json.as_bytes());
        self.memory[end] = 0;
    }

    fn ensure_live(&self) -> Result<()> {
        if self.exited {
            return Err(Error::Trap("runtime has exited".to_string()));
        }
        Ok(())
    }

    fn range(&self, ptr: Ptr, len: u32) -> Result<Range<usize>> {
        let start = ptr.addr() as usize;
        match start.checked_add(len as usize) {
            Some(end) if end <= self.memory.len() => Ok(start..end),
            _ => Err(Error::Trap(format!(
                "out of bounds memory access at {ptr} (+{len})"
            ))),
        }
    }

    /// Run the conversion, allocating the output on success.
    fn render(&mut self, call: &ConvertCall) -> Result<std::result::Result<Ptr, String>> {
        let options = self.read_c_string(call.options)?;
        let input = self.read_bytes(call.input, call.input_len)?;

        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if input == b"trap" {
            return Err(Error::Trap("unreachable executed".to_string()));
        }
        if input.is_empty() {
            return Ok(Err("empty input".to_string()));
        }
        if let Some(message) = input.strip_prefix(b"fail:") {
            return Ok(Err(String::from_utf8_lossy(message).into_owned()));
        }

        let output = expected_output(&options, &input);
        let ptr = self.malloc(output.len() as u32)?;
        self.write_bytes(ptr, &output)?;
        self.write_u32(call.output_len, output.len() as u32)?;
        Ok(Ok(ptr))
    }
}

impl ForeignRuntime for MockRuntime {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn version(&mut self) -> Result<Ptr> {
        self.ensure_live()?;
        Ok(Ptr::new(VERSION_ADDR))
    }

    fn malloc(&mut self, size: u32) -> Result<Ptr> {
        self.ensure_live()?;
        let ptr = self.next;
        let size_aligned = (size.max(1) + 7) & !7;
        self.next += size_aligned;
        self.memory.resize(self.next as usize, 0);
        self.live.insert(ptr, size);
        MockStats::bump(&self.stats.inner.allocations);
        Ok(Ptr::new(ptr))
    }

    fn free(&mut self, ptr: Ptr) -> Result<()> {
        self.ensure_live()?;
        if self.live.remove(&ptr.addr()).is_none() {
            MockStats::bump(&self.stats.inner.invalid_frees);
            return Err(Error::Trap(format!("invalid free of {ptr}")));
        }
        MockStats::bump(&self.stats.inner.frees);
        Ok(())
    }

    fn write_bytes(&mut self, ptr: Ptr, bytes: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let range = self.range(ptr, bytes.len() as u32)?;
        self.memory[range].copy_from_slice(bytes);
        Ok(())
    }

    fn read_bytes(&mut self, ptr: Ptr, len: u32) -> Result<Vec<u8>> {
        self.ensure_live()?;
        let range = self.range(ptr, len)?;
        Ok(self.memory[range].to_vec())
    }

    fn convert(&mut self, call: &ConvertCall) -> Result<Ptr> {
        self.ensure_live()?;
        MockStats::bump(&self.stats.inner.foreign_calls);
        Ok(self.render(call)?.unwrap_or(Ptr::NULL))
    }

    fn convert_async(
        &mut self,
        call: &ConvertCall,
        callback: TaskCallback,
        error_slot: Ptr,
    ) -> Result<bool> {
        self.ensure_live()?;
        MockStats::bump(&self.stats.inner.foreign_calls);
        self.stats.inner.tokens.lock().unwrap().push(callback.token());
        if self.refuse_tasks {
            return Ok(false);
        }

        let output = match self.render(call)? {
            Ok(output) => output,
            Err(message) => {
                let mut text = message.into_bytes();
                text.push(0);
                let ptr = self.malloc(text.len() as u32)?;
                self.write_bytes(ptr, &text)?;
                self.write_u32(error_slot, ptr.addr())?;
                Ptr::NULL
            }
        };

        match self.completion {
            Completion::Immediate => {
                let _ = callback.invoke(error_slot, output);
            }
            Completion::Threaded => {
                let delay = Duration::from_micros(u64::from(callback.token() % 997) * 3);
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = callback.invoke(error_slot, output);
                });
            }
            Completion::Deferred | Completion::Polled => {
                self.deferred
                    .queued
                    .lock()
                    .unwrap()
                    .push((callback, error_slot, output));
            }
        }
        Ok(true)
    }

    fn poll(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.completion == Completion::Polled {
            self.deferred.fire_all();
        }
        Ok(())
    }

    fn exit(&mut self) -> Result<()> {
        MockStats::bump(&self.stats.inner.exits);
        self.exited = true;
        Ok(())
    }
}

/// Hands out one prepared [`MockRuntime`], or fails.
pub struct MockLoader {
    runtime: Mutex<Option<MockRuntime>>,
    failure: Option<String>,
}

impl MockLoader {
    pub fn new(runtime: MockRuntime) -> Self {
        Self {
            runtime: Mutex::new(Some(runtime)),
            failure: None,
        }
    }

    /// A loader whose locator never resolves.
    pub fn failing(message: &str) -> Self {
        Self {
            runtime: Mutex::new(None),
            failure: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl RuntimeLoader for MockLoader {
    async fn load(
        &self,
        _config: &SessionConfig,
        _logger: SharedLogger,
    ) -> Result<Box<dyn ForeignRuntime>> {
        if let Some(message) = &self.failure {
            return Err(Error::Initialization(message.clone()));
        }
        let runtime = self
            .runtime
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Initialization("mock runtime already loaded".to_string()))?;
        Ok(Box::new(runtime))
    }
}

/// Logger that keeps every message.
#[derive(Debug, Clone, Default)]
pub struct RecordingLogger {
    entries: Arc<Mutex<Vec<(LogLevel, String)>>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries.lock().unwrap().clone()
    }

    /// Messages logged at `level`.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        self.entries.lock().unwrap().push((level, message.to_string()));
    }
}
