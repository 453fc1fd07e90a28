//! Hosting the conversion runtime with Wasmtime.
//!
//! The runtime is a WebAssembly core module. It must export `memory`,
//! `malloc`, `free`, `version` and `convert`; builds with worker threads also
//! export `convertAsync` (and may export a `haveAsync` global to switch it
//! off). A module whose `convertAsync` returns before the work is done also
//! exports `poll`: the host calls it periodically, off the async executor,
//! and the module delivers finished tasks from inside it. The host provides
//! three imports in the `env` namespace:
//!
//! - `lottie2img_complete(token, error_slot, output)`: the completion
//!   callback for `convertAsync`,
//! - `lottie2img_print(ptr, len)` / `lottie2img_print_err(ptr, len)`: the
//!   runtime's standard output and error streams.
//!
//! Any other import is linked to a stub that traps when called, so toolchain
//! builds that declare unused imports still instantiate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use wasmtime::{Caller, Engine, Extern, Linker, Memory, Module, Store, TypedFunc, Val};

use crate::broker::{TaskCallback, TaskHandle};
use crate::config::{ModuleLocator, SessionConfig};
use crate::error::{Error, Result};
use crate::foreign::{Capabilities, ConvertCall, ForeignRuntime, Ptr};
use crate::loader::RuntimeLoader;
use crate::logger::{log_output, SharedLogger, Stream};

/// State held by the Wasmtime store for the runtime instance.
struct HostState {
    /// Callbacks of accepted `convertAsync` calls, by token.
    callbacks: HashMap<u32, TaskCallback>,
    logger: SharedLogger,
}

struct Exports {
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
    version: TypedFunc<(), i32>,
    convert: TypedFunc<(i32, i32, i32, i32), i32>,
    convert_async: Option<TypedFunc<(i32, i32, i32, i32, i32, i32), i32>>,
    poll: Option<TypedFunc<(), ()>>,
}

struct Live {
    store: Store<HostState>,
    memory: Memory,
    exports: Exports,
}

impl Live {
    fn bounds(&self, ptr: Ptr, len: u32) -> Result<usize> {
        let start = ptr.addr() as usize;
        match start.checked_add(len as usize) {
            Some(end) if end <= self.memory.data_size(&self.store) => Ok(start),
            _ => Err(Error::Trap(format!(
                "out of bounds memory access at {ptr} (+{len})"
            ))),
        }
    }
}

/// A runtime module instantiated in Wasmtime.
pub struct WasmRuntime {
    live: Option<Live>,
    capabilities: Capabilities,
}

fn trap(e: wasmtime::Error) -> Error {
    Error::Trap(e.to_string())
}

fn init_error(stage: &str) -> impl Fn(wasmtime::Error) -> Error + '_ {
    move |e| Error::Initialization(format!("{stage}: {e}"))
}

impl WasmRuntime {
    /// Compile and instantiate a module (binary or text format).
    ///
    /// This is slow for real runtime builds; async callers should go through
    /// [`WasmLoader`], which runs it on the blocking pool.
    pub fn instantiate(engine: &Engine, module: &[u8], logger: SharedLogger) -> Result<Self> {
        let module = Module::new(engine, module).map_err(init_error("compile"))?;

        let mut linker = Linker::<HostState>::new(engine);
        linker
            .func_wrap(
                "env",
                "lottie2img_complete",
                |mut caller: Caller<'_, HostState>, token: i32, error_slot: i32, output: i32| {
                    complete(&mut caller, token as u32, error_slot as u32, output as u32)
                },
            )
            .map_err(init_error("linker"))?;
        linker
            .func_wrap(
                "env",
                "lottie2img_print",
                |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                    print(&mut caller, Stream::Stdout, ptr as u32, len as u32)
                },
            )
            .map_err(init_error("linker"))?;
        linker
            .func_wrap(
                "env",
                "lottie2img_print_err",
                |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                    print(&mut caller, Stream::Stderr, ptr as u32, len as u32)
                },
            )
            .map_err(init_error("linker"))?;
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(init_error("linker"))?;

        let state = HostState {
            callbacks: HashMap::new(),
            logger,
        };
        let mut store = Store::new(engine, state);
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(init_error("instantiate"))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::Initialization("module does not export memory".to_string()))?;
        let exports = Exports {
            malloc: instance
                .get_typed_func(&mut store, "malloc")
                .map_err(init_error("malloc"))?,
            free: instance
                .get_typed_func(&mut store, "free")
                .map_err(init_error("free"))?,
            version: instance
                .get_typed_func(&mut store, "version")
                .map_err(init_error("version"))?,
            convert: instance
                .get_typed_func(&mut store, "convert")
                .map_err(init_error("convert"))?,
            convert_async: instance
                .get_typed_func(&mut store, "convertAsync")
                .ok(),
            poll: instance.get_typed_func(&mut store, "poll").ok(),
        };

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ()).map_err(init_error("_initialize"))?;
        }

        // Read after `_initialize`, which may set it.
        let have_async = match instance.get_global(&mut store, "haveAsync") {
            Some(global) => match global.get(&mut store) {
                Val::I32(flag) => flag != 0,
                Val::I64(flag) => flag != 0,
                _ => false,
            },
            None => true,
        };
        let supports_async = have_async && exports.convert_async.is_some();
        let capabilities = Capabilities {
            supports_async,
            needs_polling: supports_async && exports.poll.is_some(),
        };

        debug!(?capabilities, "runtime module instantiated");
        Ok(Self {
            live: Some(Live {
                store,
                memory,
                exports,
            }),
            capabilities,
        })
    }

    fn live(&mut self) -> Result<&mut Live> {
        self.live
            .as_mut()
            .ok_or_else(|| Error::Trap("runtime has exited".to_string()))
    }
}

/// `env.lottie2img_complete`: route a completion to its task.
fn complete(
    caller: &mut Caller<'_, HostState>,
    token: u32,
    error_slot: u32,
    output: u32,
) -> wasmtime::Result<()> {
    let Some(callback) = caller.data_mut().callbacks.remove(&token) else {
        return Err(Error::ProtocolViolation {
            handle: TaskHandle::from_token(token),
        }
        .into());
    };
    callback.invoke(Ptr::new(error_slot), Ptr::new(output))?;
    Ok(())
}

/// `env.lottie2img_print[_err]`: forward runtime output to the logger.
fn print(
    caller: &mut Caller<'_, HostState>,
    stream: Stream,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<()> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| Error::Trap("module does not export memory".to_string()))?;

    let start = ptr as usize;
    let end = start.saturating_add(len as usize);
    let bytes = memory
        .data(&*caller)
        .get(start..end)
        .ok_or_else(|| Error::Trap(format!("out of bounds print at {}", Ptr::new(ptr))))?;
    let text = String::from_utf8_lossy(bytes);
    log_output(caller.data().logger.as_ref(), stream, &text);
    Ok(())
}

impl ForeignRuntime for WasmRuntime {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn version(&mut self) -> Result<Ptr> {
        let live = self.live()?;
        let ptr = live.exports.version.call(&mut live.store, ()).map_err(trap)?;
        Ok(Ptr::new(ptr as u32))
    }

    fn malloc(&mut self, size: u32) -> Result<Ptr> {
        let live = self.live()?;
        let ptr = live
            .exports
            .malloc
            .call(&mut live.store, size as i32)
            .map_err(trap)?;
        Ok(Ptr::new(ptr as u32))
    }

    fn free(&mut self, ptr: Ptr) -> Result<()> {
        let live = self.live()?;
        live.exports
            .free
            .call(&mut live.store, ptr.addr() as i32)
            .map_err(trap)
    }

    fn write_bytes(&mut self, ptr: Ptr, bytes: &[u8]) -> Result<()> {
        let live = self.live()?;
        let offset = live.bounds(ptr, bytes.len() as u32)?;
        live.memory
            .write(&mut live.store, offset, bytes)
            .map_err(|e| Error::Trap(e.to_string()))
    }

    fn read_bytes(&mut self, ptr: Ptr, len: u32) -> Result<Vec<u8>> {
        let live = self.live()?;
        let offset = live.bounds(ptr, len)?;
        let mut buf = vec![0; len as usize];
        live.memory
            .read(&live.store, offset, &mut buf)
            .map_err(|e| Error::Trap(e.to_string()))?;
        Ok(buf)
    }

    fn read_c_string(&mut self, ptr: Ptr) -> Result<String> {
        let live = self.live()?;
        let start = live.bounds(ptr, 0)?;
        let data = &live.memory.data(&live.store)[start..];
        let len = data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Trap(format!("unterminated string at {ptr}")))?;
        Ok(String::from_utf8_lossy(&data[..len]).into_owned())
    }

    fn convert(&mut self, call: &ConvertCall) -> Result<Ptr> {
        let live = self.live()?;
        let output = live
            .exports
            .convert
            .call(
                &mut live.store,
                (
                    call.options.addr() as i32,
                    call.input.addr() as i32,
                    call.input_len as i32,
                    call.output_len.addr() as i32,
                ),
            )
            .map_err(trap)?;
        Ok(Ptr::new(output as u32))
    }

    fn convert_async(
        &mut self,
        call: &ConvertCall,
        callback: TaskCallback,
        error_slot: Ptr,
    ) -> Result<bool> {
        let live = self.live()?;
        let Some(convert_async) = live.exports.convert_async.as_ref() else {
            return Ok(false);
        };

        // Registered first: the module may complete before returning.
        let token = callback.token();
        live.store.data_mut().callbacks.insert(token, callback);

        let accepted = convert_async.call(
            &mut live.store,
            (
                call.options.addr() as i32,
                call.input.addr() as i32,
                call.input_len as i32,
                call.output_len.addr() as i32,
                token as i32,
                error_slot.addr() as i32,
            ),
        );
        match accepted {
            Ok(flag) if flag != 0 => Ok(true),
            Ok(_) => {
                live.store.data_mut().callbacks.remove(&token);
                Ok(false)
            }
            Err(e) => {
                live.store.data_mut().callbacks.remove(&token);
                Err(trap(e))
            }
        }
    }

    fn poll(&mut self) -> Result<()> {
        let live = self.live()?;
        match live.exports.poll.as_ref() {
            Some(poll) => poll.call(&mut live.store, ()).map_err(trap),
            None => Ok(()),
        }
    }

    fn exit(&mut self) -> Result<()> {
        if let Some(live) = self.live.take() {
            debug!(
                unfinished = live.store.data().callbacks.len(),
                "runtime instance dropped"
            );
        }
        Ok(())
    }
}

impl fmt::Debug for WasmRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmRuntime")
            .field("live", &self.live.is_some())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Loads runtime modules into a shared Wasmtime engine.
#[derive(Clone, Default)]
pub struct WasmLoader {
    engine: Engine,
}

impl WasmLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing engine, e.g. one with custom compilation settings.
    pub fn with_engine(engine: Engine) -> Self {
        Self { engine }
    }
}

fn read_module(locator: &ModuleLocator, core_dir: &std::path::Path) -> Result<Arc<[u8]>> {
    if let ModuleLocator::Bytes(bytes) = locator {
        return Ok(Arc::clone(bytes));
    }
    let path = locator
        .resolve_path(core_dir)
        .ok_or_else(|| Error::Initialization(format!("cannot resolve {locator:?}")))?;
    std::fs::read(&path)
        .map(Arc::from)
        .map_err(|e| Error::Initialization(format!("{}: {e}", path.display())))
}

#[async_trait]
impl RuntimeLoader for WasmLoader {
    async fn load(
        &self,
        config: &SessionConfig,
        logger: SharedLogger,
    ) -> Result<Box<dyn ForeignRuntime>> {
        let engine = self.engine.clone();
        let locator = config.core.clone();
        let core_dir = config.core_dir.clone();

        let runtime = tokio::task::spawn_blocking(move || {
            let module = read_module(&locator, &core_dir)?;
            WasmRuntime::instantiate(&engine, &module, logger)
        })
        .await
        .map_err(|e| Error::Initialization(e.to_string()))??;

        Ok(Box::new(runtime))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::logger::NoopLogger;

    const MINIMAL: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $heap (mut i32) (i32.const 1024))
          (data (i32.const 16) "{}\00")
          (func $malloc (export "malloc") (param $size i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $heap))
            (global.set $heap (i32.add (global.get $heap) (local.get $size)))
            (local.get $ptr))
          (func (export "free") (param i32))
          (func (export "version") (result i32) (i32.const 16))
          (func (export "convert") (param i32 i32 i32 i32) (result i32) (i32.const 0)))
    "#;

    fn minimal() -> WasmRuntime {
        WasmRuntime::instantiate(&Engine::default(), MINIMAL.as_bytes(), Arc::new(NoopLogger))
            .unwrap()
    }

    #[test]
    fn sync_only_module_has_no_async_capability() {
        let mut runtime = minimal();
        assert!(!runtime.capabilities().supports_async);
        assert!(!runtime.capabilities().needs_polling);
        runtime.poll().unwrap();
    }

    #[test]
    fn have_async_is_read_after_initialize() {
        let wat = r#"
            (module
              (memory (export "memory") 1)
              (global (export "haveAsync") (mut i32) (i32.const 0))
              (data (i32.const 16) "{}\00")
              (func (export "_initialize") (global.set 0 (i32.const 1)))
              (func (export "malloc") (param i32) (result i32) (i32.const 1024))
              (func (export "free") (param i32))
              (func (export "version") (result i32) (i32.const 16))
              (func (export "convert") (param i32 i32 i32 i32) (result i32) (i32.const 0))
              (func (export "convertAsync") (param i32 i32 i32 i32 i32 i32) (result i32)
                (i32.const 0))
              (func (export "poll")))
        "#;
        let runtime =
            WasmRuntime::instantiate(&Engine::default(), wat.as_bytes(), Arc::new(NoopLogger))
                .unwrap();
        assert_eq!(
            runtime.capabilities(),
            Capabilities {
                supports_async: true,
                needs_polling: true,
            }
        );
    }

    #[test]
    fn memory_access_is_bounds_checked() {
        let mut runtime = minimal();
        let ptr = runtime.malloc(4).unwrap();
        assert_eq!(ptr, Ptr::new(1024));
        runtime.write_u32(ptr, 42).unwrap();
        assert_eq!(runtime.read_u32(ptr).unwrap(), 42);

        let past_end = Ptr::new(65536 - 2);
        assert!(matches!(runtime.read_u32(past_end), Err(Error::Trap(_))));
        assert!(matches!(runtime.write_u32(past_end, 1), Err(Error::Trap(_))));
    }

    #[test]
    fn version_record_is_readable() {
        let mut runtime = minimal();
        let ptr = runtime.version().unwrap();
        assert_eq!(runtime.read_c_string(ptr).unwrap(), "{}");
    }

    #[test]
    fn exit_releases_the_instance() {
        let mut runtime = minimal();
        runtime.exit().unwrap();
        assert!(matches!(runtime.malloc(4), Err(Error::Trap(_))));
        runtime.exit().unwrap();
    }

    #[test]
    fn missing_exports_fail_initialization() {
        let err = WasmRuntime::instantiate(
            &Engine::default(),
            br#"(module (memory (export "memory") 1))"#,
            Arc::new(NoopLogger),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Initialization(msg) if msg.starts_with("malloc")));
    }

    #[test]
    fn unparsable_module_fails_initialization() {
        let err = WasmRuntime::instantiate(&Engine::default(), b"not wasm", Arc::new(NoopLogger))
            .unwrap_err();
        assert!(matches!(err, Error::Initialization(msg) if msg.starts_with("compile")));
    }

    #[test]
    fn bytes_locator_skips_the_filesystem() {
        let locator = ModuleLocator::from(MINIMAL.as_bytes().to_vec());
        let bytes = read_module(&locator, std::path::Path::new("/nonexistent")).unwrap();
        assert_eq!(&bytes[..], MINIMAL.as_bytes());
    }

    #[test]
    fn missing_file_is_initialization_error() {
        let locator = ModuleLocator::Path("/nonexistent/path/to/core.wasm".into());
        let err = read_module(&locator, std::path::Path::new("core")).unwrap_err();
        assert!(matches!(err, Error::Initialization(msg) if msg.contains("core.wasm")));
    }
}
