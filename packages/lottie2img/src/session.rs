//! Sessions: the public face of a loaded runtime.
//!
//! A [`Session`] exclusively owns one runtime instance. It exists only once
//! the runtime has loaded (`Ready`) and ends in `Destroyed`, after which
//! every operation fails with [`Error::Destroyed`].
//!
//! Asynchronous conversions never run foreign code on the async executor:
//! every call into the runtime goes through tokio's blocking pool, and the
//! executor only awaits the task's completion.
//!
//! # Example
//!
//! ```ignore
//! use lottie2img::{ConvertOptions, CoreVariant, OutputFormat, Session, SessionConfig};
//!
//! let session = Session::create(SessionConfig::new(CoreVariant::MultiThread)).await?;
//! let webp = session
//!     .convert(lottie_json, &ConvertOptions::new().quality(80.0))
//!     .await?;
//! session.destroy()?;
//! ```

use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::broker::{PendingTask, TaskBroker, TaskHandle, TaskOutcome};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::foreign::{Capabilities, ConvertCall, Ptr, SharedRuntime};
use crate::loader::{self, RuntimeLoader};
use crate::logger::{LogLevel, SharedLogger};
use crate::options::{ConversionRequest, ConvertOptions};
use crate::version::VersionInfo;
use crate::wasm::WasmLoader;

const FALLBACK_WARNING: &str =
    "This core does not support async convert, run sync version instead";

/// How often a runtime that needs polling is driven while a task waits.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The runtime is loaded and accepts conversions.
    Ready,
    /// The runtime has been torn down. Terminal.
    Destroyed,
}

struct SessionInner {
    runtime: SharedRuntime,
    broker: Arc<TaskBroker>,
    capabilities: Capabilities,
    version: VersionInfo,
    logger: SharedLogger,
    destroyed: AtomicBool,
}

/// An asynchronous call the runtime accepted.
struct Scheduled {
    arena: Arena,
    call: ConvertCall,
    error_slot: Ptr,
    task: PendingTask,
}

/// A loaded conversion runtime.
///
/// Cloning is cheap and every clone drives the same runtime.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Load the wasm runtime named by `config` and wrap it in a session.
    pub async fn create(config: SessionConfig) -> Result<Self> {
        Self::create_with(&WasmLoader::new(), config).await
    }

    /// Create a session from a runtime produced by `loader`.
    pub async fn create_with<L>(loader: &L, config: SessionConfig) -> Result<Self>
    where
        L: RuntimeLoader + ?Sized,
    {
        let logger = config.effective_logger();
        let loaded = loader::initialize(loader, &config, Arc::clone(&logger)).await?;
        info!(
            core = ?config.core,
            supports_async = loaded.capabilities.supports_async,
            "session ready"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                runtime: loaded.runtime,
                broker: Arc::new(TaskBroker::new()),
                capabilities: loaded.capabilities,
                version: loaded.version,
                logger,
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Versions of the binding and of the runtime's components.
    pub fn version(&self) -> &VersionInfo {
        &self.inner.version
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn state(&self) -> SessionState {
        if self.is_destroyed() {
            SessionState::Destroyed
        } else {
            SessionState::Ready
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Number of asynchronous conversions awaiting the runtime.
    pub fn pending_tasks(&self) -> usize {
        self.inner.broker.pending()
    }

    /// Convert `input` (lottie JSON or gzipped TGS) to an image.
    ///
    /// Runs on the runtime's worker threads when it supports that. Otherwise
    /// a warning is logged and the synchronous entry point is called on the
    /// blocking pool, with the same result [`convert_sync`](Self::convert_sync)
    /// would give.
    ///
    /// Dropping the returned future does not cancel the conversion; the
    /// runtime finishes it and its memory is released then.
    pub async fn convert(
        &self,
        input: impl Into<Bytes>,
        options: &ConvertOptions,
    ) -> Result<Vec<u8>> {
        self.ensure_ready()?;

        let request = ConversionRequest::new(input.into(), options.clone());
        let inner = Arc::clone(&self.inner);
        let result = if self.inner.capabilities.supports_async {
            match tokio::spawn(inner.run_async(request)).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => Err(Error::Aborted(e.to_string())),
            }
        } else {
            self.inner.logger.log(LogLevel::Warn, FALLBACK_WARNING);
            blocking(move || inner.run_sync(request.input(), &request.options().encode())).await
        };
        self.inner.report(result)
    }

    /// Convert `input` on the calling thread.
    ///
    /// This blocks for the whole conversion; async callers should use
    /// [`convert`](Self::convert).
    pub fn convert_sync(&self, input: &[u8], options: &ConvertOptions) -> Result<Vec<u8>> {
        self.ensure_ready()?;
        let result = self.inner.run_sync(input, &options.encode());
        self.inner.report(result)
    }

    /// Tear the runtime down.
    ///
    /// Pending conversions fail with [`Error::Destroyed`]. Calling this
    /// again does nothing and returns [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Err(Error::Destroyed);
        }

        let drained = self.inner.broker.drain();
        self.inner.runtime.lock().exit()?;
        info!(drained, "session destroyed");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Destroyed => Err(Error::Destroyed),
        }
    }
}

/// Run foreign work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(Error::Aborted(e.to_string())),
    }
}

impl SessionInner {
    async fn run_async(self: Arc<Self>, request: ConversionRequest) -> Result<Vec<u8>> {
        let inner = Arc::clone(&self);
        let Scheduled {
            arena,
            call,
            error_slot,
            task,
        } = blocking(move || inner.schedule(&request)).await?;

        let handle = task.handle();
        let settled = self.settle(task).await;

        let inner = Arc::clone(&self);
        blocking(move || inner.finish(arena, call, error_slot, handle, settled)).await
    }

    /// Copy the request in and hand it to `convertAsync`.
    fn schedule(&self, request: &ConversionRequest) -> Result<Scheduled> {
        let wire = request.options().encode();
        let mut arena = Arena::new(self.runtime.clone());
        let slots = arena.acquire(request.input(), &wire, true)?;
        let error_slot = slots
            .error
            .ok_or_else(|| Error::Trap("no error slot for an asynchronous call".to_string()))?;

        let task = self.broker.issue()?;
        let handle = task.handle();
        let callback = self.broker.callback(handle);
        let scheduled = self
            .runtime
            .lock()
            .convert_async(&slots.call, callback, error_slot);

        match scheduled {
            Ok(true) => debug!(%handle, "conversion scheduled"),
            Ok(false) => {
                self.broker.cancel(handle);
                return Err(self.unless_destroyed(Error::TaskCreation));
            }
            Err(e) => {
                self.broker.cancel(handle);
                return Err(self.unless_destroyed(e));
            }
        }

        Ok(Scheduled {
            arena,
            call: slots.call,
            error_slot,
            task,
        })
    }

    /// Wait for the task, driving the runtime if it only completes when
    /// polled.
    async fn settle(&self, task: PendingTask) -> Result<TaskOutcome> {
        if !self.capabilities.needs_polling {
            return task.wait().await;
        }

        let mut outcome = pin!(task.wait());
        loop {
            tokio::select! {
                settled = &mut outcome => return settled,
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    let runtime = self.runtime.clone();
                    if let Err(e) = blocking(move || runtime.lock().poll()).await {
                        return Err(self.unless_destroyed(e));
                    }
                }
            }
        }
    }

    fn finish(
        &self,
        mut arena: Arena,
        call: ConvertCall,
        error_slot: Ptr,
        handle: TaskHandle,
        settled: Result<TaskOutcome>,
    ) -> Result<Vec<u8>> {
        match settled {
            Ok(TaskOutcome::Converted(output)) => arena.read_output(output, call.output_len),
            Ok(TaskOutcome::Failed) => {
                Err(Error::conversion(arena.take_error_message(error_slot)?))
            }
            Ok(TaskOutcome::Destroyed) => {
                arena.abandon();
                Err(Error::Destroyed)
            }
            Err(e) => {
                // The runtime still owns the task and may write into its
                // buffers, so they are leaked rather than freed.
                self.broker.cancel(handle);
                warn!(%handle, error = %e, "abandoning unsettled conversion");
                arena.abandon();
                Err(e)
            }
        }
    }

    fn run_sync(&self, input: &[u8], wire: &str) -> Result<Vec<u8>> {
        let mut arena = Arena::new(self.runtime.clone());
        let slots = arena.acquire(input, wire, false)?;

        let output = self.runtime.lock().convert(&slots.call)?;
        if output.is_null() {
            return Err(Error::conversion(""));
        }
        arena.read_output(output, slots.call.output_len)
    }

    /// A failure caused by a concurrent destroy is reported as such.
    fn unless_destroyed(&self, error: Error) -> Error {
        if self.destroyed.load(Ordering::SeqCst) {
            Error::Destroyed
        } else {
            error
        }
    }

    fn report(&self, result: Result<Vec<u8>>) -> Result<Vec<u8>> {
        if let Err(e) = &result {
            self.logger.log(LogLevel::Error, &e.to_string());
        }
        result
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("capabilities", &self.inner.capabilities)
            .field("version", &self.inner.version)
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}
