//! # lottie2img
//!
//! Host-side binding for the lottie2img conversion runtime: a WebAssembly
//! build of a native library that renders Lottie animations to animated WebP
//! or GIF.
//!
//! ## Core Concepts
//!
//! ### Sessions
//!
//! A [`Session`] owns one runtime instance. It is created from a
//! [`SessionConfig`] naming the core module to load, serves conversions until
//! [`Session::destroy`] is called, and is cheap to clone and share between
//! tasks.
//!
//! ### Options
//!
//! [`ConvertOptions`] is encoded into the runtime's `key=value;...` option
//! string. Keys and their order are fixed; see [`options::encode`].
//!
//! ### Asynchronous conversion
//!
//! Runtimes built with worker threads accept a conversion, return at once and
//! report completion later through a callback token. The [`TaskBroker`] maps
//! those tokens back to waiting futures. Runtimes without workers are driven
//! synchronously, with a warning.
//!
//! ### Memory
//!
//! Every runtime allocation made for a call is owned by an [`Arena`] and
//! freed exactly once when the call finishes, successfully or not.
//!
//! ## Example
//!
//! ```ignore
//! use lottie2img::{ConvertOptions, CoreVariant, OutputFormat, Session, SessionConfig};
//!
//! let session = Session::create(SessionConfig::new(CoreVariant::MultiThread)).await?;
//! let webp = session
//!     .convert(lottie_json, &ConvertOptions::default().quality(90.0))
//!     .await?;
//! let gif = session
//!     .convert(lottie_json, &ConvertOptions::default().format(OutputFormat::Gif))
//!     .await?;
//! session.destroy()?;
//! ```

pub mod arena;
pub mod broker;
pub mod config;
pub mod error;
pub mod foreign;
pub mod loader;
pub mod logger;
pub mod options;
pub mod session;
pub mod version;
pub mod wasm;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use arena::{Arena, ArenaSlots};
pub use broker::{PendingTask, TaskBroker, TaskCallback, TaskHandle, TaskOutcome};
pub use config::{CoreVariant, ModuleLocator, SessionConfig};
pub use error::{Error, Result};
pub use foreign::{Capabilities, ConvertCall, ForeignRuntime, Ptr, SharedRuntime};
pub use loader::RuntimeLoader;
pub use logger::{GuardedLogger, LogLevel, Logger, NoopLogger, TracingLogger};
pub use options::{encode, ConversionRequest, ConvertOptions, OptionKey, OutputFormat};
pub use session::{Session, SessionState};
pub use version::VersionInfo;
pub use wasm::{WasmLoader, WasmRuntime};
