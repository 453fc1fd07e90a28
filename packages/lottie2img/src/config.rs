//! Session configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::logger::{GuardedLogger, Logger, NoopLogger, SharedLogger, TracingLogger};

/// Prebuilt runtime variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoreVariant {
    /// No worker threads; conversions run synchronously.
    SingleThread,
    /// Conversions run on runtime worker threads.
    #[default]
    MultiThread,
    /// Multi-thread build with the additional GIF encoder.
    Extended,
}

impl CoreVariant {
    /// File name of the variant inside the core directory.
    pub fn file_name(self) -> &'static str {
        match self {
            CoreVariant::SingleThread => "single-thread.wasm",
            CoreVariant::MultiThread => "multi-thread.wasm",
            CoreVariant::Extended => "extended.wasm",
        }
    }
}

/// Where to load the runtime module from.
#[derive(Clone)]
pub enum ModuleLocator {
    /// A prebuilt variant inside [`SessionConfig::core_dir`].
    Variant(CoreVariant),
    /// An explicit module file.
    Path(PathBuf),
    /// Module bytes already in memory (binary or text format).
    Bytes(Arc<[u8]>),
}

impl ModuleLocator {
    /// The file this locator points at, if it points at one.
    pub fn resolve_path(&self, core_dir: &Path) -> Option<PathBuf> {
        match self {
            ModuleLocator::Variant(variant) => Some(core_dir.join(variant.file_name())),
            ModuleLocator::Path(path) => Some(path.clone()),
            ModuleLocator::Bytes(_) => None,
        }
    }
}

impl Default for ModuleLocator {
    fn default() -> Self {
        ModuleLocator::Variant(CoreVariant::default())
    }
}

impl fmt::Debug for ModuleLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleLocator::Variant(v) => f.debug_tuple("Variant").field(v).finish(),
            ModuleLocator::Path(p) => f.debug_tuple("Path").field(p).finish(),
            ModuleLocator::Bytes(b) => write!(f, "Bytes(<{} bytes>)", b.len()),
        }
    }
}

impl From<CoreVariant> for ModuleLocator {
    fn from(variant: CoreVariant) -> Self {
        ModuleLocator::Variant(variant)
    }
}

impl From<PathBuf> for ModuleLocator {
    fn from(path: PathBuf) -> Self {
        ModuleLocator::Path(path)
    }
}

impl From<Vec<u8>> for ModuleLocator {
    fn from(bytes: Vec<u8>) -> Self {
        ModuleLocator::Bytes(bytes.into())
    }
}

/// Configuration for creating a session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Which runtime module to load.
    pub core: ModuleLocator,

    /// Directory holding the prebuilt variants.
    pub core_dir: PathBuf,

    /// Whether session and runtime messages reach the logger at all.
    pub log: bool,

    /// Receives messages when `log` is enabled.
    pub logger: SharedLogger,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            core: ModuleLocator::default(),
            core_dir: PathBuf::from("core"),
            log: false,
            logger: Arc::new(TracingLogger),
        }
    }
}

impl SessionConfig {
    pub fn new(core: impl Into<ModuleLocator>) -> Self {
        Self {
            core: core.into(),
            ..Self::default()
        }
    }

    pub fn with_core_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.core_dir = dir.into();
        self
    }

    /// Enable logging through `logger`.
    pub fn with_logger(mut self, logger: impl Logger + 'static) -> Self {
        self.log = true;
        self.logger = Arc::new(logger);
        self
    }

    pub fn with_log(mut self, enabled: bool) -> Self {
        self.log = enabled;
        self
    }

    /// The logger sessions actually use: the configured one behind a panic
    /// guard, or a no-op.
    pub fn effective_logger(&self) -> SharedLogger {
        if self.log {
            Arc::new(GuardedLogger::new(Arc::clone(&self.logger)))
        } else {
            Arc::new(NoopLogger)
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("core", &self.core)
            .field("core_dir", &self.core_dir)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}
