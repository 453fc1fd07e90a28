//! Loading and initializing a runtime.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::foreign::{Capabilities, ForeignRuntime, SharedRuntime};
use crate::logger::SharedLogger;
use crate::version::VersionInfo;

/// Produces a live runtime for a session.
///
/// Loading may be slow (module compilation); implementations should keep
/// heavy work off the async executor.
#[async_trait]
pub trait RuntimeLoader: Send + Sync {
    /// Resolve `config.core` and initialize the runtime.
    ///
    /// `logger` receives whatever the runtime prints. Failures are reported
    /// as [`Error::Initialization`].
    async fn load(
        &self,
        config: &SessionConfig,
        logger: SharedLogger,
    ) -> Result<Box<dyn ForeignRuntime>>;
}

/// A runtime with its capabilities and versions read.
pub(crate) struct LoadedRuntime {
    pub runtime: SharedRuntime,
    pub capabilities: Capabilities,
    pub version: VersionInfo,
}

/// Load through `loader` and read the runtime's metadata.
pub(crate) async fn initialize<L>(
    loader: &L,
    config: &SessionConfig,
    logger: SharedLogger,
) -> Result<LoadedRuntime>
where
    L: RuntimeLoader + ?Sized,
{
    let mut runtime = loader.load(config, logger).await.map_err(|e| match e {
        Error::Initialization(_) => e,
        other => Error::Initialization(other.to_string()),
    })?;

    let capabilities = runtime.capabilities();
    let version = match read_version(&mut *runtime) {
        Ok(version) => version,
        Err(e) => {
            if let Err(exit) = runtime.exit() {
                warn!(error = %exit, "runtime failed to exit after a failed initialization");
            }
            return Err(e);
        }
    };
    debug!(?capabilities, ?version, "runtime initialized");

    Ok(LoadedRuntime {
        runtime: SharedRuntime::new(runtime),
        capabilities,
        version,
    })
}

fn read_version(runtime: &mut dyn ForeignRuntime) -> Result<VersionInfo> {
    let ptr = runtime
        .version()
        .map_err(|e| Error::Initialization(format!("version(): {e}")))?;
    if ptr.is_null() {
        return Err(Error::Initialization(
            "runtime returned no version record".to_string(),
        ));
    }
    let json = runtime
        .read_c_string(ptr)
        .map_err(|e| Error::Initialization(format!("reading version record: {e}")))?;
    VersionInfo::from_runtime_json(&json)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::logger::NoopLogger;
    use crate::testing::{MockLoader, MockRuntime};

    #[tokio::test]
    async fn reads_capabilities_and_version() {
        let loader = MockLoader::new(
            MockRuntime::new().with_version(r#"{"core":"2.0.0","rlottie":"0.2"}"#),
        );
        let loaded = initialize(&loader, &SessionConfig::default(), Arc::new(NoopLogger))
            .await
            .unwrap();

        assert!(loaded.capabilities.supports_async);
        assert_eq!(loaded.version.get("core"), Some("2.0.0"));
        assert!(loaded.version.wrapper().is_some());
    }

    #[tokio::test]
    async fn loader_failure_is_initialization_error() {
        let loader = MockLoader::failing("module not found");
        let err = initialize(&loader, &SessionConfig::default(), Arc::new(NoopLogger))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Initialization(msg) if msg.contains("module not found")));
    }

    #[tokio::test]
    async fn bad_version_record_exits_the_runtime() {
        let runtime = MockRuntime::new().with_version("not json");
        let stats = runtime.stats();
        let loader = MockLoader::new(runtime);

        let err = initialize(&loader, &SessionConfig::default(), Arc::new(NoopLogger))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Initialization(_)));
        assert_eq!(stats.exits(), 1);
    }
}
