//! Version descriptor of a loaded runtime.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};

/// Version tag of this binding, reported under the `wrapper` key.
pub const WRAPPER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Component name to version string, e.g. `rlottie` → `0.2`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VersionInfo(BTreeMap<String, String>);

impl VersionInfo {
    /// Merge the binding's tag with the runtime's JSON version record.
    ///
    /// Entries from the runtime are applied after the `wrapper` tag.
    /// Non-string values keep their JSON text.
    pub fn from_runtime_json(json: &str) -> Result<Self> {
        let record: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)
            .map_err(|e| Error::Initialization(format!("invalid version record: {e}")))?;

        let mut versions = BTreeMap::new();
        versions.insert("wrapper".to_string(), WRAPPER_VERSION.to_string());
        for (component, value) in record {
            let version = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            versions.insert(component, version);
        }
        Ok(Self(versions))
    }

    pub fn get(&self, component: &str) -> Option<&str> {
        self.0.get(component).map(String::as_str)
    }

    /// Version of this binding.
    pub fn wrapper(&self) -> Option<&str> {
        self.get("wrapper")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use collection_literals::btree;

    use super::*;

    #[test]
    fn merges_wrapper_with_runtime_record() {
        let info = VersionInfo::from_runtime_json(
            r#"{"core":"1.2.0","libwebp":"1.3.2","rlottie":"0.2","zlib":"1.3"}"#,
        )
        .unwrap();

        let expected: BTreeMap<String, String> = btree! {
            "core".to_string() => "1.2.0".to_string(),
            "libwebp".to_string() => "1.3.2".to_string(),
            "rlottie".to_string() => "0.2".to_string(),
            "wrapper".to_string() => WRAPPER_VERSION.to_string(),
            "zlib".to_string() => "1.3".to_string(),
        };
        assert_eq!(info.as_map(), &expected);
        assert_eq!(info.wrapper(), Some(WRAPPER_VERSION));

        let components: Vec<&str> = info.iter().map(|(component, _)| component).collect();
        assert_eq!(components, ["core", "libwebp", "rlottie", "wrapper", "zlib"]);
        assert!(info.iter().any(|entry| entry == ("zlib", "1.3")));
    }

    #[test]
    fn non_string_values_keep_json_text() {
        let info = VersionInfo::from_runtime_json(r#"{"abi":2}"#).unwrap();
        assert_eq!(info.get("abi"), Some("2"));
    }

    #[test]
    fn garbage_is_an_initialization_error() {
        let err = VersionInfo::from_runtime_json("lottie2img-core v1").unwrap_err();
        assert!(matches!(err, Error::Initialization(_)));
    }
}
