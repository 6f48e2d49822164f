//! Writer configuration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PREFIX: &str = "ringtrace";
pub const DEFAULT_THREAD_NAME: &str = "ringtrace-writer";

/// Digits of sub-second timestamp precision written to trace files.
pub const DEFAULT_TIMESTAMP_PRECISION: u32 = 6;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Where and how a [`TraceWriter`](crate::writer::TraceWriter) writes trace
/// files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Trace files go to `<folder>/<trace id>/`.
    pub folder: PathBuf,
    pub prefix: String,
    /// Extra `key|value` lines for the header block, in order.
    pub headers: Vec<(String, String)>,
    pub timestamp_precision: u32,
    /// gzip level, 0-9.
    pub compression_level: u32,
    pub thread_name: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            folder: std::env::temp_dir(),
            prefix: DEFAULT_PREFIX.to_string(),
            headers: Vec::new(),
            timestamp_precision: DEFAULT_TIMESTAMP_PRECISION,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl WriterConfig {
    pub fn new<P: Into<PathBuf>>(folder: P) -> Self {
        Self {
            folder: folder.into(),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read writer config {}", path.display()))?;
        let config: WriterConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse writer config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WriterConfig::new("/data/traces");
        assert_eq!(config.folder, PathBuf::from("/data/traces"));
        assert_eq!(config.prefix, "ringtrace");
        assert_eq!(config.timestamp_precision, 6);
        assert_eq!(config.compression_level, 6);
        assert_eq!(config.thread_name, "ringtrace-writer");
    }

    #[test]
    fn test_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"folder": "/t", "prefix": "app", "headers": [["build", "42"]]}}"#
        )
        .unwrap();
        let config = WriterConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.folder, PathBuf::from("/t"));
        assert_eq!(config.prefix, "app");
        assert_eq!(config.headers, vec![("build".to_string(), "42".to_string())]);
        assert_eq!(config.timestamp_precision, 6);
    }

    #[test]
    fn test_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(WriterConfig::from_json_file(file.path()).is_err());
    }
}
