use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arcstr::ArcStr;

use crate::cache::Cache;
use crate::errors::{CacheError, ErrorKind};
use crate::serialization::{DEFAULT_COMPRESSION_THRESHOLD, SerializationFormat};
use crate::transport::Transport;
use crate::types::CacheResult;

/// Lock timeout used when a caller passes none.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a cache keeps its items.
#[derive(Clone, Default)]
pub enum EngineMode {
    /// In the memory of this process.
    #[default]
    InProc,
    /// On remote servers reached through a transport.
    Remote(Arc<dyn Transport>),
}

impl fmt::Debug for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineMode::InProc => f.write_str("InProc"),
            EngineMode::Remote(_) => f.write_str("Remote"),
        }
    }
}

/// Settings of one cache handle.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub(crate) name: ArcStr,
    pub(crate) exceptions_enabled: bool,
    pub(crate) format: SerializationFormat,
    pub(crate) compression_threshold: Option<usize>,
    pub(crate) client_id: ArcStr,
    pub(crate) default_lock_timeout: Duration,
    pub(crate) mode: EngineMode,
}

impl CacheConfig {
    /// Name of the cache.
    pub fn name(&self) -> &ArcStr {
        &self.name
    }

    /// Whether failed operations report errors. When disabled, operations
    /// return an empty result instead.
    pub fn exceptions_enabled(&self) -> bool {
        self.exceptions_enabled
    }

    /// Format user values are stored in.
    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    /// Payload size above which values are compressed, `None` when
    /// compression is off.
    pub fn compression_threshold(&self) -> Option<usize> {
        self.compression_threshold
    }

    /// Identifies this client to the servers.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Lock timeout used when a caller passes none.
    pub fn default_lock_timeout(&self) -> Duration {
        self.default_lock_timeout
    }

    /// The engine the cache runs on.
    pub fn mode(&self) -> &EngineMode {
        &self.mode
    }
}

/// Used to configure and open a [`Cache`].
pub struct CacheBuilder {
    name: String,
    exceptions_enabled: bool,
    format: SerializationFormat,
    compression: bool,
    compression_threshold: usize,
    client_id: Option<String>,
    default_lock_timeout: Duration,
    mode: EngineMode,
}

impl CacheBuilder {
    /// Creates a new `CacheBuilder` for the cache called `name`.
    ///
    /// This is the same as `Cache::builder(name)`.
    pub fn new(name: impl Into<String>) -> CacheBuilder {
        CacheBuilder {
            name: name.into(),
            exceptions_enabled: true,
            format: SerializationFormat::default(),
            compression: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            client_id: None,
            default_lock_timeout: DEFAULT_LOCK_TIMEOUT,
            mode: EngineMode::InProc,
        }
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// An empty cache name, or a zero compression threshold while compression
    /// is on, is rejected with [`ErrorKind::InvalidClientConfig`].
    pub fn build(self) -> CacheResult<CacheConfig> {
        if self.name.trim().is_empty() {
            return Err(CacheError::from((
                ErrorKind::InvalidClientConfig,
                "Cache name can't be empty.",
            )));
        }
        if self.compression && self.compression_threshold == 0 {
            return Err(CacheError::from((
                ErrorKind::InvalidClientConfig,
                "Compression threshold must be greater than zero.",
            )));
        }
        if self.default_lock_timeout.is_zero() {
            return Err(CacheError::from((
                ErrorKind::InvalidClientConfig,
                "Default lock timeout must be greater than zero.",
            )));
        }

        let client_id = self
            .client_id
            .unwrap_or_else(|| format!("{:016x}", rand::random::<u64>()));
        Ok(CacheConfig {
            name: self.name.into(),
            exceptions_enabled: self.exceptions_enabled,
            format: self.format,
            compression_threshold: self.compression.then_some(self.compression_threshold),
            client_id: client_id.into(),
            default_lock_timeout: self.default_lock_timeout,
            mode: self.mode,
        })
    }

    /// Validates the settings and opens the cache.
    pub fn open(self) -> CacheResult<Cache> {
        Cache::open(self.build()?)
    }

    /// Report failures as errors (default is true).
    pub fn exceptions_enabled(mut self, enabled: bool) -> CacheBuilder {
        self.exceptions_enabled = enabled;
        self
    }

    /// Sets the format values are stored in (default is binary).
    pub fn format(mut self, format: SerializationFormat) -> CacheBuilder {
        self.format = format;
        self
    }

    /// Turns compression of large payloads on or off (default is on).
    pub fn compression(mut self, enabled: bool) -> CacheBuilder {
        self.compression = enabled;
        self
    }

    /// Payloads larger than `bytes` are compressed (default is 100 KiB).
    pub fn compression_threshold(mut self, bytes: usize) -> CacheBuilder {
        self.compression_threshold = bytes;
        self
    }

    /// Sets the id this client reports to servers. A random one is used
    /// otherwise.
    pub fn client_id(mut self, client_id: impl Into<String>) -> CacheBuilder {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the lock timeout used when callers pass none (default is 30s).
    pub fn default_lock_timeout(mut self, timeout: Duration) -> CacheBuilder {
        self.default_lock_timeout = timeout;
        self
    }

    /// Serves the cache from remote servers through `transport`.
    pub fn remote(mut self, transport: Arc<dyn Transport>) -> CacheBuilder {
        self.mode = EngineMode::Remote(transport);
        self
    }

    /// Keeps the cache in this process (the default).
    pub fn in_proc(mut self) -> CacheBuilder {
        self.mode = EngineMode::InProc;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheBuilder::new("demo").build().unwrap();
        assert_eq!(config.name().as_str(), "demo");
        assert!(config.exceptions_enabled());
        assert_eq!(config.format(), SerializationFormat::Binary);
        assert_eq!(
            config.compression_threshold(),
            Some(DEFAULT_COMPRESSION_THRESHOLD)
        );
        assert_eq!(config.default_lock_timeout(), DEFAULT_LOCK_TIMEOUT);
        assert!(!config.client_id().is_empty());
        assert!(matches!(config.mode(), EngineMode::InProc));
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let err = CacheBuilder::new("  ").build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidClientConfig);
    }

    #[test]
    fn test_zero_threshold_only_matters_with_compression() {
        let err = CacheBuilder::new("demo")
            .compression_threshold(0)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidClientConfig);

        let config = CacheBuilder::new("demo")
            .compression(false)
            .compression_threshold(0)
            .build()
            .unwrap();
        assert_eq!(config.compression_threshold(), None);
    }
}
