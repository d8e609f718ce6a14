//! Per-read configuration for a block reader.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// OS page-cache hints forwarded to the server with the read request.
///
/// A `None` means the hint is unspecified and the server applies its own
/// default; `Some` carries an explicit request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStrategy {
    /// Ask the server to drop its cache behind the read.
    pub drop_behind: Option<bool>,
    /// Ask the server to read ahead by this many bytes.
    pub read_ahead: Option<u64>,
}

impl CacheStrategy {
    /// Hint that served data should be dropped from the server's cache.
    pub fn with_drop_behind(mut self, drop_behind: bool) -> Self {
        self.drop_behind = Some(drop_behind);
        self
    }

    /// Hint that the server should read ahead by `bytes`.
    pub fn with_read_ahead(mut self, bytes: u64) -> Self {
        self.read_ahead = Some(bytes);
        self
    }
}

/// Wire-level encryption scheme negotiated for the connection.
///
/// The reader only forwards the indicator; the cipher itself lives in the
/// transport layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionScheme {
    #[default]
    None,
    AesCtrNoPadding,
}

/// Configuration for one block reader.
///
/// Options are immutable for the lifetime of one reader instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReaderOptions {
    /// Verify per-chunk checksums while reading.
    pub verify_checksum: bool,
    /// Page-cache hints forwarded to the server.
    pub cache_strategy: CacheStrategy,
    /// Negotiated encryption scheme indicator.
    pub encryption_scheme: EncryptionScheme,
}

impl Default for BlockReaderOptions {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            cache_strategy: CacheStrategy::default(),
            encryption_scheme: EncryptionScheme::default(),
        }
    }
}

impl BlockReaderOptions {
    /// Load options from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let options = Self {
            verify_checksum: std::env::var("BLOCK_TRANSFER_VERIFY_CHECKSUM")
                .map(|s| s != "false" && s != "0")
                .unwrap_or(true),
            cache_strategy: CacheStrategy {
                drop_behind: std::env::var("BLOCK_TRANSFER_DROP_BEHIND")
                    .ok()
                    .and_then(|s| s.parse().ok()),
                read_ahead: std::env::var("BLOCK_TRANSFER_READ_AHEAD")
                    .ok()
                    .and_then(|s| s.parse().ok()),
            },
            encryption_scheme: EncryptionScheme::default(),
        };
        debug!(?options, "Loaded block reader options from environment");
        options
    }
}
