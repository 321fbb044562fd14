//! File Transfer Abstraction

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Options for a single file transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Upper bound for the whole transfer.
    pub timeout: Duration,
    /// Compare source and destination digests before removing the source.
    pub verify_checksum: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            verify_checksum: false,
        }
    }
}

impl TransferOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }
}

/// Result of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub bytes_moved: u64,
}

/// Moves one file from `src` to `dst`.
///
/// Implementations enforce `options.timeout` themselves and never hang on a
/// failing device. On success the source no longer exists.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn transfer(
        &self,
        src: &Path,
        dst: &Path,
        options: &TransferOptions,
    ) -> Result<TransferOutcome>;
}
