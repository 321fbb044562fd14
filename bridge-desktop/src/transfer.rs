//! Native file transfer: rename on the same device, copy + remove otherwise.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    transfer::{Transfer, TransferOptions, TransferOutcome},
};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const HASH_CHUNK: usize = 1024 * 1024;

/// Moves files between library roots.
///
/// A plain `rename` is tried first. `EXDEV` (different filesystems) falls back
/// to copy, optional SHA-256 comparison, then removal of the source. The whole
/// call is bounded by [`TransferOptions::timeout`]; a timed out copy leaves
/// the source untouched and removes the partial destination.
#[derive(Debug, Clone, Default)]
pub struct NativeTransfer;

impl NativeTransfer {
    pub fn new() -> Self {
        Self
    }

    async fn sha256(path: &Path) -> Result<String> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    async fn move_file(src: &Path, dst: &Path, verify_checksum: bool) -> Result<u64> {
        let size = fs::metadata(src).await?.len();

        match fs::rename(src, dst).await {
            Ok(()) => {
                debug!(src = ?src, dst = ?dst, bytes = size, "Renamed file");
                return Ok(size);
            }
            Err(e) if is_cross_device(&e) => {
                debug!(src = ?src, dst = ?dst, "Cross-device move, copying");
            }
            Err(e) => return Err(BridgeError::Io(e)),
        }

        let copied = fs::copy(src, dst).await?;
        if copied != size {
            fs::remove_file(dst).await.ok();
            return Err(BridgeError::OperationFailed(format!(
                "Short copy of {}: {} of {} bytes",
                src.display(),
                copied,
                size
            )));
        }

        if verify_checksum {
            let (src_hash, dst_hash) = tokio::try_join!(Self::sha256(src), Self::sha256(dst))?;
            if src_hash != dst_hash {
                fs::remove_file(dst).await.ok();
                return Err(BridgeError::ChecksumMismatch {
                    path: dst.display().to_string(),
                });
            }
        }

        fs::remove_file(src).await?;
        Ok(copied)
    }
}

fn is_cross_device(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::libc::EXDEV)
}

#[async_trait]
impl Transfer for NativeTransfer {
    async fn transfer(
        &self,
        src: &Path,
        dst: &Path,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        if fs::try_exists(dst).await? {
            return Err(BridgeError::OperationFailed(format!(
                "Destination already exists: {}",
                dst.display()
            )));
        }

        match tokio::time::timeout(
            options.timeout,
            Self::move_file(src, dst, options.verify_checksum),
        )
        .await
        {
            Ok(result) => result.map(|bytes_moved| TransferOutcome { bytes_moved }),
            Err(_) => {
                warn!(src = ?src, dst = ?dst, "Transfer timed out");
                if fs::try_exists(src).await.unwrap_or(false) {
                    fs::remove_file(dst).await.ok();
                }
                Err(BridgeError::Timeout {
                    operation: format!("transfer {}", src.display()),
                    seconds: options.timeout.as_secs(),
                })
            }
        }
    }
}
