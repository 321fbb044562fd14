//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop and server hosts
//! (Linux, macOS).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `FileSystemAccess` using `tokio::fs`, with free space from `statvfs`
//! - `Transfer` using rename, falling back to copy + remove across devices
//! - `LibraryScanner` using `walkdir`
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{NativeTransfer, ReqwestHttpClient, TokioFileSystem, WalkdirScanner};
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let fs = TokioFileSystem::new();
//!     let scanner = WalkdirScanner::new();
//!     let transfer = NativeTransfer::new();
//!
//!     // Hand to core_service::CoreDependencies
//!     Ok(())
//! }
//! ```

mod filesystem;
mod http;
mod scanner;
mod transfer;

pub use filesystem::TokioFileSystem;
pub use http::ReqwestHttpClient;
pub use scanner::{WalkdirScanner, DEFAULT_MEDIA_EXTENSIONS};
pub use transfer::NativeTransfer;
