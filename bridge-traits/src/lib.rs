//! # Host Bridge Traits
//!
//! Collaborator contracts the Jellywatch core depends on but does not
//! implement itself.
//!
//! ## Overview
//!
//! The core decides *where* media lives and *who* needs to be told. Talking
//! to Sonarr/Radarr, moving bytes between volumes, and walking directories are
//! delegated to implementations of the traits in this crate. `bridge-desktop`
//! and `provider-arr` ship the production implementations; tests substitute
//! mocks.
//!
//! ## Traits
//!
//! ### External managers
//! - [`MediaManagerClient`](manager::MediaManagerClient) - Read and correct a manager's recorded path
//! - [`HttpClient`](http::HttpClient) - Transport used by the manager connectors
//!
//! ### Filesystem
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Existence, metadata, empty-dir removal, free space
//! - [`LibraryScanner`](scan::LibraryScanner) - Per-directory item counts and sizes under a library root
//! - [`Transfer`](transfer::Transfer) - Move one file with timeout and optional checksum
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! convert platform-specific failures into it and include the offending path
//! or URL in the message.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`; the reconciliation loops share
//! clients across spawned tasks.

pub mod error;
pub mod http;
pub mod manager;
pub mod parser;
pub mod scan;
pub mod storage;
pub mod time;
pub mod transfer;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, API_KEY_HEADER};
pub use manager::{ManagedItem, ManagerKind, MediaManagerClient};
pub use parser::ParsedMedia;
pub use scan::{LibraryScanner, ScannedDirectory, ScannedFile};
pub use storage::{FileMetadata, FileSystemAccess};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
pub use transfer::{Transfer, TransferOptions, TransferOutcome};
