//! Integration tests for logging system

use async_trait::async_trait;
use bridge_traits::error::Result as SinkResult;
use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use core_runtime::Error;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CollectingSink {
    entries: Mutex<Vec<LogEntry>>,
}

#[async_trait]
impl LoggerSink for CollectingSink {
    async fn log(&self, entry: LogEntry) -> SinkResult<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

// Only one global subscriber can be installed per process, so the whole
// lifecycle is exercised in a single test.
#[test]
fn test_init_logging_only_once() {
    let sink = Arc::new(CollectingSink::default());
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug)
        .with_logger_sink(sink.clone());

    init_logging(config).expect("first initialization succeeds");
    tracing::info!(target: "core_sync", asset = "series/foo/2019", "logging ready");

    {
        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields.get("asset"), Some(&"series/foo/2019".to_string()));
    }

    let second = init_logging(LoggingConfig::default().with_format(LogFormat::Json));
    assert!(matches!(second, Err(Error::Config(msg)) if msg.contains("Failed to initialize")));
}
