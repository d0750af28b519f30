use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficRecord {
    pub direction: Direction,
    pub byte_count: usize,
    pub at: DateTime<Utc>,
    pub payload: String,
}

impl TrafficRecord {
    pub fn new(direction: Direction, bytes: &[u8]) -> Self {
        Self {
            direction,
            byte_count: bytes.len(),
            at: Utc::now(),
            payload: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io failed: {0}")]
    Io(#[from] io::Error),
    #[error("sink encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Receives a copy of every raw read and write on the session.
///
/// Failures are logged by the caller and never reach the protocol path.
pub trait TrafficSink: Send + Sync {
    fn record(&self, record: &TrafficRecord) -> Result<(), SinkError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TrafficSink for TracingSink {
    fn record(&self, record: &TrafficRecord) -> Result<(), SinkError> {
        match record.direction {
            Direction::Inbound => debug!(
                event = "ami_received",
                bytes = record.byte_count,
                payload = %record.payload.escape_debug()
            ),
            Direction::Outbound => debug!(
                event = "ami_sending",
                bytes = record.byte_count,
                payload = %record.payload.escape_debug()
            ),
        }
        Ok(())
    }
}

/// Appends one JSON object per record.
pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl TrafficSink for JsonlSink {
    fn record(&self, record: &TrafficRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(&line)?;
        Ok(())
    }
}
