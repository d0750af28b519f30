use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// One externally requested action, delivered over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlMessage {
    pub requester_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlReply {
    pub command: String,
    pub status: ReplyStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub action_id: Option<String>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub events: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Rejected,
    Error,
}

impl ControlReply {
    pub fn rejected(command: &str, message: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            status: ReplyStatus::Rejected,
            message: Some(message.into()),
            action_id: None,
            complete: false,
            events: Vec::new(),
        }
    }

    pub fn error(command: &str, message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            ..Self::rejected(command, message)
        }
    }
}

/// A JSON value that can travel as one control line.
pub trait ControlFrame: Serialize + DeserializeOwned {
    /// Rejects values that parse but cannot be acted on.
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

impl ControlFrame for ControlMessage {
    fn check(&self) -> Result<(), String> {
        if self.requester_id.trim().is_empty() {
            return Err("requester_id is blank".to_string());
        }
        if self.command.trim().is_empty() {
            return Err("command is blank".to_string());
        }
        Ok(())
    }
}

impl ControlFrame for ControlReply {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("control frame is {size} bytes (limit {max})")]
    OversizedFrame { size: usize, max: usize },
    #[error("control buffer holds {size} bytes without a newline (limit {max})")]
    OversizedBuffer { size: usize, max: usize },
    #[error("control frame could not be serialized: {0}")]
    Encode(String),
    #[error("control line {line} is not valid JSON: {reason}")]
    Decode { line: usize, reason: String },
    #[error("control line {line} rejected: {reason}")]
    Invalid { line: usize, reason: String },
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_frame<T: ControlFrame>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut line = serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    check_size(line.len(), max_frame_bytes)?;
    line.push(b'\n');
    Ok(line)
}

/// Decodes a single line, e.g. the one reply read back by a control client.
pub fn decode_frame<T: ControlFrame>(bytes: &[u8], max_frame_bytes: usize) -> Result<T, FrameError> {
    parse_line(strip_newline(bytes), 1, max_frame_bytes)
}

fn check_size(size: usize, max: usize) -> Result<(), FrameError> {
    if size > max {
        return Err(FrameError::OversizedFrame { size, max });
    }
    Ok(())
}

fn strip_newline(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

fn parse_line<T: ControlFrame>(raw: &[u8], line: usize, max_frame_bytes: usize) -> Result<T, FrameError> {
    check_size(raw.len(), max_frame_bytes)?;
    let value: T = serde_json::from_slice(raw).map_err(|err| FrameError::Decode {
        line,
        reason: err.to_string(),
    })?;
    value
        .check()
        .map_err(|reason| FrameError::Invalid { line, reason })?;
    Ok(value)
}

/// Splits a control connection into JSON lines. Blank lines are skipped but
/// still counted, so error line numbers match what the client sent.
pub struct ControlDecoder<T> {
    max_frame_bytes: usize,
    partial: Vec<u8>,
    line: usize,
    _frame: PhantomData<T>,
}

impl<T> ControlDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            partial: Vec::new(),
            line: 0,
            _frame: PhantomData,
        }
    }

    pub fn lines_seen(&self) -> usize {
        self.line
    }
}

impl<T> Default for ControlDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: ControlFrame> ControlDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let mut rest = chunk;
        while let Some(newline) = rest.iter().position(|byte| *byte == b'\n') {
            self.partial.extend_from_slice(&rest[..newline]);
            rest = &rest[newline + 1..];
            let line = std::mem::take(&mut self.partial);
            self.take_line(&line, &mut report);
        }
        self.partial.extend_from_slice(rest);

        if self.partial.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.partial.len(),
                max: self.max_frame_bytes,
            });
            self.partial.clear();
        }
        report
    }

    /// Decodes an unterminated last line once the client has closed its side.
    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let line = std::mem::take(&mut self.partial);
        if !line.is_empty() {
            self.take_line(&line, &mut report);
        }
        report
    }

    fn take_line(&mut self, line: &[u8], report: &mut DecodeReport<T>) {
        self.line += 1;
        let raw = strip_newline(line);
        if raw.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        match parse_line(raw, self.line, self.max_frame_bytes) {
            Ok(frame) => report.frames.push(frame),
            Err(err) => report.errors.push(err),
        }
    }
}
