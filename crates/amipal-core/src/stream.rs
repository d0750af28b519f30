use crate::error::ProtocolError;
use crate::event::Event;

pub const DEFAULT_MAX_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub events: Vec<Event>,
    pub rejected: Vec<ProtocolError>,
}

impl FrameReport {
    fn push_event(&mut self, event: Event) {
        self.events.push(event);
    }

    fn push_error(&mut self, error: ProtocolError) {
        self.rejected.push(error);
    }
}

/// Reassembles blank-line delimited messages from arbitrary reads.
///
/// Anything after the last blank line of a feed is kept as the tail and
/// prefixed to the next feed, so a message is only emitted once its
/// terminating blank line has arrived.
pub struct StreamFramer {
    max_buffer_bytes: usize,
    tail: Vec<u8>,
}

impl StreamFramer {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            max_buffer_bytes,
            tail: Vec::new(),
        }
    }

    pub fn tail(&self) -> Option<&[u8]> {
        if self.tail.is_empty() {
            None
        } else {
            Some(&self.tail)
        }
    }

    /// Drops the retained tail and returns how many bytes were discarded.
    pub fn reset(&mut self) -> usize {
        let dropped = self.tail.len();
        self.tail.clear();
        dropped
    }

    pub fn feed(&mut self, raw: &[u8]) -> Result<FrameReport, ProtocolError> {
        if raw.is_empty() {
            return Err(ProtocolError::InvalidInput(
                "stream buffer cannot be empty".to_string(),
            ));
        }

        let mut buffer = std::mem::take(&mut self.tail);
        buffer.extend_from_slice(raw);

        let mut report = FrameReport::default();
        let mut chunk: Vec<String> = Vec::new();
        let mut chunk_start = 0usize;
        let mut cursor = 0usize;

        while let Some(offset) = buffer[cursor..].iter().position(|byte| *byte == b'\n') {
            let end = cursor + offset;
            let mut line = &buffer[cursor..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            cursor = end + 1;

            if line.is_empty() {
                if !chunk.is_empty() {
                    match Event::from_lines(std::mem::take(&mut chunk)) {
                        Ok(event) => report.push_event(event),
                        Err(err) => report.push_error(err),
                    }
                }
                chunk_start = cursor;
            } else {
                chunk.push(String::from_utf8_lossy(line).into_owned());
            }
        }

        if chunk_start < buffer.len() {
            let size = buffer.len() - chunk_start;
            if size > self.max_buffer_bytes {
                report.push_error(ProtocolError::OversizedBuffer {
                    size,
                    max: self.max_buffer_bytes,
                });
            } else {
                buffer.drain(..chunk_start);
                self.tail = buffer;
            }
        }

        Ok(report)
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}
