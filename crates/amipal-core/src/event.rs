use crate::error::ProtocolError;
use crate::line::{Line, LINE_TERMINATOR};
use crate::registry::{BatchId, Classification, BATCH_ATTR, CLASS_ATTR, SEQ_ATTR};
use std::collections::BTreeMap;
use std::fmt;

pub const EVENT_ATTR: &str = "Event";
pub const RESPONSE_ATTR: &str = "Response";
pub const ACTION_ID_ATTR: &str = "ActionID";

/// One framed protocol message.
///
/// Wire lines are fixed at construction. Synthetic lines appended later
/// (see [`Event::push_extra`]) follow them in every view. Duplicate attributes
/// are kept as separate entries; [`Event::to_map`] resolves them last-wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    lines: Vec<Line>,
    extra: Vec<Line>,
}

impl Event {
    pub fn new(lines: Vec<Line>) -> Result<Self, ProtocolError> {
        if lines.is_empty() {
            return Err(ProtocolError::EmptyEvent);
        }
        Ok(Self {
            lines,
            extra: Vec::new(),
        })
    }

    /// Decodes every line of one chunk; lines that do not materialize are skipped.
    pub fn from_lines<I, S>(raw_lines: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines = raw_lines
            .into_iter()
            .filter_map(|raw| Line::parse(raw.as_ref()))
            .collect::<Vec<_>>();
        Self::new(lines)
    }

    pub fn parse(chunk: &str) -> Result<Self, ProtocolError> {
        Self::from_lines(chunk.split('\n'))
    }

    pub fn push_extra(&mut self, line: Line) {
        self.extra.push(line);
    }

    pub fn wire_lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn extra(&self) -> &[Line] {
        &self.extra
    }

    pub fn lines(&self) -> impl DoubleEndedIterator<Item = &Line> {
        self.lines.iter().chain(self.extra.iter())
    }

    pub fn len(&self) -> usize {
        self.lines.len() + self.extra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.lines().map(Line::as_pair).collect()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.lines()
            .map(|line| (line.attr().to_string(), line.value().to_string()))
            .collect()
    }

    pub fn singletons(&self) -> Vec<BTreeMap<String, String>> {
        self.lines()
            .map(|line| BTreeMap::from([(line.attr().to_string(), line.value().to_string())]))
            .collect()
    }

    /// Last value recorded for `attr`, synthetic lines included.
    pub fn get(&self, attr: &str) -> Option<&str> {
        self.lines()
            .rev()
            .find(|line| line.attr() == attr)
            .map(Line::value)
    }

    pub fn has_attr(&self, attr: &str) -> bool {
        self.lines().any(|line| line.attr() == attr)
    }

    pub fn name(&self) -> Option<&str> {
        self.get(EVENT_ATTR)
    }

    pub fn response(&self) -> Option<&str> {
        self.get(RESPONSE_ATTR)
    }

    pub fn is_response(&self) -> bool {
        self.has_attr(RESPONSE_ATTR)
    }

    pub fn action_id(&self) -> Option<&str> {
        self.get(ACTION_ID_ATTR)
    }

    pub fn classification(&self) -> Option<Classification> {
        self.get(CLASS_ATTR).and_then(|value| value.parse().ok())
    }

    pub fn batch_id(&self) -> Option<BatchId> {
        self.get(BATCH_ATTR).and_then(|value| value.parse().ok())
    }

    pub fn seq(&self) -> Option<u64> {
        self.get(SEQ_ATTR).and_then(|value| value.parse().ok())
    }

    /// Wire text of the received lines, terminated by a blank line.
    pub fn to_wire(&self) -> String {
        let mut out = self.lines.iter().map(Line::to_wire).collect::<String>();
        out.push_str(LINE_TERMINATOR);
        out
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = self
            .lines()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "[{pairs}]")
    }
}
