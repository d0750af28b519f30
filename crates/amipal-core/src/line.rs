use crate::error::ProtocolError;
use std::fmt;

pub const LINE_TERMINATOR: &str = "\r\n";

/// One `attribute: value` pair, read off the wire or stamped locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Line {
    attr: String,
    value: String,
    synthetic: bool,
}

impl Line {
    /// Splits on the first colon. `None` when there is no colon.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim_end_matches(|c| c == '\r' || c == '\n');
        let (attr, value) = text.split_once(':')?;
        let attr = attr.trim();
        let value = value.trim();
        if attr.is_empty() && value.is_empty() {
            return None;
        }
        Some(Self {
            attr: attr.to_string(),
            value: value.to_string(),
            synthetic: false,
        })
    }

    pub fn synthetic(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            value: value.into(),
            synthetic: true,
        }
    }

    pub fn from_entries<I, K, V>(entries: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entries = entries.into_iter();
        let Some((attr, value)) = entries.next() else {
            return Err(ProtocolError::InvalidInput(
                "synthetic line needs exactly one key/value pair, got none".to_string(),
            ));
        };
        let extra = entries.count();
        if extra > 0 {
            return Err(ProtocolError::InvalidInput(format!(
                "synthetic line needs exactly one key/value pair, got {}",
                extra + 1
            )));
        }
        Ok(Self::synthetic(attr, value))
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn as_pair(&self) -> (&str, &str) {
        (&self.attr, &self.value)
    }

    pub fn to_wire(&self) -> String {
        format!("{}: {}{LINE_TERMINATOR}", self.attr, self.value)
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.attr, self.value)
    }
}
