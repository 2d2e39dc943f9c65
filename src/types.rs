use bytes::Bytes;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Result, StageError};

pub type ExchangeName = String;
pub type QueueName = String;
pub type RoutingKey = String;

/// A unit of work flowing through a pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// Mapping-like record with string keys
    Map(Map<String, Value>),
    /// Email-style document (headers + body)
    Document(RawDocument),
    /// A tar archive, carried opaquely
    Archive(Bytes),
    /// Anything else, carried as raw bytes
    Bytes(Bytes),
}

/// Shape of an item, resolved once at the publish boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    MapItem,
    RawDocument,
    ArchiveItem,
    OpaqueBytes,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::MapItem => "map",
            ItemKind::RawDocument => "document",
            ItemKind::ArchiveItem => "archive",
            ItemKind::OpaqueBytes => "bytes",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Item {
    pub fn kind(&self) -> ItemKind {
        match self {
            Item::Map(_) => ItemKind::MapItem,
            Item::Document(_) => ItemKind::RawDocument,
            Item::Archive(_) => ItemKind::ArchiveItem,
            Item::Bytes(_) => ItemKind::OpaqueBytes,
        }
    }

    /// Build a map item from a JSON value; only objects are mapping-like
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Item::Map(map)),
            other => Err(StageError::TypeMismatch {
                expected: "map",
                found: json_type_name(&other),
            }),
        }
    }

    pub fn as_map(&self) -> Option<&Map<String, Value>> {
        match self {
            Item::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a field of a map item
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }
}

impl From<Map<String, Value>> for Item {
    fn from(map: Map<String, Value>) -> Self {
        Item::Map(map)
    }
}

impl From<RawDocument> for Item {
    fn from(document: RawDocument) -> Self {
        Item::Document(document)
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

/// An RFC 822 style message: ordered headers followed by an opaque body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDocument {
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl RawDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing header of the same name.
    /// Line breaks in the value are unfolded to single spaces and surrounding
    /// whitespace is trimmed, so the header reads back unchanged after
    /// [`to_bytes`](Self::to_bytes) and [`parse`](Self::parse).
    pub fn with_header<K: Into<String>, V: AsRef<str>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), unfold(value.as_ref())));
        self
    }

    pub fn with_body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    /// First header with the given name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Parse a document. Folded header lines are unfolded; the first line that
    /// is neither a header nor a continuation starts the body.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let end = data[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| pos + i + 1)
                .unwrap_or(data.len());
            let raw = &data[pos..end];
            let line = trim_line_ending(raw);

            if line.is_empty() {
                pos = end;
                break;
            }

            if line[0] == b' ' || line[0] == b'\t' {
                match headers.last_mut() {
                    Some((_, value)) => {
                        let continuation = String::from_utf8_lossy(line);
                        value.push(' ');
                        value.push_str(continuation.trim());
                        pos = end;
                        continue;
                    }
                    None => break,
                }
            }

            match line.iter().position(|&b| b == b':') {
                Some(colon) if colon > 0 && !line[..colon].contains(&b' ') => {
                    let name = String::from_utf8_lossy(&line[..colon]).into_owned();
                    let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
                    headers.push((name, value));
                    pos = end;
                }
                _ => break,
            }
        }

        Ok(Self {
            headers,
            body: Bytes::copy_from_slice(&data[pos..]),
        })
    }

    /// Flatten to bytes without header folding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 64 * self.headers.len() + 1);
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }
}

fn unfold(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Properties carried alongside a message body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl MessageProperties {
    pub fn new(content_type: Option<&str>, content_encoding: Option<&str>) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            content_encoding: content_encoding.map(str::to_string),
        }
    }
}

/// An encoded message ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub body: Bytes,
    pub properties: MessageProperties,
}

/// Exchange types understood by `exchange_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Headers,
    #[default]
    Topic,
}

impl ExchangeKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(StageError::InvalidConfig(format!(
                "unknown exchange type '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Topic => "topic",
        }
    }
}
