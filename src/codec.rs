//! Content-type registry mapping wire formats to encoders and decoders.
//!
//! Decoding is keyed by the delivery's `content_type` (and checked against
//! its `content_encoding`). Encoding is keyed by the shape of the payload
//! first and the configured serializer name second: documents always travel
//! as gzipped `message/rfc822`, archives as `application/x-tar`, raw bytes
//! untouched, and only structured values consult the serializer.

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, StageError};
use crate::types::{json_type_name, MessageProperties, OutgoingMessage, RawDocument};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const MSGPACK_CONTENT_TYPE: &str = "application/x-msgpack";
pub const PICKLE_CONTENT_TYPE: &str = "application/x-pickle";
pub const RFC822_CONTENT_TYPE: &str = "message/rfc822";
pub const TAR_CONTENT_TYPE: &str = "application/x-tar";
pub const GZIP_ENCODING: &str = "gzip";

/// What goes on or comes off the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured data for json/msgpack/pickle
    Value(Value),
    Document(RawDocument),
    Archive(Bytes),
    Raw(Bytes),
}

impl Payload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Value(value) => json_type_name(value),
            Payload::Document(_) => "document",
            Payload::Archive(_) => "archive",
            Payload::Raw(_) => "bytes",
        }
    }
}

/// One entry of the codec registry
pub trait Format: Send + Sync {
    /// Serializer name selecting this format on encode
    fn name(&self) -> &str;

    /// Content type written on encode and matched on decode
    fn content_type(&self) -> &str;

    /// Whether a delivery with this content encoding can be decoded
    fn accepts_encoding(&self, encoding: Option<&str>) -> bool {
        encoding.map_or(true, str::is_empty)
    }

    fn encode(&self, payload: &Payload) -> Result<OutgoingMessage>;

    fn decode(&self, body: &[u8], encoding: Option<&str>) -> Result<Payload>;
}

fn expect_value<'a>(payload: &'a Payload, expected: &'static str) -> Result<&'a Value> {
    match payload {
        Payload::Value(value) => Ok(value),
        other => Err(StageError::TypeMismatch { expected, found: other.kind_name() }),
    }
}

fn message(body: Vec<u8>, content_type: &str, content_encoding: Option<&str>) -> OutgoingMessage {
    OutgoingMessage {
        body: Bytes::from(body),
        properties: MessageProperties::new(Some(content_type), content_encoding),
    }
}

fn accepts_gzip(encoding: Option<&str>) -> bool {
    match encoding {
        None => true,
        Some(e) => e.is_empty() || e.eq_ignore_ascii_case(GZIP_ENCODING),
    }
}

fn is_gzip(encoding: Option<&str>) -> bool {
    encoding.map_or(false, |e| e.eq_ignore_ascii_case(GZIP_ENCODING))
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| StageError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| StageError::Compression(e.to_string()))
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StageError::Compression(e.to_string()))?;
    Ok(out)
}

/// `application/json`
pub struct JsonFormat;

impl Format for JsonFormat {
    fn name(&self) -> &str {
        "json"
    }

    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, payload: &Payload) -> Result<OutgoingMessage> {
        let value = expect_value(payload, "structured value")?;
        let body = serde_json::to_vec(value).map_err(|e| StageError::Serialization(e.to_string()))?;
        Ok(message(body, JSON_CONTENT_TYPE, None))
    }

    fn decode(&self, body: &[u8], _encoding: Option<&str>) -> Result<Payload> {
        Ok(Payload::Value(serde_json::from_slice(body)?))
    }
}

/// `application/x-msgpack`
pub struct MsgPackFormat;

impl Format for MsgPackFormat {
    fn name(&self) -> &str {
        "msgpack"
    }

    fn content_type(&self) -> &str {
        MSGPACK_CONTENT_TYPE
    }

    fn encode(&self, payload: &Payload) -> Result<OutgoingMessage> {
        let value = expect_value(payload, "structured value")?;
        Ok(message(rmp_serde::to_vec(value)?, MSGPACK_CONTENT_TYPE, None))
    }

    fn decode(&self, body: &[u8], _encoding: Option<&str>) -> Result<Payload> {
        Ok(Payload::Value(rmp_serde::from_slice(body)?))
    }
}

/// `application/x-pickle`, always gzipped on encode
pub struct PickleFormat;

impl Format for PickleFormat {
    fn name(&self) -> &str {
        "pickle"
    }

    fn content_type(&self) -> &str {
        PICKLE_CONTENT_TYPE
    }

    fn accepts_encoding(&self, encoding: Option<&str>) -> bool {
        accepts_gzip(encoding)
    }

    fn encode(&self, payload: &Payload) -> Result<OutgoingMessage> {
        let value = expect_value(payload, "structured value")?;
        let pickled = serde_pickle::to_vec(value, serde_pickle::SerOptions::new())
            .map_err(|e| StageError::Serialization(e.to_string()))?;
        Ok(message(gzip(&pickled)?, PICKLE_CONTENT_TYPE, Some(GZIP_ENCODING)))
    }

    fn decode(&self, body: &[u8], encoding: Option<&str>) -> Result<Payload> {
        let value = if is_gzip(encoding) {
            serde_pickle::from_slice(&gunzip(body)?, serde_pickle::DeOptions::new())?
        } else {
            serde_pickle::from_slice(body, serde_pickle::DeOptions::new())?
        };
        Ok(Payload::Value(value))
    }
}

/// `message/rfc822`, always gzipped on encode
pub struct Rfc822Format;

impl Format for Rfc822Format {
    fn name(&self) -> &str {
        "rfc822"
    }

    fn content_type(&self) -> &str {
        RFC822_CONTENT_TYPE
    }

    fn accepts_encoding(&self, encoding: Option<&str>) -> bool {
        accepts_gzip(encoding)
    }

    fn encode(&self, payload: &Payload) -> Result<OutgoingMessage> {
        match payload {
            Payload::Document(document) => Ok(message(
                gzip(&document.to_bytes())?,
                RFC822_CONTENT_TYPE,
                Some(GZIP_ENCODING),
            )),
            other => Err(StageError::TypeMismatch { expected: "document", found: other.kind_name() }),
        }
    }

    fn decode(&self, body: &[u8], encoding: Option<&str>) -> Result<Payload> {
        let document = if is_gzip(encoding) {
            RawDocument::parse(&gunzip(body)?)?
        } else {
            RawDocument::parse(body)?
        };
        Ok(Payload::Document(document))
    }
}

/// `application/x-tar`; the archive travels as-is
pub struct TarballFormat;

impl Format for TarballFormat {
    fn name(&self) -> &str {
        "tarball"
    }

    fn content_type(&self) -> &str {
        TAR_CONTENT_TYPE
    }

    fn encode(&self, payload: &Payload) -> Result<OutgoingMessage> {
        match payload {
            Payload::Archive(archive) => Ok(OutgoingMessage {
                body: archive.clone(),
                properties: MessageProperties::new(Some(TAR_CONTENT_TYPE), None),
            }),
            other => Err(StageError::TypeMismatch { expected: "archive", found: other.kind_name() }),
        }
    }

    fn decode(&self, body: &[u8], _encoding: Option<&str>) -> Result<Payload> {
        Ok(Payload::Archive(Bytes::copy_from_slice(body)))
    }
}

/// Publishes bytes unmodified, without a content type. Structured values
/// have no raw form and go out as JSON text.
fn passthrough(payload: &Payload) -> Result<OutgoingMessage> {
    let body = match payload {
        Payload::Raw(bytes) | Payload::Archive(bytes) => bytes.clone(),
        Payload::Value(value) => Bytes::from(
            serde_json::to_vec(value).map_err(|e| StageError::Serialization(e.to_string()))?,
        ),
        Payload::Document(document) => Bytes::from(document.to_bytes()),
    };
    Ok(OutgoingMessage { body, properties: MessageProperties::default() })
}

/// Registry of wire formats
#[derive(Clone)]
pub struct FormatCodec {
    by_content_type: HashMap<String, Arc<dyn Format>>,
    by_name: HashMap<String, Arc<dyn Format>>,
}

impl Default for FormatCodec {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for FormatCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut content_types: Vec<_> = self.by_content_type.keys().collect();
        content_types.sort();
        f.debug_struct("FormatCodec").field("content_types", &content_types).finish()
    }
}

impl FormatCodec {
    /// An empty registry
    pub fn empty() -> Self {
        Self { by_content_type: HashMap::new(), by_name: HashMap::new() }
    }

    /// json, msgpack, pickle, rfc822 and tarball
    pub fn with_builtins() -> Self {
        let mut codec = Self::empty();
        codec.register(Arc::new(JsonFormat));
        codec.register(Arc::new(MsgPackFormat));
        codec.register(Arc::new(PickleFormat));
        codec.register(Arc::new(Rfc822Format));
        codec.register(Arc::new(TarballFormat));
        codec
    }

    /// Add or replace a format, keyed by both its content type and its name
    pub fn register(&mut self, format: Arc<dyn Format>) {
        self.by_content_type
            .insert(format.content_type().to_ascii_lowercase(), format.clone());
        self.by_name.insert(format.name().to_ascii_lowercase(), format);
    }

    pub fn knows_serializer(&self, name: &str) -> bool {
        self.by_name.contains_key(&name.to_ascii_lowercase())
    }

    pub fn decode(&self, body: &[u8], properties: &MessageProperties) -> Result<Payload> {
        let unsupported = || StageError::UnsupportedFormat {
            content_type: properties.content_type.clone(),
            content_encoding: properties.content_encoding.clone(),
        };

        let content_type = properties.content_type.as_deref().ok_or_else(unsupported)?;
        // Parameters such as `; charset=utf-8` do not select a different format
        let mime = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        let format = self.by_content_type.get(&mime).ok_or_else(unsupported)?;

        let encoding = properties.content_encoding.as_deref();
        if !format.accepts_encoding(encoding) {
            return Err(unsupported());
        }

        format.decode(body, encoding)
    }

    pub fn encode(&self, payload: &Payload, serializer: &str) -> Result<OutgoingMessage> {
        let format = match payload {
            Payload::Document(_) => self.by_content_type.get(RFC822_CONTENT_TYPE),
            Payload::Archive(_) => self.by_content_type.get(TAR_CONTENT_TYPE),
            Payload::Raw(_) => None,
            Payload::Value(_) => self.by_name.get(&serializer.to_ascii_lowercase()),
        };

        match format {
            Some(format) => format.encode(payload),
            None => {
                debug!("No encoder for {} payload with serializer '{}', passing through", payload.kind_name(), serializer);
                passthrough(payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn roundtrip(codec: &FormatCodec, payload: Payload, serializer: &str) -> (OutgoingMessage, Payload) {
        let message = codec.encode(&payload, serializer).unwrap();
        let decoded = codec.decode(&message.body, &message.properties).unwrap();
        (message, decoded)
    }

    fn sample() -> Value {
        json!({
            "id": 7,
            "title": "Front page",
            "tags": ["news", "home"],
            "published": true,
            "score": 0.5,
            "parent": null,
            "meta": {"lang": "en"}
        })
    }

    #[test]
    fn test_structured_formats_roundtrip() {
        let codec = FormatCodec::with_builtins();

        for (serializer, content_type, encoding) in [
            ("json", JSON_CONTENT_TYPE, None),
            ("msgpack", MSGPACK_CONTENT_TYPE, None),
            ("pickle", PICKLE_CONTENT_TYPE, Some(GZIP_ENCODING)),
        ] {
            let (message, decoded) = roundtrip(&codec, Payload::Value(sample()), serializer);
            assert_eq!(message.properties.content_type.as_deref(), Some(content_type));
            assert_eq!(message.properties.content_encoding.as_deref(), encoding);
            assert_eq!(decoded, Payload::Value(sample()), "serializer {}", serializer);
        }
    }

    #[test]
    fn test_document_always_rfc822() {
        let codec = FormatCodec::with_builtins();
        let document = RawDocument::new()
            .with_header("Subject", "Weekly digest")
            .with_header("Content-Type", "text/plain")
            .with_body("Nothing happened.\n");

        for serializer in ["json", "msgpack", "tarball", "nonsense"] {
            let (message, decoded) = roundtrip(&codec, Payload::Document(document.clone()), serializer);
            assert_eq!(message.properties.content_type.as_deref(), Some(RFC822_CONTENT_TYPE));
            assert_eq!(message.properties.content_encoding.as_deref(), Some(GZIP_ENCODING));
            assert_eq!(decoded, Payload::Document(document.clone()));
        }
    }

    #[test]
    fn test_uncompressed_pickle_and_rfc822_decode() {
        let codec = FormatCodec::with_builtins();

        let pickled = serde_pickle::to_vec(&json!({"a": 1}), serde_pickle::SerOptions::new()).unwrap();
        let decoded = codec
            .decode(&pickled, &MessageProperties::new(Some(PICKLE_CONTENT_TYPE), Some("")))
            .unwrap();
        assert_eq!(decoded, Payload::Value(json!({"a": 1})));

        let decoded = codec
            .decode(b"Subject: hi\n\nbody", &MessageProperties::new(Some(RFC822_CONTENT_TYPE), None))
            .unwrap();
        match decoded {
            Payload::Document(doc) => assert_eq!(doc.header("subject"), Some("hi")),
            other => panic!("expected document, got {:?}", other),
        }
    }

    #[test]
    fn test_tarball_requires_archive() {
        let codec = FormatCodec::with_builtins();

        let archive = Bytes::from_static(b"pretend-this-is-ustar");
        let (message, decoded) = roundtrip(&codec, Payload::Archive(archive.clone()), "tarball");
        assert_eq!(message.body, archive);
        assert_eq!(decoded, Payload::Archive(archive));

        let err = codec.encode(&Payload::Value(json!({"a": 1})), "tarball").unwrap_err();
        assert!(matches!(err, StageError::TypeMismatch { expected: "archive", found: "map" }));
    }

    #[test]
    fn test_unknown_serializer_passes_through() {
        let codec = FormatCodec::with_builtins();

        let raw = Bytes::from_static(b"\x00\x01binary");
        let message = codec.encode(&Payload::Raw(raw.clone()), "json").unwrap();
        assert_eq!(message.body, raw);
        assert_eq!(message.properties, MessageProperties::default());

        let message = codec.encode(&Payload::Value(json!({"a": 1})), "yaml").unwrap();
        assert_eq!(message.body.as_ref(), br#"{"a":1}"#);
        assert_eq!(message.properties.content_type, None);
    }

    #[test]
    fn test_decode_rejects_unknown_formats() {
        let codec = FormatCodec::with_builtins();

        let err = codec.decode(b"{}", &MessageProperties::default()).unwrap_err();
        assert!(matches!(err, StageError::UnsupportedFormat { content_type: None, .. }));

        let err = codec
            .decode(b"a,b", &MessageProperties::new(Some("text/csv"), None))
            .unwrap_err();
        assert!(matches!(err, StageError::UnsupportedFormat { .. }));

        let err = codec
            .decode(b"{}", &MessageProperties::new(Some(JSON_CONTENT_TYPE), Some("gzip")))
            .unwrap_err();
        match err {
            StageError::UnsupportedFormat { content_type, content_encoding } => {
                assert_eq!(content_type.as_deref(), Some(JSON_CONTENT_TYPE));
                assert_eq!(content_encoding.as_deref(), Some("gzip"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_content_type_parameters_ignored() {
        let codec = FormatCodec::with_builtins();
        let decoded = codec
            .decode(
                br#"{"id": 1}"#,
                &MessageProperties::new(Some("Application/JSON; charset=utf-8"), None),
            )
            .unwrap();
        assert_eq!(decoded, Payload::Value(json!({"id": 1})));
    }

    struct CsvLineFormat;

    impl Format for CsvLineFormat {
        fn name(&self) -> &str {
            "csv"
        }

        fn content_type(&self) -> &str {
            "text/csv"
        }

        fn encode(&self, payload: &Payload) -> Result<OutgoingMessage> {
            let value = expect_value(payload, "array")?;
            let fields: Vec<String> = value
                .as_array()
                .ok_or(StageError::TypeMismatch { expected: "array", found: json_type_name(value) })?
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect();
            Ok(message(fields.join(",").into_bytes(), "text/csv", None))
        }

        fn decode(&self, body: &[u8], _encoding: Option<&str>) -> Result<Payload> {
            let text = String::from_utf8_lossy(body);
            Ok(Payload::Value(Value::Array(
                text.split(',').map(|s| Value::String(s.to_string())).collect(),
            )))
        }
    }

    #[test]
    fn test_registry_is_extensible() {
        let mut codec = FormatCodec::with_builtins();
        assert!(!codec.knows_serializer("csv"));

        codec.register(Arc::new(CsvLineFormat));
        assert!(codec.knows_serializer("CSV"));

        let (message, decoded) = roundtrip(&codec, Payload::Value(json!(["a", "b"])), "csv");
        assert_eq!(message.body.as_ref(), b"a,b");
        assert_eq!(decoded, Payload::Value(json!(["a", "b"])));
    }
}
