use thiserror::Error;

/// Result type alias for stage operations
pub type Result<T> = std::result::Result<T, StageError>;

/// Errors that can occur while running a consumer or producer stage
#[derive(Error, Debug, Clone)]
pub enum StageError {
    /// Broker unreachable or credentials rejected
    #[error("Connection error: {0}")]
    Connection(String),

    /// Exchange/queue declare or bind rejected by the broker
    #[error("Declaration error: {0}")]
    Declaration(String),

    /// Delivery carried a content type/encoding the codec registry does not know
    #[error("Unsupported format: content_type={}, content_encoding={}",
        .content_type.as_deref().unwrap_or("<none>"),
        .content_encoding.as_deref().unwrap_or("<none>"))]
    UnsupportedFormat {
        content_type: Option<String>,
        content_encoding: Option<String>,
    },

    /// Item shape does not fit the selected encoder or decoder
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Publisher confirm reported the message as unroutable
    #[error("NO ROUTE: exchange={exchange}, routing_key={routing_key}")]
    NoRoute {
        exchange: String,
        routing_key: String,
    },

    /// Projected field absent from the item
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Message serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Broker I/O failure after the connection was established
    #[error("Broker error: {0}")]
    Broker(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failure raised while processing inside a stage, with processing context
    #[error("{stage} failed ({context}): {source}")]
    Stage {
        stage: &'static str,
        context: String,
        #[source]
        source: Box<StageError>,
    },
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Broker(err.to_string())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            StageError::Serialization(err.to_string())
        } else {
            StageError::Deserialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for StageError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        StageError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StageError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        StageError::Deserialization(err.to_string())
    }
}

impl From<serde_pickle::Error> for StageError {
    fn from(err: serde_pickle::Error) -> Self {
        StageError::Deserialization(err.to_string())
    }
}

impl From<toml::de::Error> for StageError {
    fn from(err: toml::de::Error) -> Self {
        StageError::InvalidConfig(err.to_string())
    }
}

impl From<lapin::Error> for StageError {
    fn from(err: lapin::Error) -> Self {
        StageError::Broker(err.to_string())
    }
}

impl StageError {
    /// Attach processing context to an error raised inside a stage
    pub fn in_stage(self, stage: &'static str, context: impl Into<String>) -> Self {
        StageError::Stage {
            stage,
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with any stage context peeled off
    pub fn root(&self) -> &StageError {
        match self {
            StageError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            StageError::Connection(_) => "connection",
            StageError::Declaration(_) => "declaration",
            StageError::UnsupportedFormat { .. } => "unsupported_format",
            StageError::TypeMismatch { .. } => "type_mismatch",
            StageError::NoRoute { .. } => "no_route",
            StageError::MissingField(_) => "missing_field",
            StageError::Serialization(_) | StageError::Deserialization(_) => "serialization",
            StageError::Compression(_) => "compression",
            StageError::Broker(_) => "broker",
            StageError::InvalidConfig(_) => "configuration",
            StageError::Stage { source, .. } => source.category(),
        }
    }

    /// Stage errors are never retried internally; restart policy belongs to
    /// whoever runs the pipeline.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_context_wraps_source() {
        let err = StageError::UnsupportedFormat {
            content_type: Some("text/plain".to_string()),
            content_encoding: None,
        }
        .in_stage("consumer", "message 3 from queue orders");

        assert_eq!(err.category(), "unsupported_format");
        assert!(matches!(err.root(), StageError::UnsupportedFormat { .. }));

        let rendered = err.to_string();
        assert!(rendered.contains("consumer failed (message 3 from queue orders)"));
        assert!(rendered.contains("content_type=text/plain"));
        assert!(rendered.contains("content_encoding=<none>"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_no_error_is_retryable() {
        let errors = vec![
            StageError::Connection("refused".to_string()),
            StageError::Declaration("inequivalent arg 'type'".to_string()),
            StageError::NoRoute {
                exchange: "amq.topic".to_string(),
                routing_key: "nowhere".to_string(),
            },
            StageError::TypeMismatch { expected: "archive", found: "map" },
        ];

        for err in errors {
            assert!(!err.is_retryable(), "{} should not be retryable", err);
        }
    }
}
