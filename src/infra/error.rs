use thiserror::Error;

/// Failures of the engine's own plumbing: configuration and telemetry.
///
/// Producer faults never show up here; they are written into the live result
/// of the affected fingerprint.
#[derive(Debug, Error)]
pub enum SwrError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl SwrError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

/// Error returned by deferred keys whose dependencies are not available yet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key dependencies not ready: {0}")]
    NotReady(String),
}

impl KeyError {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady(reason.into())
    }
}

/// General purpose producer error.
///
/// Producers may use any clonable error type; this one covers the common case
/// of carrying a message and an optional machine-readable code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProducerError {
    pub message: String,
    pub code: Option<String>,
}

impl ProducerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<String> for ProducerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProducerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
