//! Error types for the mock server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A configuration document could not be loaded or is invalid.
///
/// Fatal at startup, recoverable on reload (the previous routes stay live).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON (or YAML).
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// The document parsed but violates a structural rule.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// Why a single template failed to render.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateFault {
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("empty expression")]
    EmptyExpression,

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unknown helper `{0}`")]
    UnknownHelper(String),

    #[error("helper `{helper}` expects {expected} argument(s), got {got}")]
    Arity {
        helper: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("helper `{helper}` got invalid argument `{arg}`")]
    InvalidArgument { helper: &'static str, arg: String },

    #[error("invalid range: min {min} is greater than max {max}")]
    InvalidRange { min: i64, max: i64 },

    #[error("invalid time format `{0}`")]
    InvalidTimeFormat(String),

    #[error("template rendered to an empty string")]
    EmptyOutput,
}

/// A template failed to render.
///
/// `location` is the JSON path of the failing leaf (`$` for a bare string,
/// `$.user.name`, `$.items[2]`, `headers.x-request-id`).
#[derive(Debug, Clone, Error)]
#[error("failed to render template {template:?} at {location}: {cause}")]
pub struct TemplateError {
    pub template: String,
    pub location: String,
    #[source]
    pub cause: TemplateFault,
}

impl TemplateError {
    pub(crate) fn new(template: &str, cause: TemplateFault) -> Self {
        Self {
            template: template.to_string(),
            location: "$".to_string(),
            cause,
        }
    }

    pub(crate) fn at(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }
}

/// Failures of the server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Listener bind or accept failure.
    #[error("transport error on {addr}: {source}")]
    Transport {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The config-change subscription could not be registered.
    #[error("failed to watch config file: {0}")]
    Watch(#[from] notify::Error),

    /// In-flight requests were still running when the drain deadline passed.
    #[error("in-flight connections not drained within {}ms", timeout.as_millis())]
    ShutdownTimeout { timeout: Duration },
}
