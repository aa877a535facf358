use std::{fmt, io};

use bson::{Bson, Document};

use crate::error::mongo::{extract_error_info, ErrorInfo};

/// Crate-wide `Result` type using [`DataLayerError`] as the error.
///
/// This alias is re-exported by the parent `error` module and is intended
/// to be used throughout the crate for fallible operations.
pub type Result<T> = std::result::Result<T, DataLayerError>;

/// Top-level error type for data layer operations.
#[derive(Debug)]
pub enum DataLayerError {
    /// Invalid arguments supplied at construction time.
    Validation(ValidationError),

    /// An internal invariant did not hold (e.g. `next()` on an empty partition).
    AssertionFailed(String),

    /// Shaping was requested after the partition's find was sent.
    CursorStarted {
        collection: String,
        option: &'static str,
    },

    /// A partition cursor failed; carries the read context.
    Rethrown(RethrownError),

    /// No deserializer registered for the version and resource type.
    UnknownResourceType {
        base_version: String,
        resource_type: String,
    },

    /// Connection-related errors.
    Connection(ConnectionError),

    /// Configuration errors.
    Config(ConfigError),

    /// MongoDB driver errors.
    MongoDb(mongodb::error::Error),

    /// Document could not be converted to a resource.
    Bson(bson::de::Error),

    /// I/O errors.
    Io(io::Error),

    /// Generic error with a free-form message.
    Generic(String),
}

/// Argument validation errors.
#[derive(Debug)]
pub enum ValidationError {
    /// A required argument was empty.
    Empty(&'static str),

    /// Argument had an unexpected value.
    Invalid { field: &'static str, value: String },
}

/// Connection-specific errors.
#[derive(Debug)]
pub enum ConnectionError {
    /// Failed to establish a connection.
    ConnectionFailed(String),

    /// Invalid connection URI.
    InvalidUri(String),

    /// Not currently connected to MongoDB.
    NotConnected,

    /// Ping command failed.
    PingFailed(String),
}

/// Configuration-specific errors.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file not found.
    FileNotFound(String),

    /// Invalid config format.
    InvalidFormat(String),

    /// Invalid field value.
    InvalidValue { field: String, value: String },
}

/// Error raised by a partitioned read, wrapping the underlying failure.
///
/// The collections and databases are the partitions that were still open
/// when the failure happened, so the first entry is the partition that was
/// being read for sequential operations.
#[derive(Debug)]
pub struct RethrownError {
    /// Collections remaining at the time of the failure.
    pub collections: Vec<String>,

    /// Databases of those collections, in the same order.
    pub databases: Vec<String>,

    /// Logical query being executed.
    pub query: Document,

    /// Underlying error.
    pub source: Box<DataLayerError>,
}

impl RethrownError {
    /// Wrap `source` with the read context.
    pub fn new(
        source: DataLayerError,
        collections: Vec<String>,
        databases: Vec<String>,
        query: Document,
    ) -> Self {
        Self {
            collections,
            databases,
            query,
            source: Box::new(source),
        }
    }

    /// The innermost error, skipping any nested rethrows.
    pub fn root_cause(&self) -> &DataLayerError {
        let mut current = self.source.as_ref();
        while let DataLayerError::Rethrown(inner) = current {
            current = inner.source.as_ref();
        }
        current
    }

    /// Structured diagnostics suitable for logs and error bodies.
    pub fn diagnostics(&self) -> serde_json::Value {
        let cause = match self.root_cause() {
            DataLayerError::MongoDb(e) => extract_error_info(e),
            other => ErrorInfo::from_message(other.to_string()),
        };

        serde_json::json!({
            "collections": self.collections,
            "databases": self.databases,
            "query": Bson::Document(self.query.clone()).into_relaxed_extjson(),
            "error": cause,
        })
    }
}

/* ========================= Display & Error impls ========================= */

impl fmt::Display for DataLayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataLayerError::Validation(e) => write!(f, "Validation error: {e}"),
            DataLayerError::AssertionFailed(msg) => write!(f, "Assertion failed: {msg}"),
            DataLayerError::CursorStarted { collection, option } => write!(
                f,
                "Cannot set {option} on {collection}: cursor already started reading"
            ),
            DataLayerError::Rethrown(e) => write!(f, "{e}"),
            DataLayerError::UnknownResourceType {
                base_version,
                resource_type,
            } => write!(
                f,
                "No resource registered for {resource_type} (version {base_version})"
            ),
            DataLayerError::Connection(e) => write!(f, "Connection error: {e}"),
            DataLayerError::Config(e) => write!(f, "Configuration error: {e}"),
            DataLayerError::MongoDb(e) => write!(f, "MongoDB error: {e}"),
            DataLayerError::Bson(e) => write!(f, "Deserialization error: {e}"),
            DataLayerError::Io(e) => write!(f, "I/O error: {e}"),
            DataLayerError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Empty(field) => write!(f, "{field} is empty"),
            ValidationError::Invalid { field, value } => {
                write!(f, "Invalid value '{value}' for {field}")
            }
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::ConnectionFailed(msg) => write!(f, "Failed to connect: {msg}"),
            ConnectionError::InvalidUri(uri) => write!(f, "Invalid connection URI: {uri}"),
            ConnectionError::NotConnected => write!(f, "Not connected to MongoDB"),
            ConnectionError::PingFailed(msg) => write!(f, "Ping failed: {msg}"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::InvalidFormat(msg) => write!(f, "Invalid config format: {msg}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{value}' for field '{field}'")
            }
        }
    }
}

impl fmt::Display for RethrownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [collections: {}; databases: {}; query: {}]",
            self.source,
            self.collections.join(","),
            self.databases.join(","),
            self.query
        )
    }
}

impl std::error::Error for DataLayerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataLayerError::Rethrown(e) => Some(e),
            DataLayerError::MongoDb(e) => Some(e),
            DataLayerError::Bson(e) => Some(e),
            DataLayerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for RethrownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl std::error::Error for ValidationError {}
impl std::error::Error for ConnectionError {}
impl std::error::Error for ConfigError {}

/* ========================= Conversions to DataLayerError ========================= */

impl From<io::Error> for DataLayerError {
    fn from(err: io::Error) -> Self {
        DataLayerError::Io(err)
    }
}

impl From<mongodb::error::Error> for DataLayerError {
    fn from(err: mongodb::error::Error) -> Self {
        DataLayerError::MongoDb(err)
    }
}

impl From<bson::de::Error> for DataLayerError {
    fn from(err: bson::de::Error) -> Self {
        DataLayerError::Bson(err)
    }
}

impl From<ValidationError> for DataLayerError {
    fn from(err: ValidationError) -> Self {
        DataLayerError::Validation(err)
    }
}

impl From<RethrownError> for DataLayerError {
    fn from(err: RethrownError) -> Self {
        DataLayerError::Rethrown(err)
    }
}

impl From<ConnectionError> for DataLayerError {
    fn from(err: ConnectionError) -> Self {
        DataLayerError::Connection(err)
    }
}

impl From<ConfigError> for DataLayerError {
    fn from(err: ConfigError) -> Self {
        DataLayerError::Config(err)
    }
}

impl From<String> for DataLayerError {
    fn from(msg: String) -> Self {
        DataLayerError::Generic(msg)
    }
}

impl From<&str> for DataLayerError {
    fn from(msg: &str) -> Self {
        DataLayerError::Generic(msg.to_owned())
    }
}
