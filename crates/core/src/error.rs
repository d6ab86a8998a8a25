use thiserror::Error;

/// A metric that cannot be represented on the wire.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("Metric key is empty")]
    EmptyKey,

    #[error("Metric key contains invalid character {ch:?}: {key}")]
    InvalidKey { key: String, ch: char },

    #[error("Dimension key is empty for metric {0}")]
    EmptyDimensionKey(String),

    #[error("Dimension key contains invalid character {ch:?}: {dimension} (metric {key})")]
    InvalidDimensionKey { key: String, dimension: String, ch: char },

    #[error("Dimension value for {dimension} contains a line break (metric {key})")]
    InvalidDimensionValue { key: String, dimension: String },

    #[error("Metric value is not finite for {0}")]
    NonFiniteValue(String),

    #[error("Summary values are only valid for gauge metrics ({0})")]
    SummaryNotGauge(String),

    #[error("Metric dimension count of {count} exceeds limit of {limit} for {key}")]
    TooManyDimensions { key: String, count: usize, limit: usize },

    #[error("Metric line length {length} exceeds limit of {limit} for {key}")]
    LineTooLong { key: String, length: usize, limit: usize },
}

/// A line that does not follow the metric line protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineParseError {
    #[error("Line is empty")]
    Empty,

    #[error("Missing payload section: {0}")]
    MissingPayload(String),

    #[error("Unterminated quoted dimension value: {0}")]
    UnterminatedQuote(String),

    #[error("Malformed dimension: {0}")]
    MalformedDimension(String),

    #[error("Unknown payload kind: {0}")]
    UnknownKind(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Configuration that cannot be loaded or is out of range.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
