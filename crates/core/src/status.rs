use std::fmt;

use serde::{Deserialize, Serialize};

/// Health value reported to the ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusValue {
    #[default]
    #[serde(rename = "")]
    Empty,
    Ok,
    GenericError,
    InvalidArgsError,
    EecConnectionError,
    InvalidConfigError,
    AuthenticationError,
    DeviceConnectionError,
    Warning,
    UnknownError,
}

impl StatusValue {
    /// Everything except `Ok` and `Empty` is an error; warnings included.
    pub fn is_error(self) -> bool {
        !matches!(self, StatusValue::Ok | StatusValue::Empty)
    }

    pub fn is_warning(self) -> bool {
        self == StatusValue::Warning
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusValue::Empty => "",
            StatusValue::Ok => "OK",
            StatusValue::GenericError => "GENERIC_ERROR",
            StatusValue::InvalidArgsError => "INVALID_ARGS_ERROR",
            StatusValue::EecConnectionError => "EEC_CONNECTION_ERROR",
            StatusValue::InvalidConfigError => "INVALID_CONFIG_ERROR",
            StatusValue::AuthenticationError => "AUTHENTICATION_ERROR",
            StatusValue::DeviceConnectionError => "DEVICE_CONNECTION_ERROR",
            StatusValue::Warning => "WARNING",
            StatusValue::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status value with an optional message and epoch-millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Status {
    pub status: StatusValue,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Status {
    pub fn new(status: StatusValue, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            timestamp: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusValue::Ok, "")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StatusValue::GenericError, message)
    }

    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }

    pub fn is_warning(&self) -> bool {
        self.status.is_warning()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{}: {}", self.status, self.message)
        }
    }
}

/// Combines several partial statuses into one.
#[derive(Debug, Default)]
pub struct MultiStatus {
    statuses: Vec<Status>,
}

impl MultiStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, status: StatusValue, message: impl Into<String>) {
        self.statuses.push(Status::new(status, message));
    }

    /// Any warning wins; otherwise all-ok is OK, all-error is GENERIC_ERROR,
    /// and a mix is WARNING.
    pub fn build(&self) -> Status {
        if self.statuses.is_empty() {
            return Status::ok();
        }

        let messages: Vec<&str> = self
            .statuses
            .iter()
            .map(|s| s.message.as_str())
            .filter(|m| !m.is_empty())
            .collect();
        let any_warning = self.statuses.iter().any(Status::is_warning);
        let all_ok = self.statuses.iter().all(|s| !s.is_error());
        let all_err = self.statuses.iter().all(Status::is_error);

        let value = if any_warning {
            StatusValue::Warning
        } else if all_ok {
            StatusValue::Ok
        } else if all_err {
            StatusValue::GenericError
        } else {
            StatusValue::Warning
        };
        Status::new(value, messages.join(", "))
    }
}
