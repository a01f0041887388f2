use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input. Never retried.
    #[error("configuration error in {full_name}: {message}")]
    Configuration { full_name: String, message: String },

    /// A full scheduling round dispatched nothing.
    #[error("no progress possible, still blocked: {blocked:?} (cycles: {cycles:?})")]
    Stalled {
        blocked: Vec<String>,
        cycles: Vec<Vec<String>>,
    },

    #[error("'{command}' returned {code}: {stderr}")]
    Gateway {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("{what} did not finish within {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("prerequisites not met:\n{0}")]
    Prerequisites(String),

    #[error("unexpected response: {0}")]
    Unexpected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn configuration(full_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Configuration {
            full_name: full_name.into(),
            message: message.into(),
        }
    }
}
