use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// Every variant is fatal at startup: the process must not start with a
/// configuration it cannot honour.
#[derive(Debug, Error)]
pub enum CadenceError {
    /// The configuration sources could not be read or deserialised.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value was read successfully but is out of range or inconsistent.
    #[error("Invalid configuration for `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },
}

impl CadenceError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CadenceError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
