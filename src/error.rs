//! Domain errors that callers may want to tell apart.
//!
//! Library functions return `anyhow::Result`; the variants here travel
//! inside the `anyhow::Error` and are recovered with `downcast_ref` where
//! the distinction matters (HTTP status codes, CLI exit messages).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KbError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid {0}")]
    Invalid(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0}")]
    TooLarge(String),
    #[error("{0} is disabled")]
    Disabled(String),
}

impl KbError {
    pub fn not_found(what: impl std::fmt::Display) -> anyhow::Error {
        KbError::NotFound(what.to_string()).into()
    }

    pub fn invalid(what: impl std::fmt::Display) -> anyhow::Error {
        KbError::Invalid(what.to_string()).into()
    }

    pub fn conflict(what: impl std::fmt::Display) -> anyhow::Error {
        KbError::Conflict(what.to_string()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_anyhow_context() {
        use anyhow::Context;
        let err: anyhow::Result<()> = Err(KbError::not_found("file abc"));
        let err = err.context("loading chat context").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::NotFound(_))
        ));
    }
}
