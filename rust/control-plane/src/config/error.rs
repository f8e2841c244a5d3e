//! Configuration errors with actionable messages.

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or did not deserialize.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A value is out of range or inconsistent.
    #[error("Invalid configuration: {message}\n\nHow to fix: {fix_hint}")]
    Invalid { message: String, fix_hint: String },

    #[error("Multiple configuration errors:{}", render_all(.0))]
    Multiple(Vec<ConfigError>),
}

/// Result type alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    #[must_use]
    pub fn invalid(message: impl Into<String>, fix_hint: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }

    /// Collapse a list of errors: none is `Ok`, one is itself, more are
    /// `Multiple`.
    pub fn from_list(mut errors: Vec<ConfigError>) -> ConfigResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

fn render_all(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .enumerate()
        .map(|(i, err)| format!("\n\n{}. {err}", i + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_has_fix_hint() {
        let err = ConfigError::invalid(
            "reconciler.max_concurrency must be at least 1",
            "Set HYPERLANE__RECONCILER__MAX_CONCURRENCY=4",
        );
        let msg = err.to_string();
        assert!(msg.contains("max_concurrency"));
        assert!(msg.contains("How to fix: Set HYPERLANE__RECONCILER__MAX_CONCURRENCY=4"));
    }

    #[test]
    fn test_from_list() {
        assert!(ConfigError::from_list(vec![]).is_ok());

        let one = ConfigError::from_list(vec![ConfigError::invalid("a", "b")]).unwrap_err();
        assert!(matches!(one, ConfigError::Invalid { .. }));

        let many = ConfigError::from_list(vec![
            ConfigError::invalid("first problem", "x"),
            ConfigError::invalid("second problem", "y"),
        ])
        .unwrap_err();
        let msg = many.to_string();
        assert!(msg.starts_with("Multiple configuration errors:"));
        assert!(msg.contains("1. Invalid configuration: first problem"));
        assert!(msg.contains("2. Invalid configuration: second problem"));
    }
}
