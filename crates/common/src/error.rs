//! Startup and configuration errors

use thiserror::Error;

/// Errors raised while loading service configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_the_problem() {
        let err = Error::Config("rotation.pages must be at least 1".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: rotation.pages must be at least 1"
        );
    }

    #[test]
    fn io_and_toml_errors_convert() {
        let io: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "code-server.toml").into();
        assert!(io.to_string().starts_with("I/O error:"), "got: {io}");

        let toml_err = toml::from_str::<toml::Table>("pages = ").unwrap_err();
        let err: Error = toml_err.into();
        assert!(matches!(err, Error::Toml(_)));
    }
}
