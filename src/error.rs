use thiserror::Error;

/// Gateway settings required by every operation are missing.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("gateway base URL (WAHA_INTERNAL_URL) is not set")]
    MissingBaseUrl,
    #[error("gateway API key (WAHA_API_KEY) is not set")]
    MissingApiKey,
    #[error("gateway base URL (WAHA_INTERNAL_URL) and API key (WAHA_API_KEY) are not set")]
    MissingBoth,
}

impl ConfigurationError {
    /// Operator-facing setup hint.
    pub fn hint(&self) -> String {
        format!(
            "Server configuration error: {}. Set it in config.toml [gateway] or the environment.",
            self
        )
    }
}

/// The caller abandoned the operation; nothing further is sent or returned.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("operation cancelled by caller")]
pub struct Cancelled;
