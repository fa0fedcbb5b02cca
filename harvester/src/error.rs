use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Device offline: {0}")]
    DeviceOffline(String),

    #[error("Loading in progress at window start")]
    LoadingInProgress,

    #[error("CMS transient error: {0}")]
    CmsTransient(String),

    #[error("CMS authentication failed: {0}")]
    CmsAuth(String),

    #[error("CMS returned result {code}: {message}")]
    CmsApi { code: i64, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("State file error: {0}")]
    StateIo(String),

    #[error("Unknown recorder: {0}")]
    UnknownRecorder(String),

    #[error("Primary clip unavailable: {0}")]
    ClipUnavailable(String),

    #[error("Frame extraction failed: {0}")]
    FrameExtract(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,
}

impl HarvestError {
    /// Errors that abort the current cycle rather than a single interest.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HarvestError::CmsAuth(_) | HarvestError::StateIo(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HarvestError::CmsTransient(_)
                | HarvestError::Storage(_)
                | HarvestError::Http(_)
                | HarvestError::Timeout(_)
        )
    }

    pub fn is_device_offline(&self) -> bool {
        matches!(self, HarvestError::DeviceOffline(_))
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(error: serde_json::Error) -> Self {
        HarvestError::SerializationError(error.to_string())
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            HarvestError::Timeout(error.to_string())
        } else {
            HarvestError::Http(error.to_string())
        }
    }
}

impl From<config::ConfigError> for HarvestError {
    fn from(error: config::ConfigError) -> Self {
        HarvestError::ConfigError(error.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for HarvestError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        HarvestError::Timeout(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_and_state_are_fatal() {
        assert!(HarvestError::CmsAuth("bad password".into()).is_fatal());
        assert!(HarvestError::StateIo("corrupt".into()).is_fatal());
        assert!(!HarvestError::DeviceOffline("dev1".into()).is_fatal());
        assert!(!HarvestError::LoadingInProgress.is_fatal());
        assert!(!HarvestError::Storage("503".into()).is_fatal());
        assert!(!HarvestError::UnknownRecorder("dev9".into()).is_fatal());
        assert!(!HarvestError::ClipUnavailable("no files".into()).is_fatal());
    }

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(HarvestError::CmsTransient("result 22".into()).is_retryable());
        assert!(HarvestError::Storage("put failed".into()).is_retryable());
        assert!(!HarvestError::DeviceOffline("dev1".into()).is_retryable());
    }

    #[test]
    fn messages_carry_context() {
        let err = HarvestError::CmsApi { code: 7, message: "bad window".into() };
        assert_eq!(err.to_string(), "CMS returned result 7: bad window");
    }
}
