use thiserror::Error;

pub type VltResult<T> = Result<T, VltError>;

#[derive(Debug, Error)]
pub enum VltError {
    /// No key slot accepted the supplied credential
    #[error("invalid credential: cannot unlock the repository")]
    InvalidCredential,

    /// Bad input from the caller (path syntax, duplicates, key management rules)
    #[error("{0}")]
    User(String),

    /// Corrupt or unsupported on-disk structure; fatal for that object only
    #[error("format error: {0}")]
    Format(String),

    /// Authentication failure; no plaintext from the failing package is emitted
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Optimistic-concurrency tag mismatch on a conditional write
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VltError {
    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn decrypt(msg: impl Into<String>) -> Self {
        Self::Decrypt(msg.into())
    }

    /// True for errors caused by the caller's input, safe to show verbatim.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::InvalidCredential | Self::User(_))
    }

    /// True when the operation was aborted through its cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_classification() {
        assert!(VltError::InvalidCredential.is_user_error());
        assert!(VltError::user("path must start with /").is_user_error());
        assert!(!VltError::format("bad header").is_user_error());
        assert!(!VltError::decrypt("package 3").is_user_error());
        assert!(!VltError::Conflict("chunk 0".into()).is_user_error());
        assert!(!VltError::Cancelled.is_user_error());
    }

    #[test]
    fn test_cancelled_is_distinct_from_io() {
        let io = VltError::from(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "client went away",
        ));
        assert!(!io.is_cancelled());
        assert!(VltError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_user_message_is_verbatim() {
        let err = VltError::user("file already exists");
        assert_eq!(err.to_string(), "file already exists");
    }
}
