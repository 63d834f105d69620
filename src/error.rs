use thiserror::Error;

use crate::dialect::Dialect;

#[derive(Error, Debug)]
pub enum GcsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The answer does not have the shape the caller asked for.
    #[error("protocol error: {msg} (raw: {raw:?})")]
    Protocol { msg: String, raw: String },

    /// Error code reported by the controller's own error query.
    #[error("{dialect} device error {code}: {message}")]
    Device {
        dialect: Dialect,
        code: i32,
        message: String,
    },

    /// Rejected before anything was sent to the device.
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("wait timed out: {0}")]
    WaitTimeout(String),
}

pub type Result<T> = std::result::Result<T, GcsError>;

impl GcsError {
    pub fn protocol(msg: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::Protocol {
            msg: msg.into(),
            raw: raw.into(),
        }
    }

    /// Device error code, if this is a device-reported error.
    #[must_use]
    pub const fn device_code(&self) -> Option<i32> {
        match self {
            Self::Device { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_device_error_carries_dialect_and_code() {
        let e = GcsError::Device {
            dialect: Dialect::Gcs2,
            code: 10,
            message: "Controller was stopped by command".into(),
        };
        assert_eq!(
            e.to_string(),
            "GCS2 device error 10: Controller was stopped by command"
        );
        assert_eq!(e.device_code(), Some(10));
    }

    #[test]
    fn protocol_error_keeps_raw_text() {
        let e = GcsError::protocol("column count mismatch", "1\t2\t3");
        assert!(e.to_string().contains("column count mismatch"));
        assert!(e.to_string().contains("1\\t2\\t3"));
        assert_eq!(e.device_code(), None);
    }

    #[test]
    fn io_converts_with_question_mark() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(GcsError::Io(_))));
    }

    #[test]
    fn timeout_predicate() {
        assert!(GcsError::Timeout("no answer".into()).is_timeout());
        assert!(!GcsError::WaitTimeout("on target".into()).is_timeout());
    }
}
