use thiserror::Error;

use crate::types::CycleOutcome;

/// Failure below HTTP: the request never produced a status line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open connection: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Why a version check or image download did not produce usable data.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("HTTP {0}")]
    Status(u16),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed reading response body: {0}")]
    Body(#[from] std::io::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("content length is zero or unknown")]
    UnknownSize,
    #[error("manifest size {manifest} does not match content length {reported}")]
    SizeMismatch { manifest: u64, reported: u64 },
}

/// Fault reported by the flash target, or detected by the sink itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashFault {
    #[error("image incomplete ({written}/{expected} bytes)")]
    Incomplete { written: u64, expected: u64 },
    #[error("flash device error (code {code})")]
    Device { code: i32 },
}

impl FlashFault {
    /// Numeric diagnostic from the flashing mechanism, if it reported one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Incomplete { .. } => None,
            Self::Device { code } => Some(*code),
        }
    }
}

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("version check failed: {reason}")]
    CheckFailed { reason: FetchFailure },
    #[error("firmware download failed: {reason}")]
    DownloadFailed { reason: FetchFailure },
    #[error("not enough space for {requested} byte image ({available} bytes available)")]
    InsufficientSpace { requested: u64, available: u64 },
    #[error("finalize failed: {0}")]
    FinalizeFailed(FlashFault),
}

impl OtaError {
    pub fn outcome(&self) -> CycleOutcome {
        match self {
            Self::CheckFailed { .. } => CycleOutcome::CheckFailed,
            Self::DownloadFailed { .. } => CycleOutcome::DownloadFailed,
            Self::InsufficientSpace { .. } => CycleOutcome::InsufficientSpace,
            Self::FinalizeFailed(_) => CycleOutcome::FinalizeFailed,
        }
    }
}

/// Why a release could not be published.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("release version is empty")]
    EmptyVersion,
    #[error("firmware image is empty")]
    EmptyImage,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed encoding manifest: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fetch_errors_carry_their_reason() {
        let err = OtaError::CheckFailed {
            reason: FetchFailure::Status(503),
        };
        assert_eq!(err.outcome(), CycleOutcome::CheckFailed);
        assert_eq!(err.to_string(), "version check failed: HTTP 503");

        let err = OtaError::DownloadFailed {
            reason: TransportError::Connect("refused".to_string()).into(),
        };
        assert_eq!(err.outcome(), CycleOutcome::DownloadFailed);
        assert_eq!(
            err.to_string(),
            "firmware download failed: failed to open connection: refused"
        );
    }

    #[test]
    fn finalize_failure_exposes_device_code() {
        let err = OtaError::FinalizeFailed(FlashFault::Device { code: 0x1503 });

        assert_eq!(err.outcome(), CycleOutcome::FinalizeFailed);
        match err {
            OtaError::FinalizeFailed(fault) => assert_eq!(fault.code(), Some(0x1503)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            FlashFault::Incomplete {
                written: 1,
                expected: 2
            }
            .code(),
            None
        );
    }
}
