use std::fmt;

use serde::Serialize;

/// Opaque firmware version token. Compared for equality only, after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct FirmwareVersion(String);

impl FirmwareVersion {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FirmwareVersion {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// What the version endpoint told us about the image to install.
///
/// `version` is `None` when version gating is disabled and the binary
/// endpoint is flashed unconditionally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteManifest {
    pub version: Option<FirmwareVersion>,
    #[serde(rename = "binaryUrl")]
    pub binary_url: String,
    #[serde(rename = "expectedSize")]
    pub expected_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    CheckingVersion,
    Downloading,
    Writing,
    Finalizing,
    Rebooting,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::CheckingVersion => "CHECKING_VERSION",
            Self::Downloading => "DOWNLOADING",
            Self::Writing => "WRITING",
            Self::Finalizing => "FINALIZING",
            Self::Rebooting => "REBOOTING",
        }
    }

    /// Forward edges of the session state machine. Every non-terminal state
    /// may fall back to `Idle`; `Rebooting` is terminal.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        match (self, next) {
            (Self::Rebooting, _) => false,
            (_, Self::Idle) => true,
            (Self::Idle, Self::CheckingVersion) => true,
            (Self::CheckingVersion, Self::Downloading) => true,
            (Self::Downloading, Self::Writing) => true,
            (Self::Writing, Self::Finalizing) => true,
            (Self::Finalizing, Self::Rebooting) => true,
            _ => false,
        }
    }
}

/// How an update cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleOutcome {
    UpToDate,
    CheckFailed,
    DownloadFailed,
    InsufficientSpace,
    FinalizeFailed,
    Updated,
}

impl CycleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpToDate => "UP_TO_DATE",
            Self::CheckFailed => "CHECK_FAILED",
            Self::DownloadFailed => "DOWNLOAD_FAILED",
            Self::InsufficientSpace => "INSUFFICIENT_SPACE",
            Self::FinalizeFailed => "FINALIZE_FAILED",
            Self::Updated => "UPDATED",
        }
    }
}
