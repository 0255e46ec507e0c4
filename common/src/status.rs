use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{CycleOutcome, FirmwareVersion, SessionState};

#[derive(Debug, Clone, Serialize)]
pub struct OtaStatus {
    pub state: SessionState,
    #[serde(rename = "currentVersion")]
    pub current_version: FirmwareVersion,
    #[serde(rename = "remoteVersion")]
    pub remote_version: Option<FirmwareVersion>,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
    #[serde(rename = "bytesExpected")]
    pub bytes_expected: Option<u64>,
    #[serde(rename = "progressPct")]
    pub progress_pct: Option<u8>,
    #[serde(rename = "lastOutcome")]
    pub last_outcome: Option<CycleOutcome>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    pub last_sha256: Option<String>,
    #[serde(rename = "lastCheck")]
    pub last_check: Option<DateTime<Utc>>,
    pub cycles: u64,
}

impl OtaStatus {
    fn new(current_version: FirmwareVersion) -> Self {
        Self {
            state: SessionState::Idle,
            current_version,
            remote_version: None,
            bytes_written: 0,
            bytes_expected: None,
            progress_pct: None,
            last_outcome: None,
            last_error: None,
            last_sha256: None,
            last_check: None,
            cycles: 0,
        }
    }
}

/// Shared view of the update task. Only the update context writes to it;
/// anything else takes snapshots.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    inner: Arc<Mutex<OtaStatus>>,
}

impl StatusHandle {
    pub fn new(current_version: FirmwareVersion) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OtaStatus::new(current_version))),
        }
    }

    pub fn snapshot(&self) -> OtaStatus {
        self.lock().clone()
    }

    pub(crate) fn cycle_started(&self) {
        let mut status = self.lock();
        status.cycles = status.cycles.saturating_add(1);
        status.last_check = Some(Utc::now());
        status.bytes_written = 0;
        status.bytes_expected = None;
        status.progress_pct = None;
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    pub(crate) fn set_remote_version(&self, remote: Option<FirmwareVersion>) {
        self.lock().remote_version = remote;
    }

    pub(crate) fn set_expected(&self, expected: u64) {
        self.lock().bytes_expected = Some(expected);
    }

    pub(crate) fn record_progress(&self, written: u64) {
        let mut status = self.lock();
        status.bytes_written = written;
        if let Some(total) = status.bytes_expected.filter(|total| *total > 0) {
            let pct = (written.saturating_mul(100) / total).min(100);
            status.progress_pct = Some(pct as u8);
        }
    }

    pub(crate) fn cycle_finished(
        &self,
        outcome: CycleOutcome,
        error: Option<String>,
        sha256: Option<String>,
    ) {
        let mut status = self.lock();
        status.last_outcome = Some(outcome);
        status.last_error = error;
        if sha256.is_some() {
            status.last_sha256 = sha256;
        }
    }

    fn lock(&self) -> MutexGuard<'_, OtaStatus> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
