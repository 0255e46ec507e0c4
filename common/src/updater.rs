use log::{debug, info, warn};

use crate::{
    config::UpdaterConfig,
    download::ImageDownloader,
    error::OtaError,
    flash::{FlashSink, FlashTarget},
    http::HttpTransport,
    manifest::{ManifestFetcher, VersionCheck},
    status::StatusHandle,
    types::{CycleOutcome, SessionState},
};

/// Hard reset of the device. On hardware this does not return.
pub trait DeviceControl {
    fn restart(&mut self);
}

/// The single in-flight update attempt. Lives for one cycle only.
#[derive(Debug)]
pub struct UpdateSession {
    state: SessionState,
    bytes_expected: u64,
    bytes_written: u64,
}

impl UpdateSession {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            bytes_expected: 0,
            bytes_written: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bytes_expected(&self) -> u64 {
        self.bytes_expected
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn transition(&mut self, next: SessionState, status: &StatusHandle) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("[ota] session {} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
        status.set_state(next);
    }

    fn record_written(&mut self, written: u64) {
        self.bytes_written = written.min(self.bytes_expected);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub bytes_expected: u64,
    pub bytes_written: u64,
    /// Set when fewer bytes than declared reached flash.
    pub partial_write: bool,
    pub error: Option<String>,
    pub sha256: Option<String>,
}

struct Applied {
    partial_write: bool,
    sha256: String,
}

/// Owns everything one update cycle touches: the transport, the flash
/// partition and the restart hook. `&mut self` on [`OtaUpdater::run_cycle`]
/// is what keeps cycles from overlapping.
pub struct OtaUpdater<T, F, D> {
    config: UpdaterConfig,
    transport: T,
    flash: F,
    device: D,
    status: StatusHandle,
}

impl<T, F, D> OtaUpdater<T, F, D>
where
    T: HttpTransport,
    F: FlashTarget,
    D: DeviceControl,
{
    pub fn new(config: UpdaterConfig, transport: T, flash: F, device: D) -> Self {
        let status = StatusHandle::new(config.current_version.clone());
        Self {
            config,
            transport,
            flash,
            device,
            status,
        }
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Check for, download and install an update. Every failure ends here as
    /// a report; a successful install restarts the device.
    pub fn run_cycle(&mut self) -> CycleReport {
        info!("[ota] checking for new firmware version");
        self.status.cycle_started();

        let mut session = UpdateSession::new();
        let result = self.attempt(&mut session);

        let mut report = CycleReport {
            outcome: CycleOutcome::Updated,
            bytes_expected: session.bytes_expected(),
            bytes_written: session.bytes_written(),
            partial_write: false,
            error: None,
            sha256: None,
        };

        match result {
            Ok(None) => {
                info!("[ota] firmware is up to date");
                report.outcome = CycleOutcome::UpToDate;
            }
            Ok(Some(applied)) => {
                info!("[ota] image sha256 {}", applied.sha256);
                report.partial_write = applied.partial_write;
                report.sha256 = Some(applied.sha256);
            }
            Err(err) => {
                match &err {
                    OtaError::FinalizeFailed(fault) => {
                        warn!("[ota] {err} (diagnostic code {:?})", fault.code())
                    }
                    _ => warn!("[ota] {err}"),
                }
                report.outcome = err.outcome();
                report.partial_write = session.bytes_written() < session.bytes_expected();
                report.error = Some(err.to_string());
            }
        }

        self.status.cycle_finished(
            report.outcome,
            report.error.clone(),
            report.sha256.clone(),
        );

        if report.outcome == CycleOutcome::Updated {
            session.transition(SessionState::Rebooting, &self.status);
            info!("[ota] update successful, rebooting");
            self.device.restart();
        } else {
            session.transition(SessionState::Idle, &self.status);
        }

        report
    }

    fn attempt(&mut self, session: &mut UpdateSession) -> Result<Option<Applied>, OtaError> {
        session.transition(SessionState::CheckingVersion, &self.status);
        let manifest = match ManifestFetcher::new(&self.config).check(&mut self.transport)? {
            VersionCheck::UpToDate { remote } => {
                self.status.set_remote_version(Some(remote));
                return Ok(None);
            }
            VersionCheck::UpdateAvailable(manifest) => manifest,
        };
        self.status.set_remote_version(manifest.version.clone());
        info!("[ota] new firmware available, starting update");

        session.transition(SessionState::Downloading, &self.status);
        let mut image = ImageDownloader::open(&mut self.transport, &manifest)?;
        session.bytes_expected = image.size;
        self.status.set_expected(image.size);

        session.transition(SessionState::Writing, &self.status);
        let mut sink = FlashSink::begin(&mut self.flash, image.size)?;
        info!("[ota] writing firmware to flash");

        let status = &self.status;
        let written = sink.write_all(&mut image.body, |written| status.record_progress(written));
        session.record_written(written);

        let partial_write = written < image.size;
        if partial_write {
            warn!("[ota] wrote only {written}/{} bytes", image.size);
        } else {
            info!("[ota] wrote {written} bytes");
        }

        session.transition(SessionState::Finalizing, &self.status);
        let sha256 = sink.finalize()?;

        Ok(Some(Applied {
            partial_write,
            sha256,
        }))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::OtaSettings,
        error::FlashFault,
        testing::{
            image_bytes, FakeDevice, FakeFlash, FakeRoute, FakeTransport, FlashCall,
            FIRMWARE_URL, VERSION_URL,
        },
        types::FirmwareVersion,
    };

    impl<T, F, D> OtaUpdater<T, F, D> {
        fn transport(&self) -> &T {
            &self.transport
        }

        fn flash(&self) -> &F {
            &self.flash
        }

        fn device(&self) -> &D {
            &self.device
        }
    }

    fn gated(current: &str) -> UpdaterConfig {
        let settings = OtaSettings {
            version_url: Some(VERSION_URL.to_string()),
            firmware_url: FIRMWARE_URL.to_string(),
            ..OtaSettings::default()
        };
        UpdaterConfig::from_settings(&settings, FirmwareVersion::new(current))
    }

    fn ungated() -> UpdaterConfig {
        let settings = OtaSettings {
            version_url: None,
            firmware_url: FIRMWARE_URL.to_string(),
            version_gating: false,
            ..OtaSettings::default()
        };
        UpdaterConfig::from_settings(&settings, FirmwareVersion::new("1.0"))
    }

    fn updater(
        config: UpdaterConfig,
        transport: FakeTransport,
        flash: FakeFlash,
    ) -> OtaUpdater<FakeTransport, FakeFlash, FakeDevice> {
        OtaUpdater::new(config, transport, flash, FakeDevice::default())
    }

    #[test]
    fn scenario_a_same_version_skips_download() {
        let transport = FakeTransport::new()
            .route(VERSION_URL, FakeRoute::ok("1.0"))
            .route(FIRMWARE_URL, FakeRoute::image(500_000));
        let mut updater = updater(gated("1.0"), transport, FakeFlash::with_capacity(1 << 21));

        let report = updater.run_cycle();

        assert_eq!(report.outcome, CycleOutcome::UpToDate);
        assert!(!updater.transport().requested(FIRMWARE_URL));
        assert!(updater.flash().calls.is_empty());
        assert_eq!(updater.device().restarts, 0);
        assert_eq!(updater.status().snapshot().state, SessionState::Idle);
    }

    #[test]
    fn scenario_b_new_version_flashes_and_restarts_once() {
        let transport = FakeTransport::new()
            .route(VERSION_URL, FakeRoute::ok("2.0"))
            .route(FIRMWARE_URL, FakeRoute::image(500_000));
        let mut updater = updater(gated("1.0"), transport, FakeFlash::with_capacity(1 << 21));

        let report = updater.run_cycle();

        assert_eq!(report.outcome, CycleOutcome::Updated);
        assert_eq!(report.bytes_expected, 500_000);
        assert_eq!(report.bytes_written, 500_000);
        assert!(!report.partial_write);
        assert_eq!(updater.flash().calls.first(), Some(&FlashCall::Begin(500_000)));
        assert_eq!(updater.flash().count(&FlashCall::Finalize), 1);
        assert_eq!(
            updater.flash().boot_image.as_deref(),
            Some(image_bytes(500_000).as_slice())
        );
        assert_eq!(updater.device().restarts, 1);

        let status = updater.status().snapshot();
        assert_eq!(status.state, SessionState::Rebooting);
        assert_eq!(status.progress_pct, Some(100));
        assert_eq!(status.remote_version, Some(FirmwareVersion::new("2.0")));
        assert_eq!(status.last_sha256, report.sha256);
    }

    #[test]
    fn scenario_c_missing_binary_touches_no_flash() {
        let transport = FakeTransport::new()
            .route(VERSION_URL, FakeRoute::ok("2.0"))
            .route(FIRMWARE_URL, FakeRoute::status(404));
        let mut updater = updater(gated("1.0"), transport, FakeFlash::with_capacity(1 << 21));

        let report = updater.run_cycle();

        assert_eq!(report.outcome, CycleOutcome::DownloadFailed);
        assert!(report.error.unwrap().contains("404"));
        assert!(updater.flash().calls.is_empty());
        assert_eq!(updater.device().restarts, 0);
    }

    #[test]
    fn scenario_d_zero_size_never_begins() {
        let transport = FakeTransport::new()
            .route(VERSION_URL, FakeRoute::ok("2.0"))
            .route(FIRMWARE_URL, FakeRoute::ok(Vec::new()));
        let mut updater = updater(gated("1.0"), transport, FakeFlash::with_capacity(1 << 21));

        let report = updater.run_cycle();

        assert_eq!(report.outcome, CycleOutcome::DownloadFailed);
        assert_eq!(updater.flash().count(&FlashCall::Begin(0)), 0);
        assert!(updater.flash().calls.is_empty());
        assert_eq!(updater.device().restarts, 0);
    }

    #[test]
    fn scenario_e_no_space_skips_write_and_finalize() {
        let transport = FakeTransport::new()
            .route(VERSION_URL, FakeRoute::ok("2.0"))
            .route(FIRMWARE_URL, FakeRoute::image(500_000));
        let mut flash = FakeFlash::with_capacity(1 << 21);
        flash.reject_begin = Some(0x1504);
        let mut updater = updater(gated("1.0"), transport, flash);

        let report = updater.run_cycle();

        assert_eq!(report.outcome, CycleOutcome::InsufficientSpace);
        assert_eq!(updater.flash().calls, vec![FlashCall::Begin(500_000)]);
        assert_eq!(updater.device().restarts, 0);
    }

    #[test]
    fn scenario_f_finalize_rejection_records_code_without_restart() {
        let transport = FakeTransport::new()
            .route(VERSION_URL, FakeRoute::ok("2.0"))
            .route(FIRMWARE_URL, FakeRoute::image(500_000));
        let mut flash = FakeFlash::with_capacity(1 << 21);
        flash.reject_finalize = Some(0x1503);
        let mut updater = updater(gated("1.0"), transport, flash);

        let report = updater.run_cycle();

        assert_eq!(report.outcome, CycleOutcome::FinalizeFailed);
        assert_eq!(report.bytes_written, 500_000);
        assert!(report
            .error
            .as_deref()
            .unwrap()
            .contains(&FlashFault::Device { code: 0x1503 }.to_string()));
        assert_eq!(updater.flash().count(&FlashCall::Finalize), 1);
        assert_eq!(updater.device().restarts, 0);

        let status = updater.status().snapshot();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.last_outcome, Some(CycleOutcome::FinalizeFailed));
    }

    #[test]
    fn truncated_transfer_is_partial_and_never_restarts() {
        let transport = FakeTransport::new()
            .route(VERSION_URL, FakeRoute::ok("2.0"))
            .route(
                FIRMWARE_URL,
                FakeRoute::Respond {
                    status: 200,
                    content_length: Some(500_000),
                    body: image_bytes(500_000),
                    fail_after: Some(123_456),
                },
            );
        let mut updater = updater(gated("1.0"), transport, FakeFlash::with_capacity(1 << 21));

        let report = updater.run_cycle();

        assert_eq!(report.outcome, CycleOutcome::FinalizeFailed);
        assert!(report.partial_write);
        assert_eq!(report.bytes_written, 123_456);
        assert_eq!(updater.flash().count(&FlashCall::Abort), 1);
        assert!(updater.flash().boot_image.is_none());
        assert_eq!(updater.device().restarts, 0);
    }

    #[test]
    fn version_check_failure_ends_cycle_quietly() {
        let transport = FakeTransport::new()
            .route(VERSION_URL, FakeRoute::status(500))
            .route(FIRMWARE_URL, FakeRoute::image(1_000));
        let mut updater = updater(gated("1.0"), transport, FakeFlash::with_capacity(1 << 21));

        let report = updater.run_cycle();

        assert_eq!(report.outcome, CycleOutcome::CheckFailed);
        assert!(!updater.transport().requested(FIRMWARE_URL));
        assert_eq!(updater.device().restarts, 0);
    }

    #[test]
    fn update_decision_follows_trimmed_token_equality() {
        for (remote, current, expect_download) in [
            ("1.0", "1.0", false),
            ("1.0\n", "1.0", false),
            ("  1.0  ", "1.0", false),
            ("1.1", "1.0", true),
            ("1.0", "1.0.0", true),
            ("RC1", "rc1", true),
        ] {
            let transport = FakeTransport::new()
                .route(VERSION_URL, FakeRoute::ok(remote))
                .route(FIRMWARE_URL, FakeRoute::image(64));
            let mut updater =
                updater(gated(current), transport, FakeFlash::with_capacity(1 << 21));

            updater.run_cycle();

            assert_eq!(
                updater.transport().requested(FIRMWARE_URL),
                expect_download,
                "remote {remote:?} vs current {current:?}"
            );
        }
    }

    #[test]
    fn ungated_cycles_reflash_every_time() {
        let transport = FakeTransport::new().route(FIRMWARE_URL, FakeRoute::image(2_048));
        let mut updater = updater(ungated(), transport, FakeFlash::with_capacity(1 << 21));

        assert_eq!(updater.run_cycle().outcome, CycleOutcome::Updated);
        assert_eq!(updater.run_cycle().outcome, CycleOutcome::Updated);

        assert!(!updater.transport().requested(VERSION_URL));
        assert_eq!(updater.flash().count(&FlashCall::Finalize), 2);
        assert_eq!(updater.device().restarts, 2);
    }

    #[test]
    fn json_manifest_url_is_downloaded() {
        let transport = FakeTransport::new()
            .route(
                VERSION_URL,
                FakeRoute::ok(r#"{"version":"3.0","url":"http://cdn.test/fw-3.bin","size":256}"#),
            )
            .route("http://cdn.test/fw-3.bin", FakeRoute::image(256));
        let mut updater = updater(gated("1.0"), transport, FakeFlash::with_capacity(1 << 21));

        let report = updater.run_cycle();

        assert_eq!(report.outcome, CycleOutcome::Updated);
        assert!(!updater.transport().requested(FIRMWARE_URL));
    }

    #[test]
    fn restart_happens_only_after_successful_finalize() {
        let cases: Vec<(FakeRoute, Option<i32>, Option<i32>)> = vec![
            (FakeRoute::image(1_000), None, None),
            (FakeRoute::image(1_000), Some(1), None),
            (FakeRoute::image(1_000), None, Some(2)),
            (FakeRoute::status(403), None, None),
            (FakeRoute::Unreachable("timeout".to_string()), None, None),
        ];

        for (route, reject_begin, reject_finalize) in cases {
            let transport = FakeTransport::new()
                .route(VERSION_URL, FakeRoute::ok("9"))
                .route(FIRMWARE_URL, route);
            let mut flash = FakeFlash::with_capacity(1 << 21);
            flash.reject_begin = reject_begin;
            flash.reject_finalize = reject_finalize;
            let mut updater = updater(gated("1"), transport, flash);

            let report = updater.run_cycle();
            let finalized = updater.flash().boot_image.is_some();

            assert_eq!(updater.device().restarts, usize::from(finalized));
            assert_eq!(report.outcome == CycleOutcome::Updated, finalized);
            if updater.flash().count(&FlashCall::Finalize) > 0 {
                assert!(matches!(
                    updater.flash().calls.first(),
                    Some(FlashCall::Begin(_))
                ));
            }
        }
    }
}
