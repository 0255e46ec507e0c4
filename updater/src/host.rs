use std::{
    fs::{self, File},
    io::{self, ErrorKind, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use tokio::sync::Mutex;
use tracing::{info, warn};

use ota_common::{
    publish_release, ConnectivitySignal, DeviceControl, FirmwareVersion, FlashFault, FlashTarget,
    HttpResponse, HttpTransport, OtaSettings, OtaStatus, OtaUpdater, RuntimeConfig,
    TransportError, UpdateScheduler, UpdaterConfig,
};

const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const DEFAULT_SLOT_CAPACITY: u64 = 4 * 1024 * 1024;
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const STAGING_FILE: &str = "next.partial";
const BOOT_FILE: &str = "next.bin";
/// Host I/O failures that carry no OS error number.
const NO_OS_CODE: i32 = -1;

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    slot_dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Desktop simulation of the OTA updater.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the update task against the configured endpoints (the default).
    Run,
    /// Lay out a firmware image with its version token and manifest, ready to
    /// be served from the release endpoint.
    Release {
        /// Built firmware image.
        #[arg(long)]
        image: PathBuf,
        /// Version token devices compare against their own.
        #[arg(long = "firmware-version", env = "FIRMWARE_VERSION")]
        version: String,
        #[arg(long, default_value = "releases")]
        out_dir: PathBuf,
        /// Public URL of `out_dir`; recorded as the image url in the manifest.
        #[arg(long)]
        base_url: Option<String>,
    },
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command.unwrap_or(Command::Run) {
        Command::Run => run_updater().await,
        Command::Release {
            image,
            version,
            out_dir,
            base_url,
        } => {
            let release = publish_release(
                &image,
                &out_dir,
                &FirmwareVersion::new(&version),
                base_url.as_deref(),
            )
            .with_context(|| format!("failed to publish {}", image.display()))?;
            info!(
                "release {} written to {} ({} bytes)",
                release.manifest.version,
                out_dir.display(),
                release.manifest.size
            );
            Ok(())
        }
    }
}

async fn run_updater() -> anyhow::Result<()> {
    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime.ota);
    runtime.sanitize();

    if runtime.ota.firmware_url.is_empty() {
        warn!("no firmware url configured; set OTA_FIRMWARE_URL or {BOOT_FILE} will never change");
    }

    let config = UpdaterConfig::from_settings(&runtime.ota, crate::firmware_version());
    let capacity = std::env::var("OTA_SLOT_CAPACITY")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_SLOT_CAPACITY);

    let updater = OtaUpdater::new(
        config,
        ReqwestTransport::default(),
        FileFlashTarget::new(store.slot_dir.as_ref().clone(), capacity),
        ProcessRestart,
    );

    let connectivity = ConnectivitySignal::new();
    let scheduler = UpdateScheduler::new(updater, connectivity.clone());
    let status = scheduler.status();
    let scheduler_handle = scheduler.handle();
    let _ota_task = scheduler.spawn().context("failed to spawn update task")?;

    // The host network stack is up before the process starts.
    connectivity.notify_connected();
    info!(
        "device simulation running (slot dir {}, capacity {capacity} bytes)",
        store.slot_dir.display()
    );

    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("failed to install SIGHUP handler")?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        #[cfg(unix)]
        let check_requested = hangup.recv();
        #[cfg(not(unix))]
        let check_requested = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = heartbeat.tick() => log_heartbeat(&status.snapshot()),
            _ = check_requested => {
                info!("SIGHUP received; requesting update check");
                if !scheduler_handle.check_now() {
                    warn!("update task is no longer running");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

fn log_heartbeat(status: &OtaStatus) {
    info!(
        "[heartbeat] version {} state {} cycles {} last {} progress {}",
        status.current_version,
        status.state.as_str(),
        status.cycles,
        status.last_outcome.map(|o| o.as_str()).unwrap_or("--"),
        status
            .progress_pct
            .map(|pct| format!("{pct}%"))
            .unwrap_or_else(|| "--".to_string()),
    );
}

fn apply_env_overrides(ota: &mut OtaSettings) {
    if let Ok(url) = std::env::var("OTA_VERSION_URL") {
        ota.version_url = Some(url);
    }
    if let Ok(url) = std::env::var("OTA_FIRMWARE_URL") {
        ota.firmware_url = url;
    }
    if let Some(interval) = std::env::var("OTA_CHECK_INTERVAL_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        ota.check_interval_ms = interval;
    }
    if let Some(gating) = std::env::var("OTA_VERSION_GATING")
        .ok()
        .and_then(|value| parse_flag(&value))
    {
        ota.version_gating = gating;
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Blocking client, built on first use so it is created on the update
/// thread rather than inside the async runtime.
#[derive(Default)]
struct ReqwestTransport {
    client: Option<Client>,
}

impl ReqwestTransport {
    fn client(&mut self) -> Result<&Client, TransportError> {
        if self.client.is_none() {
            let client = Client::builder()
                .user_agent(APP_USER_AGENT)
                .connect_timeout(HTTP_CONNECT_TIMEOUT)
                .timeout(HTTP_TIMEOUT)
                .build()
                .map_err(|err| TransportError::Connect(format!("failed building client: {err}")))?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| TransportError::Connect("http client unavailable".to_string()))
    }
}

impl HttpTransport for ReqwestTransport {
    type Body = reqwest::blocking::Response;

    fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse<Self::Body>, TransportError> {
        let mut request = self.client()?.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().map_err(|err| {
            if err.is_connect() {
                TransportError::Connect(err.to_string())
            } else {
                TransportError::Request(err.to_string())
            }
        })?;

        Ok(HttpResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: response,
        })
    }
}

struct PendingImage {
    file: File,
    expected: u64,
    written: u64,
}

/// Update slot backed by a directory: the image is staged in a partial file
/// and renamed into place on finalize.
struct FileFlashTarget {
    slot_dir: PathBuf,
    capacity: u64,
    pending: Option<PendingImage>,
}

impl FileFlashTarget {
    fn new(slot_dir: PathBuf, capacity: u64) -> Self {
        Self {
            slot_dir,
            capacity,
            pending: None,
        }
    }

    fn staging_path(&self) -> PathBuf {
        self.slot_dir.join(STAGING_FILE)
    }

    fn boot_path(&self) -> PathBuf {
        self.slot_dir.join(BOOT_FILE)
    }

    fn open_staging(&self, image_size: u64) -> io::Result<File> {
        fs::create_dir_all(&self.slot_dir)?;
        let file = File::create(self.staging_path())?;
        file.set_len(image_size)?;
        Ok(file)
    }

    fn commit(&self, pending: PendingImage) -> io::Result<()> {
        if pending.written != pending.expected {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("staged {}/{} bytes", pending.written, pending.expected),
            ));
        }
        pending.file.sync_all()?;
        drop(pending.file);
        fs::rename(self.staging_path(), self.boot_path())
    }
}

impl FlashTarget for FileFlashTarget {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn begin(&mut self, image_size: u64) -> Result<(), FlashFault> {
        self.abort();
        let file = self.open_staging(image_size).map_err(io_fault)?;
        self.pending = Some(PendingImage {
            file,
            expected: image_size,
            written: 0,
        });
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), FlashFault> {
        let pending = self.pending.as_mut().ok_or(FlashFault::Device { code: NO_OS_CODE })?;
        if pending.written + chunk.len() as u64 > pending.expected {
            return Err(FlashFault::Device { code: NO_OS_CODE });
        }
        pending.file.write_all(chunk).map_err(io_fault)?;
        pending.written += chunk.len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), FlashFault> {
        let pending = self.pending.take().ok_or(FlashFault::Device { code: NO_OS_CODE })?;
        self.commit(pending).map_err(|err| {
            let _ = fs::remove_file(self.staging_path());
            io_fault(err)
        })?;
        info!("new image staged at {}", self.boot_path().display());
        Ok(())
    }

    fn abort(&mut self) {
        if self.pending.take().is_some() {
            if let Err(err) = fs::remove_file(self.staging_path()) {
                warn!("failed to discard staged image: {err}");
            }
        }
    }
}

fn io_fault(err: io::Error) -> FlashFault {
    warn!("slot i/o error: {err}");
    FlashFault::Device {
        code: err.raw_os_error().unwrap_or(NO_OS_CODE),
    }
}

struct ProcessRestart;

impl DeviceControl for ProcessRestart {
    fn restart(&mut self) {
        info!("restarting into new image");
        std::process::exit(0);
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("OTA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.ota"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            slot_dir: Arc::new(data_dir.join("slot")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}
