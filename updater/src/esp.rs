use core::convert::TryInto;
use std::{
    io,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method, Status},
    io::Read as EmbeddedRead,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{modem::Modem, prelude::Peripherals};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use esp_idf_sys::{
    esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_t, ESP_OK,
};
use log::{info, warn};

use ota_common::{
    config::{NetworkConfig, DEFAULT_BAUD_RATE},
    ConnectivitySignal, DeviceControl, FlashFault, FlashTarget, HttpResponse, HttpTransport,
    OtaStatus, OtaUpdater, RuntimeConfig, TransportError, UpdateScheduler, UpdaterConfig,
};

const NVS_NAMESPACE: &str = "ota";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const CONSOLE_UART: i32 = 0;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();
    apply_console_baud(runtime.logging.baud_rate);

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let config = UpdaterConfig::from_settings(&runtime.ota, crate::firmware_version());
    let updater = OtaUpdater::new(config, EspTransport, EspFlashTarget::default(), EspRestart);

    // The task starts right away and parks on the signal until the station is up.
    let connectivity = ConnectivitySignal::new();
    let scheduler = UpdateScheduler::new(updater, connectivity.clone());
    let status = scheduler.status();
    let _ota_task = scheduler.spawn().context("failed to spawn update task")?;

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let mut last_heartbeat = Instant::now();
    let mut last_reconnect = Instant::now();
    loop {
        if is_wifi_station_connected() {
            connectivity.notify_connected();
        } else {
            connectivity.notify_disconnected();
            if last_reconnect.elapsed() >= WIFI_RECONNECT_INTERVAL {
                last_reconnect = Instant::now();
                reconnect_wifi(&mut wifi);
            }
        }

        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            last_heartbeat = Instant::now();
            log_heartbeat(&status.snapshot());
        }

        thread::sleep(Duration::from_secs(1));
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

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
}

fn apply_console_baud(baud_rate: u32) {
    if baud_rate == DEFAULT_BAUD_RATE {
        info!("console at {baud_rate} baud");
        return;
    }

    let rc = unsafe { esp_idf_sys::uart_set_baudrate(CONSOLE_UART, baud_rate) };
    if rc == ESP_OK {
        info!("console switched to {baud_rate} baud");
    } else {
        warn!("failed to set console baud {baud_rate}: esp_err_t={rc}");
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<BlockingWifi<EspWifi<'static>>> {
    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(wifi);
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; retrying in background");
    Ok(wifi)
}

fn reconnect_wifi(wifi: &mut BlockingWifi<EspWifi<'static>>) {
    info!("wifi link down; reconnecting");
    let _ = wifi.disconnect();
    if let Err(err) = wifi.connect().and_then(|()| wifi.wait_netif_up()) {
        warn!("wifi reconnect failed: {err:#}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == ESP_OK
}

/// Opens a fresh connection per request; the connection moves into the body.
struct EspTransport;

impl HttpTransport for EspTransport {
    type Body = EspBody;

    fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse<Self::Body>, TransportError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(HTTP_TIMEOUT),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut connection = EspHttpConnection::new(&http_conf)
            .map_err(|err| TransportError::Connect(format!("{err:?}")))?;

        connection
            .initiate_request(Method::Get, url, headers)
            .map_err(|err| TransportError::Connect(format!("{err:?}")))?;
        connection
            .initiate_response()
            .map_err(|err| TransportError::Request(format!("{err:?}")))?;

        Ok(HttpResponse {
            status: connection.status(),
            content_length: connection.content_len(),
            body: EspBody(connection),
        })
    }
}

struct EspBody(EspHttpConnection);

impl io::Read for EspBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        EmbeddedRead::read(&mut self.0, buf)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("{err:?}")))
    }
}

/// Inactive OTA partition, written through the ESP-IDF OTA API. The partition
/// is looked up on every call so no raw pointer is held across the session.
#[derive(Default)]
struct EspFlashTarget {
    handle: Option<esp_ota_handle_t>,
}

impl EspFlashTarget {
    fn next_partition() -> Result<*const esp_partition_t, FlashFault> {
        let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if partition.is_null() {
            warn!("no OTA update partition available");
            return Err(FlashFault::Device {
                code: esp_idf_sys::ESP_ERR_NOT_FOUND,
            });
        }
        Ok(partition)
    }
}

fn check(rc: i32) -> Result<(), FlashFault> {
    if rc == ESP_OK {
        Ok(())
    } else {
        Err(FlashFault::Device { code: rc })
    }
}

impl FlashTarget for EspFlashTarget {
    fn capacity(&self) -> u64 {
        match Self::next_partition() {
            Ok(partition) => u64::from(unsafe { (*partition).size }),
            Err(_) => 0,
        }
    }

    fn begin(&mut self, image_size: u64) -> Result<(), FlashFault> {
        self.abort();
        let partition = Self::next_partition()?;
        let size = usize::try_from(image_size).map_err(|_| FlashFault::Device {
            code: esp_idf_sys::ESP_ERR_INVALID_SIZE,
        })?;

        let mut handle: esp_ota_handle_t = 0;
        check(unsafe { esp_ota_begin(partition, size, &mut handle) })?;
        self.handle = Some(handle);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), FlashFault> {
        let handle = self.handle.ok_or(FlashFault::Device {
            code: esp_idf_sys::ESP_ERR_INVALID_STATE,
        })?;
        check(unsafe { esp_ota_write(handle, chunk.as_ptr().cast(), chunk.len()) })
    }

    fn finalize(&mut self) -> Result<(), FlashFault> {
        let handle = self.handle.take().ok_or(FlashFault::Device {
            code: esp_idf_sys::ESP_ERR_INVALID_STATE,
        })?;
        check(unsafe { esp_ota_end(handle) })?;
        let partition = Self::next_partition()?;
        check(unsafe { esp_ota_set_boot_partition(partition) })
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            let rc = unsafe { esp_ota_abort(handle) };
            if rc != ESP_OK {
                warn!("failed to abort OTA session: esp_err_t={rc}");
            }
        }
    }
}

struct EspRestart;

impl DeviceControl for EspRestart {
    fn restart(&mut self) {
        info!("restarting into new image");
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_sys::esp_restart() };
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("nvs store lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}
