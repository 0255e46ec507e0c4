pub mod config;
pub mod download;
pub mod error;
pub mod flash;
pub mod http;
pub mod manifest;
pub mod release;
pub mod scheduler;
pub mod status;
pub mod types;
pub mod updater;

#[cfg(test)]
mod testing;

pub use config::{LoggingConfig, NetworkConfig, OtaSettings, RuntimeConfig, UpdaterConfig};
pub use download::{ImageDownloader, ImageStream};
pub use error::{FetchFailure, FlashFault, OtaError, ReleaseError, TransportError};
pub use flash::{FlashSink, FlashTarget};
pub use http::{HttpResponse, HttpTransport, HTTP_OK, NO_CACHE_HEADERS};
pub use manifest::{ManifestFetcher, VersionCheck};
pub use release::{publish_release, PublishedRelease, ReleaseManifest};
pub use scheduler::{ConnectivityGate, ConnectivitySignal, SchedulerHandle, UpdateScheduler};
pub use status::{OtaStatus, StatusHandle};
pub use types::{CycleOutcome, FirmwareVersion, RemoteManifest, SessionState};
pub use updater::{CycleReport, DeviceControl, OtaUpdater, UpdateSession};
