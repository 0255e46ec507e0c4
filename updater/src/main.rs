#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;

#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}

/// Version of the running image, injected at build time like the rest of the
/// device identity.
fn firmware_version() -> ota_common::FirmwareVersion {
    ota_common::FirmwareVersion::new(
        option_env!("FIRMWARE_VERSION").unwrap_or(env!("CARGO_PKG_VERSION")),
    )
}
