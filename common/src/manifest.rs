use std::io::Read;

use log::{debug, info};
use serde::Deserialize;

use crate::{
    config::UpdaterConfig,
    error::{FetchFailure, OtaError},
    http::{HttpTransport, HTTP_OK, NO_CACHE_HEADERS},
    types::{FirmwareVersion, RemoteManifest},
};

/// Plaintext version bodies carry only the token.
pub const MAX_VERSION_BODY: usize = 256;
/// JSON manifests may carry a long (e.g. presigned) image url.
pub const MAX_MANIFEST_BODY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    UpToDate { remote: FirmwareVersion },
    UpdateAvailable(RemoteManifest),
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    version: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

pub struct ManifestFetcher<'a> {
    config: &'a UpdaterConfig,
}

impl<'a> ManifestFetcher<'a> {
    pub fn new(config: &'a UpdaterConfig) -> Self {
        Self { config }
    }

    pub fn check<T: HttpTransport>(&self, transport: &mut T) -> Result<VersionCheck, OtaError> {
        let Some(version_url) = self.config.gated_version_url() else {
            debug!("[ota] version gating disabled; treating binary endpoint as the update");
            return Ok(VersionCheck::UpdateAvailable(RemoteManifest {
                version: None,
                binary_url: self.config.firmware_url.clone(),
                expected_size: None,
            }));
        };

        let body = fetch_version_body(transport, version_url)
            .map_err(|reason| OtaError::CheckFailed { reason })?;
        let manifest = parse_manifest(&body, &self.config.firmware_url)
            .map_err(|reason| OtaError::CheckFailed { reason })?;

        let current = &self.config.current_version;
        let Some(remote) = manifest.version.clone() else {
            return Err(OtaError::CheckFailed {
                reason: FetchFailure::Malformed("manifest has no version".to_string()),
            });
        };
        info!("[ota] current version: {current}, remote version: {remote}");

        if remote == *current {
            Ok(VersionCheck::UpToDate { remote })
        } else {
            Ok(VersionCheck::UpdateAvailable(manifest))
        }
    }
}

fn fetch_version_body<T: HttpTransport>(
    transport: &mut T,
    version_url: &str,
) -> Result<String, FetchFailure> {
    let response = transport.get(version_url, &NO_CACHE_HEADERS)?;
    if response.status != HTTP_OK {
        return Err(FetchFailure::Status(response.status));
    }

    let mut raw = Vec::with_capacity(64);
    response
        .body
        .take(MAX_MANIFEST_BODY as u64 + 1)
        .read_to_end(&mut raw)?;

    let body = String::from_utf8(raw)
        .map_err(|_| FetchFailure::Malformed("version body is not valid UTF-8".to_string()))?;

    let limit = if body.trim_start().starts_with('{') {
        MAX_MANIFEST_BODY
    } else {
        MAX_VERSION_BODY
    };
    if body.len() > limit {
        return Err(FetchFailure::Malformed(format!(
            "version body exceeds {limit} bytes"
        )));
    }

    Ok(body)
}

/// A plaintext body is the version token itself. A JSON object body may also
/// carry the image url and size.
pub fn parse_manifest(body: &str, default_url: &str) -> Result<RemoteManifest, FetchFailure> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(FetchFailure::Malformed("empty version body".to_string()));
    }

    if !trimmed.starts_with('{') {
        return Ok(RemoteManifest {
            version: Some(FirmwareVersion::new(trimmed)),
            binary_url: default_url.to_string(),
            expected_size: None,
        });
    }

    let document: ManifestDocument = serde_json::from_str(trimmed)
        .map_err(|err| FetchFailure::Malformed(format!("invalid manifest json: {err}")))?;

    let version = FirmwareVersion::new(&document.version);
    if version.is_empty() {
        return Err(FetchFailure::Malformed("manifest version is empty".to_string()));
    }

    let binary_url = document
        .url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| default_url.to_string());

    Ok(RemoteManifest {
        version: Some(version),
        binary_url,
        expected_size: document.size,
    })
}
