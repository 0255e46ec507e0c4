use log::info;

use crate::{
    error::{FetchFailure, OtaError},
    http::{HttpTransport, HTTP_OK, NO_CACHE_HEADERS},
    types::RemoteManifest,
};

/// An open image transfer. The body is read incrementally by the flash sink
/// and never held in memory as a whole.
pub struct ImageStream<B> {
    pub body: B,
    pub size: u64,
}

pub struct ImageDownloader;

impl ImageDownloader {
    pub fn open<T: HttpTransport>(
        transport: &mut T,
        manifest: &RemoteManifest,
    ) -> Result<ImageStream<T::Body>, OtaError> {
        info!("[ota] starting firmware download from {}", manifest.binary_url);

        let response = transport
            .get(&manifest.binary_url, &NO_CACHE_HEADERS)
            .map_err(|err| OtaError::DownloadFailed { reason: err.into() })?;

        if response.status != HTTP_OK {
            return Err(OtaError::DownloadFailed {
                reason: FetchFailure::Status(response.status),
            });
        }

        let size = resolve_size(manifest.expected_size, response.content_length)
            .map_err(|reason| OtaError::DownloadFailed { reason })?;
        info!("[ota] firmware size: {size} bytes");

        Ok(ImageStream {
            body: response.body,
            size,
        })
    }
}

fn resolve_size(manifest: Option<u64>, reported: Option<u64>) -> Result<u64, FetchFailure> {
    let size = match (manifest, reported) {
        (Some(manifest), Some(reported)) if manifest != reported => {
            return Err(FetchFailure::SizeMismatch { manifest, reported });
        }
        (Some(size), _) | (None, Some(size)) => size,
        (None, None) => 0,
    };

    if size == 0 {
        return Err(FetchFailure::UnknownSize);
    }
    Ok(size)
}
