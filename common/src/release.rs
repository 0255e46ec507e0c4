//! Publishing side of version gating: lays out the files the version and
//! binary endpoints serve.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use log::info;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{
    error::ReleaseError,
    flash::{hex_digest, FLASH_CHUNK_SIZE},
    types::FirmwareVersion,
};

pub const FIRMWARE_FILE: &str = "firmware.bin";
pub const VERSION_FILE: &str = "version.txt";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Body of `manifest.json`, readable by the version check as a JSON manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseManifest {
    pub version: FirmwareVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRelease {
    pub manifest: ReleaseManifest,
    pub firmware_path: PathBuf,
    pub version_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Copy `image` into `out_dir` and write the version token and manifest next
/// to it. `version.txt` is written last, so a device never sees a new token
/// before the image it names is in place.
pub fn publish_release(
    image: &Path,
    out_dir: &Path,
    version: &FirmwareVersion,
    base_url: Option<&str>,
) -> Result<PublishedRelease, ReleaseError> {
    if version.is_empty() {
        return Err(ReleaseError::EmptyVersion);
    }

    fs::create_dir_all(out_dir)?;
    let firmware_path = out_dir.join(FIRMWARE_FILE);
    let (size, sha256) = copy_with_digest(image, &firmware_path)?;
    if size == 0 {
        let _ = fs::remove_file(&firmware_path);
        return Err(ReleaseError::EmptyImage);
    }

    let manifest = ReleaseManifest {
        version: version.clone(),
        url: base_url
            .map(|base| base.trim().trim_end_matches('/'))
            .filter(|base| !base.is_empty())
            .map(|base| format!("{base}/{FIRMWARE_FILE}")),
        size,
        sha256,
    };

    let manifest_path = out_dir.join(MANIFEST_FILE);
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

    let version_path = out_dir.join(VERSION_FILE);
    fs::write(&version_path, version.as_str())?;

    info!(
        "[release] published {} ({size} bytes, sha256 {})",
        manifest.version, manifest.sha256
    );

    Ok(PublishedRelease {
        manifest,
        firmware_path,
        version_path,
        manifest_path,
    })
}

fn copy_with_digest(source: &Path, destination: &Path) -> io::Result<(u64, String)> {
    let mut input = File::open(source)?;
    let mut output = File::create(destination)?;
    let mut hasher = Sha256::new();
    let mut chunk = [0_u8; FLASH_CHUNK_SIZE];
    let mut copied = 0_u64;

    loop {
        let read = input.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        output.write_all(&chunk[..read])?;
        hasher.update(&chunk[..read]);
        copied += read as u64;
    }
    output.sync_all()?;

    Ok((copied, hex_digest(hasher.finalize().as_slice())))
}
