use std::{
    fmt::Write as _,
    io::{ErrorKind, Read},
};

use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::error::{FlashFault, OtaError};

pub const FLASH_CHUNK_SIZE: usize = 4096;

/// The partition that receives the next boot image.
pub trait FlashTarget {
    /// Bytes the update partition can hold.
    fn capacity(&self) -> u64;

    /// Reserve and erase space for an image of `image_size` bytes.
    fn begin(&mut self, image_size: u64) -> Result<(), FlashFault>;

    fn write(&mut self, chunk: &[u8]) -> Result<(), FlashFault>;

    /// Validate the written image and mark it as the next boot target.
    fn finalize(&mut self) -> Result<(), FlashFault>;

    /// Release an open reservation without touching the boot selection.
    fn abort(&mut self);
}

/// One session's exclusive hold on a [`FlashTarget`]. Only [`FlashSink::begin`]
/// creates one, so nothing can be written or finalized before space is
/// reserved. Dropping an unfinished sink aborts the reservation.
pub struct FlashSink<'a, F: FlashTarget> {
    target: &'a mut F,
    expected: u64,
    written: u64,
    hasher: Sha256,
    open: bool,
}

impl<'a, F: FlashTarget> FlashSink<'a, F> {
    pub fn begin(target: &'a mut F, expected_size: u64) -> Result<Self, OtaError> {
        let available = target.capacity();
        let insufficient = OtaError::InsufficientSpace {
            requested: expected_size,
            available,
        };

        if expected_size > available {
            return Err(insufficient);
        }

        if let Err(fault) = target.begin(expected_size) {
            warn!("[ota] flash target refused {expected_size} byte reservation: {fault}");
            return Err(insufficient);
        }

        Ok(Self {
            target,
            expected: expected_size,
            written: 0,
            hasher: Sha256::new(),
            open: true,
        })
    }

    /// Copy the stream into flash until it ends, fails, or `expected` bytes
    /// have been written. Returns the total written; a short count is left
    /// for [`FlashSink::finalize`] to reject.
    pub fn write_all<R: Read>(&mut self, stream: &mut R, mut on_progress: impl FnMut(u64)) -> u64 {
        let mut chunk = [0_u8; FLASH_CHUNK_SIZE];

        while self.written < self.expected {
            let remaining = self.expected - self.written;
            let want = remaining.min(FLASH_CHUNK_SIZE as u64) as usize;

            let read = match stream.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("[ota] stream read failed after {} bytes: {err}", self.written);
                    break;
                }
            };

            if let Err(fault) = self.target.write(&chunk[..read]) {
                warn!("[ota] flash write failed after {} bytes: {fault}", self.written);
                break;
            }

            self.hasher.update(&chunk[..read]);
            self.written += read as u64;
            on_progress(self.written);
        }

        if self.written == self.expected {
            let mut probe = [0_u8; 1];
            if matches!(stream.read(&mut probe), Ok(read) if read > 0) {
                warn!(
                    "[ota] stream carries more than the declared {} bytes; surplus ignored",
                    self.expected
                );
            }
        }

        debug!("[ota] streamed {}/{} bytes", self.written, self.expected);
        self.written
    }

    /// Check the byte count, then let the target validate the image and
    /// switch the boot selection. Returns the SHA-256 of the written bytes.
    pub fn finalize(mut self) -> Result<String, OtaError> {
        self.open = false;

        if self.written != self.expected {
            self.target.abort();
            return Err(OtaError::FinalizeFailed(FlashFault::Incomplete {
                written: self.written,
                expected: self.expected,
            }));
        }

        self.target.finalize().map_err(OtaError::FinalizeFailed)?;
        Ok(hex_digest(self.hasher.finalize_reset().as_slice()))
    }
}

impl<F: FlashTarget> Drop for FlashSink<'_, F> {
    fn drop(&mut self) {
        if self.open {
            debug!("[ota] aborting unfinished flash session");
            self.target.abort();
        }
    }
}

pub(crate) fn hex_digest(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}
