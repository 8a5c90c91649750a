/*! Firmware image streaming.

The flash protocol is plain: erase room for the image, then write it
in fixed 384 byte chunks at increasing offsets, then jump to the
bootloader, which copies the image over and resets. Chunks that are
all `0xFF` are skipped, since that is what erased flash already reads
as; sparse images upload much faster that way.

Compression is not done here. When the caller asks for LZO, the chunks
the [`Firmware`] source hands out must already be compressed; the
uploader only sends them under the LZO command id.
*/
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::controller::Controller;
use crate::{Error, Result};

/// Firmware chunk size in bytes.
pub const CHUNK_SIZE: usize = 384;

/// How often upload progress is reported.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// A source of firmware data, consumed chunk by chunk.
pub trait Firmware {
    /// Total image size in bytes, for the erase request.
    fn total_size(&self) -> u32;

    /// Bytes not yet handed out.
    fn remaining(&self) -> usize;

    /// Chunk granularity. The last chunk may be shorter.
    fn chunk_size(&self) -> usize {
        CHUNK_SIZE
    }

    /// Hand out the next chunk.
    fn next_chunk(&mut self) -> Vec<u8>;

    /// Percentage complete once `offset` bytes are on the device.
    fn progress(&self, offset: usize) -> f64 {
        if self.total_size() == 0 {
            100.0
        } else {
            100.0 * offset as f64 / f64::from(self.total_size())
        }
    }
}

/// A firmware image held in memory.
pub struct ImageFirmware {
    data: Vec<u8>,
    pos: usize,
}

impl ImageFirmware {
    /// Wrap an image.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Load an image from disk.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }
}

impl Firmware for ImageFirmware {
    fn total_size(&self) -> u32 {
        self.data.len() as u32
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn next_chunk(&mut self) -> Vec<u8> {
        let end = (self.pos + CHUNK_SIZE).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        chunk
    }
}

/// Progress notifications from [`upload`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UploadEvent {
    /// The erase request is on its way.
    Erasing,
    /// Another slice of the image is on the device.
    Progress {
        /// Flash offset reached.
        offset: usize,
        /// Percentage complete.
        percent: f64,
    },
    /// The device rejected the erase request.
    EraseFailed,
    /// The device rejected a data chunk.
    FlashingFailed,
    /// Upload complete, jumping to the bootloader.
    Rebooting,
}

/// Stream a firmware image to the device.
///
/// Returns `Ok(false)` when the device rejects the erase or a write,
/// after reporting the stage through `progress`; transport failures
/// are returned as errors. On success the controller's heartbeat is
/// stopped and the device is told to reboot into the bootloader, so
/// the controller is no longer usable afterwards.
pub fn upload<F>(
    ctl: &mut Controller,
    fw: &mut dyn Firmware,
    use_lzo: bool,
    mut progress: F,
) -> Result<bool>
where
    F: FnMut(UploadEvent),
{
    info!("erasing {} bytes of flash", fw.total_size());
    progress(UploadEvent::Erasing);
    match ctl.erase_new_app(fw.total_size()) {
        Ok(()) => {}
        Err(Error::FirmwareEraseFailed) => {
            error!("device rejected the erase request");
            progress(UploadEvent::EraseFailed);
            return Ok(false);
        }
        Err(e) => return Err(e),
    }

    info!("sending firmware");
    let mut offset = 0usize;
    let mut last_report = Instant::now();
    while fw.remaining() > 0 {
        let chunk = fw.next_chunk();
        // Erased flash reads all ones already.
        if chunk.iter().any(|&b| b != 0xff) {
            let res = if use_lzo {
                ctl.write_new_app_data_lzo(offset as u32, &chunk)
            } else {
                ctl.write_new_app_data(offset as u32, &chunk)
            };
            match res {
                Ok(()) => {}
                Err(Error::FirmwareWriteFailed) => {
                    error!("device rejected chunk at offset {offset}");
                    progress(UploadEvent::FlashingFailed);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        offset += fw.chunk_size();

        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            let percent = fw.progress(offset);
            info!("progress: {percent:.2}%, {offset} bytes");
            progress(UploadEvent::Progress { offset, percent });
        }
    }

    info!("firmware upload complete, jumping to bootloader");
    progress(UploadEvent::Rebooting);
    // The device resets as soon as this lands; a lost reply or a
    // half-closed port here is expected.
    if let Err(e) = ctl.jump_to_bootloader() {
        warn!("bootloader jump went unacknowledged: {e}");
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_chunking() {
        let mut fw = ImageFirmware::new(vec![0xab; CHUNK_SIZE + 10]);
        assert_eq!(fw.total_size(), (CHUNK_SIZE + 10) as u32);
        assert_eq!(fw.remaining(), CHUNK_SIZE + 10);
        assert_eq!(fw.next_chunk().len(), CHUNK_SIZE);
        assert_eq!(fw.remaining(), 10);
        assert_eq!(fw.next_chunk().len(), 10);
        assert_eq!(fw.remaining(), 0);
    }

    #[test]
    fn progress_percentage() {
        let fw = ImageFirmware::new(vec![0; 1000]);
        assert_eq!(fw.progress(0), 0.0);
        assert_eq!(fw.progress(500), 50.0);
        let empty = ImageFirmware::new(vec![]);
        assert_eq!(empty.progress(0), 100.0);
    }

    #[test]
    fn image_from_file() -> anyhow::Result<()> {
        use std::io::Write;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fw.bin");
        let mut f = std::fs::File::create(&path)?;
        f.write_all(&[1, 2, 3, 4])?;
        drop(f);
        let fw = ImageFirmware::from_file(&path)?;
        assert_eq!(fw.total_size(), 4);
        Ok(())
    }
}
