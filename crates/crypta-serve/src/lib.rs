//! Crypta serve
//!
//! Presents a mounted volume to the operating system as a block of storage
//! an ordinary filesystem driver can mount. The POSIX transport is NFSv4
//! over loopback: the server binds an ephemeral TCP port on 127.0.0.1 and
//! the OS's own NFS client mounts `127.0.0.1:/` from it. The exported
//! namespace is three fixed filehandles: the root directory, the volume
//! file carrying the block contents, and an empty control file.
//!
//! One server serves one volume, on one dedicated event-loop thread, with a
//! classical poll loop: no async runtime, at most a few hundred protocol
//! operations per second, with latency dominated by crypto and disk.

use std::sync::Arc;

use crypta_volume::{SectorIo, VolumeError};

pub mod nfs;
pub mod rpc;
pub mod server;
pub mod xdr;

pub use server::{NfsServer, RunOutcome, ServerRunner, StopHandle};

/// Status of a block-device callback, the only vocabulary the protocol
/// layer shares with the volume engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    /// The handle no longer refers to a live volume.
    #[error("stale volume handle")]
    Stale,
    /// Backend read or write failure.
    #[error("volume I/O error")]
    Io,
    /// The volume is mounted read-only.
    #[error("volume is read-only")]
    ReadOnly,
    /// Hidden-volume protection refused the write.
    #[error("write refused by hidden-volume protection")]
    Access,
    /// Offset or length outside the volume, or misaligned.
    #[error("request outside the volume")]
    Range,
}

/// The block-device callback surface the server drives. Offsets and
/// lengths handed to `read_sectors`/`write_sectors` are multiples of
/// [`Self::sector_size`]; the server performs its own alignment emulation
/// for the byte-granular NFS operations.
pub trait BlockDevice: Send + Sync + 'static {
    fn read_sectors(&self, offset: u64, buf: &mut [u8]) -> Result<(), BlockError>;
    fn write_sectors(&self, offset: u64, data: &[u8]) -> Result<(), BlockError>;
    fn volume_size(&self) -> u64;
    fn sector_size(&self) -> u32;
    fn sync(&self) -> Result<(), BlockError>;
}

impl BlockDevice for crypta_volume::SectorIo {
    fn read_sectors(&self, offset: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        SectorIo::read_sectors(self, offset, buf).map_err(map_volume_error)
    }

    fn write_sectors(&self, offset: u64, data: &[u8]) -> Result<(), BlockError> {
        SectorIo::write_sectors(self, offset, data).map_err(map_volume_error)
    }

    fn volume_size(&self) -> u64 {
        self.volume_size_bytes()
    }

    fn sector_size(&self) -> u32 {
        self.sector_size_bytes()
    }

    fn sync(&self) -> Result<(), BlockError> {
        SectorIo::sync(self).map_err(map_volume_error)
    }
}

fn map_volume_error(err: VolumeError) -> BlockError {
    match err {
        VolumeError::ReadOnly => BlockError::ReadOnly,
        VolumeError::HiddenProtection => BlockError::Access,
        VolumeError::OutOfRange | VolumeError::Misaligned => BlockError::Range,
        _ => BlockError::Io,
    }
}

/// Sector-aligned adapter over a [`BlockDevice`] for byte-granular reads.
pub(crate) fn device_read(
    device: &Arc<dyn BlockDevice>,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>, BlockError> {
    let size = device.volume_size();
    if offset >= size {
        return Ok(Vec::new());
    }
    let len = len.min((size - offset) as usize);
    if len == 0 {
        return Ok(Vec::new());
    }

    let ss = device.sector_size() as u64;
    let start = offset / ss * ss;
    let end = (offset + len as u64).div_ceil(ss) * ss;
    let end = end.min(size / ss * ss).max(start);
    let span = (end - start) as usize;

    let mut scratch = vec![0u8; span];
    device.read_sectors(start, &mut scratch)?;
    let head = (offset - start) as usize;
    scratch.drain(..head);
    scratch.truncate(len);
    Ok(scratch)
}

/// Sector-aligned adapter over a [`BlockDevice`] for byte-granular writes.
/// Unaligned edges are read-modify-written.
pub(crate) fn device_write(
    device: &Arc<dyn BlockDevice>,
    offset: u64,
    data: &[u8],
) -> Result<usize, BlockError> {
    let size = device.volume_size();
    if offset >= size || data.is_empty() {
        return Ok(0);
    }
    let len = data.len().min((size - offset) as usize);
    let data = &data[..len];

    let ss = device.sector_size() as u64;
    let start = offset / ss * ss;
    let end = (offset + len as u64).div_ceil(ss) * ss;
    let end = end.min(size);
    let span = (end - start) as usize;

    if offset == start && len == span {
        device.write_sectors(offset, data)?;
        return Ok(len);
    }

    let mut scratch = vec![0u8; span];
    device.read_sectors(start, &mut scratch)?;
    let head = (offset - start) as usize;
    scratch[head..head + len].copy_from_slice(data);
    device.write_sectors(start, &scratch)?;
    Ok(len)
}


#[cfg(test)]
mod tests {
    use super::testutil::MemDevice;
    use super::*;

    #[test]
    fn byte_granular_read_and_write() {
        let dev = MemDevice::new(8192);
        let handle: Arc<dyn BlockDevice> = dev.clone();

        let written = device_write(&handle, 700, b"straddles sectors").unwrap();
        assert_eq!(written, 17);
        let back = device_read(&handle, 700, 17).unwrap();
        assert_eq!(back, b"straddles sectors");

        // Neighbouring bytes untouched by the RMW edges.
        let neighbour = device_read(&handle, 690, 10).unwrap();
        assert_eq!(neighbour, vec![0u8; 10]);
    }

    #[test]
    fn reads_past_the_end_are_clamped() {
        let handle: Arc<dyn BlockDevice> = MemDevice::new(4096);
        assert_eq!(device_read(&handle, 4096, 100).unwrap(), Vec::<u8>::new());
        assert_eq!(device_read(&handle, 4000, 200).unwrap().len(), 96);
    }
}
