//! Byte-addressable backends over a container file or a raw block device.
//!
//! Files map `read_at`/`write_at` directly. Raw devices only accept
//! sector-aligned transfers, so byte ranges are translated to aligned spans
//! with read-modify-write emulation on the write path.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::VolumeError;

#[cfg(target_os = "linux")]
mod ioctl {
    // BLKGETSIZE64 is _IOR(0x12, 114, u64); BLKSSZGET predates the ioctl
    // encoding scheme and keeps its bare number.
    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
    nix::ioctl_read_bad!(blksszget, 0x1268, std::os::raw::c_int);
}

/// A container backend. Owned exclusively by one mounted volume (or one
/// create/header operation); the OS handle closes with it on every exit
/// path, panics included.
pub enum Backend {
    File(FileBackend),
    Device(DeviceBackend),
}

pub struct FileBackend {
    path: PathBuf,
    file: File,
    len: u64,
}

pub struct DeviceBackend {
    path: PathBuf,
    file: File,
    len: u64,
    sector_size: u32,
}

impl Backend {
    /// Opens an existing container, classifying it as a file or raw device.
    pub fn open(path: &Path, writable: bool) -> Result<Self, VolumeError> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        Self::from_file(path, file)
    }

    /// Wraps an already-created file (volume creation path).
    pub fn from_file(path: &Path, file: File) -> Result<Self, VolumeError> {
        let meta = file.metadata()?;
        if meta.file_type().is_block_device() {
            let (len, sector_size) = device_geometry(&file)?;
            log::debug!(
                "opened device backend {}: {len} bytes, {sector_size}-byte sectors",
                path.display()
            );
            Ok(Backend::Device(DeviceBackend {
                path: path.to_path_buf(),
                file,
                len,
                sector_size,
            }))
        } else {
            let len = meta.len();
            Ok(Backend::File(FileBackend {
                path: path.to_path_buf(),
                file,
                len,
            }))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Backend::File(b) => &b.path,
            Backend::Device(b) => &b.path,
        }
    }

    /// Total backend length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Backend::File(b) => b.len,
            Backend::Device(b) => b.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Backend::Device(_))
    }

    /// The device's native sector size; 512 for plain files.
    pub fn device_sector_size(&self) -> u32 {
        match self {
            Backend::File(_) => 512,
            Backend::Device(b) => b.sector_size,
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        self.check_span(offset, buf.len())?;
        match self {
            Backend::File(b) => b.file.read_exact_at(buf, offset)?,
            Backend::Device(b) => b.read_aligned(offset, buf)?,
        }
        Ok(())
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), VolumeError> {
        self.check_span(offset, buf.len())?;
        match self {
            Backend::File(b) => b.file.write_all_at(buf, offset)?,
            Backend::Device(b) => b.write_aligned(offset, buf)?,
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<(), VolumeError> {
        let file = match self {
            Backend::File(b) => &b.file,
            Backend::Device(b) => &b.file,
        };
        file.sync_all()?;
        Ok(())
    }

    fn check_span(&self, offset: u64, len: usize) -> Result<(), VolumeError> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(VolumeError::OutOfRange)?;
        if end > self.len() {
            return Err(VolumeError::OutOfRange);
        }
        Ok(())
    }
}

impl DeviceBackend {
    fn read_aligned(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        let ss = self.sector_size as u64;
        if offset % ss == 0 && buf.len() as u64 % ss == 0 {
            self.file.read_exact_at(buf, offset)?;
            return Ok(());
        }
        let (span_start, span) = self.aligned_span(offset, buf.len());
        let mut scratch = vec![0u8; span];
        self.file.read_exact_at(&mut scratch, span_start)?;
        let head = (offset - span_start) as usize;
        buf.copy_from_slice(&scratch[head..head + buf.len()]);
        Ok(())
    }

    fn write_aligned(&self, offset: u64, buf: &[u8]) -> Result<(), VolumeError> {
        let ss = self.sector_size as u64;
        if offset % ss == 0 && buf.len() as u64 % ss == 0 {
            self.file.write_all_at(buf, offset)?;
            return Ok(());
        }
        // Read-modify-write over the covering aligned span.
        let (span_start, span) = self.aligned_span(offset, buf.len());
        let mut scratch = vec![0u8; span];
        self.file.read_exact_at(&mut scratch, span_start)?;
        let head = (offset - span_start) as usize;
        scratch[head..head + buf.len()].copy_from_slice(buf);
        self.file.write_all_at(&scratch, span_start)?;
        Ok(())
    }

    /// Smallest sector-aligned `(start, len)` covering `[offset, offset+len)`.
    fn aligned_span(&self, offset: u64, len: usize) -> (u64, usize) {
        let ss = self.sector_size as u64;
        let start = offset / ss * ss;
        let end = (offset + len as u64).div_ceil(ss) * ss;
        (start, (end - start) as usize)
    }
}

#[cfg(target_os = "linux")]
fn device_geometry(file: &File) -> io::Result<(u64, u32)> {
    use std::os::fd::AsRawFd;

    let fd = file.as_raw_fd();
    let mut len: u64 = 0;
    let mut sector: std::os::raw::c_int = 0;
    unsafe {
        ioctl::blkgetsize64(fd, &mut len).map_err(io::Error::from)?;
        ioctl::blksszget(fd, &mut sector).map_err(io::Error::from)?;
    }
    Ok((len, sector.max(512) as u32))
}

#[cfg(not(target_os = "linux"))]
fn device_geometry(file: &File) -> io::Result<(u64, u32)> {
    Ok((file.metadata()?.len(), 512))
}
