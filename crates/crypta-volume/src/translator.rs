//! The sector I/O translator.
//!
//! This is the keyed read/write surface the storage-server front-end calls
//! into: block-device byte offsets in, cascade/XTS transforms against the
//! backend out. It also enforces the read-only and hidden-protection
//! policies, so nothing above it has to know they exist.
//!
//! XTS sector numbers are relative to the master-key scope: the first
//! sector of the scope is sector 0. Changing that breaks existing volumes.

use std::ops::Range;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crypta_crypto::Cascade;
use zeroize::Zeroize;

use crate::backend::Backend;
use crate::VolumeError;

/// Live I/O counters, updated after each successful operation. The
/// front-end polls them for idle detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

pub struct SectorIo {
    backend: Backend,
    cascade: Cascade,
    scope_start: u64,
    scope_len: u64,
    sector_size: u32,
    read_only: bool,
    /// Absolute container byte range of the protected hidden volume.
    hidden_range: Option<Range<u64>>,
    protection_triggered: AtomicBool,
    total_read: AtomicU64,
    total_written: AtomicU64,
    // Reads share, writes exclude. Lock order: this before any backend
    // state; never taken while holding the entropy-pool lock.
    lock: RwLock<()>,
}

impl SectorIo {
    pub fn new(
        backend: Backend,
        cascade: Cascade,
        scope_start: u64,
        scope_len: u64,
        sector_size: u32,
        read_only: bool,
        hidden_range: Option<Range<u64>>,
    ) -> Self {
        Self {
            backend,
            cascade,
            scope_start,
            scope_len,
            sector_size,
            read_only,
            hidden_range,
            protection_triggered: AtomicBool::new(false),
            total_read: AtomicU64::new(0),
            total_written: AtomicU64::new(0),
            lock: RwLock::new(()),
        }
    }

    /// Usable volume size in bytes (the master-key scope length).
    pub fn volume_size_bytes(&self) -> u64 {
        self.scope_len
    }

    pub fn sector_size_bytes(&self) -> u32 {
        self.sector_size
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Whether a write has ever hit the protected hidden range.
    pub fn protection_triggered(&self) -> bool {
        self.protection_triggered.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> IoCounters {
        IoCounters {
            bytes_read: self.total_read.load(Ordering::Relaxed),
            bytes_written: self.total_written.load(Ordering::Relaxed),
        }
    }

    /// Reads `buf.len()` bytes of plaintext starting at volume byte
    /// `offset`. Offset and length must be sector-aligned.
    pub fn read_sectors(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        self.check_request(offset, buf.len())?;
        let _shared = self.lock.read().unwrap();
        self.backend.read_at(self.scope_start + offset, buf)?;
        self.cascade.decrypt_area(
            buf,
            self.sector_size as usize,
            offset / self.sector_size as u64,
        );
        self.total_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Encrypts and writes `data` at volume byte `offset`. Refused on
    /// read-only mounts; refused (and remembered) when the range touches a
    /// protected hidden volume.
    pub fn write_sectors(&self, offset: u64, data: &[u8]) -> Result<(), VolumeError> {
        self.check_request(offset, data.len())?;
        if self.read_only {
            return Err(VolumeError::ReadOnly);
        }
        if self.protection_triggered.load(Ordering::Acquire) {
            return Err(VolumeError::HiddenProtection);
        }

        let abs = self.scope_start + offset;
        if let Some(hidden) = &self.hidden_range {
            if abs < hidden.end && abs + data.len() as u64 > hidden.start {
                // One stray write means the host filesystem already saw a
                // damaged outer view; everything after this is refused too.
                self.protection_triggered.store(true, Ordering::Release);
                log::warn!("write at volume offset {offset} overlaps the hidden volume; write protection engaged");
                return Err(VolumeError::HiddenProtection);
            }
        }

        let mut ciphertext = data.to_vec();
        self.cascade.encrypt_area(
            &mut ciphertext,
            self.sector_size as usize,
            offset / self.sector_size as u64,
        );

        let _exclusive = self.lock.write().unwrap();
        let res = self.backend.write_at(abs, &ciphertext);
        ciphertext.zeroize();
        res?;
        self.total_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes the backend (COMMIT / SYNCHRONIZE CACHE path).
    pub fn sync(&self) -> Result<(), VolumeError> {
        let _shared = self.lock.read().unwrap();
        self.backend.sync()
    }

    fn check_request(&self, offset: u64, len: usize) -> Result<(), VolumeError> {
        let ss = self.sector_size as u64;
        if offset % ss != 0 || len as u64 % ss != 0 {
            return Err(VolumeError::Misaligned);
        }
        let end = offset
            .checked_add(len as u64)
            .ok_or(VolumeError::OutOfRange)?;
        if end > self.scope_len {
            return Err(VolumeError::OutOfRange);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypta_crypto::CascadeId;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;

    const SS: u64 = 512;

    fn scratch_container(dir: &tempfile::TempDir, len: usize) -> PathBuf {
        let path = dir.path().join("blob");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        path
    }

    fn translator(
        dir: &tempfile::TempDir,
        read_only: bool,
        hidden: Option<Range<u64>>,
    ) -> SectorIo {
        let path = scratch_container(dir, 1 << 20);
        let backend = Backend::open(&path, true).unwrap();
        let material: [u8; 64] = std::array::from_fn(|i| i as u8 ^ 0x33);
        let cascade = Cascade::with_key_material(CascadeId::Aes, &material).unwrap();
        SectorIo::new(backend, cascade, 4096, (1 << 20) - 8192, 512, read_only, hidden)
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let io = translator(&dir, false, None);
        let data = vec![0xC7u8; 2 * SS as usize];
        io.write_sectors(3 * SS, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        io.read_sectors(3 * SS, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(
            io.counters(),
            IoCounters {
                bytes_read: 2 * SS,
                bytes_written: 2 * SS
            }
        );
    }

    #[test]
    fn ciphertext_lands_at_scope_offset() {
        let dir = tempfile::tempdir().unwrap();
        let io = translator(&dir, false, None);
        let data = vec![0x5Au8; SS as usize];
        io.write_sectors(0, &data).unwrap();

        // The backing bytes at scope start must be ciphertext, not the
        // plaintext pattern and not zeros.
        let mut raw = vec![0u8; SS as usize];
        io.backend.read_at(4096, &mut raw).unwrap();
        assert_ne!(raw, data);
        assert_ne!(raw, vec![0u8; SS as usize]);
    }

    #[test]
    fn misaligned_and_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let io = translator(&dir, false, None);
        let mut buf = vec![0u8; SS as usize];
        assert!(matches!(
            io.read_sectors(100, &mut buf),
            Err(VolumeError::Misaligned)
        ));
        assert!(matches!(
            io.read_sectors(0, &mut vec![0u8; 100]),
            Err(VolumeError::Misaligned)
        ));
        let vol = io.volume_size_bytes();
        assert!(matches!(
            io.read_sectors(vol, &mut buf),
            Err(VolumeError::OutOfRange)
        ));
    }

    #[test]
    fn read_only_blocks_writes_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let io = translator(&dir, true, None);
        let err = io.write_sectors(0, &vec![1u8; SS as usize]).unwrap_err();
        assert!(matches!(err, VolumeError::ReadOnly));

        let mut buf = vec![0xFFu8; SS as usize];
        io.read_sectors(0, &mut buf).unwrap();

        let mut raw = vec![0xFFu8; SS as usize];
        io.backend.read_at(4096, &mut raw).unwrap();
        assert_eq!(raw, vec![0u8; SS as usize], "backend must stay untouched");
    }

    #[test]
    fn hidden_protection_triggers_and_latches() {
        let dir = tempfile::tempdir().unwrap();
        // Hidden volume occupies absolute bytes [64 KiB, 128 KiB).
        let io = translator(&dir, false, Some(65_536..131_072));
        let data = vec![0x11u8; SS as usize];

        // Below the hidden range: allowed.
        io.write_sectors(0, &data).unwrap();
        assert!(!io.protection_triggered());

        // Overlapping (volume offset 61440 + scope_start 4096 = 65536):
        let before: Vec<u8> = {
            let mut raw = vec![0u8; 512];
            io.backend.read_at(65_536, &mut raw).unwrap();
            raw
        };
        let err = io.write_sectors(61_440, &data).unwrap_err();
        assert!(matches!(err, VolumeError::HiddenProtection));
        assert!(io.protection_triggered());

        let mut after = vec![0u8; 512];
        io.backend.read_at(65_536, &mut after).unwrap();
        assert_eq!(before, after, "hidden bytes must be unchanged");

        // Latched: even a safe write is now refused.
        let err = io.write_sectors(0, &data).unwrap_err();
        assert!(matches!(err, VolumeError::HiddenProtection));

        // Reads keep working.
        let mut buf = vec![0u8; SS as usize];
        io.read_sectors(0, &mut buf).unwrap();
        assert_eq!(buf, data);
    }
}
