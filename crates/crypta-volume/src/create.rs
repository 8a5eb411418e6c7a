//! Volume creation.
//!
//! Lays out a fresh container: reserved header bands front and back, a
//! random-filled data area (unless quick formatting), and sealed headers in
//! the primary and backup slots. The unused hidden slots are filled with
//! pool randomness so a container without a hidden volume is byte-for-byte
//! indistinguishable from one with.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crypta_crypto::{CancelToken, Cascade, CascadeId, KdfId};
use crypta_format::header::{CURRENT_MIN_PROGRAM_VERSION, CURRENT_VERSION, VolumeHeader};
use crypta_format::layout::{DATA_AREA_OFFSET, MIN_CONTAINER_LEN, data_area_len};
use crypta_format::{HEADER_LEN, HeaderFlags, HeaderSlot, VolumeKind};
use zeroize::Zeroizing;

use crate::backend::Backend;
use crate::open::{Credentials, MountOptions, decrypt_slot, seal_header};
use crate::VolumeError;

/// Bytes of pool output drawn per fill iteration. The abort flag is
/// checked per sector, not per chunk.
const FILL_CHUNK: usize = 128 * 1024;

/// Creation parameters.
pub struct CreateOptions {
    /// Container size in bytes. Ignored for raw devices (the device size is
    /// used).
    pub size: u64,
    pub cascade: CascadeId,
    pub kdf: KdfId,
    pub sector_size: u32,
    /// Skip the random fill of the data area.
    pub quick_format: bool,
    /// Raw-device targets are refused unless the caller confirms.
    pub user_confirmed: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            size: 0,
            cascade: CascadeId::Aes,
            kdf: KdfId::Pbkdf2Sha512 { strengthened: true },
            sector_size: 512,
            quick_format: false,
            user_confirmed: false,
        }
    }
}

/// Creation progress, shared with a polling thread. `abort` is cooperative
/// and honoured per sector during the fill.
#[derive(Debug, Default)]
pub struct CreateProgress {
    done: AtomicU64,
    total: AtomicU64,
}

impl CreateProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(bytes_done, total_bytes)`.
    pub fn snapshot(&self) -> (u64, u64) {
        (self.done.load(Ordering::Relaxed), self.total.load(Ordering::Relaxed))
    }

    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn add(&self, bytes: u64) {
        self.done.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Creates an outer volume at `path`.
///
/// On abort the partial container file is unlinked; on a raw device the
/// header slots are wiped instead.
pub fn create_volume(
    path: &Path,
    credentials: &Credentials,
    options: &CreateOptions,
    progress: &CreateProgress,
    cancel: &CancelToken,
) -> Result<(), VolumeError> {
    crate::ensure_selftests()?;
    validate_sector_size(options.sector_size)?;

    let backend = open_target(path, options)?;
    let total = backend.len();
    if total < MIN_CONTAINER_LEN {
        return Err(VolumeError::ContainerTooSmall(total));
    }

    let scope_start = DATA_AREA_OFFSET;
    let scope_length = data_area_len(total) / options.sector_size as u64 * options.sector_size as u64;
    progress.set_total(if options.quick_format { 0 } else { scope_length });

    match build_volume(&backend, credentials, options, scope_start, scope_length, total, progress, cancel) {
        Ok(()) => {
            backend.sync()?;
            Ok(())
        }
        Err(err) => {
            discard_partial(&backend, path);
            Err(err)
        }
    }
}

fn build_volume(
    backend: &Backend,
    credentials: &Credentials,
    options: &CreateOptions,
    scope_start: u64,
    scope_length: u64,
    total: u64,
    progress: &CreateProgress,
    cancel: &CancelToken,
) -> Result<(), VolumeError> {
    let (cascade, master_key) = Cascade::generate(options.cascade)?;

    if !options.quick_format {
        random_fill(backend, &cascade, scope_start, scope_length, options.sector_size, progress, cancel)?;
    }

    let now = timestamp_micros();
    let header = VolumeHeader {
        kind: VolumeKind::Outer,
        version: CURRENT_VERSION,
        min_program_version: CURRENT_MIN_PROGRAM_VERSION,
        volume_ctime: now,
        header_ctime: now,
        hidden_volume_size: 0,
        volume_size: total,
        scope_start,
        scope_length,
        flags: HeaderFlags::empty(),
        sector_size: options.sector_size,
        master_key: *master_key,
    };

    let mixed = credentials.mixed()?;
    write_header_pair(backend, &header, &mixed, options.kdf, options.cascade, total)?;

    // No hidden volume yet: its slots get pool randomness, indistinguishable
    // from a sealed header.
    for slot in [HeaderSlot::PrimaryHidden, HeaderSlot::BackupHidden] {
        let mut noise = [0u8; HEADER_LEN];
        crypta_crypto::rng::random_bytes(&mut noise)?;
        backend.write_at(slot.offset(total), &noise)?;
    }
    Ok(())
}

/// Creates a hidden volume inside an existing outer container.
///
/// The outer credentials locate the outer scope; the hidden volume's data
/// occupies its tail (`start = outer_end - hidden_size`) and its sealed
/// headers land in the two hidden slots. The data area is not touched: a
/// non-quick outer format already left it uniformly random.
pub fn create_hidden_volume(
    path: &Path,
    outer_credentials: &Credentials,
    hidden_credentials: &Credentials,
    hidden_size: u64,
    options: &CreateOptions,
    cancel: &CancelToken,
) -> Result<(), VolumeError> {
    crate::ensure_selftests()?;
    validate_sector_size(options.sector_size)?;

    let backend = Backend::open(path, true)?;
    if backend.is_device() && !options.user_confirmed {
        return Err(VolumeError::DeviceNotConfirmed);
    }
    let total = backend.len();

    let outer_mixed = outer_credentials.mixed()?;
    let outer = decrypt_slot(&backend, VolumeKind::Outer, &outer_mixed, &MountOptions::default(), cancel)?
        .ok_or(VolumeError::WrongCredentialsOrNotAVolume)?;

    let sector_size = outer.header.sector_size;
    let outer_end = outer.header.scope_start + outer.header.scope_length;
    if hidden_size == 0
        || hidden_size % sector_size as u64 != 0
        || hidden_size >= outer.header.scope_length
    {
        return Err(VolumeError::OutOfRange);
    }

    let (_cascade, master_key) = Cascade::generate(options.cascade)?;
    let now = timestamp_micros();
    let header = VolumeHeader {
        kind: VolumeKind::Hidden,
        version: CURRENT_VERSION,
        min_program_version: CURRENT_MIN_PROGRAM_VERSION,
        volume_ctime: now,
        header_ctime: now,
        hidden_volume_size: hidden_size,
        volume_size: hidden_size,
        scope_start: outer_end - hidden_size,
        scope_length: hidden_size,
        flags: HeaderFlags::empty(),
        sector_size,
        master_key: *master_key,
    };

    let hidden_mixed = hidden_credentials.mixed()?;
    write_header_pair(&backend, &header, &hidden_mixed, options.kdf, options.cascade, total)?;
    backend.sync()?;
    log::info!(
        "created hidden volume: {hidden_size} bytes at the tail of {}",
        path.display()
    );
    Ok(())
}

/// Seals and writes a header to its primary and backup slots, each under a
/// fresh salt.
fn write_header_pair(
    backend: &Backend,
    header: &VolumeHeader,
    mixed_passphrase: &[u8],
    kdf: KdfId,
    cascade: CascadeId,
    total: u64,
) -> Result<(), VolumeError> {
    for use_backup in [false, true] {
        let slot = HeaderSlot::for_mount(header.kind, use_backup);
        let sealed = seal_header(header, mixed_passphrase, kdf, cascade)?;
        backend.write_at(slot.offset(total), &sealed)?;
    }
    Ok(())
}

fn random_fill(
    backend: &Backend,
    cascade: &Cascade,
    scope_start: u64,
    scope_length: u64,
    sector_size: u32,
    progress: &CreateProgress,
    cancel: &CancelToken,
) -> Result<(), VolumeError> {
    let sector = sector_size as usize;
    let mut chunk = Zeroizing::new(vec![0u8; FILL_CHUNK]);
    let mut done: u64 = 0;
    while done < scope_length {
        if cancel.is_cancelled() {
            return Err(VolumeError::Aborted);
        }
        let len = FILL_CHUNK.min((scope_length - done) as usize);
        let buf = &mut chunk[..len];
        crypta_crypto::rng::random_bytes(buf)?;
        for piece in buf.chunks_mut(sector) {
            if cancel.is_cancelled() {
                return Err(VolumeError::Aborted);
            }
            cascade.encrypt_area(piece, sector, done / sector_size as u64);
            backend.write_at(scope_start + done, piece)?;
            done += piece.len() as u64;
            progress.add(piece.len() as u64);
        }
    }
    Ok(())
}

fn open_target(path: &Path, options: &CreateOptions) -> Result<Backend, VolumeError> {
    let existing_device = path
        .metadata()
        .map(|m| {
            use std::os::unix::fs::FileTypeExt;
            m.file_type().is_block_device()
        })
        .unwrap_or(false);

    if existing_device {
        if !options.user_confirmed {
            return Err(VolumeError::DeviceNotConfirmed);
        }
        return Backend::open(path, true);
    }

    if options.size < MIN_CONTAINER_LEN {
        return Err(VolumeError::ContainerTooSmall(options.size));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(options.size)?;
    reserve(&file, options.size)?;
    Backend::from_file(path, file)
}

/// Full reservation: the container must not be sparse.
#[cfg(target_os = "linux")]
fn reserve(file: &std::fs::File, len: u64) -> Result<(), VolumeError> {
    use std::os::fd::AsFd;
    nix::fcntl::fallocate(file.as_fd(), nix::fcntl::FallocateFlags::empty(), 0, len as i64)
        .map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn reserve(file: &std::fs::File, len: u64) -> Result<(), VolumeError> {
    use std::os::unix::fs::FileExt;
    let zeros = vec![0u8; FILL_CHUNK];
    let mut off = 0u64;
    while off < len {
        let n = FILL_CHUNK.min((len - off) as usize);
        file.write_all_at(&zeros[..n], off)?;
        off += n as u64;
    }
    Ok(())
}

fn discard_partial(backend: &Backend, path: &Path) {
    if backend.is_device() {
        // Wipe the slots so a half-written device does not leak a mountable
        // header.
        let total = backend.len();
        for slot in HeaderSlot::ALL {
            let mut noise = [0u8; HEADER_LEN];
            if crypta_crypto::rng::random_bytes(&mut noise).is_ok() {
                let _ = backend.write_at(slot.offset(total), &noise);
            }
        }
    } else if let Err(err) = std::fs::remove_file(path) {
        log::warn!("could not remove partial container {}: {err}", path.display());
    }
}

pub(crate) fn timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn validate_sector_size(sector_size: u32) -> Result<(), VolumeError> {
    if !(512..=4096).contains(&sector_size) || !sector_size.is_power_of_two() {
        return Err(VolumeError::Misaligned);
    }
    Ok(())
}
