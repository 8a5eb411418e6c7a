//! Header maintenance: credential changes, external backup and restore.
//!
//! All of these operate on an unmounted container. A credential change
//! keeps the master key, scope and flag bits (including foreign flag bits
//! another implementation may have set) and re-seals the header under fresh
//! salts; only the outer layer of the slot changes, so the data area is
//! untouched.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crypta_crypto::{CancelToken, KdfId};
use crypta_format::{HEADER_LEN, HeaderSlot, VolumeKind};

use crate::backend::Backend;
use crate::open::{Credentials, MountOptions, decrypt_slot, seal_header, try_all};
use crate::VolumeError;

/// Magic at the front of an external header backup file.
const BACKUP_MAGIC: &[u8; 8] = b"CRYPTAHB";

/// Re-seals a volume's headers under new credentials.
///
/// Finds which volume the old credentials open (hidden slots first, like
/// mounting), then rewrites that volume's primary and backup slots. The
/// KDF may be changed at the same time; the cascade and master key never
/// change here.
pub fn change_credentials(
    path: &Path,
    old: &Credentials,
    new: &Credentials,
    new_kdf: Option<KdfId>,
    options: &MountOptions,
    cancel: &CancelToken,
) -> Result<(), VolumeError> {
    crate::ensure_selftests()?;

    let backend = Backend::open(path, true)?;
    let total = backend.len();
    let old_mixed = old.mixed()?;

    let decrypted = match decrypt_slot(&backend, VolumeKind::Hidden, &old_mixed, options, cancel)? {
        Some(found) => found,
        None => decrypt_slot(&backend, VolumeKind::Outer, &old_mixed, options, cancel)?
            .ok_or(VolumeError::WrongCredentialsOrNotAVolume)?,
    };

    let kdf = new_kdf.unwrap_or(decrypted.kdf);
    let mut header = decrypted.header;
    header.header_ctime = super::create::timestamp_micros();

    let new_mixed = new.mixed()?;
    for use_backup in [false, true] {
        let slot = HeaderSlot::for_mount(header.kind, use_backup);
        let sealed = seal_header(&header, &new_mixed, kdf, decrypted.cascade)?;
        backend.write_at(slot.offset(total), &sealed)?;
    }
    backend.sync()?;
    log::info!("re-sealed {} headers of {}", header.kind.name(), path.display());
    Ok(())
}

/// Writes all four header slots to an external backup file.
///
/// The backup is raw slot content: without credentials it reveals nothing,
/// including whether a hidden volume exists.
pub fn backup_headers(path: &Path, to: &Path) -> Result<(), VolumeError> {
    let backend = Backend::open(path, false)?;
    let total = backend.len();

    let mut out = File::create(to)?;
    out.write_all(BACKUP_MAGIC)?;
    for slot in HeaderSlot::ALL {
        let mut bytes = [0u8; HEADER_LEN];
        backend.read_at(slot.offset(total), &mut bytes)?;
        out.write_all(&bytes)?;
    }
    out.sync_all()?;
    Ok(())
}

/// Restores all four header slots from an external backup file.
pub fn restore_headers_from_file(path: &Path, from: &Path) -> Result<(), VolumeError> {
    let mut input = File::open(from)?;
    let mut magic = [0u8; BACKUP_MAGIC.len()];
    input.read_exact(&mut magic)?;
    if &magic != BACKUP_MAGIC {
        return Err(VolumeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "not a crypta header backup file",
        )));
    }

    let backend = Backend::open(path, true)?;
    let total = backend.len();
    for slot in HeaderSlot::ALL {
        let mut bytes = [0u8; HEADER_LEN];
        input.read_exact(&mut bytes)?;
        backend.write_at(slot.offset(total), &bytes)?;
    }
    backend.sync()?;
    Ok(())
}

/// Restores the primary header slots from the container's own backup slots.
///
/// The credentials must open at least one backup slot first; copying
/// unverifiable bytes over the primaries would just spread corruption.
pub fn restore_headers_from_internal(
    path: &Path,
    credentials: &Credentials,
    options: &MountOptions,
    cancel: &CancelToken,
) -> Result<(), VolumeError> {
    crate::ensure_selftests()?;

    let backend = Backend::open(path, true)?;
    let total = backend.len();
    let mixed = credentials.mixed()?;

    let options = MountOptions {
        use_backup_headers: true,
        kdf: options.kdf,
        cascade: options.cascade,
        ..Default::default()
    };
    let verified = decrypt_slot(&backend, VolumeKind::Hidden, &mixed, &options, cancel)?.is_some()
        || decrypt_slot(&backend, VolumeKind::Outer, &mixed, &options, cancel)?.is_some();
    if !verified {
        return Err(VolumeError::WrongCredentialsOrNotAVolume);
    }

    for (backup, primary) in [
        (HeaderSlot::BackupOuter, HeaderSlot::PrimaryOuter),
        (HeaderSlot::BackupHidden, HeaderSlot::PrimaryHidden),
    ] {
        let mut bytes = [0u8; HEADER_LEN];
        backend.read_at(backup.offset(total), &mut bytes)?;
        backend.write_at(primary.offset(total), &bytes)?;
    }
    backend.sync()?;
    log::info!("restored primary headers of {} from internal backup", path.display());
    Ok(())
}

/// Checks whether `credentials` open either volume of `path`, without
/// mounting anything. Cheap sanity check after a maintenance operation.
pub fn verify_credentials(
    path: &Path,
    credentials: &Credentials,
    options: &MountOptions,
    cancel: &CancelToken,
) -> Result<bool, VolumeError> {
    let backend = Backend::open(path, false)?;
    let mixed = credentials.mixed()?;
    for kind in [VolumeKind::Hidden, VolumeKind::Outer] {
        let slot = HeaderSlot::for_mount(kind, options.use_backup_headers);
        let mut slot_bytes = [0u8; HEADER_LEN];
        backend.read_at(slot.offset(backend.len()), &mut slot_bytes)?;
        if try_all(&slot_bytes, kind, &mixed, options, cancel)?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}
