//! Mounting: the try-all header decryption state machine.
//!
//! A slot's 512 bytes are salt plus ciphertext; nothing identifies the KDF
//! or cascade that protects it, so mounting derives a candidate header key
//! for every KDF in [`KdfId::MOUNT_ORDER`] and attempts every cascade under
//! it until a decryption yields valid magic and CRCs. Exhaustion is
//! reported as one indistinguishable error: wrong credentials or not a
//! volume at all.

use std::path::{Path, PathBuf};

use crypta_crypto::{CancelToken, Cascade, CascadeId, KdfId};
use crypta_format::header::VolumeHeader;
use crypta_format::keyfile::{self, MAX_PASSPHRASE_LEN};
use crypta_format::layout::MIN_CONTAINER_LEN;
use crypta_format::{ENC_HEADER_LEN, FormatError, HEADER_LEN, HeaderSlot, SALT_LEN, VolumeKind};
use zeroize::Zeroizing;

use crate::backend::Backend;
use crate::translator::SectorIo;
use crate::volume::MountedVolume;
use crate::VolumeError;

/// Passphrase plus keyfile set. The passphrase buffer is wiped on drop.
#[derive(Clone)]
pub struct Credentials {
    pub passphrase: Zeroizing<Vec<u8>>,
    pub keyfiles: Vec<PathBuf>,
}

impl Credentials {
    pub fn new(passphrase: impl Into<Vec<u8>>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
            keyfiles: Vec::new(),
        }
    }

    pub fn with_keyfiles(mut self, keyfiles: Vec<PathBuf>) -> Self {
        self.keyfiles = keyfiles;
        self
    }

    /// The KDF input: passphrase with the keyfile digest folded in.
    pub(crate) fn mixed(&self) -> Result<Zeroizing<Vec<u8>>, VolumeError> {
        if self.passphrase.len() > MAX_PASSPHRASE_LEN {
            return Err(VolumeError::PassphraseTooLong);
        }
        Ok(keyfile::mix_into_passphrase(&self.passphrase, &self.keyfiles)?)
    }
}

/// Mount-time options.
#[derive(Default)]
pub struct MountOptions {
    /// Read the backup header slots at the end of the container instead of
    /// the primary ones.
    pub use_backup_headers: bool,
    pub read_only: bool,
    /// Credentials of the hidden volume to protect. Mounts the outer volume
    /// write-guarded against the hidden volume's byte range.
    pub protect_hidden: Option<Credentials>,
    /// Restrict the try-all loop to one KDF (the caller knows what the
    /// volume was created with). `None` tries the full order.
    pub kdf: Option<KdfId>,
    /// Restrict the try-all loop to one cascade.
    pub cascade: Option<CascadeId>,
}

/// A successfully decrypted header plus the pair that opened it.
pub(crate) struct DecryptedHeader {
    pub header: VolumeHeader,
    pub kdf: KdfId,
    pub cascade: CascadeId,
}

/// Opens a container and mounts one of its volumes.
///
/// Without `protect_hidden`, the hidden slot is tried before the outer one
/// with the same credentials, so a hidden passphrase mounts the hidden
/// volume and an outer passphrase the outer. With `protect_hidden`, both
/// credential sets must open their volume and the result is the outer,
/// write-guarded.
pub fn open_volume(
    path: &Path,
    credentials: &Credentials,
    options: &MountOptions,
    cancel: &CancelToken,
) -> Result<MountedVolume, VolumeError> {
    crate::ensure_selftests()?;

    let backend = Backend::open(path, !options.read_only)?;
    let total = backend.len();
    if total < MIN_CONTAINER_LEN {
        return Err(VolumeError::ContainerTooSmall(total));
    }

    let mixed = credentials.mixed()?;
    crypta_crypto::rng::pool().lock().unwrap().stir_timing_jitter();

    let (decrypted, hidden_guard) = match &options.protect_hidden {
        Some(hidden_credentials) => {
            let outer = decrypt_slot(&backend, VolumeKind::Outer, &mixed, options, cancel)?
                .ok_or(VolumeError::WrongCredentialsOrNotAVolume)?;
            let hidden_mixed = hidden_credentials.mixed()?;
            let hidden = decrypt_slot(&backend, VolumeKind::Hidden, &hidden_mixed, options, cancel)?
                .ok_or(VolumeError::WrongCredentialsOrNotAVolume)?;
            let range =
                hidden.header.scope_start..hidden.header.scope_start + hidden.header.scope_length;
            (outer, Some(range))
        }
        None => {
            let found = match decrypt_slot(&backend, VolumeKind::Hidden, &mixed, options, cancel)? {
                Some(hidden) => hidden,
                None => decrypt_slot(&backend, VolumeKind::Outer, &mixed, options, cancel)?
                    .ok_or(VolumeError::WrongCredentialsOrNotAVolume)?,
            };
            (found, None)
        }
    };

    let header = &decrypted.header;
    log::info!(
        "mounted {} volume from {} ({} bytes, {}, {})",
        header.kind.name(),
        path.display(),
        header.scope_length,
        decrypted.cascade,
        decrypted.kdf,
    );

    let cascade = Cascade::with_key_material(decrypted.cascade, &header.master_key)?;
    let io = SectorIo::new(
        backend,
        cascade,
        header.scope_start,
        header.scope_length,
        header.sector_size,
        options.read_only,
        hidden_guard,
    );
    Ok(MountedVolume::new(
        path.to_path_buf(),
        header.kind,
        decrypted.kdf,
        decrypted.cascade,
        options.read_only,
        options.protect_hidden.is_some(),
        io,
    ))
}

/// Reads the slot for `kind` and runs the try-all loop over it.
///
/// `Ok(None)` means every KDF × cascade pair was exhausted; format
/// rejections (bad magic, bad CRC, version) are continue signals and never
/// escape. Only cancellation and resource failures propagate.
pub(crate) fn decrypt_slot(
    backend: &Backend,
    kind: VolumeKind,
    mixed_passphrase: &[u8],
    options: &MountOptions,
    cancel: &CancelToken,
) -> Result<Option<DecryptedHeader>, VolumeError> {
    let slot = HeaderSlot::for_mount(kind, options.use_backup_headers);
    let mut slot_bytes = [0u8; HEADER_LEN];
    backend.read_at(slot.offset(backend.len()), &mut slot_bytes)?;
    try_all(&slot_bytes, kind, mixed_passphrase, options, cancel)
}

/// The try-all core, over one slot's raw bytes.
pub(crate) fn try_all(
    slot_bytes: &[u8; HEADER_LEN],
    kind: VolumeKind,
    mixed_passphrase: &[u8],
    options: &MountOptions,
    cancel: &CancelToken,
) -> Result<Option<DecryptedHeader>, VolumeError> {
    let salt = &slot_bytes[..SALT_LEN];
    let ciphertext = &slot_bytes[SALT_LEN..];

    let kdfs: &[KdfId] = match &options.kdf {
        Some(kdf) => std::slice::from_ref(kdf),
        None => &KdfId::MOUNT_ORDER,
    };
    let cascades: &[CascadeId] = match &options.cascade {
        Some(cascade) => std::slice::from_ref(cascade),
        None => &CascadeId::ALL,
    };

    for &kdf in kdfs {
        // One derivation per distinct key-material length, shared by every
        // cascade of that length. Indexed by member count minus one.
        let mut derived: [Option<Zeroizing<Vec<u8>>>; 3] = [None, None, None];

        for &cascade_id in cascades {
            if cancel.is_cancelled() {
                return Err(VolumeError::Aborted);
            }

            let need = cascade_id.key_material_len();
            let slot_index = cascade_id.ciphers().len() - 1;
            if derived[slot_index].is_none() {
                let mut key = Zeroizing::new(vec![0u8; need]);
                // Derivation failures (RngUnavailable, InsufficientMemory)
                // are real errors, not continue signals.
                kdf.derive_key(mixed_passphrase, salt, &mut key)?;
                derived[slot_index] = Some(key);
            }
            let header_key = derived[slot_index].as_ref().unwrap();

            let cascade = Cascade::with_key_material(cascade_id, header_key)?;
            let mut plaintext = Zeroizing::new([0u8; HEADER_LEN]);
            plaintext[..ENC_HEADER_LEN].copy_from_slice(ciphertext);
            cascade.decrypt_area(&mut plaintext[..ENC_HEADER_LEN], HEADER_LEN, 0);

            match VolumeHeader::parse(&plaintext, kind) {
                Ok(header) => {
                    return Ok(Some(DecryptedHeader {
                        header,
                        kdf,
                        cascade: cascade_id,
                    }));
                }
                Err(
                    FormatError::BadMagic
                    | FormatError::BadCrc
                    | FormatError::UnsupportedVersion
                    | FormatError::InvalidSectorSize,
                ) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(None)
}

/// Encrypts a serialized header plaintext into slot form under fresh salt.
/// Shared by creation, change-password and header restore.
pub(crate) fn seal_header(
    header: &VolumeHeader,
    mixed_passphrase: &[u8],
    kdf: KdfId,
    cascade_id: CascadeId,
) -> Result<[u8; HEADER_LEN], VolumeError> {
    let mut slot = [0u8; HEADER_LEN];
    crypta_crypto::rng::random_bytes(&mut slot[..SALT_LEN])?;

    let mut header_key = Zeroizing::new(vec![0u8; cascade_id.key_material_len()]);
    kdf.derive_key(mixed_passphrase, &slot[..SALT_LEN], &mut header_key)?;
    let cascade = Cascade::with_key_material(cascade_id, &header_key)?;

    let plaintext = Zeroizing::new(header.serialize());
    slot[SALT_LEN..].copy_from_slice(&plaintext[..ENC_HEADER_LEN]);
    cascade.encrypt_area(&mut slot[SALT_LEN..], HEADER_LEN, 0);
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypta_format::header::{CURRENT_MIN_PROGRAM_VERSION, CURRENT_VERSION};
    use crypta_format::HeaderFlags;

    const KDF: KdfId = KdfId::Pbkdf2Sha512 { strengthened: false };

    fn sample_header(kind: VolumeKind) -> VolumeHeader {
        VolumeHeader {
            kind,
            version: CURRENT_VERSION,
            min_program_version: CURRENT_MIN_PROGRAM_VERSION,
            volume_ctime: 1,
            header_ctime: 2,
            hidden_volume_size: 0,
            volume_size: 1 << 21,
            scope_start: 131_072,
            scope_length: (1 << 21) - 262_144,
            flags: HeaderFlags::empty(),
            sector_size: 512,
            master_key: std::array::from_fn(|i| i as u8),
        }
    }

    fn options() -> MountOptions {
        MountOptions::default()
    }

    #[test]
    fn seal_then_try_all_recovers_the_header() {
        let header = sample_header(VolumeKind::Outer);
        let slot = seal_header(&header, b"passphrase", KDF, CascadeId::AesTwofish).unwrap();

        let found = try_all(&slot, VolumeKind::Outer, b"passphrase", &options(), &CancelToken::new())
            .unwrap()
            .expect("correct passphrase must decrypt");
        assert_eq!(found.kdf, KDF);
        assert_eq!(found.cascade, CascadeId::AesTwofish);
        assert_eq!(found.header.scope_start, header.scope_start);
        assert_eq!(found.header.master_key, header.master_key);
    }

    #[test]
    fn wrong_passphrase_exhausts_quietly() {
        let header = sample_header(VolumeKind::Outer);
        let slot = seal_header(&header, b"passphrase", KDF, CascadeId::Aes).unwrap();

        // Restrict to cheap KDFs; exhaustion must be Ok(None), not an error.
        let opts = MountOptions {
            kdf: Some(KDF),
            ..Default::default()
        };
        let found = try_all(&slot, VolumeKind::Outer, b"wrong", &opts, &CancelToken::new()).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn hidden_magic_does_not_open_as_outer() {
        let header = sample_header(VolumeKind::Hidden);
        let slot = seal_header(&header, b"pw", KDF, CascadeId::Aes).unwrap();
        let opts = MountOptions {
            kdf: Some(KDF),
            ..Default::default()
        };
        assert!(try_all(&slot, VolumeKind::Outer, b"pw", &opts, &CancelToken::new())
            .unwrap()
            .is_none());
        assert!(try_all(&slot, VolumeKind::Hidden, b"pw", &opts, &CancelToken::new())
            .unwrap()
            .is_some());
    }

    #[test]
    fn cancellation_aborts_the_loop() {
        let header = sample_header(VolumeKind::Outer);
        let slot = seal_header(&header, b"pw", KDF, CascadeId::Aes).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            try_all(&slot, VolumeKind::Outer, b"pw", &options(), &cancel),
            Err(VolumeError::Aborted)
        ));
    }

    #[test]
    fn deterministic_pair_selection() {
        let header = sample_header(VolumeKind::Outer);
        let slot = seal_header(&header, b"pw", KDF, CascadeId::Serpent).unwrap();
        let opts = MountOptions {
            kdf: Some(KDF),
            ..Default::default()
        };
        for _ in 0..3 {
            let found = try_all(&slot, VolumeKind::Outer, b"pw", &opts, &CancelToken::new())
                .unwrap()
                .unwrap();
            assert_eq!(found.cascade, CascadeId::Serpent);
            assert_eq!(found.kdf, KDF);
        }
    }
}
