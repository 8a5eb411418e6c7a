//! Crypta volume
//!
//! The volume engine: opens and creates encrypted containers, owns the
//! block backend underneath them, and exposes the keyed sector translator
//! the storage-server front-end serves to the host filesystem driver.
//!
//! A mounted volume owns everything below it: the backend owns the OS
//! handle, the cascade owns the cipher schedules, and all key material is
//! wiped when the volume is dropped. The storage server only ever holds a
//! reference-counted handle to the translator, never the volume itself.

use std::sync::OnceLock;

use crypta_crypto::CryptoError;
use crypta_format::FormatError;

pub mod backend;
pub mod create;
pub mod headers;
pub mod open;
pub mod table;
pub mod translator;
pub mod volume;

pub use backend::Backend;
pub use create::{CreateOptions, CreateProgress, create_hidden_volume, create_volume};
pub use open::{Credentials, MountOptions, open_volume};
pub use table::MountTable;
pub use translator::SectorIo;
pub use volume::MountedVolume;

pub use crypta_crypto::{CancelToken, CascadeId, KdfId};
pub use crypta_format::{HeaderSlot, VolumeKind};

/// Errors surfaced by the volume engine.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    /// Header decryption exhausted every KDF and cascade. Whether the
    /// credentials are wrong or the file simply is not a volume is
    /// indistinguishable by design.
    #[error("wrong password, wrong keyfiles, or not a crypta volume")]
    WrongCredentialsOrNotAVolume,

    /// Write attempted on a read-only mount.
    #[error("volume is mounted read-only")]
    ReadOnly,

    /// Write range overlapped the protected hidden volume, or a previous
    /// one already did. The volume stays write-dead until dismounted.
    #[error("write would damage the protected hidden volume")]
    HiddenProtection,

    /// Translator request past the end of the volume.
    #[error("request is outside the volume")]
    OutOfRange,

    /// Translator request not aligned to the sector size.
    #[error("request is not sector-aligned")]
    Misaligned,

    /// The format caps passphrases at 64 bytes.
    #[error("passphrase exceeds {} bytes", crypta_format::keyfile::MAX_PASSPHRASE_LEN)]
    PassphraseTooLong,

    /// The container cannot hold four header bands and a data area.
    #[error("container too small: {0} bytes")]
    ContainerTooSmall(u64),

    /// Creating on a raw device needs the caller's explicit confirmation.
    #[error("refusing to write to a raw device without confirmation")]
    DeviceNotConfirmed,

    /// Cooperative cancellation; distinguished from failures so progress
    /// front-ends can report it as such.
    #[error("operation aborted")]
    Aborted,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Format(#[from] FormatError),

    /// Backend read or write failure. Surfaced to the front-end as an I/O
    /// error; does not by itself dismount the volume.
    #[error("container I/O: {0}")]
    Io(#[from] std::io::Error),
}

// Pass/fail of the one-time primitive self-tests. `None` = passed.
static SELFTEST_GATE: OnceLock<Option<&'static str>> = OnceLock::new();

/// Runs the primitive self-tests once per process. Every mount and create
/// path calls this first and refuses to touch a volume after a failure.
pub fn ensure_selftests() -> Result<(), VolumeError> {
    let gate = SELFTEST_GATE.get_or_init(|| match crypta_crypto::selftest::run_all_tests() {
        Ok(()) => None,
        Err(CryptoError::SelfTest(which)) => Some(which),
        Err(_) => Some("self-test harness"),
    });
    match gate {
        None => Ok(()),
        Some(which) => Err(VolumeError::Crypto(CryptoError::SelfTest(which))),
    }
}

/// Test hook: forces the self-test gate into a failed state if it has not
/// been evaluated yet.
#[doc(hidden)]
pub fn poison_selftests_for_tests(which: &'static str) -> bool {
    SELFTEST_GATE.set(Some(which)).is_ok()
}
