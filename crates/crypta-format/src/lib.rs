//! Crypta format
//!
//! The byte-exact on-disk pieces of a crypta container: the 512-byte volume
//! header and its CRC framing, the four fixed header slots, and the keyfile
//! digest that is mixed into a passphrase before key derivation.
//!
//! Everything multi-byte on disk is big-endian. The container format is
//! compatible with TrueCrypt 7.1a volumes.

pub mod header;
pub mod keyfile;
pub mod layout;

pub use header::{HeaderFlags, VolumeHeader, VolumeKind};
pub use layout::HeaderSlot;

/// Total size of a header slot and of the decrypted header plaintext.
pub const HEADER_LEN: usize = 512;

/// Salt bytes at the front of every header slot.
pub const SALT_LEN: usize = 64;

/// Encrypted bytes following the salt. The last 64 bytes of the header
/// plaintext are never stored.
pub const ENC_HEADER_LEN: usize = HEADER_LEN - SALT_LEN;

/// Errors from the format layer.
///
/// `BadMagic`/`BadCrc`/`UnsupportedVersion` are expected rejections inside
/// the mount try-all loop and are deliberately cheap: no logging, no
/// formatting, no allocation.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The candidate plaintext does not start with the expected magic.
    #[error("header magic mismatch")]
    BadMagic,

    /// One of the two header CRCs does not verify.
    #[error("header checksum mismatch")]
    BadCrc,

    /// The format version is outside the recognised range.
    #[error("unsupported header version")]
    UnsupportedVersion,

    /// The sector size field is not a power of two in 512..=4096.
    #[error("invalid sector size in header")]
    InvalidSectorSize,

    /// Keyfile processing failed at the filesystem level.
    #[error("keyfile error: {0}")]
    Keyfile(#[from] std::io::Error),
}
