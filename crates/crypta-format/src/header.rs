//! The 512-byte volume header.
//!
//! [`RawHeader`] is the wire layout; [`VolumeHeader`] is the validated view
//! the volume engine works with. Serialization always zeroes the reserved
//! regions and recomputes both CRCs; parsing verifies them.

use zerocopy::*;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{FormatError, HEADER_LEN};

/// Size of the master key material region.
pub const MASTER_KEY_LEN: usize = 256;

/// Recognised format versions.
pub const MIN_VERSION: u16 = 0x0002;
pub const MAX_VERSION: u16 = 0x0005;

/// Version written into newly created headers.
pub const CURRENT_VERSION: u16 = 0x0005;

/// Minimum program version required to read headers this codec writes.
pub const CURRENT_MIN_PROGRAM_VERSION: u16 = 0x0005;

/// Which of the two logical volumes a header describes. The magic doubles
/// as decryption validation: a wrong key never produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    Outer,
    Hidden,
}

impl VolumeKind {
    pub fn magic(&self) -> [u8; 4] {
        match self {
            VolumeKind::Outer => *b"TRUE",
            VolumeKind::Hidden => *b"HIDD",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VolumeKind::Outer => "outer",
            VolumeKind::Hidden => "hidden",
        }
    }
}

bitflags::bitflags! {
    /// Header flag bits. Only the user-modification bit is acted upon;
    /// everything else is carried through untouched so a rewrite (change
    /// password, header restore) preserves what another implementation may
    /// have stored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        const MODIFIED_BY_USER = 0x0000_0001;

        const _ = !0;
    }
}

/// On-disk header layout, 512 bytes, big-endian fields.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// `TRUE` or `HIDD`.
    magic: [u8; 4],
    version: U16<BigEndian>,
    min_program_version: U16<BigEndian>,
    /// CRC-32 of the master key material region.
    key_area_crc32: U32<BigEndian>,
    reserved0: [u8; 4],
    /// Microseconds since an arbitrary epoch; informational only.
    volume_ctime: U64<BigEndian>,
    header_ctime: U64<BigEndian>,
    /// Zero when the container has no hidden volume.
    hidden_volume_size: U64<BigEndian>,
    volume_size: U64<BigEndian>,
    /// Master-key scope: the encrypted byte range of the container.
    scope_start: U64<BigEndian>,
    scope_length: U64<BigEndian>,
    flags: U32<BigEndian>,
    sector_size: U32<BigEndian>,
    reserved1: [u8; 60],
    /// CRC-32 of bytes 0..132.
    header_crc32: U32<BigEndian>,
    master_key: [u8; MASTER_KEY_LEN],
    /// Zero on write, ignored on read; never stored on disk (the encrypted
    /// slot region ends at byte 448).
    reserved2: [u8; 120],
}

/// A validated, decrypted volume header.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VolumeHeader {
    #[zeroize(skip)]
    pub kind: VolumeKind,
    pub version: u16,
    pub min_program_version: u16,
    pub volume_ctime: u64,
    pub header_ctime: u64,
    pub hidden_volume_size: u64,
    pub volume_size: u64,
    pub scope_start: u64,
    pub scope_length: u64,
    #[zeroize(skip)]
    pub flags: HeaderFlags,
    pub sector_size: u32,
    pub master_key: [u8; MASTER_KEY_LEN],
}

impl VolumeHeader {
    /// Parses a decrypted 512-byte plaintext candidate.
    ///
    /// Checks, in order: magic for `kind`, the header CRC over bytes 0..132,
    /// the key-material CRC over bytes 136..392, the version range and the
    /// sector size. These rejections drive the mount try-all loop and stay
    /// off any slow path.
    pub fn parse(plaintext: &[u8; HEADER_LEN], kind: VolumeKind) -> Result<Self, FormatError> {
        let raw = RawHeader::ref_from_bytes(plaintext.as_slice())
            .expect("layout is exactly HEADER_LEN bytes");

        if raw.magic != kind.magic() {
            return Err(FormatError::BadMagic);
        }
        if crc32fast::hash(&plaintext[..132]) != raw.header_crc32.get() {
            return Err(FormatError::BadCrc);
        }
        if crc32fast::hash(&raw.master_key) != raw.key_area_crc32.get() {
            return Err(FormatError::BadCrc);
        }

        let version = raw.version.get();
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(FormatError::UnsupportedVersion);
        }

        let sector_size = raw.sector_size.get();
        if !(512..=4096).contains(&sector_size) || !sector_size.is_power_of_two() {
            return Err(FormatError::InvalidSectorSize);
        }

        Ok(Self {
            kind,
            version,
            min_program_version: raw.min_program_version.get(),
            volume_ctime: raw.volume_ctime.get(),
            header_ctime: raw.header_ctime.get(),
            hidden_volume_size: raw.hidden_volume_size.get(),
            volume_size: raw.volume_size.get(),
            scope_start: raw.scope_start.get(),
            scope_length: raw.scope_length.get(),
            flags: HeaderFlags::from_bits_retain(raw.flags.get()),
            sector_size,
            master_key: raw.master_key,
        })
    }

    /// Serializes to the 512-byte plaintext: reserved regions zeroed, both
    /// CRCs recomputed.
    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let raw = RawHeader {
            magic: self.kind.magic(),
            version: U16::new(self.version),
            min_program_version: U16::new(self.min_program_version),
            key_area_crc32: U32::new(crc32fast::hash(&self.master_key)),
            reserved0: [0; 4],
            volume_ctime: U64::new(self.volume_ctime),
            header_ctime: U64::new(self.header_ctime),
            hidden_volume_size: U64::new(self.hidden_volume_size),
            volume_size: U64::new(self.volume_size),
            scope_start: U64::new(self.scope_start),
            scope_length: U64::new(self.scope_length),
            flags: U32::new(self.flags.bits()),
            sector_size: U32::new(self.sector_size),
            reserved1: [0; 60],
            header_crc32: U32::new(0),
            master_key: self.master_key,
            reserved2: [0; 120],
        };

        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(raw.as_bytes());
        let crc = crc32fast::hash(&out[..132]);
        out[132..136].copy_from_slice(&crc.to_be_bytes());
        out
    }
}

impl std::fmt::Debug for VolumeHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        f.debug_struct("VolumeHeader")
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("volume_size", &self.volume_size)
            .field("scope_start", &self.scope_start)
            .field("scope_length", &self.scope_length)
            .field("hidden_volume_size", &self.hidden_volume_size)
            .field("sector_size", &self.sector_size)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
