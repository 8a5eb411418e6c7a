//! Fixed container layout.
//!
//! Four 512-byte header slots at absolute offsets, a 128 KiB reserved area
//! at each end of the container, and the data area in between. These
//! constants are the compatibility contract with existing volumes.

use crate::header::VolumeKind;

/// Granularity of the header area: each logical header owns a 64 KiB band
/// even though only the first 512 bytes are used.
pub const HEADER_GROUP_LEN: u64 = 65_536;

/// Reserved bytes at the front of the container (outer + hidden header
/// bands).
pub const FRONT_RESERVED_LEN: u64 = 2 * HEADER_GROUP_LEN;

/// Reserved bytes at the back of the container (backup header bands).
pub const BACK_RESERVED_LEN: u64 = 2 * HEADER_GROUP_LEN;

/// Byte offset of the data area in containers this implementation creates.
pub const DATA_AREA_OFFSET: u64 = FRONT_RESERVED_LEN;

/// Smallest container that still has room for all four header bands plus
/// one data sector.
pub const MIN_CONTAINER_LEN: u64 = FRONT_RESERVED_LEN + BACK_RESERVED_LEN + 512;

/// Data area length for a container of `total` bytes, as laid out by
/// [`DATA_AREA_OFFSET`].
pub fn data_area_len(total: u64) -> u64 {
    total.saturating_sub(FRONT_RESERVED_LEN + BACK_RESERVED_LEN)
}

/// One of the four fixed header positions in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSlot {
    PrimaryOuter,
    PrimaryHidden,
    BackupOuter,
    BackupHidden,
}

impl HeaderSlot {
    pub const ALL: [HeaderSlot; 4] = [
        HeaderSlot::PrimaryOuter,
        HeaderSlot::PrimaryHidden,
        HeaderSlot::BackupOuter,
        HeaderSlot::BackupHidden,
    ];

    /// Absolute byte offset of the slot in a container of `total_size`
    /// bytes.
    pub fn offset(&self, total_size: u64) -> u64 {
        match self {
            HeaderSlot::PrimaryOuter => 0,
            HeaderSlot::PrimaryHidden => HEADER_GROUP_LEN,
            HeaderSlot::BackupOuter => total_size - 2 * HEADER_GROUP_LEN,
            HeaderSlot::BackupHidden => total_size - HEADER_GROUP_LEN,
        }
    }

    pub fn kind(&self) -> VolumeKind {
        match self {
            HeaderSlot::PrimaryOuter | HeaderSlot::BackupOuter => VolumeKind::Outer,
            HeaderSlot::PrimaryHidden | HeaderSlot::BackupHidden => VolumeKind::Hidden,
        }
    }

    pub fn is_backup(&self) -> bool {
        matches!(self, HeaderSlot::BackupOuter | HeaderSlot::BackupHidden)
    }

    /// The slot to read when mounting `kind`, honouring the backup-header
    /// mount flag.
    pub fn for_mount(kind: VolumeKind, use_backup: bool) -> Self {
        match (kind, use_backup) {
            (VolumeKind::Outer, false) => HeaderSlot::PrimaryOuter,
            (VolumeKind::Outer, true) => HeaderSlot::BackupOuter,
            (VolumeKind::Hidden, false) => HeaderSlot::PrimaryHidden,
            (VolumeKind::Hidden, true) => HeaderSlot::BackupHidden,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_offsets_match_the_format() {
        let total = 20 * 1024 * 1024;
        assert_eq!(HeaderSlot::PrimaryOuter.offset(total), 0);
        assert_eq!(HeaderSlot::PrimaryHidden.offset(total), 65_536);
        assert_eq!(HeaderSlot::BackupOuter.offset(total), total - 131_072);
        assert_eq!(HeaderSlot::BackupHidden.offset(total), total - 65_536);
    }

    #[test]
    fn data_area_excludes_both_reserved_ends() {
        assert_eq!(data_area_len(10 * 1024 * 1024), 10 * 1024 * 1024 - 262_144);
        assert_eq!(data_area_len(1024), 0);
    }

    #[test]
    fn mount_slot_selection() {
        assert_eq!(
            HeaderSlot::for_mount(VolumeKind::Outer, false),
            HeaderSlot::PrimaryOuter
        );
        assert_eq!(
            HeaderSlot::for_mount(VolumeKind::Hidden, true),
            HeaderSlot::BackupHidden
        );
        for slot in HeaderSlot::ALL {
            assert_eq!(HeaderSlot::for_mount(slot.kind(), slot.is_backup()), slot);
        }
    }
}
