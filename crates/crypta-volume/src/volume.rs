//! The live mounted-volume object.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crypta_crypto::{CancelToken, CascadeId, KdfId};
use crypta_format::VolumeKind;

use crate::translator::{IoCounters, SectorIo};
use crate::VolumeError;

/// A mounted volume: the translator (which owns the backend and the keyed
/// cascade), the parameters it was opened with, and its mount-table slot.
///
/// The storage server holds a clone of [`Self::translator`]; dismounting is
/// final only once the server has been stopped and joined so that clone is
/// gone and the key material with it.
pub struct MountedVolume {
    path: PathBuf,
    kind: VolumeKind,
    kdf: KdfId,
    cascade: CascadeId,
    read_only: bool,
    protect_hidden: bool,
    slot: u32,
    io: Arc<SectorIo>,
    stop: CancelToken,
}

impl MountedVolume {
    pub(crate) fn new(
        path: PathBuf,
        kind: VolumeKind,
        kdf: KdfId,
        cascade: CascadeId,
        read_only: bool,
        protect_hidden: bool,
        io: SectorIo,
    ) -> Self {
        Self {
            path,
            kind,
            kdf,
            cascade,
            read_only,
            protect_hidden,
            slot: 0,
            io: Arc::new(io),
            stop: CancelToken::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> VolumeKind {
        self.kind
    }

    pub fn kdf(&self) -> KdfId {
        self.kdf
    }

    pub fn cascade(&self) -> CascadeId {
        self.cascade
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn protect_hidden(&self) -> bool {
        self.protect_hidden
    }

    /// Whether the hidden-volume write guard has fired.
    pub fn protection_triggered(&self) -> bool {
        self.io.protection_triggered()
    }

    pub fn size_bytes(&self) -> u64 {
        self.io.volume_size_bytes()
    }

    pub fn counters(&self) -> IoCounters {
        self.io.counters()
    }

    /// Mount-table slot number, 0 before insertion.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub(crate) fn set_slot(&mut self, slot: u32) {
        self.slot = slot;
    }

    /// The shared translator handle for a storage server.
    pub fn translator(&self) -> Arc<SectorIo> {
        Arc::clone(&self.io)
    }

    /// The stop token shared with whoever drives this volume's server.
    pub fn stop_token(&self) -> CancelToken {
        self.stop.clone()
    }

    /// Tears the volume down: flushes the backend and drops the engine's
    /// translator handle. The caller must have stopped the storage server
    /// first; any handle it still holds keeps the keys alive until it is
    /// dropped, which is exactly the in-flight-write drain window.
    pub fn dismount(self) -> Result<(), VolumeError> {
        self.stop.cancel();
        let res = self.io.sync();
        log::info!("dismounted {}", self.path.display());
        // self.io drops here; once the last Arc clone goes, the cascade's
        // cipher schedules are wiped by their drop impls.
        res
    }
}

impl std::fmt::Debug for MountedVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedVolume")
            .field("path", &self.path)
            .field("slot", &self.slot)
            .field("read_only", &self.read_only)
            .field("protect_hidden", &self.protect_hidden)
            .field("size_bytes", &self.size_bytes())
            .finish_non_exhaustive()
    }
}
