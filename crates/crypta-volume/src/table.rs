//! The process-wide mount table.
//!
//! Each mounted volume occupies a numbered slot (1..=64) with its own
//! storage server. Volumes share nothing with each other; the table is
//! just the registry the CLI's `list` and `dismount --all` walk.

use std::path::PathBuf;
use std::sync::Mutex;

use crate::translator::IoCounters;
use crate::volume::MountedVolume;
use crate::VolumeError;

/// Highest slot number.
pub const MAX_SLOTS: usize = 64;

/// Snapshot of one table entry for listing.
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub slot: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub read_only: bool,
    pub counters: IoCounters,
}

#[derive(Default)]
pub struct MountTable {
    slots: Mutex<Vec<Option<MountedVolume>>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Inserts a volume into the lowest free slot and returns its number.
    pub fn insert(&self, mut volume: MountedVolume) -> Result<u32, VolumeError> {
        let mut slots = self.slots.lock().unwrap();
        if slots.is_empty() {
            slots.resize_with(MAX_SLOTS, || None);
        }
        let index = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or_else(|| {
                VolumeError::Io(std::io::Error::other("no free volume slots"))
            })?;
        let number = (index + 1) as u32;
        volume.set_slot(number);
        slots[index] = Some(volume);
        Ok(number)
    }

    /// Removes and returns the volume in `slot`, if any.
    pub fn remove(&self, slot: u32) -> Option<MountedVolume> {
        let mut slots = self.slots.lock().unwrap();
        let index = slot.checked_sub(1)? as usize;
        slots.get_mut(index)?.take()
    }

    /// Removes every mounted volume, highest slot first.
    pub fn drain(&self) -> Vec<MountedVolume> {
        let mut slots = self.slots.lock().unwrap();
        slots.iter_mut().rev().filter_map(Option::take).collect()
    }

    /// Finds the slot mounted from `path`.
    pub fn slot_for_path(&self, path: &std::path::Path) -> Option<u32> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .flatten()
            .find(|v| v.path() == path)
            .map(|v| v.slot())
    }

    pub fn list(&self) -> Vec<MountInfo> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .flatten()
            .map(|v| MountInfo {
                slot: v.slot(),
                path: v.path().to_path_buf(),
                size_bytes: v.size_bytes(),
                read_only: v.read_only(),
                counters: v.counters(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().unwrap().iter().all(Option::is_none)
    }
}
