//! XTS sector numbering is relative to the master-key scope, not to the
//! container. Existing volumes depend on this; these tests pin it against a
//! by-hand transform of the raw container bytes.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crypta::crypto::{Cascade, CascadeId, CipherId, XtsCipher};
use crypta::volume::{Backend, SectorIo};

const SCOPE_START: u64 = 131_072;
const SECTOR: usize = 512;

fn material() -> [u8; 64] {
    std::array::from_fn(|i| (i as u8).wrapping_mul(0x31).wrapping_add(5))
}

fn scratch(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("container");
    let mut f = File::create(&path).unwrap();
    f.write_all(&vec![0u8; 1 << 20]).unwrap();
    path
}

fn translator(path: &std::path::Path) -> SectorIo {
    let backend = Backend::open(path, true).unwrap();
    let cascade = Cascade::with_key_material(CascadeId::Aes, &material()).unwrap();
    SectorIo::new(
        backend,
        cascade,
        SCOPE_START,
        (1 << 20) - 2 * SCOPE_START,
        SECTOR as u32,
        false,
        None,
    )
}

#[test]
fn first_scope_sector_is_xts_sector_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch(&dir);
    let io = translator(&path);

    let sector0: [u8; SECTOR] = std::array::from_fn(|i| (i % 251) as u8);
    let sector1: [u8; SECTOR] = std::array::from_fn(|i| (i % 13) as u8);
    io.write_sectors(0, &sector0).unwrap();
    io.write_sectors(SECTOR as u64, &sector1).unwrap();
    drop(io);

    let raw = std::fs::read(&path).unwrap();
    let xts = XtsCipher::new(CipherId::Aes, &material()).unwrap();

    // Byte offset 0 of the volume sits at SCOPE_START and decrypts as XTS
    // sector 0, not sector SCOPE_START / SECTOR.
    let mut block = raw[SCOPE_START as usize..SCOPE_START as usize + SECTOR].to_vec();
    xts.decrypt_area(&mut block, SECTOR, 0);
    assert_eq!(block, sector0);

    let off = SCOPE_START as usize + SECTOR;
    let mut block = raw[off..off + SECTOR].to_vec();
    xts.decrypt_area(&mut block, SECTOR, 1);
    assert_eq!(block, sector1);

    // Decrypting with the absolute-offset numbering must NOT match.
    let mut wrong = raw[SCOPE_START as usize..SCOPE_START as usize + SECTOR].to_vec();
    xts.decrypt_area(&mut wrong, SECTOR, SCOPE_START / SECTOR as u64);
    assert_ne!(wrong, sector0);
}

#[test]
fn reopening_reads_what_was_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch(&dir);

    let io = translator(&path);
    io.write_sectors(4096, &[0x42u8; 1024]).unwrap();
    drop(io);

    let io = translator(&path);
    let mut back = [0u8; 1024];
    io.read_sectors(4096, &mut back).unwrap();
    assert_eq!(back, [0x42u8; 1024]);
}
