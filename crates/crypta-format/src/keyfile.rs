//! Keyfile digest.
//!
//! A set of keyfile paths is reduced to a 64-byte pool which is XORed into
//! the passphrase before key derivation. Directories expand to their direct
//! children (non-recursive, sorted by name); only the first 1 MiB of each
//! file contributes. The reduction is a running CRC-32 whose state is added
//! into the pool at a rotating offset per input byte, so ordering matters
//! but duplicate entries fold in identically each time.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use zeroize::{Zeroize, Zeroizing};

use crate::FormatError;

/// Pool width, and also the passphrase working-buffer width when keyfiles
/// are in use.
pub const KEYFILE_POOL_LEN: usize = 64;

/// Cap on bytes read from a single keyfile.
pub const MAX_KEYFILE_BYTES: u64 = 1_048_576;

/// Hard format limit on passphrase length.
pub const MAX_PASSPHRASE_LEN: usize = 64;

/// Computes the 64-byte keyfile pool, or `None` for an empty list (the
/// identity transformation on the passphrase).
pub fn keyfile_pool(paths: &[PathBuf]) -> Result<Option<Zeroizing<[u8; KEYFILE_POOL_LEN]>>, FormatError> {
    if paths.is_empty() {
        return Ok(None);
    }

    let mut pool = Zeroizing::new([0u8; KEYFILE_POOL_LEN]);
    let mut cursor = 0usize;
    for path in expand_entries(paths)? {
        fold_file(&path, &mut pool, &mut cursor)?;
    }
    Ok(Some(pool))
}

/// Applies the keyfile digest to a passphrase, returning the working copy
/// handed to the KDFs. With keyfiles present the copy is padded to the pool
/// width before XOR, matching the on-disk key derivation of existing
/// volumes.
pub fn mix_into_passphrase(
    passphrase: &[u8],
    keyfiles: &[PathBuf],
) -> Result<Zeroizing<Vec<u8>>, FormatError> {
    match keyfile_pool(keyfiles)? {
        None => Ok(Zeroizing::new(passphrase.to_vec())),
        Some(pool) => {
            let mut mixed = Zeroizing::new(vec![0u8; KEYFILE_POOL_LEN]);
            mixed[..passphrase.len()].copy_from_slice(passphrase);
            for (m, p) in mixed.iter_mut().zip(pool.iter()) {
                *m ^= p;
            }
            Ok(mixed)
        }
    }
}

/// Expands directories to their direct children, sorted lexicographically.
fn expand_entries(paths: &[PathBuf]) -> Result<Vec<PathBuf>, FormatError> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut children: Vec<PathBuf> = std::fs::read_dir(path)?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|entry| entry.path())
                .filter(|p| p.is_file())
                .collect();
            children.sort();
            files.extend(children);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn fold_file(
    path: &Path,
    pool: &mut [u8; KEYFILE_POOL_LEN],
    cursor: &mut usize,
) -> Result<(), FormatError> {
    let file = File::open(path)?;
    let mut reader = file.take(MAX_KEYFILE_BYTES);

    let mut crc = crc32fast::Hasher::new();
    let mut total: u64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            crc.update(&[byte]);
            let state = crc.clone().finalize();
            for shifted in state.to_be_bytes() {
                pool[*cursor] = pool[*cursor].wrapping_add(shifted);
                *cursor = (*cursor + 1) % KEYFILE_POOL_LEN;
            }
        }
        total += n as u64;
    }
    buf.zeroize();

    // The cumulative byte counter folds in after the content.
    for byte in total.to_be_bytes() {
        pool[*cursor] = pool[*cursor].wrapping_add(byte);
        *cursor = (*cursor + 1) % KEYFILE_POOL_LEN;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_keyfile(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[test]
    fn empty_list_is_identity() {
        let mixed = mix_into_passphrase(b"hunter2", &[]).unwrap();
        assert_eq!(mixed.as_slice(), b"hunter2");
    }

    #[test]
    fn keyfiles_pad_and_perturb_the_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let kf = write_keyfile(dir.path(), "k1", b"some keyfile content");
        let mixed = mix_into_passphrase(b"hunter2", &[kf]).unwrap();
        assert_eq!(mixed.len(), KEYFILE_POOL_LEN);
        assert_ne!(&mixed[..7], b"hunter2");
    }

    #[test]
    fn digest_is_deterministic_and_order_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_keyfile(dir.path(), "a", b"alpha");
        let b = write_keyfile(dir.path(), "b", b"bravo");

        let ab1 = keyfile_pool(&[a.clone(), b.clone()]).unwrap().unwrap();
        let ab2 = keyfile_pool(&[a.clone(), b.clone()]).unwrap().unwrap();
        assert_eq!(*ab1, *ab2);

        let ba = keyfile_pool(&[b, a]).unwrap().unwrap();
        assert_ne!(*ab1, *ba);
    }

    #[test]
    fn directory_expands_to_sorted_children() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("keys");
        std::fs::create_dir(&sub).unwrap();
        // Created out of order; expansion must sort.
        write_keyfile(&sub, "zz", b"last");
        write_keyfile(&sub, "aa", b"first");

        let via_dir = keyfile_pool(&[sub.clone()]).unwrap().unwrap();
        let explicit = keyfile_pool(&[sub.join("aa"), sub.join("zz")]).unwrap().unwrap();
        assert_eq!(*via_dir, *explicit);
    }

    #[test]
    fn duplicate_entries_fold_identically() {
        let dir = tempfile::tempdir().unwrap();
        let kf = write_keyfile(dir.path(), "k", b"same bytes");
        let once1 = keyfile_pool(&[kf.clone(), kf.clone()]).unwrap().unwrap();
        let once2 = keyfile_pool(&[kf.clone(), kf]).unwrap().unwrap();
        assert_eq!(*once1, *once2);
    }

    #[test]
    fn only_first_mebibyte_counts() {
        let dir = tempfile::tempdir().unwrap();
        let base = vec![0x41u8; MAX_KEYFILE_BYTES as usize];
        let mut extended = base.clone();
        extended.extend_from_slice(b"tail beyond the cap");

        let a = write_keyfile(dir.path(), "exact", &base);
        let b = write_keyfile(dir.path(), "extended", &extended);
        let pa = keyfile_pool(&[a]).unwrap().unwrap();
        let pb = keyfile_pool(&[b]).unwrap().unwrap();
        assert_eq!(*pa, *pb);
    }
}
