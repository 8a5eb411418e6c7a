//! The block ciphers a cascade may be composed of.
//!
//! Each cipher takes a 32-byte key and transforms 16-byte blocks; modes of
//! operation live in [`crate::xts`]. The key schedules come from the
//! RustCrypto implementations and are wiped from memory when an instance is
//! dropped.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use serpent::Serpent;
use twofish::Twofish;

use crate::CryptoError;

/// Cipher block length in bytes. All three ciphers are 128-bit block ciphers.
pub const BLOCK_LEN: usize = 16;

/// Per-cipher key length in bytes. All three ciphers run with 256-bit keys.
pub const CIPHER_KEY_LEN: usize = 32;

/// The ciphers recognised in cascade descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherId {
    Aes,
    Serpent,
    Twofish,
}

impl CipherId {
    pub const ALL: [CipherId; 3] = [CipherId::Aes, CipherId::Serpent, CipherId::Twofish];

    pub fn name(&self) -> &'static str {
        match self {
            CipherId::Aes => "AES",
            CipherId::Serpent => "Serpent",
            CipherId::Twofish => "Twofish",
        }
    }
}

impl std::fmt::Display for CipherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A keyed block cipher instance.
///
/// This is the dispatch point replacing a virtual `Cipher` hierarchy: a
/// fixed sum over the three supported schedules.
pub enum BlockCipherKind {
    Aes(Aes256),
    Serpent(Serpent),
    Twofish(Twofish),
}

impl BlockCipherKind {
    pub fn new(id: CipherId, key: &[u8]) -> Result<Self, CryptoError> {
        let err = |_| CryptoError::KeyLength {
            need: CIPHER_KEY_LEN,
            got: key.len(),
        };
        match id {
            CipherId::Aes => Aes256::new_from_slice(key).map(Self::Aes).map_err(err),
            CipherId::Serpent => Serpent::new_from_slice(key).map(Self::Serpent).map_err(err),
            CipherId::Twofish => Twofish::new_from_slice(key).map(Self::Twofish).map_err(err),
        }
    }

    pub fn id(&self) -> CipherId {
        match self {
            Self::Aes(_) => CipherId::Aes,
            Self::Serpent(_) => CipherId::Serpent,
            Self::Twofish(_) => CipherId::Twofish,
        }
    }

    /// Encrypts one block in place. `block` must be [`BLOCK_LEN`] bytes.
    pub fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes(c) => c.encrypt_block(block),
            Self::Serpent(c) => c.encrypt_block(block),
            Self::Twofish(c) => c.encrypt_block(block),
        }
    }

    /// Decrypts one block in place. `block` must be [`BLOCK_LEN`] bytes.
    pub fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes(c) => c.decrypt_block(block),
            Self::Serpent(c) => c.decrypt_block(block),
            Self::Twofish(c) => c.decrypt_block(block),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_keys() {
        for id in CipherId::ALL {
            assert!(matches!(
                BlockCipherKind::new(id, &[0u8; 16]),
                Err(CryptoError::KeyLength { need: 32, got: 16 })
            ));
        }
    }

    #[test]
    fn all_ciphers_round_trip() {
        let key: Vec<u8> = (0u8..32).collect();
        let plain: [u8; BLOCK_LEN] = *b"sixteen byte blk";
        for id in CipherId::ALL {
            let cipher = BlockCipherKind::new(id, &key).unwrap();
            let mut block = plain;
            cipher.encrypt_block(&mut block);
            assert_ne!(block, plain, "{id} must actually transform the block");
            cipher.decrypt_block(&mut block);
            assert_eq!(block, plain, "{id} decrypt must invert encrypt");
        }
    }
}
