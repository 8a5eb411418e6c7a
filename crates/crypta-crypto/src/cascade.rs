//! Cascade composition of up to three ciphers.
//!
//! A cascade applies each member cipher's XTS transform over the whole
//! sector in declaration order on write and in reverse on read. Member `i`
//! takes bytes `[64*i, 64*(i+1))` of the volume's 256-byte master key
//! material; the tail beyond the cascade's need is unused but still covered
//! by the header's key-material CRC.

use zeroize::Zeroizing;

use crate::cipher::CipherId;
use crate::xts::{XTS_KEY_LEN, XtsCipher};
use crate::CryptoError;

/// Size of the master key material region in the volume header. Every
/// cascade draws from the front of it.
pub const MASTER_KEY_LEN: usize = 256;

/// The recognised cipher cascades, in the fixed order the mount loop tries
/// them. Single ciphers come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeId {
    Aes,
    Serpent,
    Twofish,
    AesTwofish,
    AesTwofishSerpent,
    SerpentAes,
    SerpentTwofishAes,
    TwofishSerpent,
}

impl CascadeId {
    pub const ALL: [CascadeId; 8] = [
        CascadeId::Aes,
        CascadeId::Serpent,
        CascadeId::Twofish,
        CascadeId::AesTwofish,
        CascadeId::AesTwofishSerpent,
        CascadeId::SerpentAes,
        CascadeId::SerpentTwofishAes,
        CascadeId::TwofishSerpent,
    ];

    /// Member ciphers in write order.
    pub fn ciphers(&self) -> &'static [CipherId] {
        use CipherId::*;
        match self {
            CascadeId::Aes => &[Aes],
            CascadeId::Serpent => &[Serpent],
            CascadeId::Twofish => &[Twofish],
            CascadeId::AesTwofish => &[Aes, Twofish],
            CascadeId::AesTwofishSerpent => &[Aes, Twofish, Serpent],
            CascadeId::SerpentAes => &[Serpent, Aes],
            CascadeId::SerpentTwofishAes => &[Serpent, Twofish, Aes],
            CascadeId::TwofishSerpent => &[Twofish, Serpent],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CascadeId::Aes => "AES",
            CascadeId::Serpent => "Serpent",
            CascadeId::Twofish => "Twofish",
            CascadeId::AesTwofish => "AES-Twofish",
            CascadeId::AesTwofishSerpent => "AES-Twofish-Serpent",
            CascadeId::SerpentAes => "Serpent-AES",
            CascadeId::SerpentTwofishAes => "Serpent-Twofish-AES",
            CascadeId::TwofishSerpent => "Twofish-Serpent",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(name))
    }

    /// Bytes of key material the cascade consumes.
    pub fn key_material_len(&self) -> usize {
        self.ciphers().len() * XTS_KEY_LEN
    }
}

impl std::fmt::Display for CascadeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A keyed cascade instance. Owns its member schedules; the schedules wipe
/// themselves on drop.
pub struct Cascade {
    id: CascadeId,
    stages: Vec<XtsCipher>,
}

impl Cascade {
    /// Installs keys from the front of `material`, which must hold at least
    /// [`CascadeId::key_material_len`] bytes.
    pub fn with_key_material(id: CascadeId, material: &[u8]) -> Result<Self, CryptoError> {
        let need = id.key_material_len();
        if material.len() < need {
            return Err(CryptoError::KeyLength {
                need,
                got: material.len(),
            });
        }
        let stages = id
            .ciphers()
            .iter()
            .enumerate()
            .map(|(i, cipher)| {
                XtsCipher::new(*cipher, &material[i * XTS_KEY_LEN..(i + 1) * XTS_KEY_LEN])
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { id, stages })
    }

    /// Generates a fresh cascade for a new volume and returns its full
    /// [`MASTER_KEY_LEN`]-byte key material, tail included.
    pub fn generate(id: CascadeId) -> Result<(Self, Zeroizing<[u8; MASTER_KEY_LEN]>), CryptoError> {
        let mut material = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        crate::rng::random_bytes(material.as_mut())?;
        let cascade = Self::with_key_material(id, material.as_ref())?;
        Ok((cascade, material))
    }

    pub fn id(&self) -> CascadeId {
        self.id
    }

    pub fn encrypt_area(&self, data: &mut [u8], sector_size: usize, first_sector: u64) {
        for stage in &self.stages {
            stage.encrypt_area(data, sector_size, first_sector);
        }
    }

    pub fn decrypt_area(&self, data: &mut [u8], sector_size: usize, first_sector: u64) {
        for stage in self.stages.iter().rev() {
            stage.decrypt_area(data, sector_size, first_sector);
        }
    }
}
