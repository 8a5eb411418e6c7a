//! Header-key hashes.
//!
//! These back the PBKDF2 variants and the entropy-pool whitening. The
//! streaming interface is the usual init / update / finalize-into shape.

use digest::Digest;
use ripemd::Ripemd160;
use sha2::Sha512;
use streebog::Streebog512;
use whirlpool::Whirlpool;

/// The hashes recognised in KDF descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashId {
    Ripemd160,
    Sha512,
    Whirlpool,
    Streebog512,
}

impl HashId {
    pub const ALL: [HashId; 4] = [
        HashId::Ripemd160,
        HashId::Sha512,
        HashId::Whirlpool,
        HashId::Streebog512,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HashId::Ripemd160 => "RIPEMD-160",
            HashId::Sha512 => "SHA-512",
            HashId::Whirlpool => "Whirlpool",
            HashId::Streebog512 => "Streebog-512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashId::Ripemd160 => 20,
            HashId::Sha512 | HashId::Whirlpool | HashId::Streebog512 => 64,
        }
    }
}

impl std::fmt::Display for HashId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A streaming hash instance.
pub enum Hasher {
    Ripemd160(Ripemd160),
    Sha512(Sha512),
    Whirlpool(Whirlpool),
    Streebog512(Streebog512),
}

impl Hasher {
    pub fn new(id: HashId) -> Self {
        match id {
            HashId::Ripemd160 => Self::Ripemd160(Ripemd160::new()),
            HashId::Sha512 => Self::Sha512(Sha512::new()),
            HashId::Whirlpool => Self::Whirlpool(Whirlpool::new()),
            HashId::Streebog512 => Self::Streebog512(Streebog512::new()),
        }
    }

    pub fn id(&self) -> HashId {
        match self {
            Self::Ripemd160(_) => HashId::Ripemd160,
            Self::Sha512(_) => HashId::Sha512,
            Self::Whirlpool(_) => HashId::Whirlpool,
            Self::Streebog512(_) => HashId::Streebog512,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Ripemd160(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Whirlpool(h) => h.update(data),
            Self::Streebog512(h) => h.update(data),
        }
    }

    /// Writes the digest into the front of `out` and returns its length.
    /// `out` must hold at least [`HashId::output_len`] bytes.
    pub fn finalize_into(self, out: &mut [u8]) -> usize {
        match self {
            Self::Ripemd160(h) => {
                let d = h.finalize();
                out[..d.len()].copy_from_slice(&d);
                d.len()
            }
            Self::Sha512(h) => {
                let d = h.finalize();
                out[..d.len()].copy_from_slice(&d);
                d.len()
            }
            Self::Whirlpool(h) => {
                let d = h.finalize();
                out[..d.len()].copy_from_slice(&d);
                d.len()
            }
            Self::Streebog512(h) => {
                let d = h.finalize();
                out[..d.len()].copy_from_slice(&d);
                d.len()
            }
        }
    }
}

/// One-shot convenience over [`Hasher`].
pub fn digest_into(id: HashId, data: &[u8], out: &mut [u8]) -> usize {
    let mut h = Hasher::new(id);
    h.update(data);
    h.finalize_into(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_oneshot() {
        for id in HashId::ALL {
            let mut streamed = [0u8; 64];
            let mut hasher = Hasher::new(id);
            hasher.update(b"hello ");
            hasher.update(b"world");
            let n = hasher.finalize_into(&mut streamed);
            assert_eq!(n, id.output_len());

            let mut oneshot = [0u8; 64];
            digest_into(id, b"hello world", &mut oneshot);
            assert_eq!(streamed, oneshot);
        }
    }
}
