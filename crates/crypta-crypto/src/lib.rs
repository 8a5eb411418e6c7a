//! Crypta crypto
//!
//! The deterministic cryptographic engine behind crypta volumes: the three
//! block ciphers a cascade may be built from, the four header-key hashes,
//! the password-based KDFs, the XTS sector transform, and the process-wide
//! entropy pool. Everything here is keyed and deterministic except the pool.
//!
//! The algorithm enumerations ([`CipherId`], [`HashId`], [`KdfId`],
//! [`CascadeId`]) are fixed static lists; volume headers on disk encode a
//! cascade implicitly (a header only decrypts under the cascade that wrote
//! it), so extending these lists never changes existing volumes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod cascade;
pub mod cipher;
pub mod hash;
pub mod kdf;
pub mod rng;
pub mod selftest;
pub mod xts;

pub use cascade::{Cascade, CascadeId, MASTER_KEY_LEN};
pub use cipher::{BLOCK_LEN, CIPHER_KEY_LEN, BlockCipherKind, CipherId};
pub use hash::{HashId, Hasher};
pub use kdf::KdfId;
pub use xts::{XTS_KEY_LEN, XtsCipher};

/// Errors produced by the crypto engine.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The operating system refused to hand out entropy. Fatal for any
    /// operation that needs randomness until the pool is re-seeded.
    #[error("OS entropy source unavailable")]
    RngUnavailable,

    /// Key derivation could not allocate its working memory (Argon2id only;
    /// the PBKDF2 variants do not allocate).
    #[error("not enough memory for key derivation")]
    InsufficientMemory,

    /// A caller-provided key or key-material slice has the wrong length.
    #[error("key material too short: need {need} bytes, got {got}")]
    KeyLength { need: usize, got: usize },

    /// The KDF backend rejected its parameters.
    #[error("key derivation failed")]
    Kdf,

    /// A known-answer test did not produce the published answer.
    #[error("self-test failed: {0}")]
    SelfTest(&'static str),
}

/// Cooperative cancellation flag, shared between the thread driving a slow
/// operation (mount try-all, volume formatting) and the thread that wants to
/// abort it. Checked between KDF attempts and between formatting chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
