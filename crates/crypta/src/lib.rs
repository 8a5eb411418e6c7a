//! Crypta
//!
//! A collection of crates implementing TrueCrypt-compatible encrypted
//! volumes: the cryptographic engine, the byte-exact on-disk format, the
//! volume engine (mount, create, sector translation, hidden-volume
//! protection) and the loopback NFSv4 storage server that presents a
//! mounted volume to the host filesystem driver.
//!
//! Most callers want [`volume`] for the engine surface and [`serve`] to
//! expose a mounted volume to the OS:
//!
//! ```no_run
//! use std::path::Path;
//! use crypta::volume::{Credentials, MountOptions, open_volume};
//! use crypta::CancelToken;
//!
//! let creds = Credentials::new(&b"correct horse battery staple"[..]);
//! let volume = open_volume(
//!     Path::new("vault.tc"),
//!     &creds,
//!     &MountOptions::default(),
//!     &CancelToken::new(),
//! )?;
//! let server = crypta::serve::NfsServer::bind(volume.translator())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use crypta_crypto as crypto;
pub use crypta_format as format;
pub use crypta_volume as volume;

#[cfg(feature = "serve")]
pub use crypta_serve as serve;

pub use crypta_crypto::{CancelToken, CascadeId, CryptoError, KdfId};
pub use crypta_format::{HeaderSlot, VolumeKind};
pub use crypta_volume::{MountedVolume, VolumeError};
