//! A failed primitive self-test must gate every volume operation.
//!
//! Lives in its own test binary: the gate is process-wide and poisoning it
//! would break any other volume test sharing the process.

use crypta::volume::create::CreateProgress;
use crypta::volume::{CreateOptions, Credentials, MountOptions, create_volume, open_volume};
use crypta::{CancelToken, CryptoError, VolumeError};

#[test]
fn poisoned_selftests_refuse_mount_and_create() {
    assert!(crypta::volume::poison_selftests_for_tests("AES"));

    let err = open_volume(
        "does-not-matter.tc".as_ref(),
        &Credentials::new(&b"pw"[..]),
        &MountOptions::default(),
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        VolumeError::Crypto(CryptoError::SelfTest("AES"))
    ));

    let dir = tempfile::tempdir().unwrap();
    let err = create_volume(
        &dir.path().join("vault.tc"),
        &Credentials::new(&b"pw"[..]),
        &CreateOptions {
            size: 1 << 20,
            quick_format: true,
            ..Default::default()
        },
        &CreateProgress::new(),
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        VolumeError::Crypto(CryptoError::SelfTest("AES"))
    ));
}
