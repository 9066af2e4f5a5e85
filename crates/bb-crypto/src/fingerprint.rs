//! Password fingerprint binding a master secret to a data directory

use std::io::Write;
use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use tracing::{debug, info};

use crate::kdf::derive_key;
use crate::{CryptoError, CryptoResult, MasterSecret};

/// File name of the fingerprint under the data directory.
pub const FINGERPRINT_FILE: &str = "fingerprint.txt";

const FINGERPRINT_PURPOSE: &str = "fingerprint";
const FINGERPRINT_LEN: usize = 32;

/// Outcome of a successful [`verify_or_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintCheck {
    /// No fingerprint existed; this master secret now owns the directory.
    Created,
    /// The stored fingerprint matches.
    Verified,
}

/// Lowercase hex of `derive_key(master, "fingerprint", 32)`.
pub fn fingerprint_hex(master: &MasterSecret) -> CryptoResult<String> {
    let fp = derive_key(master.as_bytes(), FINGERPRINT_PURPOSE, FINGERPRINT_LEN)?;
    Ok(HEXLOWER.encode(&fp))
}

pub fn fingerprint_path(data_dir: &Path) -> PathBuf {
    data_dir.join(FINGERPRINT_FILE)
}

/// Check `master` against the fingerprint in `data_dir`, writing it first if
/// the directory has none yet.
///
/// A stored fingerprint is never overwritten; a mismatch yields
/// [`CryptoError::FingerprintMismatch`].
pub fn verify_or_init(data_dir: &Path, master: &MasterSecret) -> CryptoResult<FingerprintCheck> {
    let path = fingerprint_path(data_dir);
    let expected = fingerprint_hex(master)?;

    match std::fs::read_to_string(&path) {
        Ok(on_disk) => {
            if on_disk.trim() != expected {
                debug!(path = %path.display(), "fingerprint mismatch");
                return Err(CryptoError::FingerprintMismatch(path));
            }
            info!(path = %path.display(), "fingerprint verified (existing instance)");
            Ok(FingerprintCheck::Verified)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_private(&path, format!("{expected}\n").as_bytes())?;
            info!(path = %path.display(), "fingerprint created (fresh instance)");
            Ok(FingerprintCheck::Created)
        }
        Err(e) => Err(e.into()),
    }
}

/// Create `path` (failing if it exists) with owner-only permissions.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(byte: u8) -> MasterSecret {
        MasterSecret::from_bytes([byte; crate::MASTER_SECRET_SIZE])
    }

    #[test]
    fn test_first_unlock_creates_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        let check = verify_or_init(tmp.path(), &secret(1)).unwrap();
        assert_eq!(check, FingerprintCheck::Created);

        let stored = std::fs::read_to_string(fingerprint_path(tmp.path())).unwrap();
        assert!(stored.ends_with('\n'));
        assert_eq!(stored.trim(), fingerprint_hex(&secret(1)).unwrap());
        assert_eq!(stored.trim().len(), 64);
    }

    #[test]
    fn test_same_secret_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        verify_or_init(tmp.path(), &secret(1)).unwrap();
        let check = verify_or_init(tmp.path(), &secret(1)).unwrap();
        assert_eq!(check, FingerprintCheck::Verified);
    }

    #[test]
    fn test_other_secret_rejected_and_not_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        verify_or_init(tmp.path(), &secret(1)).unwrap();
        let before = std::fs::read(fingerprint_path(tmp.path())).unwrap();

        let err = verify_or_init(tmp.path(), &secret(2)).unwrap_err();
        assert!(matches!(err, CryptoError::FingerprintMismatch(_)));

        let after = std::fs::read(fingerprint_path(tmp.path())).unwrap();
        assert_eq!(before, after, "stored fingerprint must not change");
    }

    #[test]
    fn test_surrounding_whitespace_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let hex = fingerprint_hex(&secret(3)).unwrap();
        std::fs::write(fingerprint_path(tmp.path()), format!("  {hex}\r\n")).unwrap();
        assert_eq!(
            verify_or_init(tmp.path(), &secret(3)).unwrap(),
            FingerprintCheck::Verified
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_fingerprint_mode_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        verify_or_init(tmp.path(), &secret(4)).unwrap();
        let mode = std::fs::metadata(fingerprint_path(tmp.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
