//! Control-plane key files
//!
//! The daemon writes, and the CLI reads, two PEM files:
//! - `server.pub`: the daemon's public key (SPKI, "PUBLIC KEY"), pinned by the CLI
//! - `client.key`: the CLI's private key (PKCS#8, "PRIVATE KEY")

use std::io::Write;
use std::path::{Path, PathBuf};

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::{TlsError, TlsResult};

pub const SERVER_PUBLIC_KEY_FILE: &str = "server.pub";
pub const CLIENT_PRIVATE_KEY_FILE: &str = "client.key";

/// What the CLI needs to open the control-plane link.
pub struct PinnedMaterial {
    pub server_public: VerifyingKey,
    pub client_private: SigningKey,
}

impl std::fmt::Debug for PinnedMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedMaterial")
            .field("server_public", &self.server_public)
            .field("client_private", &"[REDACTED]")
            .finish()
    }
}

/// Fresh random Ed25519 key for an ephemeral control-plane session.
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Write `server.pub` and `client.key` into `dir` (created 0700, files 0600).
pub fn persist_pinned_material(
    dir: &Path,
    server_public: &VerifyingKey,
    client_private: &SigningKey,
) -> TlsResult<()> {
    create_private_dir(dir)?;

    let public_pem = server_public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| TlsError::KeyEncoding(e.to_string()))?;
    write_private(&dir.join(SERVER_PUBLIC_KEY_FILE), public_pem.as_bytes())?;

    let private_pem = client_private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| TlsError::KeyEncoding(e.to_string()))?;
    write_private(&dir.join(CLIENT_PRIVATE_KEY_FILE), private_pem.as_bytes())?;

    Ok(())
}

/// Read back what [`persist_pinned_material`] wrote.
pub fn load_pinned_material(dir: &Path) -> TlsResult<PinnedMaterial> {
    let public_path = dir.join(SERVER_PUBLIC_KEY_FILE);
    let public_pem = std::fs::read_to_string(&public_path)?;
    let server_public = VerifyingKey::from_public_key_pem(&public_pem)
        .map_err(|e| corrupt(public_path, e))?;

    let private_path = dir.join(CLIENT_PRIVATE_KEY_FILE);
    let private_pem = zeroize::Zeroizing::new(std::fs::read_to_string(&private_path)?);
    let client_private =
        SigningKey::from_pkcs8_pem(&private_pem).map_err(|e| corrupt(private_path, e))?;

    Ok(PinnedMaterial {
        server_public,
        client_private,
    })
}

/// Delete both key files; missing files are not an error.
pub fn remove_pinned_material(dir: &Path) -> std::io::Result<()> {
    for name in [CLIENT_PRIVATE_KEY_FILE, SERVER_PUBLIC_KEY_FILE] {
        match std::fs::remove_file(dir.join(name)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    }
    Ok(())
}

fn corrupt(path: PathBuf, e: impl std::fmt::Display) -> TlsError {
    TlsError::CorruptKeyMaterial {
        path,
        reason: e.to_string(),
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
