//! Device signing key.
//!
//! Registration requests are signed with a persistent RSA key pair
//! (RSASSA-PKCS1-v1_5 over SHA-256). The server learns the public half from
//! the `public_key` field of the request and verifies the
//! `X-RDFM-Device-Signature` header against the exact body bytes.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::info;

use crate::error::KeyError;

/// Asymmetric identity used to sign registration requests.
pub trait DeviceKey: Send + Sync {
    /// Sign `data`, returning the raw signature bytes.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// Public key as a `-----BEGIN PUBLIC KEY-----` PEM document.
    fn public_key_pem(&self) -> Result<String, KeyError>;
}

/// RSA key pair persisted as a PKCS#8 PEM file.
pub struct FileKeyStore {
    path: PathBuf,
    signing_key: SigningKey<Sha256>,
    public_pem: String,
}

impl FileKeyStore {
    /// Load the key at `path`, generating and persisting a `bits`-bit key
    /// first if the file does not exist.
    ///
    /// Generation is CPU-heavy for production key sizes; call this from a
    /// blocking context.
    pub fn load_or_generate(path: &Path, bits: usize) -> Result<Self, KeyError> {
        let private_key = if path.exists() {
            let pem = std::fs::read_to_string(path)?;
            RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| KeyError::Encoding(e.to_string()))?
        } else {
            info!("Device key not found, generating {bits}-bit RSA key at {}", path.display());
            let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
                .map_err(|e| KeyError::Generate(e.to_string()))?;
            write_private_key(path, &key)?;
            key
        };
        Self::from_private_key(path.to_path_buf(), private_key)
    }

    fn from_private_key(path: PathBuf, private_key: RsaPrivateKey) -> Result<Self, KeyError> {
        let public_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        Ok(Self {
            path,
            signing_key: SigningKey::<Sha256>::new(private_key),
            public_pem,
        })
    }

    /// Location of the backing key file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceKey for FileKeyStore {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let signature = self
            .signing_key
            .try_sign(data)
            .map_err(|e| KeyError::Sign(e.to_string()))?;
        Ok(signature.to_vec())
    }

    fn public_key_pem(&self) -> Result<String, KeyError> {
        Ok(self.public_pem.clone())
    }
}

/// Write the private key with owner-only permissions.
fn write_private_key(path: &Path, key: &RsaPrivateKey) -> Result<(), KeyError> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KeyError::Encoding(e.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem.as_bytes())?;
    file.sync_all()?;
    Ok(())
}
