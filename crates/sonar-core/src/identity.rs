//! Long-term node identity
//!
//! The node key is a secp256k1 secret persisted as hex text (the same
//! `nodekey` format go-ethereum uses). A missing or unreadable key file is
//! replaced with a fresh key; failing to persist that key is fatal, since
//! the node would otherwise change identity on every start.

use crate::{random_bytes, Error, NodeEndpoint, NodeId, NodeRecord, PublicKey, Result};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Length of a recoverable signature: r || s || recovery id
pub const SIGNATURE_LEN: usize = 65;

/// On-disk location of the node key
#[derive(Debug, Clone)]
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored key material, `None` if no key has been written yet
    pub fn read_key_material(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write key material, readable and writable by the owner only
    pub fn write_key_material(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        // mode() only applies on creation; tighten a pre-existing file too
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

/// The node's keypair and derived identifier
pub struct Identity {
    secret: SigningKey,
    public_key: PublicKey,
    node_id: NodeId,
}

impl Identity {
    /// Generate a fresh random identity
    pub fn generate() -> Result<Self> {
        // A random scalar is out of range with negligible probability; retry if so
        loop {
            let bytes: [u8; 32] = random_bytes()?;
            if let Ok(identity) = Self::from_secret_bytes(&bytes) {
                return Ok(identity);
            }
        }
    }

    /// Build an identity from a raw 32-byte secret
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret =
            SigningKey::from_slice(bytes).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let public_key = PublicKey::from_verifying_key(secret.verifying_key());
        Ok(Self {
            node_id: public_key.id(),
            secret,
            public_key,
        })
    }

    /// Parse the hex text stored in a key file
    pub fn from_key_material(material: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(material)
            .map_err(|_| Error::InvalidKey("key file is not valid UTF-8".to_string()))?;
        let bytes = hex::decode(text.trim())
            .map_err(|e| Error::InvalidKey(format!("key file is not hex: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Load the persisted identity, or create and persist a new one
    pub fn load_or_create(store: &KeyFile) -> Result<Self> {
        match store.read_key_material() {
            Ok(Some(material)) => match Self::from_key_material(&material) {
                Ok(identity) => {
                    tracing::debug!(path = %store.path().display(), node = %identity.node_id, "loaded node key");
                    return Ok(identity);
                }
                Err(e) => {
                    tracing::warn!(path = %store.path().display(), error = %e, "stored node key is invalid, generating a new one");
                }
            },
            Ok(None) => {
                tracing::info!(path = %store.path().display(), "no node key found, generating a new one");
            }
            Err(e) => {
                tracing::warn!(path = %store.path().display(), error = %e, "failed to read node key, generating a new one");
            }
        }

        let identity = Self::generate()?;
        store.write_key_material(identity.key_material().as_bytes())?;
        tracing::info!(path = %store.path().display(), node = %identity.node_id, "saved new node key");
        Ok(identity)
    }

    /// Hex text suitable for [`KeyFile::write_key_material`]
    pub fn key_material(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The local node record at the given endpoint
    pub fn record(&self, endpoint: NodeEndpoint) -> NodeRecord {
        NodeRecord::new(self.public_key, endpoint)
    }

    /// Sign a 32-byte digest, producing `r || s || v` with `v` in {0, 1}
    pub fn sign_prehash(&self, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_LEN]> {
        let (signature, recovery_id) = self
            .secret
            .sign_prehash_recoverable(digest)
            .map_err(|_| Error::InvalidSignature)?;

        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(out)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Recover the signer's public key from a recoverable signature over `digest`
pub fn recover_signer(digest: &[u8; 32], signature: &[u8]) -> Result<PublicKey> {
    if signature.len() != SIGNATURE_LEN {
        return Err(Error::InvalidSignature);
    }
    let sig = Signature::from_slice(&signature[..64]).map_err(|_| Error::InvalidSignature)?;
    let recovery_id = RecoveryId::from_byte(signature[64]).ok_or(Error::InvalidSignature)?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
        .map_err(|_| Error::InvalidSignature)?;
    Ok(PublicKey::from_verifying_key(&key))
}
