//! Cryptographic Verification
//!
//! SHA256 checksums for downloaded artifacts and Ed25519 signatures published
//! in the feed.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Verification errors
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Update is not signed but a public key is configured")]
    MissingSignature,
    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Calculate SHA256 checksum of a file
pub fn sha256_file(path: &Path) -> Result<String, VerifyError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify a file's checksum (hex, case-insensitive).
pub fn verify_checksum(path: &Path, expected: &str) -> Result<(), VerifyError> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(VerifyError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Checks feed-published Ed25519 signatures over artifact bytes.
pub struct SignatureVerifier {
    public_key: Option<VerifyingKey>,
}

impl SignatureVerifier {
    /// A verifier with no key; every signature is ignored.
    pub fn disabled() -> Self {
        Self { public_key: None }
    }

    /// Create verifier from a base64 encoded 32-byte public key.
    pub fn from_base64(key: &str) -> Result<Self, VerifyError> {
        let bytes = BASE64
            .decode(key.trim())
            .map_err(|e| VerifyError::ParseError(e.to_string()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| VerifyError::InvalidPublicKey)?;
        let public_key = VerifyingKey::from_bytes(&bytes).map_err(|_| VerifyError::InvalidPublicKey)?;
        Ok(Self { public_key: Some(public_key) })
    }

    pub fn from_config(key: Option<&str>) -> Result<Self, VerifyError> {
        match key {
            Some(key) => Self::from_base64(key),
            None => Ok(Self::disabled()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.public_key.is_some()
    }

    /// Verify `signature` (base64) over the contents of `path`.
    pub fn verify_file(&self, path: &Path, signature: Option<&str>) -> Result<(), VerifyError> {
        let Some(public_key) = &self.public_key else {
            if signature.is_some() {
                tracing::warn!("feed carries a signature but no public key is configured; skipping");
            }
            return Ok(());
        };
        let signature = signature.ok_or(VerifyError::MissingSignature)?;

        let sig_bytes = BASE64
            .decode(signature.trim())
            .map_err(|e| VerifyError::ParseError(e.to_string()))?;
        let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|_| VerifyError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_array);

        let message = std::fs::read(path)?;
        public_key
            .verify(&message, &signature)
            .map_err(|_| VerifyError::InvalidSignature)
    }
}
