//! ---
//! shem_section: "05-update-security"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Ed25519 signature verification for module artifacts."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
//! Verification of signed artifacts. A signature container's labels carry
//! the binary image's digest, the signer's public key, and an Ed25519
//! signature over the literal ASCII string `"<base_image>:<tag> <digest>"`.
//! The declared key must byte-match the module's configured key before any
//! cryptographic check runs; a registry cannot substitute its own keypair.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use thiserror::Error;

/// Signature material extracted from a signature container's labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureData {
    /// Digest of the binary image, including the algorithm prefix.
    pub digest: String,
    /// Base64 of the signer's 32-byte Ed25519 public key.
    pub public_key_b64: String,
    /// Base64 of the 64-byte Ed25519 signature.
    pub signature_b64: String,
}

/// Reasons an artifact fails verification. All are permanent for the
/// `(image, tag)` pair in question.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("public key mismatch: artifact declares {declared}, module expects {expected}")]
    KeyMismatch { declared: String, expected: String },
    #[error("failed to decode public key: {0}")]
    KeyEncoding(base64::DecodeError),
    #[error("failed to decode signature: {0}")]
    SignatureEncoding(base64::DecodeError),
    #[error("invalid public key length: expected {PUBLIC_KEY_LENGTH}, got {0}")]
    KeyLength(usize),
    #[error("invalid signature length: expected {SIGNATURE_LENGTH}, got {0}")]
    SignatureLength(usize),
    #[error("invalid public key: {0}")]
    Key(ed25519_dalek::SignatureError),
    #[error("signature verification failed for message: {message}")]
    Invalid { message: String },
}

/// The exact byte string that release tooling signs for an artifact.
pub fn signed_message(base_image: &str, tag: &str, digest: &str) -> String {
    format!("{base_image}:{tag} {digest}")
}

/// Verify that `sig` binds `(base_image, tag, digest)` to the module's
/// configured key.
pub fn verify_artifact(
    base_image: &str,
    tag: &str,
    sig: &SignatureData,
    module_key_b64: &str,
) -> Result<(), SignatureError> {
    if sig.public_key_b64 != module_key_b64 {
        return Err(SignatureError::KeyMismatch {
            declared: sig.public_key_b64.clone(),
            expected: module_key_b64.to_owned(),
        });
    }

    let key_bytes = BASE64
        .decode(module_key_b64)
        .map_err(SignatureError::KeyEncoding)?;
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::KeyLength(key_bytes.len()))?;

    let signature_bytes = BASE64
        .decode(&sig.signature_b64)
        .map_err(SignatureError::SignatureEncoding)?;
    let signature_bytes: [u8; SIGNATURE_LENGTH] = signature_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::SignatureLength(signature_bytes.len()))?;

    let key = VerifyingKey::from_bytes(&key_bytes).map_err(SignatureError::Key)?;
    let signature = Signature::from_bytes(&signature_bytes);
    let message = signed_message(base_image, tag, &sig.digest);

    key.verify_strict(message.as_bytes(), &signature)
        .map_err(|_| SignatureError::Invalid { message })
}
