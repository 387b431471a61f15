//! Payload codec for queue items at rest
//!
//! Queued mutations carry phone numbers and message bodies, so payloads are
//! transformed before they reach SQLite:
//! - gzip (flate2) when the serialized payload exceeds a size threshold
//! - AES-256-GCM with a per-user key derived from the device secret (HKDF-SHA256)
//! - SHA-256 checksum over the stored bytes, verified on read
//!
//! The device secret lives in a 0600 file next to the database and is wiped
//! from memory on drop.

use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;
const SECRET_LEN: usize = 32;
const KEY_LEN: usize = 32;
const KEY_SALT: &[u8] = b"commlog-sync-queue-salt-v1";
const KEY_INFO: &[u8] = b"commlog-sync-queue-payload-v1";

/// Stored payload was gzip-compressed
pub const FLAG_COMPRESSED: u8 = 0b01;
/// Stored payload was encrypted with the user's key
pub const FLAG_ENCRYPTED: u8 = 0b10;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Random number generation failed")]
    Rng,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed - wrong key or corrupted data")]
    Decryption,

    #[error("Payload is encrypted but no device secret is configured")]
    MissingKey,

    #[error("Checksum mismatch - stored payload is corrupted")]
    ChecksumMismatch,

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Device secret I/O error: {0}")]
    Io(String),

    #[error("Device secret has invalid length {0}")]
    InvalidSecret(usize),
}

// ============================================================================
// Keys
// ============================================================================

/// Wrapper for derived key bytes that zeroizes on drop
struct SecureKey([u8; KEY_LEN]);

impl Drop for SecureKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Custom key type for HKDF output
struct KeyType(usize);

impl hkdf::KeyType for KeyType {
    fn len(&self) -> usize {
        self.0
    }
}

/// Installation-scoped secret that all per-user payload keys derive from
pub struct DeviceSecret([u8; SECRET_LEN]);

impl Drop for DeviceSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for DeviceSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeviceSecret(..)")
    }
}

impl DeviceSecret {
    /// Generate a fresh random secret
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; SECRET_LEN];
        rng.fill(&mut bytes).map_err(|_| CryptoError::Rng)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Read the secret from `path`, creating it with owner-only permissions if absent
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let data = fs::read(path).map_err(|e| CryptoError::Io(e.to_string()))?;
            if data.len() != SECRET_LEN {
                return Err(CryptoError::InvalidSecret(data.len()));
            }
            let mut bytes = [0u8; SECRET_LEN];
            bytes.copy_from_slice(&data);
            return Ok(Self(bytes));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CryptoError::Io(e.to_string()))?;
        }

        let secret = Self::generate()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .map_err(|e| CryptoError::Io(e.to_string()))?;
            file.write_all(&secret.0)
                .map_err(|e| CryptoError::Io(e.to_string()))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(path, secret.0).map_err(|e| CryptoError::Io(e.to_string()))?;
        }

        log::info!("Created new device secret at {}", path.display());
        Ok(secret)
    }

    /// Derive the payload key for one user
    fn derive_user_key(&self, user_id: &str) -> Result<SecureKey, CryptoError> {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, KEY_SALT);
        let prk = salt.extract(&self.0);

        let info: &[&[u8]] = &[KEY_INFO, user_id.as_bytes()];
        let okm = prk
            .expand(info, KeyType(KEY_LEN))
            .map_err(|_| CryptoError::KeyDerivation)?;

        let mut key = [0u8; KEY_LEN];
        okm.fill(&mut key).map_err(|_| CryptoError::KeyDerivation)?;
        Ok(SecureKey(key))
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Payload as it is written to the queue table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    /// base64 of the stored bytes
    pub data: String,
    /// `FLAG_*` bits describing the applied transforms
    pub flags: u8,
    /// SHA-256 hex of the stored bytes
    pub checksum: String,
}

/// Compresses and encrypts payloads on the way in, reverses it on the way out
pub struct PayloadCodec {
    secret: Option<DeviceSecret>,
    compression_threshold: usize,
}

impl PayloadCodec {
    pub fn new(secret: Option<DeviceSecret>, compression_threshold: usize) -> Self {
        Self {
            secret,
            compression_threshold,
        }
    }

    pub fn encrypts(&self) -> bool {
        self.secret.is_some()
    }

    pub fn encode(&self, user_id: &str, plaintext: &[u8]) -> Result<EncodedPayload, CryptoError> {
        let mut flags = 0u8;

        let mut bytes = if plaintext.len() > self.compression_threshold {
            flags |= FLAG_COMPRESSED;
            gzip_compress(plaintext)?
        } else {
            plaintext.to_vec()
        };

        if let Some(secret) = &self.secret {
            let key = secret.derive_user_key(user_id)?;
            bytes = seal(&key, user_id, bytes)?;
            flags |= FLAG_ENCRYPTED;
        }

        Ok(EncodedPayload {
            checksum: compute_sha256(&bytes),
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            flags,
        })
    }

    pub fn decode(&self, user_id: &str, payload: &EncodedPayload) -> Result<Vec<u8>, CryptoError> {
        let stored = base64::engine::general_purpose::STANDARD
            .decode(&payload.data)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;

        if compute_sha256(&stored) != payload.checksum {
            return Err(CryptoError::ChecksumMismatch);
        }

        let mut bytes = stored;

        if payload.flags & FLAG_ENCRYPTED != 0 {
            let secret = self.secret.as_ref().ok_or(CryptoError::MissingKey)?;
            let key = secret.derive_user_key(user_id)?;
            bytes = open(&key, user_id, bytes)?;
        }

        if payload.flags & FLAG_COMPRESSED != 0 {
            bytes = gzip_decompress(&bytes)?;
        }

        Ok(bytes)
    }
}

/// AES-256-GCM encrypt; output is nonce || ciphertext || tag
fn seal(key: &SecureKey, user_id: &str, mut data: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Rng)?;

    let unbound = UnboundKey::new(&AES_256_GCM, &key.0).map_err(|_| CryptoError::Encryption)?;
    let sealing_key = LessSafeKey::new(unbound);

    sealing_key
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(user_id.as_bytes()),
            &mut data,
        )
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + data.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&data);
    Ok(out)
}

fn open(key: &SecureKey, user_id: &str, data: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::Decryption);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Decryption)?;

    let unbound = UnboundKey::new(&AES_256_GCM, &key.0).map_err(|_| CryptoError::Decryption)?;
    let opening_key = LessSafeKey::new(unbound);

    let mut buffer = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(nonce, Aad::from(user_id.as_bytes()), &mut buffer)
        .map_err(|_| CryptoError::Decryption)?;

    Ok(plaintext.to_vec())
}

// ============================================================================
// Helpers
// ============================================================================

pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CryptoError::Compression(e.to_string()))
}

pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    Ok(out)
}

/// Compute SHA-256 checksum of data (returns hex string)
pub fn compute_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secret() -> DeviceSecret {
        DeviceSecret::from_bytes([7u8; SECRET_LEN])
    }

    #[test]
    fn test_plain_roundtrip_small_payload() {
        let codec = PayloadCodec::new(None, 1024);
        let encoded = codec.encode("user-1", b"{\"number\":\"555\"}").unwrap();

        assert_eq!(encoded.flags, 0);
        assert_eq!(codec.decode("user-1", &encoded).unwrap(), b"{\"number\":\"555\"}");
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let codec = PayloadCodec::new(None, 64);
        let payload = "call-record ".repeat(200);

        let encoded = codec.encode("user-1", payload.as_bytes()).unwrap();
        assert_eq!(encoded.flags & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(encoded.data.len() < payload.len());

        let decoded = codec.decode("user-1", &encoded).unwrap();
        assert_eq!(decoded, payload.as_bytes());
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let codec = PayloadCodec::new(Some(test_secret()), 64);
        let payload = "sms body with a phone number +15550100 ".repeat(10);

        let encoded = codec.encode("user-1", payload.as_bytes()).unwrap();
        assert_eq!(encoded.flags, FLAG_COMPRESSED | FLAG_ENCRYPTED);

        let decoded = codec.decode("user-1", &encoded).unwrap();
        assert_eq!(decoded, payload.as_bytes());
    }

    #[test]
    fn test_other_user_cannot_decrypt() {
        let codec = PayloadCodec::new(Some(test_secret()), 1024);
        let encoded = codec.encode("user-1", b"private").unwrap();

        let result = codec.decode("user-2", &encoded);
        assert!(matches!(result, Err(CryptoError::Decryption)));
    }

    #[test]
    fn test_encrypted_payload_needs_secret() {
        let writer = PayloadCodec::new(Some(test_secret()), 1024);
        let reader = PayloadCodec::new(None, 1024);

        let encoded = writer.encode("user-1", b"private").unwrap();
        assert!(matches!(reader.decode("user-1", &encoded), Err(CryptoError::MissingKey)));
    }

    #[test]
    fn test_checksum_tampering_detected() {
        let codec = PayloadCodec::new(None, 1024);
        let mut encoded = codec.encode("user-1", b"original").unwrap();
        encoded.data = base64::engine::general_purpose::STANDARD.encode(b"tampered");

        assert!(matches!(
            codec.decode("user-1", &encoded),
            Err(CryptoError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_device_secret_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("device.secret");

        let first = DeviceSecret::load_or_create(&path).unwrap();
        let second = DeviceSecret::load_or_create(&path).unwrap();
        assert_eq!(first.0, second.0);

        let codec_a = PayloadCodec::new(Some(first), 1024);
        let codec_b = PayloadCodec::new(Some(second), 1024);
        let encoded = codec_a.encode("user-1", b"shared").unwrap();
        assert_eq!(codec_b.decode("user-1", &encoded).unwrap(), b"shared");
    }

    #[test]
    fn test_device_secret_rejects_bad_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.secret");
        std::fs::write(&path, [1u8; 5]).unwrap();

        assert!(matches!(
            DeviceSecret::load_or_create(&path),
            Err(CryptoError::InvalidSecret(5))
        ));
    }

    #[test]
    fn test_sha256_checksum() {
        assert_eq!(
            compute_sha256(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
