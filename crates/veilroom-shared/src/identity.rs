use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::error::IdentityError;

// Ed25519-based identity. The fingerprint doubles as the wire address:
// base64url(pubkey) names the signer, the service id names the overlay
// endpoint the peer can be reached on.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    service: HiddenService,
}

/// Serializable form of a local identity, for the daemon state file.
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub service_secret: [u8; 32],
}

impl Identity {
    /// Generate a fresh keypair together with a fresh hidden service.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            service: HiddenService::generate(),
        }
    }

    pub fn from_export(export: &IdentityExport) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&export.secret_key),
            service: HiddenService::from_secret_bytes(&export.service_secret),
        }
    }

    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            service_secret: *self.service.signing_key.as_bytes(),
        }
    }

    /// `base64url-nopad(pubkey) + "@" + service-id`, the globally unique
    /// participant name. Case-sensitive.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}@{}",
            URL_SAFE_NO_PAD.encode(self.public_key_bytes()),
            self.service.service_id()
        )
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn service(&self) -> &HiddenService {
        &self.service
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// A room member other than ourselves: public key plus overlay address,
/// both recovered from the fingerprint string.
#[derive(Debug, Clone)]
pub struct RemoteIdentity {
    verifying_key: VerifyingKey,
    service_id: String,
}

impl RemoteIdentity {
    pub fn from_fingerprint(fingerprint: &str) -> Result<Self, IdentityError> {
        let (pubkey_b64, service_id) = fingerprint
            .split_once('@')
            .ok_or(IdentityError::InvalidFingerprint)?;
        if service_id.is_empty() {
            return Err(IdentityError::InvalidFingerprint);
        }

        let pubkey_bytes = URL_SAFE_NO_PAD
            .decode(pubkey_b64)
            .map_err(|_| IdentityError::Base64Decode)?;
        let pubkey_arr: [u8; 32] = pubkey_bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyBytes)?;
        let verifying_key =
            VerifyingKey::from_bytes(&pubkey_arr).map_err(|_| IdentityError::InvalidKeyBytes)?;

        Ok(Self {
            verifying_key,
            service_id: service_id.to_string(),
        })
    }

    pub fn fingerprint(&self) -> String {
        format!(
            "{}@{}",
            URL_SAFE_NO_PAD.encode(self.verifying_key.to_bytes()),
            self.service_id
        )
    }

    /// Signature check that never panics; malformed signatures are simply
    /// invalid.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.verifying_key.verify(message, &sig).is_ok(),
            Err(_) => false,
        }
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }
}

// A v3 onion service keypair. The service id is derived from the public
// key exactly the way the router derives the address, so the id is stable
// across restarts and unique per keypair.
#[derive(Clone)]
pub struct HiddenService {
    signing_key: SigningKey,
}

impl HiddenService {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// The v3 address label: base32(pubkey || checksum || version), where
    /// checksum = SHA3-256(".onion checksum" || pubkey || version)[..2]
    /// and version = 0x03. Lowercase, without the ".onion" suffix.
    pub fn service_id(&self) -> String {
        let pubkey = self.signing_key.verifying_key().to_bytes();
        let version: u8 = 0x03;

        let mut hasher = Sha3_256::new();
        hasher.update(b".onion checksum");
        hasher.update(pubkey);
        hasher.update([version]);
        let checksum = hasher.finalize();

        let mut combined = [0u8; 35];
        combined[..32].copy_from_slice(&pubkey);
        combined[32..34].copy_from_slice(&checksum[..2]);
        combined[34] = version;

        base32_encode(&combined)
    }
}

// RFC 4648 base32, lowercase, no padding. The 35-byte input never needs
// padding anyway.
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut result = String::new();

    let mut buffer: u64 = 0;
    let mut bits_left = 0;

    for &byte in data {
        buffer = (buffer << 8) | (byte as u64);
        bits_left += 8;

        while bits_left >= 5 {
            bits_left -= 5;
            let idx = ((buffer >> bits_left) & 0x1f) as usize;
            result.push(ALPHABET[idx] as char);
        }
    }

    if bits_left > 0 {
        let idx = ((buffer << (5 - bits_left)) & 0x1f) as usize;
        result.push(ALPHABET[idx] as char);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let remote = RemoteIdentity::from_fingerprint(&id.fingerprint()).unwrap();

        let sig = id.sign(b"challenge bytes");
        assert!(remote.verify(b"challenge bytes", &sig.to_bytes()));
        assert!(!remote.verify(b"other bytes", &sig.to_bytes()));
    }

    #[test]
    fn test_verify_malformed_signature() {
        let id = Identity::generate();
        let remote = RemoteIdentity::from_fingerprint(&id.fingerprint()).unwrap();

        assert!(!remote.verify(b"anything", b"too short"));
        assert!(!remote.verify(b"anything", &[0u8; 64]));
    }

    #[test]
    fn test_fingerprint_roundtrip() {
        let id = Identity::generate();
        let remote = RemoteIdentity::from_fingerprint(&id.fingerprint()).unwrap();

        assert_eq!(remote.fingerprint(), id.fingerprint());
        assert_eq!(remote.service_id(), id.service().service_id());
        assert_eq!(remote.verifying_key().to_bytes(), id.public_key_bytes());
    }

    #[test]
    fn test_fingerprint_unique_per_identity() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_rejects_garbage() {
        assert!(RemoteIdentity::from_fingerprint("no-separator").is_err());
        assert!(RemoteIdentity::from_fingerprint("!!!not-base64@service").is_err());
        assert!(RemoteIdentity::from_fingerprint("c2hvcnQ@service").is_err());
        assert!(RemoteIdentity::from_fingerprint("@service").is_err());

        let id = Identity::generate();
        let bare = id.fingerprint().split('@').next().unwrap().to_string();
        assert!(RemoteIdentity::from_fingerprint(&bare).is_err());
        assert!(RemoteIdentity::from_fingerprint(&format!("{bare}@")).is_err());
    }

    #[test]
    fn test_export_roundtrip() {
        let id = Identity::generate();
        let restored = Identity::from_export(&id.to_export());
        assert_eq!(restored.fingerprint(), id.fingerprint());
    }

    #[test]
    fn test_service_id_is_stable() {
        let service = HiddenService::generate();
        assert_eq!(service.service_id(), service.service_id());
        // 35 bytes map onto 56 base32 characters
        assert_eq!(service.service_id().len(), 56);
        assert!(service
            .service_id()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
