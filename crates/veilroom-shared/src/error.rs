use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid fingerprint: expected <base64url-pubkey>@<service-id>")]
    InvalidFingerprint,

    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Base64 decode error")]
    Base64Decode,
}
