use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::COMMAND_DELIMITER;
use crate::identity::{Identity, RemoteIdentity};

/// What the content bytes mean. The discriminant byte is part of the
/// signed digest, so it is fixed forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ContentType {
    Text = 0x00,
    Command = 0x01,
    Binary = 0x02,
}

impl ContentType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Text),
            0x01 => Some(Self::Command),
            0x02 => Some(Self::Binary),
            _ => None,
        }
    }
}

/// A signed message envelope. Immutable once signed; every mutation of
/// the fields invalidates the signature.
///
/// Text and command payloads are UTF-8. Binary payloads carry the 16 raw
/// bytes of a blob id; the blob itself travels out of band.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub content: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Message {
    /// Build and sign a message as `identity`, stamped with the current
    /// time. Signing cannot fail once keys exist.
    pub fn signed(identity: &Identity, content_type: ContentType, content: Vec<u8>) -> Self {
        // The digest only covers whole seconds, so store whole seconds.
        let now = Utc
            .timestamp_opt(Utc::now().timestamp(), 0)
            .single()
            .expect("current time is representable");

        let mut message = Self {
            sender: identity.fingerprint(),
            time: now,
            content_type,
            content,
            signature: Vec::new(),
        };
        message.signature = identity.sign(&message.digest()).to_bytes().to_vec();
        message
    }

    /// `utf8(sender) || le-i64(unix-seconds) || type-byte || content`,
    /// the exact byte sequence both ends sign and verify.
    pub fn digest(&self) -> Vec<u8> {
        let mut d = self.sender.as_bytes().to_vec();
        d.extend_from_slice(&self.time.timestamp().to_le_bytes());
        d.push(self.content_type.as_byte());
        d.extend_from_slice(&self.content);
        d
    }

    pub fn verify(&self, sender: &RemoteIdentity) -> bool {
        sender.verify(&self.digest(), &self.signature)
    }

    /// Verification against our own key, for messages we authored that
    /// come back around through another member.
    pub fn verify_own(&self, identity: &Identity) -> bool {
        use ed25519_dalek::Verifier;
        let Ok(sig) = ed25519_dalek::Signature::from_slice(&self.signature) else {
            return false;
        };
        identity.verifying_key().verify(&self.digest(), &sig).is_ok()
    }

    /// The blob referenced by a binary message, if any.
    pub fn blob_id(&self) -> Option<Uuid> {
        if self.content_type != ContentType::Binary {
            return None;
        }
        Uuid::from_slice(&self.content).ok()
    }

    /// First whitespace-delimited token of a command payload.
    pub fn command_name(&self) -> Option<&str> {
        if self.content_type != ContentType::Command {
            return None;
        }
        let payload = std::str::from_utf8(&self.content).ok()?;
        payload.split(COMMAND_DELIMITER).next()
    }
}

/// Prefix a payload with a command name. An empty name returns the body
/// untouched, an empty body returns just the name.
pub fn construct_command(body: &[u8], command: &str) -> Vec<u8> {
    if command.is_empty() {
        return body.to_vec();
    }
    if body.is_empty() {
        return command.as_bytes().to_vec();
    }

    let mut out = command.as_bytes().to_vec();
    out.extend_from_slice(COMMAND_DELIMITER.as_bytes());
    out.extend_from_slice(body);
    out
}
