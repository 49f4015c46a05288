use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-sender high-watermark: fingerprint to the timestamp of the newest
/// message seen from that sender. A sparse vector clock.
pub type SyncState = HashMap<String, DateTime<Utc>>;

/// True when `last` covers everything `current` has, i.e. the peer that
/// recorded `last` has nothing left to push.
pub fn is_caught_up(last: &SyncState, current: &SyncState) -> bool {
    current
        .iter()
        .all(|(sender, time)| last.get(sender).is_some_and(|t| t >= time))
}

/// Mutable per-member metadata, changed through room commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerMeta {
    pub nick: Option<String>,
    pub admin: bool,
}
