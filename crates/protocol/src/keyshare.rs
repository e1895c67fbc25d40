//! Long-term verifying keys for the configured group.
use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;

use crate::{Error, PeerId, Result};

/// Read-only mapping from peer id textual form to long-term
/// verifying key.
///
/// Fixed at construction from out-of-band configuration; sessions
/// only ever read from it. A participant missing from the share is
/// a configuration error.
#[derive(Debug, Clone, Default)]
pub struct KeyShare {
    keys: HashMap<String, VerifyingKey>,
}

impl KeyShare {
    /// Create a key share from a set of entries.
    pub fn new(
        entries: impl IntoIterator<Item = (PeerId, VerifyingKey)>,
    ) -> Self {
        Self {
            keys: entries
                .into_iter()
                .map(|(id, key)| (id.to_string(), key))
                .collect(),
        }
    }

    /// Get the verifying key for a peer.
    pub fn key(&self, id: &PeerId) -> Result<&VerifyingKey> {
        self.keys
            .get(&id.to_string())
            .ok_or_else(|| Error::MissingKeyShare(id.to_string()))
    }

    /// Whether the share contains an entry for a peer.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.keys.contains_key(&id.to_string())
    }

    /// Number of entries in the share.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the share is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
