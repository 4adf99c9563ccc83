use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Pool of API credentials with one shared rotation cursor.
///
/// Rotation is compare-and-advance: a caller names the credential it saw
/// fail, and the cursor only moves if that credential is still current. Two
/// requests failing on the same key therefore advance the pool once.
#[derive(Debug, Default)]
pub struct CredentialPool {
    keys: Vec<String>,
    cursor: Mutex<usize>,
}

impl CredentialPool {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        let mut uniq: Vec<String> = Vec::new();
        for k in keys {
            let k = k.trim().to_string();
            if !k.is_empty() && !uniq.contains(&k) {
                uniq.push(k);
            }
        }
        Self {
            keys: uniq,
            cursor: Mutex::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn current(&self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = *self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        self.keys.get(idx).cloned()
    }

    /// Advance past `failed` if it is still current; returns the credential to use next.
    pub fn rotate_from(&self, failed: &str) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if self.keys[*cursor] == failed {
            let old = *cursor;
            *cursor = (*cursor + 1) % self.keys.len();
            info!(from = old, to = *cursor, "rotated API credential");
        }
        self.keys.get(*cursor).cloned()
    }
}
