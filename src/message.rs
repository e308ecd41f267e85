use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::headers::Headers;

/// Canonical message envelope: a globally unique identifier, ordered
/// headers, and an opaque payload. Interpretation of the payload bytes is
/// the application's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub headers: Headers,
    pub content: Vec<u8>,
}

impl Message {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            headers: Headers::new(),
            content: content.into(),
        }
    }

    pub fn with_headers(content: impl Into<Vec<u8>>, headers: Headers) -> Self {
        Self {
            id: Uuid::new_v4(),
            headers,
            content: content.into(),
        }
    }

    /// Whether the message's `Expires` header lies in the past.
    ///
    /// Expired messages are acknowledged silently at pickup and never
    /// dispatched to a listener.
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.headers.expires() {
            Some(expires) => expires <= now,
            None => false,
        }
    }
}
