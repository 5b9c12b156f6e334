//! Session record types

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Authenticated client state bound to one WebSocket connection
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque URL-safe token
    pub token: String,
    /// Connection the session is bound to
    pub connection_id: Uuid,
    /// Client-chosen identifier
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Currently selected device id (namespaced)
    pub selected_scanner: Option<String>,
    /// Active scan request id; at most one per session
    pub active_request: Option<String>,
    pub scanning: bool,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
