//! Session Store - token lifecycle and socket binding
//!
//! ## Responsibilities
//!
//! - Issue, validate, renew and expire authentication tokens
//! - Map connections to sessions through a side index
//!
//! Both indexes mutate under one lock, so after any operation either both
//! entries exist or both are gone.

mod types;

pub use types::Session;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Sweep cadence for expired sessions
pub const SWEEP_INTERVAL_SECS: u64 = 300;

struct Indexes {
    by_token: HashMap<String, Session>,
    by_connection: HashMap<Uuid, String>,
}

/// Session store instance
pub struct SessionStore {
    ttl: Duration,
    max_sessions: usize,
    inner: RwLock<Indexes>,
}

impl SessionStore {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            ttl,
            max_sessions,
            inner: RwLock::new(Indexes {
                by_token: HashMap::new(),
                by_connection: HashMap::new(),
            }),
        }
    }

    /// Create a session bound to `connection_id`
    ///
    /// Returns `None` when the live session count has reached the cap.
    pub async fn create(&self, connection_id: Uuid, client_id: Option<String>) -> Option<Session> {
        let mut inner = self.inner.write().await;
        if inner.by_token.len() >= self.max_sessions {
            tracing::warn!(
                max_sessions = self.max_sessions,
                "Session cap reached, refusing authentication"
            );
            return None;
        }

        let token = generate_token();
        let now = Utc::now();
        let session = Session {
            token: token.clone(),
            connection_id,
            client_id,
            created_at: now,
            last_activity: now,
            expires_at: now + self.ttl,
            selected_scanner: None,
            active_request: None,
            scanning: false,
        };

        inner.by_connection.insert(connection_id, token.clone());
        inner.by_token.insert(token, session.clone());

        tracing::info!(connection_id = %connection_id, "Session created");
        Some(session)
    }

    /// Validate a token, refreshing its last-activity timestamp
    ///
    /// An expired entry is removed and `None` returned.
    pub async fn validate(&self, token: &str) -> Option<Session> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let expired = match inner.by_token.get(token) {
            Some(session) => session.is_expired(now),
            None => return None,
        };

        if expired {
            if let Some(session) = inner.by_token.remove(token) {
                inner.by_connection.remove(&session.connection_id);
                tracing::info!(connection_id = %session.connection_id, "Expired session removed");
            }
            return None;
        }

        let session = inner.by_token.get_mut(token)?;
        session.last_activity = now;
        Some(session.clone())
    }

    /// Look up the session bound to a connection
    pub async fn by_connection(&self, connection_id: Uuid) -> Option<Session> {
        let inner = self.inner.read().await;
        let token = inner.by_connection.get(&connection_id)?;
        inner.by_token.get(token).cloned()
    }

    /// Extend a session's expiry to now + TTL
    pub async fn renew(&self, token: &str) -> Option<Session> {
        let mut inner = self.inner.write().await;
        let session = inner.by_token.get_mut(token)?;
        session.expires_at = Utc::now() + self.ttl;
        Some(session.clone())
    }

    /// Mutate a session in place; returns false for unknown tokens
    pub async fn update<F>(&self, token: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let mut inner = self.inner.write().await;
        match inner.by_token.get_mut(token) {
            Some(session) => {
                mutate(session);
                true
            }
            None => false,
        }
    }

    /// Remove by token; idempotent
    pub async fn remove(&self, token: &str) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.by_token.remove(token) {
            inner.by_connection.remove(&session.connection_id);
            tracing::info!(connection_id = %session.connection_id, "Session removed");
        }
    }

    /// Remove by connection; idempotent
    pub async fn remove_by_connection(&self, connection_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(token) = inner.by_connection.remove(&connection_id) {
            inner.by_token.remove(&token);
            tracing::info!(connection_id = %connection_id, "Session removed on disconnect");
        }
    }

    /// Drop expired sessions; returns how many were removed
    pub async fn sweep(&self) -> usize {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let expired: Vec<String> = inner
            .by_token
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.token.clone())
            .collect();

        for token in &expired {
            if let Some(session) = inner.by_token.remove(token) {
                inner.by_connection.remove(&session.connection_id);
            }
        }

        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "Session sweep");
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_token.len()
    }
}

/// 256-bit token from the OS random source, URL-safe encoded
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Duration::minutes(30), 4)
    }

    #[test]
    fn tokens_are_url_safe_and_long() {
        let token = generate_token();
        assert!(token.len() >= 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(generate_token(), generate_token());
    }

    #[tokio::test]
    async fn create_and_validate() {
        let store = store();
        let conn = Uuid::new_v4();
        let session = store.create(conn, Some("browser".into())).await.unwrap();
        assert_eq!(session.connection_id, conn);

        let validated = store.validate(&session.token).await.unwrap();
        assert_eq!(validated.token, session.token);
        assert!(validated.last_activity >= session.last_activity);
    }

    #[tokio::test]
    async fn validate_removes_expired_entries() {
        let store = SessionStore::new(Duration::milliseconds(-1), 4);
        let conn = Uuid::new_v4();
        let session = store.create(conn, None).await.unwrap();

        assert!(store.validate(&session.token).await.is_none());
        // Both indexes are gone
        assert!(store.by_connection(conn).await.is_none());
        assert_eq!(store.len().await, 0);
        // A second validate is a no-op
        assert!(store.validate(&session.token).await.is_none());
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let store = SessionStore::new(Duration::minutes(30), 2);
        assert!(store.create(Uuid::new_v4(), None).await.is_some());
        assert!(store.create(Uuid::new_v4(), None).await.is_some());
        assert!(store.create(Uuid::new_v4(), None).await.is_none());
    }

    #[tokio::test]
    async fn remove_by_connection_clears_both_indexes() {
        let store = store();
        let conn = Uuid::new_v4();
        let session = store.create(conn, None).await.unwrap();

        store.remove_by_connection(conn).await;
        assert!(store.validate(&session.token).await.is_none());
        assert!(store.by_connection(conn).await.is_none());

        // Idempotent
        store.remove_by_connection(conn).await;
        store.remove(&session.token).await;
    }

    #[tokio::test]
    async fn sweep_drops_only_expired() {
        let expired_store = SessionStore::new(Duration::milliseconds(-1), 4);
        expired_store.create(Uuid::new_v4(), None).await.unwrap();
        expired_store.create(Uuid::new_v4(), None).await.unwrap();
        assert_eq!(expired_store.sweep().await, 2);
        assert_eq!(expired_store.len().await, 0);

        let live_store = store();
        live_store.create(Uuid::new_v4(), None).await.unwrap();
        assert_eq!(live_store.sweep().await, 0);
        assert_eq!(live_store.len().await, 1);
    }

    #[tokio::test]
    async fn renew_extends_expiry() {
        let store = store();
        let session = store.create(Uuid::new_v4(), None).await.unwrap();
        let renewed = store.renew(&session.token).await.unwrap();
        assert!(renewed.expires_at >= session.expires_at);
        assert!(store.renew("unknown-token").await.is_none());
    }

    #[tokio::test]
    async fn update_mutates_in_place() {
        let store = store();
        let session = store.create(Uuid::new_v4(), None).await.unwrap();
        assert!(
            store
                .update(&session.token, |s| {
                    s.selected_scanner = Some("a:Front Desk".into());
                    s.scanning = true;
                })
                .await
        );
        let validated = store.validate(&session.token).await.unwrap();
        assert_eq!(validated.selected_scanner.as_deref(), Some("a:Front Desk"));
        assert!(validated.scanning);
        assert!(!store.update("unknown", |_| {}).await);
    }
}
