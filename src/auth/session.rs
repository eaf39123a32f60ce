use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::User;

pub(crate) const SERVICE_NAME: &str = "cirrus-session";

/// Sessions are trusted for ten days after sign-in.
pub const SESSION_DURATION_MS: i64 = 10 * 24 * 60 * 60 * 1000;

/// What is kept in the keyring between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user: User,
    pub created_at: i64,
    pub expires_at: i64,
}

impl StoredSession {
    pub fn new(access_token: String, refresh_token: String, user: User, now_ms: i64) -> Self {
        Self {
            access_token,
            refresh_token,
            user,
            created_at: now_ms,
            expires_at: now_ms + SESSION_DURATION_MS,
        }
    }

    pub fn is_valid(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }

    /// Whole days left, rounded up; zero once expired.
    pub fn remaining_days(&self, now_ms: i64) -> i64 {
        if !self.is_valid(now_ms) {
            return 0;
        }
        let day = 24 * 60 * 60 * 1000;
        (self.expires_at - now_ms + day - 1) / day
    }
}

fn attributes(server: &str) -> HashMap<&str, &str> {
    let mut attrs = HashMap::new();
    attrs.insert("service", SERVICE_NAME);
    attrs.insert("server", server);
    attrs
}

/// Store the session for `server` in the system keyring.
pub async fn store_session(server: &str, session: &StoredSession) -> Result<(), String> {
    let keyring = oo7::Keyring::new()
        .await
        .map_err(|e| format!("Failed to connect to keyring: {}", e))?;

    let secret = serde_json::to_string(session)
        .map_err(|e| format!("Failed to serialize session: {}", e))?;

    keyring
        .create_item(
            &format!("Cirrus session ({})", server),
            &attributes(server),
            secret.as_bytes(),
            true, // replace existing
        )
        .await
        .map_err(|e| format!("Failed to store session: {}", e))?;

    Ok(())
}

/// Load the stored session for `server`. Unreadable entries are deleted
/// and reported as absent.
pub async fn load_session(server: &str) -> Result<Option<StoredSession>, String> {
    let keyring = oo7::Keyring::new()
        .await
        .map_err(|e| format!("Failed to connect to keyring: {}", e))?;

    let items = keyring
        .search_items(&attributes(server))
        .await
        .map_err(|e| format!("Failed to search keyring: {}", e))?;

    let Some(item) = items.first() else {
        return Ok(None);
    };

    let secret_bytes = item
        .secret()
        .await
        .map_err(|e| format!("Failed to read secret: {}", e))?;

    match serde_json::from_slice::<StoredSession>(&secret_bytes.to_vec()) {
        Ok(session) => Ok(Some(session)),
        Err(e) => {
            log::warn!("Discarding unreadable stored session: {}", e);
            if let Err(e) = item.delete().await {
                log::error!("Failed to delete stored session: {}", e);
            }
            Ok(None)
        }
    }
}

/// Delete the stored session for `server`.
pub async fn clear_session(server: &str) -> Result<(), String> {
    let keyring = oo7::Keyring::new()
        .await
        .map_err(|e| format!("Failed to connect to keyring: {}", e))?;

    let items = keyring
        .search_items(&attributes(server))
        .await
        .map_err(|e| format!("Failed to search keyring: {}", e))?;

    for item in items {
        item.delete()
            .await
            .map_err(|e| format!("Failed to delete session: {}", e))?;
    }

    Ok(())
}

/// Where the signed-in session survives restarts.
#[async_trait]
pub trait SessionVault: Send + Sync {
    async fn load(&self) -> Result<Option<StoredSession>, String>;
    async fn store(&self, session: &StoredSession) -> Result<(), String>;
    async fn clear(&self) -> Result<(), String>;
}

/// The system keyring, one entry per server.
pub struct KeyringVault {
    server: String,
}

impl KeyringVault {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
        }
    }
}

#[async_trait]
impl SessionVault for KeyringVault {
    async fn load(&self) -> Result<Option<StoredSession>, String> {
        load_session(&self.server).await
    }

    async fn store(&self, session: &StoredSession) -> Result<(), String> {
        store_session(&self.server, session).await
    }

    async fn clear(&self) -> Result<(), String> {
        clear_session(&self.server).await
    }
}

/// Process-local vault for tests and machines without a keyring.
#[derive(Default)]
pub struct MemoryVault {
    session: Mutex<Option<StoredSession>>,
}

impl MemoryVault {
    pub fn holding(session: StoredSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }

    pub fn get(&self) -> Option<StoredSession> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, session: Option<StoredSession>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }
}

#[async_trait]
impl SessionVault for MemoryVault {
    async fn load(&self) -> Result<Option<StoredSession>, String> {
        Ok(self.get())
    }

    async fn store(&self, session: &StoredSession) -> Result<(), String> {
        self.set(Some(session.clone()));
        Ok(())
    }

    async fn clear(&self) -> Result<(), String> {
        self.set(None);
        Ok(())
    }
}
