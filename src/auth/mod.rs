//! Who is signed in, and whether startup session restore has finished.

pub mod session;
#[cfg(test)]
pub(crate) mod stub;
pub mod supabase;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::RemoteError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_confirmed_at: Option<String>,
}

/// Identity used to scope remote queries.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// `Ok(None)` when nobody is signed in.
    async fn current_user(&self) -> Result<Option<User>, RemoteError>;
}

/// Bearer token for data requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Option<String>;

    /// Called after the server rejected `rejected`. `Ok(true)` means a
    /// different token is now current and the request is worth retrying.
    async fn refresh_access_token(&self, _rejected: &str) -> Result<bool, RemoteError> {
        Ok(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreState {
    Pending,
    Restored(Option<User>),
    Failed(String),
}

impl RestoreState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Tracks the startup session restore. Until it settles, the cache cannot
/// tell "signed out" from "not restored yet", so loads wait on it.
pub struct SessionGate {
    state: watch::Sender<RestoreState>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RestoreState::Pending);
        Self { state }
    }

    /// A gate with nothing to restore.
    pub fn settled(user: Option<User>) -> Self {
        let gate = Self::new();
        gate.restored(user);
        gate
    }

    pub fn restored(&self, user: Option<User>) {
        log::info!(
            "Session restore finished ({})",
            if user.is_some() { "signed in" } else { "signed out" }
        );
        self.state.send_replace(RestoreState::Restored(user));
    }

    pub fn failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("Session restore failed: {}", reason);
        self.state.send_replace(RestoreState::Failed(reason));
    }

    pub fn state(&self) -> RestoreState {
        self.state.borrow().clone()
    }

    /// Wait until restore has either succeeded or failed.
    pub async fn wait(&self) -> RestoreState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(RestoreState::is_settled).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }
}

/// Fixed identity, for tests and offline use.
pub struct StaticAuth {
    user: Mutex<Result<Option<User>, RemoteError>>,
}

impl StaticAuth {
    pub fn signed_in(id: &str) -> Self {
        Self::with(Ok(Some(User {
            id: id.to_string(),
            email: None,
            email_confirmed_at: None,
        })))
    }

    pub fn signed_out() -> Self {
        Self::with(Ok(None))
    }

    pub fn failing(err: RemoteError) -> Self {
        Self::with(Err(err))
    }

    fn with(user: Result<Option<User>, RemoteError>) -> Self {
        Self {
            user: Mutex::new(user),
        }
    }

    pub fn set(&self, user: Result<Option<User>, RemoteError>) {
        *self.user.lock().unwrap_or_else(PoisonError::into_inner) = user;
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_user(&self) -> Result<Option<User>, RemoteError> {
        self.user
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
