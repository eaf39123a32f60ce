use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::session::{SessionVault, StoredSession};
use super::{AuthProvider, SessionGate, TokenSource, User};
use crate::error::{GatewayError, RemoteError};
use crate::gateway::{DataGateway, Outcome};
use crate::remote::postgrest::error_from_response;

/// Where confirmation links send the user back to.
pub const EMAIL_REDIRECT: &str = "cirrus://auth/callback";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    user: User,
}

impl TokenResponse {
    fn into_session(self) -> StoredSession {
        StoredSession::new(
            self.access_token,
            self.refresh_token,
            self.user,
            chrono::Utc::now().timestamp_millis(),
        )
    }
}

/// `/signup` answers with a session when confirmation is off, otherwise
/// with the bare user.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(User),
}

/// Result of a sign-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUp {
    pub user: User,
    /// Present when the server signed the new account in right away.
    pub session: Option<StoredSession>,
    /// The address must be confirmed before password sign-in works.
    pub needs_confirmation: bool,
}

/// Password sign-in, sign-up, refresh and user lookup against `/auth/v1`.
///
/// Holds the current session. With a vault attached, every session it
/// adopts is persisted and sign-out clears it.
pub struct SupabaseAuth {
    auth_url: String,
    anon_key: String,
    session: RwLock<Option<StoredSession>>,
    vault: Option<Arc<dyn SessionVault>>,
    refreshing: tokio::sync::Mutex<()>,
    http: Client,
}

impl SupabaseAuth {
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .build()
            .map_err(|e| RemoteError::new(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            auth_url: format!("{}/auth/v1", base_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
            session: RwLock::new(None),
            vault: None,
            refreshing: tokio::sync::Mutex::new(()),
            http,
        })
    }

    pub fn with_vault(mut self, vault: Arc<dyn SessionVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn session(&self) -> Option<StoredSession> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session(&self, session: Option<StoredSession>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    /// Make `session` current and persist it.
    async fn adopt(&self, session: &StoredSession) {
        self.set_session(Some(session.clone()));
        if let Some(vault) = &self.vault {
            if let Err(e) = vault.store(session).await {
                log::warn!("{}", e);
            }
        }
    }

    async fn forget(&self) {
        self.set_session(None);
        if let Some(vault) = &self.vault {
            if let Err(e) = vault.clear().await {
                log::error!("{}", e);
            }
        }
    }

    async fn token_grant(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<StoredSession, RemoteError> {
        let resp = self
            .http
            .post(format!("{}/token", self.auth_url))
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::new(format!("Failed to parse token response: {}", e)))?;
        Ok(token.into_session())
    }

    /// Sign in with email and password and persist the new session. An
    /// unconfirmed address comes back as an error with code
    /// `email_not_confirmed`.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<StoredSession, RemoteError> {
        log::info!("Signing in {}", email);
        let session = self
            .token_grant(
                "password",
                serde_json::json!({ "email": email, "password": password }),
            )
            .await?;
        self.adopt(&session).await;
        Ok(session)
    }

    /// Register a new account. Unless the server confirms addresses
    /// automatically, nobody is signed in until the emailed link is used.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUp, RemoteError> {
        log::info!("Signing up {}", email);
        let resp = self
            .http
            .post(format!("{}/signup", self.auth_url))
            .query(&[("redirect_to", EMAIL_REDIRECT)])
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let body: SignUpResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::new(format!("Failed to parse sign-up response: {}", e)))?;

        let (user, session) = match body {
            SignUpResponse::Session(token) => {
                let session = token.into_session();
                self.adopt(&session).await;
                (session.user.clone(), Some(session))
            }
            SignUpResponse::User(user) => (user, None),
        };
        Ok(SignUp {
            needs_confirmation: user.email_confirmed_at.is_none(),
            user,
            session,
        })
    }

    /// Send the sign-up confirmation email again. The server rate-limits
    /// this (`over_email_send_rate_limit`, status 429).
    pub async fn resend_confirmation(&self, email: &str) -> Result<(), RemoteError> {
        log::info!("Resending confirmation to {}", email);
        let resp = self
            .http
            .post(format!("{}/resend", self.auth_url))
            .query(&[("redirect_to", EMAIL_REDIRECT)])
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "type": "signup", "email": email }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(())
    }

    pub async fn refresh_session(&self, refresh_token: &str) -> Result<StoredSession, RemoteError> {
        self.token_grant(
            "refresh_token",
            serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }

    /// Adopt a stored session, refreshing it if the access token was
    /// rejected. Returns the (possibly refreshed) session.
    pub async fn restore(&self, stored: &StoredSession) -> Result<StoredSession, RemoteError> {
        self.set_session(Some(stored.clone()));

        match self.fetch_user(&stored.access_token).await {
            Ok(user) => {
                let mut session = stored.clone();
                session.user = user;
                self.set_session(Some(session.clone()));
                Ok(session)
            }
            Err(e) if e.status == Some(StatusCode::UNAUTHORIZED.as_u16()) => {
                log::info!("Stored access token rejected, refreshing");
                let refreshed = match self.refresh_session(&stored.refresh_token).await {
                    Ok(refreshed) => refreshed,
                    Err(e) => {
                        self.set_session(None);
                        return Err(e);
                    }
                };
                let refreshed = keep_window(refreshed, stored);
                self.set_session(Some(refreshed.clone()));
                Ok(refreshed)
            }
            Err(e) => {
                self.set_session(None);
                Err(e)
            }
        }
    }

    /// End the session on the server and forget it locally, including the
    /// vault entry. Local state is cleared even when the server call fails.
    pub async fn sign_out(&self) -> Result<(), RemoteError> {
        let Some(session) = self.session() else {
            self.forget().await;
            return Ok(());
        };
        self.forget().await;
        log::info!("Signing out");

        let resp = self
            .http
            .post(format!("{}/logout", self.auth_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        if !resp.status().is_success() && resp.status() != StatusCode::UNAUTHORIZED {
            return Err(error_from_response(resp).await);
        }
        Ok(())
    }

    async fn fetch_user(&self, access_token: &str) -> Result<User, RemoteError> {
        let resp = self
            .http
            .get(format!("{}/user", self.auth_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        resp.json()
            .await
            .map_err(|e| RemoteError::new(format!("Failed to parse user: {}", e)))
    }
}

/// The validity window runs from the original sign-in, not the refresh.
fn keep_window(mut refreshed: StoredSession, original: &StoredSession) -> StoredSession {
    refreshed.created_at = original.created_at;
    refreshed.expires_at = original.expires_at;
    refreshed
}

#[async_trait]
impl AuthProvider for SupabaseAuth {
    async fn current_user(&self) -> Result<Option<User>, RemoteError> {
        let Some(session) = self.session() else {
            return Ok(None);
        };
        match self.fetch_user(&session.access_token).await {
            Err(e) if e.status == Some(StatusCode::UNAUTHORIZED.as_u16()) => {
                if !self.refresh_access_token(&session.access_token).await? {
                    return Err(e);
                }
                let token = self.access_token().ok_or(e)?;
                self.fetch_user(&token).await.map(Some)
            }
            result => result.map(Some),
        }
    }
}

#[async_trait]
impl TokenSource for SupabaseAuth {
    fn access_token(&self) -> Option<String> {
        self.session().map(|s| s.access_token)
    }

    async fn refresh_access_token(&self, rejected: &str) -> Result<bool, RemoteError> {
        let _refreshing = self.refreshing.lock().await;
        let Some(current) = self.session() else {
            return Ok(false);
        };
        if current.access_token != rejected {
            // Someone else refreshed while we waited.
            return Ok(true);
        }
        if !current.is_valid(chrono::Utc::now().timestamp_millis()) {
            log::info!("Session older than its validity window, not refreshing");
            return Ok(false);
        }

        log::debug!("Access token rejected, refreshing");
        let refreshed = keep_window(self.refresh_session(&current.refresh_token).await?, &current);
        self.adopt(&refreshed).await;
        Ok(true)
    }
}

/// Restore the vault's session into `auth` and settle `gate`. Without a
/// vault there is nothing to restore.
pub async fn restore_session(auth: &SupabaseAuth, gate: &SessionGate) {
    let Some(vault) = &auth.vault else {
        gate.restored(None);
        return;
    };
    let stored = match vault.load().await {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            gate.restored(None);
            return;
        }
        Err(e) => {
            gate.failed(e);
            return;
        }
    };

    let now = chrono::Utc::now().timestamp_millis();
    if !stored.is_valid(now) {
        log::info!("Stored session expired, signing out");
        auth.forget().await;
        gate.restored(None);
        return;
    }

    match auth.restore(&stored).await {
        Ok(session) => {
            if session != stored {
                if let Err(e) = vault.store(&session).await {
                    log::warn!("{}", e);
                }
            }
            log::info!(
                "Session restored, {} day(s) left",
                session.remaining_days(now)
            );
            gate.restored(Some(session.user));
        }
        Err(e) => gate.failed(e.message),
    }
}

/// Logout: drop realtime channels and the cache, then end the session and
/// clear the stored copy.
pub async fn log_out(auth: &SupabaseAuth, gateway: &DataGateway) -> Outcome<()> {
    let torn_down = gateway.teardown().await;
    if let Err(e) = auth.sign_out().await {
        log::warn!("Server sign-out failed, local session cleared anyway: {}", e);
        return Outcome::failed(&GatewayError::from(e));
    }
    torn_down
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RestoreState;
    use crate::auth::session::{MemoryVault, SESSION_DURATION_MS};
    use crate::auth::stub::StubServer;

    fn client(server: &StubServer, vault: &Arc<MemoryVault>) -> SupabaseAuth {
        SupabaseAuth::new(&server.url, "anon")
            .unwrap()
            .with_vault(vault.clone())
    }

    #[tokio::test]
    async fn signed_out_client_has_no_user_or_token() {
        let auth = SupabaseAuth::new("https://example.supabase.co", "anon").unwrap();
        assert!(auth.current_user().await.unwrap().is_none());
        assert!(auth.access_token().is_none());
        assert!(auth.sign_out().await.is_ok());
        assert!(!auth.refresh_access_token("anon").await.unwrap());
    }

    #[test]
    fn token_response_parses() {
        let json = r#"{
            "access_token": "a", "token_type": "bearer", "expires_in": 3600,
            "refresh_token": "r",
            "user": { "id": "u1", "email": "x@example.com", "email_confirmed_at": null }
        }"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.user.id, "u1");
        assert_eq!(token.refresh_token, "r");
    }

    #[tokio::test]
    async fn sign_in_persists_a_ten_day_session() {
        let server = StubServer::start().await;
        server.add_user("a@example.com", "pw", true);
        let vault = Arc::new(MemoryVault::default());
        let auth = client(&server, &vault);

        let session = auth.sign_in_with_password("a@example.com", "pw").await.unwrap();
        assert_eq!(vault.get(), Some(session.clone()));
        assert_eq!(session.expires_at - session.created_at, SESSION_DURATION_MS);
        assert_eq!(auth.access_token().as_deref(), Some("access-1"));
        assert_eq!(auth.current_user().await.unwrap().unwrap().id, "u1");
    }

    #[tokio::test]
    async fn unconfirmed_sign_in_passes_the_code_through() {
        let server = StubServer::start().await;
        server.add_user("new@example.com", "pw", false);
        let vault = Arc::new(MemoryVault::default());
        let auth = client(&server, &vault);

        let err = auth
            .sign_in_with_password("new@example.com", "pw")
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("email_not_confirmed"));
        assert_eq!(err.message, "Email not confirmed");
        assert!(vault.get().is_none());
        assert!(auth.session().is_none());
    }

    #[tokio::test]
    async fn sign_up_waits_for_confirmation() {
        let server = StubServer::start().await;
        let vault = Arc::new(MemoryVault::default());
        let auth = client(&server, &vault);

        let signed_up = auth.sign_up("new@example.com", "pw").await.unwrap();
        assert!(signed_up.needs_confirmation);
        assert!(signed_up.session.is_none());
        assert_eq!(signed_up.user.email.as_deref(), Some("new@example.com"));
        assert!(vault.get().is_none());

        let again = auth.sign_up("new@example.com", "pw").await.unwrap_err();
        assert_eq!(again.code.as_deref(), Some("user_already_exists"));
        assert_eq!(again.status, Some(422));
    }

    #[tokio::test]
    async fn auto_confirmed_sign_up_is_signed_in() {
        let server = StubServer::start().await;
        server.auto_confirm();
        let vault = Arc::new(MemoryVault::default());
        let auth = client(&server, &vault);

        let signed_up = auth.sign_up("new@example.com", "pw").await.unwrap();
        assert!(!signed_up.needs_confirmation);
        let session = signed_up.session.unwrap();
        assert_eq!(vault.get(), Some(session));
        assert!(auth.access_token().is_some());
    }

    #[tokio::test]
    async fn resend_is_a_signup_confirmation_and_reports_rate_limits() {
        let server = StubServer::start().await;
        server.add_user("new@example.com", "pw", false);
        server.rate_limit("busy@example.com");
        let auth = SupabaseAuth::new(&server.url, "anon").unwrap();

        auth.resend_confirmation("new@example.com").await.unwrap();
        assert!(server.calls().contains(&"resend:signup:new@example.com".to_string()));

        let err = auth.resend_confirmation("busy@example.com").await.unwrap_err();
        assert_eq!(err.status, Some(429));
        assert_eq!(err.code.as_deref(), Some("over_email_send_rate_limit"));
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_inside_the_window() {
        let server = StubServer::start().await;
        server.add_user("a@example.com", "pw", true);
        let vault = Arc::new(MemoryVault::default());
        let auth = client(&server, &vault);
        let signed_in = auth.sign_in_with_password("a@example.com", "pw").await.unwrap();

        server.expire_access_token();
        assert!(auth.refresh_access_token("access-1").await.unwrap());
        let refreshed = vault.get().unwrap();
        assert_eq!(refreshed.access_token, "access-2");
        assert_eq!(refreshed.refresh_token, "refresh-2");
        assert_eq!(refreshed.created_at, signed_in.created_at);
        assert_eq!(refreshed.expires_at, signed_in.expires_at);

        // A second caller that saw the same stale token does not refresh again.
        assert!(auth.refresh_access_token("access-1").await.unwrap());
        assert_eq!(server.count("token:refresh_token"), 1);
    }

    #[tokio::test]
    async fn current_user_survives_an_expired_access_token() {
        let server = StubServer::start().await;
        server.add_user("a@example.com", "pw", true);
        let vault = Arc::new(MemoryVault::default());
        let auth = client(&server, &vault);
        auth.sign_in_with_password("a@example.com", "pw").await.unwrap();

        server.expire_access_token();
        let user = auth.current_user().await.unwrap().unwrap();
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
        assert_eq!(auth.access_token().as_deref(), Some("access-2"));
    }

    #[tokio::test]
    async fn no_refresh_past_the_validity_window() {
        let server = StubServer::start().await;
        server.add_user("a@example.com", "pw", true);
        let vault = Arc::new(MemoryVault::default());
        let auth = client(&server, &vault);
        let mut session = auth.sign_in_with_password("a@example.com", "pw").await.unwrap();

        session.created_at -= SESSION_DURATION_MS;
        session.expires_at -= SESSION_DURATION_MS;
        auth.set_session(Some(session));
        server.expire_access_token();

        assert!(!auth.refresh_access_token("access-1").await.unwrap());
        assert_eq!(server.count("token:refresh_token"), 0);
    }

    #[tokio::test]
    async fn restore_refreshes_a_rejected_stored_token() {
        let server = StubServer::start().await;
        server.add_user("a@example.com", "pw", true);
        let first = SupabaseAuth::new(&server.url, "anon").unwrap();
        let stored = first.sign_in_with_password("a@example.com", "pw").await.unwrap();
        server.expire_access_token();

        let vault = Arc::new(MemoryVault::holding(stored.clone()));
        let auth = client(&server, &vault);
        let gate = SessionGate::new();
        restore_session(&auth, &gate).await;

        assert_eq!(
            gate.state(),
            RestoreState::Restored(Some(stored.user.clone()))
        );
        let persisted = vault.get().unwrap();
        assert_eq!(persisted.access_token, "access-2");
        assert_eq!(persisted.expires_at, stored.expires_at);
    }

    #[tokio::test]
    async fn expired_stored_session_is_cleared() {
        let server = StubServer::start().await;
        let mut stored = StoredSession::new(
            "access-x".into(),
            "refresh-x".into(),
            User {
                id: "u1".into(),
                email: None,
                email_confirmed_at: None,
            },
            0,
        );
        stored.expires_at = SESSION_DURATION_MS;
        let vault = Arc::new(MemoryVault::holding(stored));
        let auth = client(&server, &vault);
        let gate = SessionGate::new();

        restore_session(&auth, &gate).await;
        assert_eq!(gate.state(), RestoreState::Restored(None));
        assert!(vault.get().is_none());
        assert!(server.calls().is_empty());
    }

    #[tokio::test]
    async fn no_vault_means_signed_out() {
        let auth = SupabaseAuth::new("https://example.supabase.co", "anon").unwrap();
        let gate = SessionGate::new();
        restore_session(&auth, &gate).await;
        assert_eq!(gate.state(), RestoreState::Restored(None));
    }

    #[tokio::test]
    async fn log_out_ends_session_clears_vault_and_cache() {
        use crate::gateway::fixture::{fixture, group};

        let server = StubServer::start().await;
        server.add_user("a@example.com", "pw", true);
        let vault = Arc::new(MemoryVault::default());
        let auth = client(&server, &vault);
        auth.sign_in_with_password("a@example.com", "pw").await.unwrap();

        let f = fixture();
        f.store.save_groups(&[group("g1", 0)]);
        f.gateway.subscribe_to_groups(|_| {}).await;

        let out = log_out(&auth, &f.gateway).await;
        assert!(out.success);
        assert!(vault.get().is_none());
        assert!(auth.session().is_none());
        assert_eq!(server.count("logout"), 1);
        assert!(!f.store.has_cached_data());
        assert!(f.backend.open_channels().is_empty());

        // The old tokens are dead server-side too.
        assert!(auth.refresh_session("refresh-1").await.is_err());
    }
}
