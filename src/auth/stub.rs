//! A loopback HTTP server speaking just enough of the hosted auth and REST
//! APIs for the client tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

struct Account {
    id: String,
    password: String,
    confirmed: bool,
}

#[derive(Default)]
struct Accounts {
    users: HashMap<String, Account>,
    rate_limited: HashSet<String>,
    auto_confirm: bool,
    generation: u32,
    signed_in: Option<String>,
    access: Option<String>,
    refresh: Option<String>,
    calls: Vec<String>,
}

impl Accounts {
    fn user_json(&self, email: &str) -> Value {
        let account = &self.users[email];
        json!({
            "id": account.id,
            "email": email,
            "email_confirmed_at": account.confirmed.then_some("2025-01-01T00:00:00Z"),
        })
    }

    fn issue(&mut self, email: &str) -> Value {
        self.generation += 1;
        let access = format!("access-{}", self.generation);
        let refresh = format!("refresh-{}", self.generation);
        self.signed_in = Some(email.to_string());
        self.access = Some(access.clone());
        self.refresh = Some(refresh.clone());
        json!({
            "access_token": access,
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": refresh,
            "user": self.user_json(email),
        })
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        bearer.is_some() && bearer == self.access.as_deref()
    }
}

type Shared = Arc<Mutex<Accounts>>;

fn lock(state: &Shared) -> MutexGuard<'_, Accounts> {
    state.lock().unwrap()
}

fn auth_error(status: StatusCode, code: &str, msg: &str) -> Response {
    (
        status,
        Json(json!({ "code": status.as_u16(), "error_code": code, "msg": msg })),
    )
        .into_response()
}

fn field<'a>(body: &'a Value, name: &str) -> &'a str {
    body.get(name).and_then(Value::as_str).unwrap_or_default()
}

async fn token(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let mut accounts = lock(&state);
    let grant = query.get("grant_type").cloned().unwrap_or_default();
    accounts.calls.push(format!("token:{}", grant));

    match grant.as_str() {
        "password" => {
            let email = field(&body, "email");
            let Some(account) = accounts.users.get(email) else {
                return auth_error(StatusCode::BAD_REQUEST, "invalid_credentials", "Invalid login credentials");
            };
            if account.password != field(&body, "password") {
                return auth_error(StatusCode::BAD_REQUEST, "invalid_credentials", "Invalid login credentials");
            }
            if !account.confirmed {
                return auth_error(StatusCode::BAD_REQUEST, "email_not_confirmed", "Email not confirmed");
            }
            Json(accounts.issue(email)).into_response()
        }
        "refresh_token" => {
            let current = accounts.refresh.as_deref() == Some(field(&body, "refresh_token"));
            match accounts.signed_in.clone() {
                Some(email) if current => Json(accounts.issue(&email)).into_response(),
                _ => auth_error(
                    StatusCode::BAD_REQUEST,
                    "refresh_token_not_found",
                    "Invalid Refresh Token: Refresh Token Not Found",
                ),
            }
        }
        _ => auth_error(StatusCode::BAD_REQUEST, "validation_failed", "Unsupported grant type"),
    }
}

async fn user(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut accounts = lock(&state);
    accounts.calls.push("user".to_string());
    match accounts.signed_in.clone() {
        Some(email) if accounts.authorized(&headers) => Json(accounts.user_json(&email)).into_response(),
        _ => auth_error(StatusCode::UNAUTHORIZED, "bad_jwt", "invalid JWT"),
    }
}

async fn logout(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut accounts = lock(&state);
    accounts.calls.push("logout".to_string());
    if !accounts.authorized(&headers) {
        return auth_error(StatusCode::UNAUTHORIZED, "bad_jwt", "invalid JWT");
    }
    accounts.signed_in = None;
    accounts.access = None;
    accounts.refresh = None;
    StatusCode::NO_CONTENT.into_response()
}

async fn signup(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut accounts = lock(&state);
    accounts.calls.push("signup".to_string());
    let email = field(&body, "email").to_string();
    if accounts.users.contains_key(&email) {
        return auth_error(StatusCode::UNPROCESSABLE_ENTITY, "user_already_exists", "User already registered");
    }
    let confirmed = accounts.auto_confirm;
    let id = format!("u{}", accounts.users.len() + 1);
    accounts.users.insert(
        email.clone(),
        Account {
            id,
            password: field(&body, "password").to_string(),
            confirmed,
        },
    );
    if confirmed {
        Json(accounts.issue(&email)).into_response()
    } else {
        Json(accounts.user_json(&email)).into_response()
    }
}

async fn resend(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut accounts = lock(&state);
    let email = field(&body, "email").to_string();
    accounts
        .calls
        .push(format!("resend:{}:{}", field(&body, "type"), email));
    if accounts.rate_limited.contains(&email) {
        return auth_error(
            StatusCode::TOO_MANY_REQUESTS,
            "over_email_send_rate_limit",
            "For security purposes, you can only request this after 60 seconds.",
        );
    }
    Json(json!({})).into_response()
}

async fn groups(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut accounts = lock(&state);
    accounts.calls.push("groups".to_string());
    if !accounts.authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "PGRST301", "details": null, "hint": null, "message": "JWT expired" })),
        )
            .into_response();
    }
    Json(json!([])).into_response()
}

pub struct StubServer {
    pub url: String,
    state: Shared,
}

impl StubServer {
    pub async fn start() -> Self {
        let state = Shared::default();
        let app = Router::new()
            .route("/auth/v1/token", post(token))
            .route("/auth/v1/user", get(user))
            .route("/auth/v1/logout", post(logout))
            .route("/auth/v1/signup", post(signup))
            .route("/auth/v1/resend", post(resend))
            .route("/rest/v1/groups", get(groups))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    pub fn add_user(&self, email: &str, password: &str, confirmed: bool) {
        let mut accounts = lock(&self.state);
        let id = format!("u{}", accounts.users.len() + 1);
        accounts.users.insert(
            email.to_string(),
            Account {
                id,
                password: password.to_string(),
                confirmed,
            },
        );
    }

    /// Sign-ups come back with a session instead of waiting for the email.
    pub fn auto_confirm(&self) {
        lock(&self.state).auto_confirm = true;
    }

    pub fn rate_limit(&self, email: &str) {
        lock(&self.state).rate_limited.insert(email.to_string());
    }

    /// The current access token stops working; the refresh token still does.
    pub fn expire_access_token(&self) {
        lock(&self.state).access = None;
    }

    /// Both tokens stop working.
    pub fn revoke_session(&self) {
        let mut accounts = lock(&self.state);
        accounts.access = None;
        accounts.refresh = None;
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }
}
