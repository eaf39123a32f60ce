use serde::Serialize;

use crate::error::GatewayError;

fn is_false(b: &bool) -> bool {
    !*b
}

/// What every gateway call hands back to the UI. Failures are values, not
/// errors: branch on `success`, show `error`, special-case on `code`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Data came from the local cache rather than the server.
    #[serde(skip_serializing_if = "is_false")]
    pub from_cache: bool,
    /// The user could not be confirmed; data is cache-only.
    #[serde(skip_serializing_if = "is_false")]
    pub auth_error: bool,
}

impl<T> Outcome<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            from_cache: false,
            auth_error: false,
        }
    }

    pub fn cached(data: T) -> Self {
        Self {
            from_cache: true,
            ..Self::ok(data)
        }
    }

    pub fn failed(err: &GatewayError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            code: err.code(),
            from_cache: false,
            auth_error: false,
        }
    }

    pub fn with_data(mut self, data: T) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach an error while keeping `success` as is (stale-cache fallback).
    pub fn with_error(mut self, err: &GatewayError) -> Self {
        self.error = Some(err.to_string());
        self.code = err.code();
        self
    }

    pub fn with_auth_error(mut self) -> Self {
        self.auth_error = true;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.success
    }
}

impl<T> From<Result<T, GatewayError>> for Outcome<T> {
    fn from(result: Result<T, GatewayError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::failed(&e),
        }
    }
}
