use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{GROUPS_TABLE, RemoteTables, TODOS_TABLE};
use crate::auth::TokenSource;
use crate::core::{Group, GroupPatch, NewGroup, NewTodo, SortRank, Todo, TodoPatch};
use crate::error::RemoteError;

const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// Error body shared by the REST and auth endpoints. REST uses
/// `message`/`code`, auth uses `msg`/`error_code` or the OAuth pair.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
    code: Option<serde_json::Value>,
    error_code: Option<String>,
}

/// Turn a non-success response into a `RemoteError`, keeping the
/// provider's code verbatim.
pub(crate) async fn error_from_response(resp: Response) -> RemoteError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();

    let message = body
        .message
        .or(body.msg)
        .or(body.error_description)
        .or_else(|| body.error.clone())
        .unwrap_or_else(|| {
            if text.is_empty() {
                format!("Server returned {}", status)
            } else {
                format!("Server returned {}: {}", status, text)
            }
        });
    let code = body.error_code.or_else(|| match body.code {
        Some(serde_json::Value::String(code)) => Some(code),
        _ => body.error,
    });

    RemoteError {
        message,
        code,
        status: Some(status.as_u16()),
    }
}

/// `RemoteTables` over the hosted REST endpoint (`/rest/v1/<table>`).
pub struct PostgrestClient {
    rest_url: String,
    anon_key: String,
    tokens: Arc<dyn TokenSource>,
    http: Client,
}

impl PostgrestClient {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .build()
            .map_err(|e| RemoteError::new(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            rest_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
            tokens,
            http,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_url, table)
    }

    fn bearer(&self) -> String {
        self.tokens
            .access_token()
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn authed(&self, req: RequestBuilder, token: &str) -> RequestBuilder {
        req.header("apikey", &self.anon_key).bearer_auth(token)
    }

    /// Send with the current token. A 401 gets one retry if the token
    /// source manages to refresh.
    async fn send(&self, req: RequestBuilder) -> Result<Response, RemoteError> {
        let retry = req.try_clone();
        let token = self.bearer();
        let resp = self.authed(req, &token).send().await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            if let Some(retry) = retry {
                match self.tokens.refresh_access_token(&token).await {
                    Ok(true) => {
                        log::debug!("Retrying request with refreshed token");
                        let resp = self.authed(retry, &self.bearer()).send().await?;
                        return checked(resp).await;
                    }
                    Ok(false) => {}
                    Err(e) => log::warn!("Token refresh failed: {}", e),
                }
            }
        }
        checked(resp).await
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, RemoteError> {
        let resp = self.send(req).await?;
        resp.json::<T>()
            .await
            .map_err(|e| RemoteError::new(format!("Failed to parse response: {}", e)))
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, RemoteError> {
        let req = self
            .http
            .get(self.table_url(table))
            .query(&[("select", "*"), ("order", "sort_order.asc")])
            .query(filters);
        self.fetch(req).await
    }

    async fn insert<B, T>(&self, table: &str, row: &B) -> Result<T, RemoteError>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let req = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .header("Accept", SINGLE_OBJECT)
            .json(&[row]);
        self.fetch(req).await
    }

    async fn update<B, T>(&self, table: &str, id: &str, patch: &B) -> Result<T, RemoteError>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let req = self
            .http
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .header("Accept", SINGLE_OBJECT)
            .json(patch);
        self.fetch(req).await
    }

    async fn delete(&self, table: &str, filter: (&str, String)) -> Result<(), RemoteError> {
        let req = self.http.delete(self.table_url(table)).query(&[filter]);
        self.send(req).await.map(|_| ())
    }

    async fn upsert_ranks(&self, table: &str, ranks: &[SortRank]) -> Result<(), RemoteError> {
        if ranks.is_empty() {
            return Ok(());
        }
        let req = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(ranks);
        self.send(req).await.map(|_| ())
    }
}

async fn checked(resp: Response) -> Result<Response, RemoteError> {
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }
    Ok(resp)
}

/// `in.(a,b,c)` filter value.
fn in_list(ids: &[String]) -> String {
    format!("in.({})", ids.join(","))
}

#[async_trait]
impl RemoteTables for PostgrestClient {
    async fn select_groups(&self) -> Result<Vec<Group>, RemoteError> {
        self.select(GROUPS_TABLE, &[]).await
    }

    async fn insert_group(&self, group: &NewGroup) -> Result<Group, RemoteError> {
        self.insert(GROUPS_TABLE, group).await
    }

    async fn update_group(&self, id: &str, patch: &GroupPatch) -> Result<Group, RemoteError> {
        self.update(GROUPS_TABLE, id, patch).await
    }

    async fn delete_group(&self, id: &str) -> Result<(), RemoteError> {
        self.delete(GROUPS_TABLE, ("id", format!("eq.{}", id))).await
    }

    async fn upsert_group_ranks(&self, ranks: &[SortRank]) -> Result<(), RemoteError> {
        self.upsert_ranks(GROUPS_TABLE, ranks).await
    }

    async fn select_todos(&self, group_id: &str) -> Result<Vec<Todo>, RemoteError> {
        self.select(TODOS_TABLE, &[("group_id", format!("eq.{}", group_id))])
            .await
    }

    async fn insert_todo(&self, todo: &NewTodo) -> Result<Todo, RemoteError> {
        self.insert(TODOS_TABLE, todo).await
    }

    async fn update_todo(&self, id: &str, patch: &TodoPatch) -> Result<Todo, RemoteError> {
        self.update(TODOS_TABLE, id, patch).await
    }

    async fn delete_todos(&self, ids: &[String]) -> Result<(), RemoteError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.delete(TODOS_TABLE, ("id", in_list(ids))).await
    }

    async fn upsert_todo_ranks(&self, ranks: &[SortRank]) -> Result<(), RemoteError> {
        self.upsert_ranks(TODOS_TABLE, ranks).await
    }
}
