//! Remote collaborators: the row-oriented data API and its change feed.

pub mod memory;
pub mod postgrest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::{Group, GroupPatch, NewGroup, NewTodo, SortRank, Todo, TodoPatch};
use crate::error::RemoteError;

pub const GROUPS_TABLE: &str = "groups";
pub const TODOS_TABLE: &str = "todos";

/// CRUD and rank upserts against the `groups` and `todos` tables.
///
/// Selects return rows ordered by `sort_order` ascending. Inserts and
/// updates return the row as stored by the server.
#[async_trait]
pub trait RemoteTables: Send + Sync {
    async fn select_groups(&self) -> Result<Vec<Group>, RemoteError>;
    async fn insert_group(&self, group: &NewGroup) -> Result<Group, RemoteError>;
    async fn update_group(&self, id: &str, patch: &GroupPatch) -> Result<Group, RemoteError>;
    async fn delete_group(&self, id: &str) -> Result<(), RemoteError>;
    async fn upsert_group_ranks(&self, ranks: &[SortRank]) -> Result<(), RemoteError>;

    async fn select_todos(&self, group_id: &str) -> Result<Vec<Todo>, RemoteError>;
    async fn insert_todo(&self, todo: &NewTodo) -> Result<Todo, RemoteError>;
    async fn update_todo(&self, id: &str, patch: &TodoPatch) -> Result<Todo, RemoteError>;
    async fn delete_todos(&self, ids: &[String]) -> Result<(), RemoteError>;
    async fn upsert_todo_ranks(&self, ranks: &[SortRank]) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change pushed by the server. Rows stay raw JSON so the
/// event can be handed to listeners exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn insert(table: &str, row: serde_json::Value) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            table: table.to_string(),
            new: Some(row),
            old: None,
        }
    }

    pub fn update(table: &str, row: serde_json::Value) -> Self {
        Self {
            event_type: ChangeKind::Update,
            table: table.to_string(),
            new: Some(row),
            old: None,
        }
    }

    pub fn delete(table: &str, old: serde_json::Value) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            table: table.to_string(),
            new: None,
            old: Some(old),
        }
    }

    /// `id` of the affected row, from `new` or else `old`.
    pub fn row_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .and_then(|row| row.get("id"))
            .and_then(|id| id.as_str())
    }
}

/// What a channel listens to: one table, optionally narrowed by a
/// `column=eq.value` filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub table: String,
    pub filter: Option<String>,
}

impl ChannelSpec {
    /// Whether `event` passes this channel's table and filter.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        let Some(filter) = &self.filter else {
            return true;
        };
        let Some((column, value)) = filter.split_once("=eq.") else {
            return true;
        };
        [event.new.as_ref(), event.old.as_ref()]
            .into_iter()
            .flatten()
            .any(|row| row.get(column).and_then(|v| v.as_str()) == Some(value))
    }
}

/// Subscription side of the server: channels of row-change events.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(
        &self,
        spec: &ChannelSpec,
    ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>, RemoteError>;

    /// Tear down a channel on the server side.
    async fn remove_channel(&self, name: &str);
}
