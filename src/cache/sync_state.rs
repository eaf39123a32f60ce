use serde::{Deserialize, Serialize};

/// Mutation kinds recorded in the pending-operation journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateGroup,
    UpdateGroup,
    DeleteGroup,
    ReorderGroups,
    CreateTodo,
    UpdateTodo,
    DeleteTodo,
    DeleteTodos,
    ReorderTodos,
}

/// A mutation that was sent to the server and has not settled yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: String,
    pub kind: OperationKind,
    /// Affected record, or the parent group for batch/reorder operations.
    pub entity_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, entity_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            entity_id: entity_id.into(),
            timestamp: 0,
        }
    }
}

/// `sync-state.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(default)]
    pub last_sync: Option<i64>,
    #[serde(default)]
    pub pending_operations: Vec<PendingOperation>,
}
