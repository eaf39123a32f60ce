use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Record;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub group_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Todo {
    /// A locally-built todo that has not been confirmed by the server yet.
    pub fn provisional(
        id: impl Into<String>,
        group_id: impl Into<String>,
        text: impl Into<String>,
        sort_order: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            group_id: group_id.into(),
            text: text.into(),
            completed: false,
            sort_order,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, patch: &TodoPatch) {
        if let Some(text) = &patch.text {
            self.text = text.clone();
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
        if let Some(sort_order) = patch.sort_order {
            self.sort_order = sort_order;
        }
    }
}

impl Record for Todo {
    fn id(&self) -> &str {
        &self.id
    }

    fn sort_order(&self) -> i64 {
        self.sort_order
    }

    fn set_sort_order(&mut self, sort_order: i64) {
        self.sort_order = sort_order;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
}

impl TodoPatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTodo {
    pub group_id: String,
    pub text: String,
    pub completed: bool,
    pub sort_order: i64,
}
