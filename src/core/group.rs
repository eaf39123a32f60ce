use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Record;

/// Color theme of a group card.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Blue,
    Green,
    Purple,
    Gray,
    Pink,
    /// Also what unknown theme names read as.
    #[default]
    #[serde(other)]
    Default,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Purple => "purple",
            Self::Gray => "gray",
            Self::Pink => "pink",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "blue" => Some(Self::Blue),
            "green" => Some(Self::Green),
            "purple" => Some(Self::Purple),
            "gray" => Some(Self::Gray),
            "pink" => Some(Self::Pink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "theme_or_default")]
    pub theme: Theme,
    #[serde(default)]
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `null` themes show up in rows written before the column had a default.
fn theme_or_default<'de, D>(deserializer: D) -> Result<Theme, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Theme>::deserialize(deserializer)?.unwrap_or_default())
}

impl Group {
    /// A locally-built group that has not been confirmed by the server yet.
    pub fn provisional(
        id: impl Into<String>,
        user_id: impl Into<String>,
        name: impl Into<String>,
        theme: Theme,
        sort_order: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            name: name.into(),
            theme,
            sort_order,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow-merge a patch into this group.
    pub fn apply(&mut self, patch: &GroupPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(theme) = patch.theme {
            self.theme = theme;
        }
        if let Some(sort_order) = patch.sort_order {
            self.sort_order = sort_order;
        }
    }
}

impl Record for Group {
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

/// Columns the client may change on an existing group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
}

impl GroupPatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn retheme(theme: Theme) -> Self {
        Self {
            theme: Some(theme),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.theme.is_none() && self.sort_order.is_none()
    }
}

/// Insert payload; the server assigns `id` and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGroup {
    pub user_id: String,
    pub name: String,
    pub theme: Theme,
    pub sort_order: i64,
}
