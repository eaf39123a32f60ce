//! Folds server-pushed row changes into the local cache.
//!
//! One channel for all groups, one per group for todos. Each channel is a
//! spawned task that applies the event to the [`LocalStore`] first and only
//! then hands the raw event to the listener, so listeners can re-read the
//! cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::cache::LocalStore;
use crate::core::{Group, Todo};
use crate::error::RemoteError;
use crate::remote::{ChangeEvent, ChangeFeed, ChangeKind, ChannelSpec, GROUPS_TABLE, TODOS_TABLE};

pub const GROUPS_CHANNEL: &str = "groups";

pub fn todos_channel(group_id: &str) -> String {
    format!("todos-{}", group_id)
}

/// Which cache collection a channel feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Groups,
    Todos(String),
}

pub struct Reconciler {
    store: Arc<LocalStore>,
    feed: Arc<dyn ChangeFeed>,
    channels: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(store: Arc<LocalStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            store,
            feed,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn subscribe_to_groups<F>(&self, listener: F) -> Result<String, RemoteError>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let spec = ChannelSpec {
            name: GROUPS_CHANNEL.to_string(),
            table: GROUPS_TABLE.to_string(),
            filter: None,
        };
        self.open(spec, Scope::Groups, listener).await
    }

    /// At most one channel per group: subscribing again replaces the
    /// previous channel and its listener.
    pub async fn subscribe_to_todos<F>(
        &self,
        group_id: &str,
        listener: F,
    ) -> Result<String, RemoteError>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let spec = ChannelSpec {
            name: todos_channel(group_id),
            table: TODOS_TABLE.to_string(),
            filter: Some(format!("group_id=eq.{}", group_id)),
        };
        self.open(spec, Scope::Todos(group_id.to_string()), listener)
            .await
    }

    async fn open<F>(&self, spec: ChannelSpec, scope: Scope, listener: F) -> Result<String, RemoteError>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.unsubscribe(&spec.name).await;

        let mut events = self.feed.subscribe(&spec).await?;
        let store = self.store.clone();
        let name = spec.name.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                apply_event(&store, &scope, &event);
                listener(&event);
            }
            log::debug!("Channel {} closed", name);
        });

        log::info!("Subscribed to {}", spec.name);
        // A concurrent subscribe to the same name may have landed first.
        if let Some(previous) = self.channels().insert(spec.name.clone(), handle) {
            previous.abort();
        }
        Ok(spec.name)
    }

    /// Tear down one channel. Returns whether it was open.
    pub async fn unsubscribe(&self, name: &str) -> bool {
        let Some(handle) = self.channels().remove(name) else {
            return false;
        };
        handle.abort();
        self.feed.remove_channel(name).await;
        log::debug!("Unsubscribed from {}", name);
        true
    }

    pub async fn unsubscribe_all(&self) {
        let names: Vec<String> = self.channels().keys().cloned().collect();
        for name in names {
            self.unsubscribe(&name).await;
        }
    }

    pub fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels().keys().cloned().collect();
        names.sort();
        names
    }
}

fn parse_row<T: DeserializeOwned>(row: Option<&serde_json::Value>) -> Option<T> {
    let row = row?;
    match serde_json::from_value(row.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            log::error!("Unreadable row in change event: {}", e);
            None
        }
    }
}

/// Apply one change to the cache. Returns false when the event carried
/// nothing usable; the event is still worth forwarding in that case.
///
/// Inserts upsert by id, so a server echo of a row this client already
/// confirmed is a no-op. Updates replace the whole record.
pub fn apply_event(store: &LocalStore, scope: &Scope, event: &ChangeEvent) -> bool {
    match scope {
        Scope::Groups => match event.event_type {
            ChangeKind::Insert => parse_row::<Group>(event.new.as_ref())
                .map(|group| store.upsert_group(group))
                .unwrap_or(false),
            ChangeKind::Update => parse_row::<Group>(event.new.as_ref())
                .map(|group| store.replace_group(&group.id.clone(), group))
                .unwrap_or(false),
            ChangeKind::Delete => match event.row_id() {
                Some(id) => store.delete_group(id),
                None => false,
            },
        },
        Scope::Todos(group_id) => match event.event_type {
            ChangeKind::Insert => parse_row::<Todo>(event.new.as_ref())
                .map(|todo| store.upsert_todo(&todo.group_id.clone(), todo))
                .unwrap_or(false),
            ChangeKind::Update => parse_row::<Todo>(event.new.as_ref())
                .map(|todo| {
                    let (group, id) = (todo.group_id.clone(), todo.id.clone());
                    store.replace_todo(&group, &id, todo)
                })
                .unwrap_or(false),
            ChangeKind::Delete => match event.row_id() {
                Some(id) => store.delete_todo(group_id, id),
                None => false,
            },
        },
    }
}
