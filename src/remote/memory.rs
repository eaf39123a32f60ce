//! In-process stand-in for the remote service.
//!
//! Behaves like the hosted tables closely enough for the gateway: the
//! server assigns ids and timestamps, selects come back ordered, foreign
//! keys and not-null columns are enforced, and every mutation is echoed to
//! matching change-feed channels. Failures and slow writes can be scripted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{ChangeEvent, ChangeFeed, ChannelSpec, GROUPS_TABLE, RemoteTables, TODOS_TABLE};
use crate::core::{Group, GroupPatch, NewGroup, NewTodo, Record, SortRank, Todo, TodoPatch};
use crate::error::RemoteError;

/// A call as received by the backend, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    SelectGroups,
    InsertGroup(NewGroup),
    UpdateGroup(String, GroupPatch),
    DeleteGroup(String),
    UpsertGroupRanks(Vec<SortRank>),
    SelectTodos(String),
    InsertTodo(NewTodo),
    UpdateTodo(String, TodoPatch),
    DeleteTodos(Vec<String>),
    UpsertTodoRanks(Vec<SortRank>),
}

#[derive(Default)]
struct Tables {
    groups: Vec<Group>,
    todos: Vec<Todo>,
    calls: Vec<RemoteCall>,
    read_failure: Option<RemoteError>,
    write_failure: Option<RemoteError>,
    channels: HashMap<String, (ChannelSpec, mpsc::UnboundedSender<ChangeEvent>)>,
}

impl Tables {
    fn emit(&mut self, event: ChangeEvent) {
        self.channels.retain(|_, (spec, tx)| {
            if spec.matches(&event) {
                tx.send(event.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }
}

pub struct MemoryBackend {
    tables: Mutex<Tables>,
    writes_held: watch::Sender<bool>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (writes_held, _) = watch::channel(false);
        Self {
            tables: Mutex::new(Tables::default()),
            writes_held,
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seed_groups(&self, groups: Vec<Group>) {
        self.tables().groups = groups;
    }

    pub fn seed_todos(&self, todos: Vec<Todo>) {
        self.tables().todos = todos;
    }

    pub fn groups(&self) -> Vec<Group> {
        sorted(self.tables().groups.clone())
    }

    pub fn todos(&self, group_id: &str) -> Vec<Todo> {
        let todos = self
            .tables()
            .todos
            .iter()
            .filter(|t| t.group_id == group_id)
            .cloned()
            .collect();
        sorted(todos)
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.tables().calls.clone()
    }

    /// Make every following select fail with `err`.
    pub fn fail_reads(&self, err: RemoteError) {
        self.tables().read_failure = Some(err);
    }

    /// Make every following mutation fail with `err`.
    pub fn fail_writes(&self, err: RemoteError) {
        self.tables().write_failure = Some(err);
    }

    pub fn recover(&self) {
        let mut tables = self.tables();
        tables.read_failure = None;
        tables.write_failure = None;
    }

    /// Park mutations until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.writes_held.send_replace(true);
    }

    pub fn release_writes(&self) {
        self.writes_held.send_replace(false);
    }

    /// Push an event as if another client had changed a row.
    pub fn push_event(&self, event: ChangeEvent) {
        self.tables().emit(event);
    }

    pub fn open_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables().channels.keys().cloned().collect();
        names.sort();
        names
    }

    fn read(&self, call: RemoteCall) -> Result<MutexGuard<'_, Tables>, RemoteError> {
        let mut tables = self.tables();
        tables.calls.push(call);
        match &tables.read_failure {
            Some(err) => Err(err.clone()),
            None => Ok(tables),
        }
    }

    async fn write(&self, call: RemoteCall) -> Result<MutexGuard<'_, Tables>, RemoteError> {
        self.tables().calls.push(call);
        let mut held = self.writes_held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        let tables = self.tables();
        match &tables.write_failure {
            Some(err) => Err(err.clone()),
            None => Ok(tables),
        }
    }
}

fn sorted<R: Record>(mut rows: Vec<R>) -> Vec<R> {
    rows.sort_by_key(|r| r.sort_order());
    rows
}

fn row_json<T: serde::Serialize>(row: &T) -> serde_json::Value {
    serde_json::to_value(row).unwrap_or(serde_json::Value::Null)
}

fn no_row() -> RemoteError {
    RemoteError::new("JSON object requested, multiple (or no) rows returned")
        .with_code("PGRST116")
        .with_status(406)
}

fn not_null(column: &str, table: &str) -> RemoteError {
    RemoteError::new(format!(
        "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
        column, table
    ))
    .with_code("23502")
    .with_status(400)
}

#[async_trait]
impl RemoteTables for MemoryBackend {
    async fn select_groups(&self) -> Result<Vec<Group>, RemoteError> {
        let tables = self.read(RemoteCall::SelectGroups)?;
        Ok(sorted(tables.groups.clone()))
    }

    async fn insert_group(&self, group: &NewGroup) -> Result<Group, RemoteError> {
        let mut tables = self.write(RemoteCall::InsertGroup(group.clone())).await?;
        let now = Utc::now();
        let row = Group {
            id: Uuid::new_v4().to_string(),
            user_id: group.user_id.clone(),
            name: group.name.clone(),
            theme: group.theme,
            sort_order: group.sort_order,
            created_at: now,
            updated_at: now,
        };
        tables.groups.push(row.clone());
        tables.emit(ChangeEvent::insert(GROUPS_TABLE, row_json(&row)));
        Ok(row)
    }

    async fn update_group(&self, id: &str, patch: &GroupPatch) -> Result<Group, RemoteError> {
        let mut tables = self
            .write(RemoteCall::UpdateGroup(id.to_string(), patch.clone()))
            .await?;
        let row = {
            let group = tables
                .groups
                .iter_mut()
                .find(|g| g.id == id)
                .ok_or_else(no_row)?;
            group.apply(patch);
            group.updated_at = Utc::now();
            group.clone()
        };
        tables.emit(ChangeEvent::update(GROUPS_TABLE, row_json(&row)));
        Ok(row)
    }

    async fn delete_group(&self, id: &str) -> Result<(), RemoteError> {
        let mut tables = self.write(RemoteCall::DeleteGroup(id.to_string())).await?;
        let (gone, kept): (Vec<Todo>, Vec<Todo>) =
            std::mem::take(&mut tables.todos)
                .into_iter()
                .partition(|t| t.group_id == id);
        tables.todos = kept;
        for todo in gone {
            tables.emit(ChangeEvent::delete(TODOS_TABLE, row_json(&todo)));
        }
        if let Some(pos) = tables.groups.iter().position(|g| g.id == id) {
            let group = tables.groups.remove(pos);
            tables.emit(ChangeEvent::delete(GROUPS_TABLE, row_json(&group)));
        }
        Ok(())
    }

    async fn upsert_group_ranks(&self, ranks: &[SortRank]) -> Result<(), RemoteError> {
        let mut tables = self
            .write(RemoteCall::UpsertGroupRanks(ranks.to_vec()))
            .await?;
        if ranks
            .iter()
            .any(|rank| !tables.groups.iter().any(|g| g.id == rank.id))
        {
            return Err(not_null("user_id", GROUPS_TABLE));
        }
        let now = Utc::now();
        for rank in ranks {
            let row = {
                let Some(group) = tables.groups.iter_mut().find(|g| g.id == rank.id) else {
                    continue;
                };
                group.sort_order = rank.sort_order;
                group.updated_at = now;
                group.clone()
            };
            tables.emit(ChangeEvent::update(GROUPS_TABLE, row_json(&row)));
        }
        Ok(())
    }

    async fn select_todos(&self, group_id: &str) -> Result<Vec<Todo>, RemoteError> {
        let tables = self.read(RemoteCall::SelectTodos(group_id.to_string()))?;
        let todos = tables
            .todos
            .iter()
            .filter(|t| t.group_id == group_id)
            .cloned()
            .collect();
        Ok(sorted(todos))
    }

    async fn insert_todo(&self, todo: &NewTodo) -> Result<Todo, RemoteError> {
        let mut tables = self.write(RemoteCall::InsertTodo(todo.clone())).await?;
        if !tables.groups.iter().any(|g| g.id == todo.group_id) {
            return Err(RemoteError::new(
                "insert or update on table \"todos\" violates foreign key constraint \"todos_group_id_fkey\"",
            )
            .with_code("23503")
            .with_status(409));
        }
        let now = Utc::now();
        let row = Todo {
            id: Uuid::new_v4().to_string(),
            group_id: todo.group_id.clone(),
            text: todo.text.clone(),
            completed: todo.completed,
            sort_order: todo.sort_order,
            created_at: now,
            updated_at: now,
        };
        tables.todos.push(row.clone());
        tables.emit(ChangeEvent::insert(TODOS_TABLE, row_json(&row)));
        Ok(row)
    }

    async fn update_todo(&self, id: &str, patch: &TodoPatch) -> Result<Todo, RemoteError> {
        let mut tables = self
            .write(RemoteCall::UpdateTodo(id.to_string(), patch.clone()))
            .await?;
        let row = {
            let todo = tables
                .todos
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(no_row)?;
            todo.apply(patch);
            todo.updated_at = Utc::now();
            todo.clone()
        };
        tables.emit(ChangeEvent::update(TODOS_TABLE, row_json(&row)));
        Ok(row)
    }

    async fn delete_todos(&self, ids: &[String]) -> Result<(), RemoteError> {
        let mut tables = self.write(RemoteCall::DeleteTodos(ids.to_vec())).await?;
        let (gone, kept): (Vec<Todo>, Vec<Todo>) = std::mem::take(&mut tables.todos)
            .into_iter()
            .partition(|t| ids.contains(&t.id));
        tables.todos = kept;
        for todo in gone {
            tables.emit(ChangeEvent::delete(TODOS_TABLE, row_json(&todo)));
        }
        Ok(())
    }

    async fn upsert_todo_ranks(&self, ranks: &[SortRank]) -> Result<(), RemoteError> {
        let mut tables = self
            .write(RemoteCall::UpsertTodoRanks(ranks.to_vec()))
            .await?;
        if ranks
            .iter()
            .any(|rank| !tables.todos.iter().any(|t| t.id == rank.id))
        {
            return Err(not_null("group_id", TODOS_TABLE));
        }
        let now = Utc::now();
        for rank in ranks {
            let row = {
                let Some(todo) = tables.todos.iter_mut().find(|t| t.id == rank.id) else {
                    continue;
                };
                todo.sort_order = rank.sort_order;
                todo.updated_at = now;
                todo.clone()
            };
            tables.emit(ChangeEvent::update(TODOS_TABLE, row_json(&row)));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(
        &self,
        spec: &ChannelSpec,
    ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>, RemoteError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tables()
            .channels
            .insert(spec.name.clone(), (spec.clone(), tx));
        Ok(rx)
    }

    async fn remove_channel(&self, name: &str) {
        self.tables().channels.remove(name);
    }
}
