use std::collections::BTreeMap;

use super::groups::cache_only;
use super::{DataGateway, Outcome, report};
use crate::cache::OperationKind;
use crate::core::order::{dedup_ids, next_sort_order, rank_in_order, ranks_for};
use crate::core::temp_id::new_temp_id;
use crate::core::{NewTodo, SortRank, Todo, TodoPatch};
use crate::error::GatewayError;

impl DataGateway {
    /// Todos of one group. Same cache-first rules as groups, but only for a
    /// signed-in user; otherwise the cache is served tagged `auth_error`.
    pub async fn load_todos(&self, group_id: &str, force_refresh: bool) -> Outcome<Vec<Todo>> {
        if !self.signed_in().await {
            log::debug!("No signed-in user, serving cached todos for {}", group_id);
            return cache_only(self.store.todos(group_id));
        }

        if !force_refresh {
            let cached = self.store.todos(group_id);
            if !cached.is_empty() {
                self.refresh_todos_in_background(group_id);
                return Outcome::cached(cached);
            }
        }

        match self.remote.select_todos(group_id).await {
            Ok(todos) => {
                self.store.save_todos(group_id, &todos);
                self.store.update_last_sync();
                Outcome::ok(todos)
            }
            Err(e) => {
                let e = GatewayError::from(e);
                log::error!("Failed to load todos for {}: {}", group_id, e);
                let cached = self.store.todos(group_id);
                if cached.is_empty() {
                    Outcome::failed(&e).with_data(Vec::new())
                } else {
                    Outcome::cached(cached).with_error(&e)
                }
            }
        }
    }

    fn refresh_todos_in_background(&self, group_id: &str) {
        let store = self.store.clone();
        let remote = self.remote.clone();
        let group_id = group_id.to_string();
        self.spawn_background(async move {
            match remote.select_todos(&group_id).await {
                Ok(todos) => {
                    store.save_todos(&group_id, &todos);
                    store.update_last_sync();
                }
                Err(e) => log::warn!("Background todo refresh for {} failed: {}", group_id, e),
            }
        });
    }

    pub async fn create_todo(&self, group_id: &str, text: &str) -> Outcome<Todo> {
        report("create todo", self.try_create_todo(group_id, text).await)
    }

    async fn try_create_todo(&self, group_id: &str, text: &str) -> Result<Todo, GatewayError> {
        let sort_order = next_sort_order(&self.store.todos(group_id));
        let temp_id = new_temp_id();
        self.store
            .add_todo(group_id, Todo::provisional(&temp_id, group_id, text, sort_order));

        let op = self.begin(OperationKind::CreateTodo, &temp_id);
        let result = self
            .remote
            .insert_todo(&NewTodo {
                group_id: group_id.to_string(),
                text: text.to_string(),
                completed: false,
                sort_order,
            })
            .await;
        self.settle(&op);

        match result {
            Ok(todo) => {
                self.store.confirm_todo(group_id, &temp_id, todo.clone());
                Ok(todo)
            }
            Err(e) => {
                self.store.delete_todo(group_id, &temp_id);
                Err(e.into())
            }
        }
    }

    pub async fn update_todo(&self, id: &str, patch: &TodoPatch) -> Outcome<Todo> {
        report("update todo", self.try_update_todo(id, patch).await)
    }

    async fn try_update_todo(&self, id: &str, patch: &TodoPatch) -> Result<Todo, GatewayError> {
        let (group_id, _, before) = self.locate_todo(id)?;
        self.store.update_todo(&group_id, id, patch);

        let op = self.begin(OperationKind::UpdateTodo, id);
        let result = self.remote.update_todo(id, patch).await;
        self.settle(&op);

        match result {
            Ok(todo) => {
                self.store.replace_todo(&group_id, id, todo.clone());
                Ok(todo)
            }
            Err(e) => {
                self.store.replace_todo(&group_id, id, before);
                Err(e.into())
            }
        }
    }

    pub async fn delete_todo(&self, id: &str) -> Outcome<()> {
        report("delete todo", self.try_delete_todo(id).await)
    }

    async fn try_delete_todo(&self, id: &str) -> Result<(), GatewayError> {
        let (group_id, position, before) = self.locate_todo(id)?;
        self.store.delete_todo(&group_id, id);

        let op = self.begin(OperationKind::DeleteTodo, id);
        let result = self.remote.delete_todos(&[id.to_string()]).await;
        self.settle(&op);

        if let Err(e) = result {
            self.store.insert_todo_at(&group_id, position, before);
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete several todos, possibly from different groups, in one call.
    /// Ids missing from the cache are still sent to the server.
    pub async fn delete_todos(&self, ids: &[String]) -> Outcome<()> {
        report("delete todos", self.try_delete_todos(ids).await)
    }

    async fn try_delete_todos(&self, ids: &[String]) -> Result<(), GatewayError> {
        if ids.is_empty() {
            return Ok(());
        }

        // group id -> (position, todo), positions as they were before removal
        let mut removed: BTreeMap<String, Vec<(usize, Todo)>> = BTreeMap::new();
        for id in ids {
            match self.locate_todo(id) {
                Ok((group_id, position, todo)) => {
                    removed.entry(group_id).or_default().push((position, todo));
                }
                Err(e) => log::debug!("{}", e),
            }
        }
        for (group_id, entries) in &removed {
            let doomed: Vec<String> = entries.iter().map(|(_, t)| t.id.clone()).collect();
            self.store.delete_todos(group_id, &doomed);
        }

        let op = self.begin(OperationKind::DeleteTodos, &ids.join(","));
        let result = self.remote.delete_todos(ids).await;
        self.settle(&op);

        if let Err(e) = result {
            for (group_id, mut entries) in removed {
                entries.sort_by_key(|(position, _)| *position);
                for (position, todo) in entries {
                    self.store.insert_todo_at(&group_id, position, todo);
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn reorder_todos(&self, group_id: &str, ids: &[String]) -> Outcome<Vec<SortRank>> {
        report("reorder todos", self.try_reorder_todos(group_id, ids).await)
    }

    async fn try_reorder_todos(
        &self,
        group_id: &str,
        ids: &[String],
    ) -> Result<Vec<SortRank>, GatewayError> {
        let ids = dedup_ids(ids);
        let snapshot = self.store.todos(group_id);
        let ranks = ranks_for(&ids);
        self.store
            .save_todos(group_id, &rank_in_order(&snapshot, &ids));

        let op = self.begin(OperationKind::ReorderTodos, group_id);
        let result = self.remote.upsert_todo_ranks(&ranks).await;
        self.settle(&op);

        match result {
            Ok(()) => Ok(ranks),
            Err(e) => {
                self.store.save_todos(group_id, &snapshot);
                Err(e.into())
            }
        }
    }
}
