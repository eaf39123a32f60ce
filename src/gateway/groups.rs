use super::{DataGateway, Outcome, report};
use crate::cache::OperationKind;
use crate::core::order::{dedup_ids, next_sort_order, rank_in_order, ranks_for};
use crate::core::temp_id::new_temp_id;
use crate::core::{Group, GroupPatch, NewGroup, SortRank, Theme};
use crate::error::GatewayError;

impl DataGateway {
    /// All groups ordered by `sort_order`. Serves the cache when it has
    /// anything (and refreshes it in the background) unless `force_refresh`.
    pub async fn load_groups(&self, force_refresh: bool) -> Outcome<Vec<Group>> {
        if !self.session_usable().await {
            return cache_only(self.store.groups());
        }

        if !force_refresh {
            let cached = self.store.groups();
            if !cached.is_empty() {
                self.refresh_groups_in_background();
                return Outcome::cached(cached);
            }
        }

        match self.remote.select_groups().await {
            Ok(groups) => {
                self.store.save_groups(&groups);
                self.store.update_last_sync();
                Outcome::ok(groups)
            }
            Err(e) => {
                let e = GatewayError::from(e);
                log::error!("Failed to load groups: {}", e);
                let cached = self.store.groups();
                if cached.is_empty() {
                    Outcome::failed(&e).with_data(Vec::new())
                } else {
                    Outcome::cached(cached).with_error(&e)
                }
            }
        }
    }

    fn refresh_groups_in_background(&self) {
        let store = self.store.clone();
        let remote = self.remote.clone();
        self.spawn_background(async move {
            match remote.select_groups().await {
                Ok(groups) => {
                    log::debug!("Background refresh: {} groups", groups.len());
                    store.save_groups(&groups);
                    store.update_last_sync();
                }
                Err(e) => log::warn!("Background group refresh failed: {}", e),
            }
        });
    }

    pub async fn create_group(&self, name: &str, theme: Theme) -> Outcome<Group> {
        report("create group", self.try_create_group(name, theme).await)
    }

    async fn try_create_group(&self, name: &str, theme: Theme) -> Result<Group, GatewayError> {
        let user = self
            .auth
            .current_user()
            .await?
            .ok_or(GatewayError::NotAuthenticated)?;

        let sort_order = next_sort_order(&self.store.groups());
        let temp_id = new_temp_id();
        self.store.add_group(Group::provisional(
            &temp_id, &user.id, name, theme, sort_order,
        ));

        let op = self.begin(OperationKind::CreateGroup, &temp_id);
        let result = self
            .remote
            .insert_group(&NewGroup {
                user_id: user.id,
                name: name.to_string(),
                theme,
                sort_order,
            })
            .await;
        self.settle(&op);

        match result {
            Ok(group) => {
                self.store.confirm_group(&temp_id, group.clone());
                Ok(group)
            }
            Err(e) => {
                self.store.delete_group(&temp_id);
                Err(e.into())
            }
        }
    }

    pub async fn update_group(&self, id: &str, patch: &GroupPatch) -> Outcome<Group> {
        report("update group", self.try_update_group(id, patch).await)
    }

    async fn try_update_group(&self, id: &str, patch: &GroupPatch) -> Result<Group, GatewayError> {
        let before = self.store.groups().into_iter().find(|g| g.id == id);
        if before.is_some() {
            self.store.update_group(id, patch);
        }

        let op = self.begin(OperationKind::UpdateGroup, id);
        let result = self.remote.update_group(id, patch).await;
        self.settle(&op);

        match result {
            Ok(group) => {
                self.store.replace_group(id, group.clone());
                Ok(group)
            }
            Err(e) => {
                if let Some(before) = before {
                    self.store.replace_group(id, before);
                }
                Err(e.into())
            }
        }
    }

    /// Delete a group; the server cascades to its todos, the cache drops
    /// the group's todo file.
    pub async fn delete_group(&self, id: &str) -> Outcome<()> {
        report("delete group", self.try_delete_group(id).await)
    }

    async fn try_delete_group(&self, id: &str) -> Result<(), GatewayError> {
        let groups = self.store.groups();
        let position = groups.iter().position(|g| g.id == id);
        let todos = self.store.todos(id);
        self.store.delete_group(id);

        let op = self.begin(OperationKind::DeleteGroup, id);
        let result = self.remote.delete_group(id).await;
        self.settle(&op);

        if let Err(e) = result {
            if let Some(pos) = position {
                self.store.insert_group_at(pos, groups[pos].clone());
            }
            if !todos.is_empty() {
                self.store.save_todos(id, &todos);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Rank groups by their position in `ids`.
    pub async fn reorder_groups(&self, ids: &[String]) -> Outcome<Vec<SortRank>> {
        report("reorder groups", self.try_reorder_groups(ids).await)
    }

    async fn try_reorder_groups(&self, ids: &[String]) -> Result<Vec<SortRank>, GatewayError> {
        let ids = dedup_ids(ids);
        let snapshot = self.store.groups();
        let ranks = ranks_for(&ids);
        self.store.save_groups(&rank_in_order(&snapshot, &ids));

        let op = self.begin(OperationKind::ReorderGroups, "groups");
        let result = self.remote.upsert_group_ranks(&ranks).await;
        self.settle(&op);

        match result {
            Ok(()) => Ok(ranks),
            Err(e) => {
                self.store.save_groups(&snapshot);
                Err(e.into())
            }
        }
    }
}

/// Cache-only answer when the session could not be restored.
pub(super) fn cache_only<T>(cached: Vec<T>) -> Outcome<Vec<T>> {
    if cached.is_empty() {
        Outcome::failed(&GatewayError::NotAuthenticated)
            .with_data(Vec::new())
            .with_auth_error()
    } else {
        Outcome::cached(cached).with_auth_error()
    }
}
