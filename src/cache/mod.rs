//! Local JSON cache of groups and todos.
//!
//! Every operation reads the current file, applies its change and rewrites
//! the whole file. Failures are logged and reported as `false` / empty data,
//! never as errors: a corrupt cache behaves like an empty one.
//!
//! Todos are additionally kept in an in-memory map per group once loaded.
//! Each public method holds the store lock for its own read-modify-write,
//! which keeps concurrent tasks from interleaving writes to one file. Nothing
//! is isolated across calls.

pub mod files;
pub mod sync_state;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::core::{Group, GroupPatch, Record, Todo, TodoPatch};
use files::{GroupsFile, TodosFile, now_millis, read_json, remove_if_exists, write_json};
pub use sync_state::{OperationKind, PendingOperation, SyncState};

const GROUPS_FILE: &str = "groups.json";
const SYNC_STATE_FILE: &str = "sync-state.json";
const TODOS_PREFIX: &str = "todos-";
const TODOS_SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub groups_count: usize,
    pub todo_caches_count: usize,
    pub total_size: u64,
    pub last_sync: Option<i64>,
}

pub struct LocalStore {
    dir: PathBuf,
    groups_path: PathBuf,
    sync_state_path: PathBuf,
    todos: Mutex<HashMap<String, Vec<Todo>>>,
}

impl LocalStore {
    /// Open (and create if needed) the cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            log::error!("Failed to create cache directory {}: {}", dir.display(), e);
        }
        Self {
            groups_path: dir.join(GROUPS_FILE),
            sync_state_path: dir.join(SYNC_STATE_FILE),
            dir,
            todos: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Todo>>> {
        self.todos.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- groups ----

    pub fn groups(&self) -> Vec<Group> {
        let _guard = self.lock();
        self.read_groups()
    }

    pub fn save_groups(&self, groups: &[Group]) -> bool {
        let _guard = self.lock();
        self.write_groups(groups)
    }

    /// Shallow-merge `patch` into the cached group and refresh `updated_at`.
    pub fn update_group(&self, id: &str, patch: &GroupPatch) -> bool {
        self.modify_groups(|groups| match groups.iter_mut().find(|g| g.id == id) {
            Some(group) => {
                group.apply(patch);
                group.touch();
                true
            }
            None => false,
        })
    }

    /// Overwrite the cached group `id` with `group` exactly as given.
    pub fn replace_group(&self, id: &str, group: Group) -> bool {
        self.modify_groups(|groups| replace_in(groups, id, group))
    }

    /// Swap a provisional group for its server-confirmed row.
    pub fn confirm_group(&self, temp_id: &str, group: Group) -> bool {
        self.modify_groups(|groups| {
            confirm_in(groups, temp_id, group);
            true
        })
    }

    pub fn add_group(&self, group: Group) -> bool {
        self.modify_groups(|groups| {
            groups.push(group);
            true
        })
    }

    /// Replace the group with the same id, or append it.
    pub fn upsert_group(&self, group: Group) -> bool {
        self.modify_groups(|groups| {
            upsert_in(groups, group);
            true
        })
    }

    /// Put a group back at `index` (clamped), used when undoing a delete.
    pub fn insert_group_at(&self, index: usize, group: Group) -> bool {
        self.modify_groups(|groups| {
            insert_at(groups, index, group);
            true
        })
    }

    /// Remove a group and, with it, its todo cache file and map entry.
    pub fn delete_group(&self, id: &str) -> bool {
        let mut todos = self.lock();
        let mut groups = self.read_groups();
        groups.retain(|g| g.id != id);
        self.drop_todos_file(&mut todos, id);
        self.write_groups(&groups)
    }

    fn modify_groups(&self, f: impl FnOnce(&mut Vec<Group>) -> bool) -> bool {
        let _guard = self.lock();
        let mut groups = self.read_groups();
        if !f(&mut groups) {
            return false;
        }
        self.write_groups(&groups)
    }

    fn read_groups(&self) -> Vec<Group> {
        read_json::<GroupsFile>(&self.groups_path)
            .map(|file| file.groups)
            .unwrap_or_default()
    }

    fn write_groups(&self, groups: &[Group]) -> bool {
        let file = GroupsFile {
            groups: groups.to_vec(),
            timestamp: now_millis(),
        };
        write_json(&self.groups_path, &file)
    }

    // ---- todos ----

    /// Always a direct child of the cache directory, whatever the id holds.
    pub fn todos_path(&self, group_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}{}",
            TODOS_PREFIX,
            file_key(group_id),
            TODOS_SUFFIX
        ))
    }

    /// Todos of one group, from memory if already loaded this session.
    pub fn todos(&self, group_id: &str) -> Vec<Todo> {
        let mut todos = self.lock();
        self.read_todos(&mut todos, group_id)
    }

    /// Write the group's todo file and the in-memory entry together.
    pub fn save_todos(&self, group_id: &str, list: &[Todo]) -> bool {
        let mut todos = self.lock();
        self.write_todos(&mut todos, group_id, list.to_vec())
    }

    pub fn update_todo(&self, group_id: &str, todo_id: &str, patch: &TodoPatch) -> bool {
        self.modify_todos(group_id, |list| {
            match list.iter_mut().find(|t| t.id == todo_id) {
                Some(todo) => {
                    todo.apply(patch);
                    todo.touch();
                    true
                }
                None => false,
            }
        })
    }

    pub fn replace_todo(&self, group_id: &str, todo_id: &str, todo: Todo) -> bool {
        self.modify_todos(group_id, |list| replace_in(list, todo_id, todo))
    }

    pub fn confirm_todo(&self, group_id: &str, temp_id: &str, todo: Todo) -> bool {
        self.modify_todos(group_id, |list| {
            confirm_in(list, temp_id, todo);
            true
        })
    }

    pub fn add_todo(&self, group_id: &str, todo: Todo) -> bool {
        self.modify_todos(group_id, |list| {
            list.push(todo);
            true
        })
    }

    pub fn upsert_todo(&self, group_id: &str, todo: Todo) -> bool {
        self.modify_todos(group_id, |list| {
            upsert_in(list, todo);
            true
        })
    }

    pub fn insert_todo_at(&self, group_id: &str, index: usize, todo: Todo) -> bool {
        self.modify_todos(group_id, |list| {
            insert_at(list, index, todo);
            true
        })
    }

    pub fn delete_todo(&self, group_id: &str, todo_id: &str) -> bool {
        self.modify_todos(group_id, |list| {
            list.retain(|t| t.id != todo_id);
            true
        })
    }

    pub fn delete_todos(&self, group_id: &str, todo_ids: &[String]) -> bool {
        self.modify_todos(group_id, |list| {
            list.retain(|t| !todo_ids.contains(&t.id));
            true
        })
    }

    /// Delete a group's todo file and forget its in-memory entry.
    pub fn delete_todos_file(&self, group_id: &str) -> bool {
        let mut todos = self.lock();
        self.drop_todos_file(&mut todos, group_id)
    }

    fn modify_todos(&self, group_id: &str, f: impl FnOnce(&mut Vec<Todo>) -> bool) -> bool {
        let mut todos = self.lock();
        let mut list = self.read_todos(&mut todos, group_id);
        if !f(&mut list) {
            return false;
        }
        self.write_todos(&mut todos, group_id, list)
    }

    fn read_todos(&self, todos: &mut HashMap<String, Vec<Todo>>, group_id: &str) -> Vec<Todo> {
        if let Some(list) = todos.get(group_id) {
            return list.clone();
        }
        match read_json::<TodosFile>(&self.todos_path(group_id)) {
            Some(file) => {
                todos.insert(group_id.to_string(), file.todos.clone());
                file.todos
            }
            None => Vec::new(),
        }
    }

    fn write_todos(
        &self,
        todos: &mut HashMap<String, Vec<Todo>>,
        group_id: &str,
        list: Vec<Todo>,
    ) -> bool {
        let file = TodosFile {
            group_id: group_id.to_string(),
            todos: list,
            timestamp: now_millis(),
        };
        if !write_json(&self.todos_path(group_id), &file) {
            return false;
        }
        todos.insert(group_id.to_string(), file.todos);
        true
    }

    fn drop_todos_file(&self, todos: &mut HashMap<String, Vec<Todo>>, group_id: &str) -> bool {
        todos.remove(group_id);
        remove_if_exists(&self.todos_path(group_id))
    }

    // ---- sync state ----

    pub fn sync_state(&self) -> SyncState {
        let _guard = self.lock();
        self.read_sync_state()
    }

    pub fn save_sync_state(&self, state: &SyncState) -> bool {
        let _guard = self.lock();
        write_json(&self.sync_state_path, state)
    }

    pub fn update_last_sync(&self) -> bool {
        self.modify_sync_state(|state| state.last_sync = Some(now_millis()))
    }

    pub fn add_pending_operation(&self, mut operation: PendingOperation) -> bool {
        operation.timestamp = now_millis();
        self.modify_sync_state(|state| state.pending_operations.push(operation))
    }

    pub fn remove_pending_operation(&self, operation_id: &str) -> bool {
        self.modify_sync_state(|state| {
            state.pending_operations.retain(|op| op.id != operation_id)
        })
    }

    pub fn clear_pending_operations(&self) -> bool {
        self.modify_sync_state(|state| state.pending_operations.clear())
    }

    fn modify_sync_state(&self, f: impl FnOnce(&mut SyncState)) -> bool {
        let _guard = self.lock();
        let mut state = self.read_sync_state();
        f(&mut state);
        write_json(&self.sync_state_path, &state)
    }

    fn read_sync_state(&self) -> SyncState {
        read_json(&self.sync_state_path).unwrap_or_default()
    }

    // ---- housekeeping ----

    /// Delete every cache file and empty the in-memory map. Used on logout.
    pub fn clear_all(&self) -> bool {
        let mut todos = self.lock();
        let mut ok = remove_if_exists(&self.groups_path);
        match self.todo_cache_files() {
            Ok(paths) => {
                for path in paths {
                    ok &= remove_if_exists(&path);
                }
            }
            Err(e) => {
                log::error!("Failed to list cache directory: {}", e);
                ok = false;
            }
        }
        ok &= remove_if_exists(&self.sync_state_path);
        todos.clear();
        ok
    }

    pub fn has_cached_data(&self) -> bool {
        self.groups_path.exists()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        let _guard = self.lock();
        let mut stats = CacheStats {
            groups_count: 0,
            todo_caches_count: 0,
            total_size: 0,
            last_sync: None,
        };

        let mut collect = || -> std::io::Result<()> {
            if self.groups_path.exists() {
                stats.groups_count = self.read_groups().len();
                stats.total_size += fs::metadata(&self.groups_path)?.len();
            }
            for path in self.todo_cache_files()? {
                stats.todo_caches_count += 1;
                stats.total_size += fs::metadata(&path)?.len();
            }
            stats.last_sync = self.read_sync_state().last_sync;
            Ok(())
        };

        match collect() {
            Ok(()) => Some(stats),
            Err(e) => {
                log::error!("Failed to compute cache stats: {}", e);
                None
            }
        }
    }

    fn todo_cache_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TODOS_PREFIX) && name.ends_with(TODOS_SUFFIX) {
                out.push(entry.path());
            }
        }
        Ok(out)
    }
}

fn replace_in<R: Record>(list: &mut [R], id: &str, record: R) -> bool {
    match list.iter_mut().find(|r| r.id() == id) {
        Some(slot) => {
            *slot = record;
            true
        }
        None => false,
    }
}

/// Put the confirmed record where the provisional one was. A copy of the
/// confirmed id that arrived earlier (realtime echo, background refresh)
/// is dropped so the id appears once.
fn confirm_in<R: Record>(list: &mut Vec<R>, temp_id: &str, record: R) {
    let existing = list.iter().position(|r| r.id() == record.id());
    match list.iter().position(|r| r.id() == temp_id) {
        Some(pos) => {
            list[pos] = record;
            if let Some(dup) = existing {
                list.remove(dup);
            }
        }
        None => match existing {
            Some(pos) => list[pos] = record,
            None => list.push(record),
        },
    }
}

fn upsert_in<R: Record>(list: &mut Vec<R>, record: R) {
    match list.iter().position(|r| r.id() == record.id()) {
        Some(pos) => list[pos] = record,
        None => list.push(record),
    }
}

fn insert_at<R: Record>(list: &mut Vec<R>, index: usize, record: R) {
    if let Some(pos) = list.iter().position(|r| r.id() == record.id()) {
        list[pos] = record;
        return;
    }
    let index = index.min(list.len());
    list.insert(index, record);
}

/// Percent-encode everything outside `[A-Za-z0-9_-]`, so separators and
/// dots in an id cannot leave the cache directory. UUIDs and temp ids pass
/// through unchanged.
fn file_key(id: &str) -> String {
    let mut key = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            key.push(byte as char);
        } else {
            key.push_str(&format!("%{:02X}", byte));
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Theme;

    fn group(id: &str, sort_order: i64) -> Group {
        Group::provisional(id, "u1", format!("Group {}", id), Theme::Default, sort_order)
    }

    fn todo(id: &str, group_id: &str, sort_order: i64) -> Todo {
        Todo::provisional(id, group_id, format!("Todo {}", id), sort_order)
    }

    fn ids<R: Record>(list: &[R]) -> Vec<String> {
        list.iter().map(|r| r.id().to_string()).collect()
    }

    #[test]
    fn empty_store_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        assert!(store.groups().is_empty());
        assert!(store.todos("g1").is_empty());
        assert!(!store.has_cached_data());
        assert_eq!(store.sync_state(), SyncState::default());
    }

    #[test]
    fn groups_file_has_envelope_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        assert!(store.save_groups(&[group("g1", 0)]));

        let raw = fs::read_to_string(dir.path().join("groups.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["groups"][0]["id"], "g1");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn corrupt_groups_file_is_a_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("groups.json"), "[[[").unwrap();
        let store = LocalStore::open(dir.path());
        assert!(store.groups().is_empty());
        assert!(store.has_cached_data());
    }

    #[test]
    fn update_group_merges_and_touches() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        let g = group("g1", 0);
        let before = g.updated_at;
        store.save_groups(&[g]);

        assert!(store.update_group("g1", &GroupPatch::rename("Renamed")));
        assert!(!store.update_group("nope", &GroupPatch::rename("x")));

        let groups = store.groups();
        assert_eq!(groups[0].name, "Renamed");
        assert!(groups[0].updated_at >= before);
    }

    #[test]
    fn deleting_group_cascades_to_todos() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        store.save_groups(&[group("g1", 0), group("g2", 1)]);
        store.save_todos("g1", &[todo("t1", "g1", 0)]);
        assert!(store.todos_path("g1").exists());

        assert!(store.delete_group("g1"));
        assert_eq!(ids(&store.groups()), vec!["g2"]);
        assert!(!store.todos_path("g1").exists());
        assert!(store.todos("g1").is_empty());
    }

    #[test]
    fn todos_are_served_from_memory_after_first_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        store.save_todos("g1", &[todo("t1", "g1", 0)]);

        fs::remove_file(store.todos_path("g1")).unwrap();
        assert_eq!(ids(&store.todos("g1")), vec!["t1"]);

        let reopened = LocalStore::open(dir.path());
        assert!(reopened.todos("g1").is_empty());
    }

    #[test]
    fn todo_crud_rewrites_the_group_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        store.add_todo("g1", todo("t1", "g1", 0));
        store.add_todo("g1", todo("t2", "g1", 1));
        store.add_todo("g1", todo("t3", "g1", 2));

        assert!(store.update_todo("g1", "t2", &TodoPatch::completed(true)));
        store.delete_todo("g1", "t1");
        let reopened = LocalStore::open(dir.path());
        let list = reopened.todos("g1");
        assert_eq!(ids(&list), vec!["t2", "t3"]);
        assert!(list[0].completed);

        store.delete_todos("g1", &["t2".to_string(), "t3".to_string()]);
        assert!(store.todos("g1").is_empty());
    }

    #[test]
    fn confirm_replaces_temp_in_place_and_drops_echo() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        store.save_todos(
            "g1",
            &[todo("t0", "g1", 0), todo("temp_1_abc", "g1", 1), todo("srv", "g1", 1)],
        );

        let mut confirmed = todo("srv", "g1", 1);
        confirmed.text = "from server".into();
        store.confirm_todo("g1", "temp_1_abc", confirmed);

        let list = store.todos("g1");
        assert_eq!(ids(&list), vec!["t0", "srv"]);
        assert_eq!(list[1].text, "from server");
    }

    #[test]
    fn confirm_without_temp_appends_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        store.save_groups(&[group("g1", 0)]);
        store.confirm_group("temp_gone", group("g2", 1));
        store.confirm_group("temp_gone", group("g2", 1));
        assert_eq!(ids(&store.groups()), vec!["g1", "g2"]);
    }

    #[test]
    fn insert_at_restores_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        store.save_groups(&[group("a", 0), group("c", 2)]);
        store.insert_group_at(1, group("b", 1));
        store.insert_group_at(99, group("d", 3));
        assert_eq!(ids(&store.groups()), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn pending_operations_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        let op = PendingOperation::new(OperationKind::UpdateTodo, "t1");
        let op_id = op.id.clone();

        store.add_pending_operation(op);
        store.add_pending_operation(PendingOperation::new(OperationKind::CreateGroup, "temp_x"));
        let state = store.sync_state();
        assert_eq!(state.pending_operations.len(), 2);
        assert!(state.pending_operations[0].timestamp > 0);

        store.remove_pending_operation(&op_id);
        assert_eq!(store.sync_state().pending_operations.len(), 1);
        store.clear_pending_operations();
        assert!(store.sync_state().pending_operations.is_empty());

        store.update_last_sync();
        assert!(store.sync_state().last_sync.is_some());
    }

    #[test]
    fn clear_all_removes_every_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        store.save_groups(&[group("g1", 0)]);
        store.save_todos("g1", &[todo("t1", "g1", 0)]);
        store.save_todos("g2", &[todo("t2", "g2", 0)]);
        store.update_last_sync();
        fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        assert!(store.clear_all());
        assert!(!store.has_cached_data());
        assert!(store.todos("g1").is_empty());
        assert!(!dir.path().join("sync-state.json").exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn stats_count_files_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        store.save_groups(&[group("g1", 0), group("g2", 1)]);
        store.save_todos("g1", &[todo("t1", "g1", 0)]);
        store.update_last_sync();

        let stats = store.cache_stats().unwrap();
        assert_eq!(stats.groups_count, 2);
        assert_eq!(stats.todo_caches_count, 1);
        assert!(stats.total_size > 0);
        assert!(stats.last_sync.is_some());
    }

    #[test]
    fn group_ids_cannot_escape_the_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("cache"));

        for id in ["../evil", "..\\evil", "a/b", "..", "/etc/passwd"] {
            let path = store.todos_path(id);
            assert_eq!(path.parent(), Some(store.dir()), "{}", id);
        }
        assert_eq!(store.todos_path("../evil").file_name().unwrap(), "todos-%2E%2E%2Fevil.json");
        assert_eq!(
            store.todos_path("temp_1700000000000_ab12cd").file_name().unwrap(),
            "todos-temp_1700000000000_ab12cd.json"
        );

        assert!(store.save_todos("../evil", &[todo("t1", "../evil", 0)]));
        assert!(!dir.path().join("todos-evil.json").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(ids(&store.todos("../evil")), vec!["t1"]);

        assert!(store.clear_all());
        assert!(!store.todos_path("../evil").exists());
    }
}
