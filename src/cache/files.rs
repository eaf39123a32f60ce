//! On-disk envelopes and file helpers for the local cache.
//!
//! Writes go through a temp file that is fsynced and renamed over the
//! target, so a crash mid-write leaves the previous file in place.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{Group, Todo};

/// `groups.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupsFile {
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub timestamp: i64,
}

/// `todos-<groupId>.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodosFile {
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub todos: Vec<Todo>,
    #[serde(default)]
    pub timestamp: i64,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Read and parse a JSON file. Missing files are `None` without noise;
/// unreadable or corrupt files are logged and also `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            log::error!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            log::error!("Failed to parse {}: {}", path.display(), e);
            None
        }
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> bool {
    let json = match serde_json::to_string_pretty(value) {
        Ok(json) => json,
        Err(e) => {
            log::error!("Failed to serialize {}: {}", path.display(), e);
            return false;
        }
    };
    match atomic_write(path, &json) {
        Ok(()) => true,
        Err(e) => {
            log::error!("Failed to write {}: {}", path.display(), e);
            false
        }
    }
}

fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let temp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(content.as_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    fs::rename(&temp_path, path)
}

/// Remove a file if present. Returns false only on a real I/O failure.
pub fn remove_if_exists(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            log::error!("Failed to delete {}: {}", path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn todos_envelope_uses_camel_case_group_id() {
        let file = TodosFile {
            group_id: "g1".into(),
            todos: Vec::new(),
            timestamp: 42,
        };
        let value = serde_json::to_value(&file).unwrap();
        assert_eq!(value["groupId"], "g1");
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn write_then_read_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");
        assert!(write_json(&path, &GroupsFile::default()));
        assert!(path.exists());
        assert!(!dir.path().join("groups.json.tmp").exists());
        let back: Option<GroupsFile> = read_json(&path);
        assert!(back.unwrap().groups.is_empty());
    }

    #[test]
    fn corrupt_and_missing_files_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");
        assert!(read_json::<GroupsFile>(&path).is_none());
        fs::write(&path, "{ not json").unwrap();
        assert!(read_json::<GroupsFile>(&path).is_none());
    }

    #[test]
    fn envelope_without_list_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("todos-g1.json");
        fs::write(&path, r#"{"groupId":"g1"}"#).unwrap();
        let file: TodosFile = read_json(&path).unwrap();
        assert!(file.todos.is_empty());
    }
}
