use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::Record;

/// One row of a reorder upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortRank {
    pub id: String,
    pub sort_order: i64,
}

/// `ids` with repeats removed, first occurrence kept.
///
/// Reorders run their ids through this once so the cache rewrite and the
/// upsert rank the same list.
pub fn dedup_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Dense zero-based ranks in the order the ids were given.
pub fn ranks_for(ids: &[String]) -> Vec<SortRank> {
    ids.iter()
        .enumerate()
        .map(|(index, id)| SortRank {
            id: id.clone(),
            sort_order: index as i64,
        })
        .collect()
}

/// Sort order for a record appended to `records`.
pub fn next_sort_order<R: Record>(records: &[R]) -> i64 {
    records
        .iter()
        .map(Record::sort_order)
        .max()
        .map_or(0, |max| max + 1)
}

/// Rebuild `records` in the order given by `ids`, ranking each by position.
///
/// Ids with no matching record are skipped. Records not named in `ids` keep
/// their sort order and follow the ranked ones, since the server only ever
/// sees the named rows.
pub fn rank_in_order<R: Record + Clone>(records: &[R], ids: &[String]) -> Vec<R> {
    let by_id: HashMap<&str, &R> = records.iter().map(|r| (r.id(), r)).collect();
    let mut named = HashSet::new();
    let mut out = Vec::with_capacity(records.len());

    for (index, id) in ids.iter().enumerate() {
        if let Some(record) = by_id.get(id.as_str()) {
            if !named.insert(id.as_str()) {
                continue;
            }
            let mut record = (*record).clone();
            record.set_sort_order(index as i64);
            out.push(record);
        }
    }

    out.extend(
        records
            .iter()
            .filter(|r| !named.contains(r.id()))
            .cloned(),
    );
    out
}
