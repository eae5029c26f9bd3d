//! Pure DAG helpers over the commit store.
//!
//! These walks follow every parent edge (first parent on the commit row
//! plus merge parents from the side table), unlike the first-parent chain
//! walk used for linear history.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::errors::Result;
use crate::store::{CommitRow, CommitStore};

/// Every parent of a commit: the row's first parent plus merge parents,
/// deduplicated (position 0 of the side table mirrors the row).
pub fn parents_of(commits: &CommitStore<'_>, commit: &CommitRow) -> Result<Vec<String>> {
    let mut parents: Vec<String> = Vec::new();
    if let Some(first) = &commit.parent_hash {
        parents.push(first.clone());
    }
    for parent in commits.get_parents(&commit.commit_hash)? {
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }
    Ok(parents)
}

/// The set of all commits reachable from `start` via any parent edge,
/// including `start` itself. BFS.
pub fn all_ancestors(commits: &CommitStore<'_>, start: &str) -> Result<HashSet<String>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(start.to_string());
    while let Some(hash) = queue.pop_front() {
        if !seen.insert(hash.clone()) {
            continue;
        }
        let Some(commit) = commits.get(&hash)? else {
            continue;
        };
        for parent in parents_of(commits, &commit)? {
            if !seen.contains(&parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(seen)
}

/// Whether `a` is an ancestor of (or equal to) `b`.
pub fn is_ancestor(commits: &CommitStore<'_>, a: &str, b: &str) -> Result<bool> {
    Ok(all_ancestors(commits, b)?.contains(a))
}

/// Nearest common ancestor of `a` and `b` following all parent edges.
///
/// A commit is the merge base when it is common to both ancestor sets and
/// not a proper ancestor of any other common commit. Returns None when the
/// sets are disjoint (e.g. unrelated tracts).
pub fn find_merge_base(commits: &CommitStore<'_>, a: &str, b: &str) -> Result<Option<String>> {
    let ancestors_a = all_ancestors(commits, a)?;
    let ancestors_b = all_ancestors(commits, b)?;
    let common: HashSet<&String> = ancestors_a.intersection(&ancestors_b).collect();
    if common.is_empty() {
        return Ok(None);
    }

    // Mark every common commit reachable from another common commit's
    // parents as dominated; the survivors are nearest common ancestors.
    let mut dominated: HashSet<String> = HashSet::new();
    for candidate in &common {
        let Some(commit) = commits.get(candidate)? else {
            continue;
        };
        let mut queue: VecDeque<String> = parents_of(commits, &commit)?.into();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(hash) = queue.pop_front() {
            if !seen.insert(hash.clone()) {
                continue;
            }
            if common.contains(&hash) {
                dominated.insert(hash.clone());
            }
            if let Some(row) = commits.get(&hash)? {
                for parent in parents_of(commits, &row)? {
                    queue.push_back(parent);
                }
            }
        }
    }

    let mut survivors: Vec<&String> = common
        .into_iter()
        .filter(|c| !dominated.contains(*c))
        .collect();
    // Deterministic pick when history has several equally-near bases.
    survivors.sort();
    let survivors_rows: Vec<CommitRow> = survivors
        .iter()
        .filter_map(|h| commits.get(h).transpose())
        .collect::<Result<Vec<_>>>()?;
    Ok(survivors_rows
        .into_iter()
        .max_by(|x, y| {
            x.created_at
                .cmp(&y.created_at)
                .then_with(|| x.commit_hash.cmp(&y.commit_hash))
        })
        .map(|c| c.commit_hash))
}

/// Commits in `ancestors(tip) \ ancestors(base)`, chronologically ordered
/// (created_at ascending, commit hash as tiebreak).
pub fn branch_commits(
    commits: &CommitStore<'_>,
    tip: &str,
    base: &str,
) -> Result<Vec<CommitRow>> {
    let tip_ancestors = all_ancestors(commits, tip)?;
    let base_ancestors = all_ancestors(commits, base)?;
    let unique: HashSet<&String> = tip_ancestors.difference(&base_ancestors).collect();

    let mut rows: Vec<CommitRow> = Vec::with_capacity(unique.len());
    let mut by_hash: HashMap<&String, ()> = HashMap::new();
    for hash in unique {
        if by_hash.insert(hash, ()).is_none() {
            if let Some(row) = commits.get(hash)? {
                rows.push(row);
            }
        }
    }
    rows.sort_by(|x, y| {
        x.created_at
            .cmp(&y.created_at)
            .then_with(|| x.commit_hash.cmp(&y.commit_hash))
    });
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommitOperation;
    use crate::store::{ts_from_sql, Store};

    fn save(store: &Store, hash: &str, parent: Option<&str>, offset_us: i64) {
        store
            .commits()
            .save(&CommitRow {
                commit_hash: hash.to_string(),
                tract_id: "t".to_string(),
                parent_hash: parent.map(str::to_owned),
                content_hash: format!("blob-{hash}"),
                content_type: "dialogue".to_string(),
                operation: CommitOperation::Append,
                edit_target: None,
                message: None,
                token_count: 1,
                metadata_json: None,
                generation_config_json: None,
                tags_json: vec![],
                created_at: ts_from_sql("2026-01-01T00:00:00.000000Z")
                    + chrono::Duration::microseconds(offset_us),
            })
            .unwrap();
    }

    /// B <- M1  (main)
    ///  \
    ///   F1 <- F2 (feature)
    fn forked_store() -> Store {
        let store = Store::open(":memory:").unwrap();
        save(&store, "base", None, 0);
        save(&store, "m1", Some("base"), 10);
        save(&store, "f1", Some("base"), 20);
        save(&store, "f2", Some("f1"), 30);
        store
    }

    #[test]
    fn ancestors_include_self_and_root() {
        let store = forked_store();
        let commits = store.commits();
        let set = all_ancestors(&commits, "f2").unwrap();
        assert!(set.contains("f2"));
        assert!(set.contains("f1"));
        assert!(set.contains("base"));
        assert!(!set.contains("m1"));
    }

    #[test]
    fn merge_base_of_forked_branches() {
        let store = forked_store();
        let commits = store.commits();
        assert_eq!(
            find_merge_base(&commits, "m1", "f2").unwrap().as_deref(),
            Some("base")
        );
        // Ancestor case: base(a, ancestor-of-a) == the ancestor.
        assert_eq!(
            find_merge_base(&commits, "f2", "f1").unwrap().as_deref(),
            Some("f1")
        );
    }

    #[test]
    fn merge_base_disjoint_is_none() {
        let store = forked_store();
        save(&store, "island", None, 40);
        let commits = store.commits();
        assert!(find_merge_base(&commits, "m1", "island").unwrap().is_none());
    }

    #[test]
    fn branch_commits_excludes_base_side() {
        let store = forked_store();
        let commits = store.commits();
        let unique = branch_commits(&commits, "f2", "m1").unwrap();
        let hashes: Vec<&str> = unique.iter().map(|c| c.commit_hash.as_str()).collect();
        assert_eq!(hashes, ["f1", "f2"]);
    }

    #[test]
    fn merge_parents_feed_reachability() {
        let store = forked_store();
        // Merge commit with parents m1 (first) and f2 (side table).
        save(&store, "merge", Some("m1"), 50);
        store
            .commits()
            .add_parents("merge", &["m1".to_string(), "f2".to_string()])
            .unwrap();
        let commits = store.commits();
        let set = all_ancestors(&commits, "merge").unwrap();
        assert!(set.contains("f2"));
        assert!(set.contains("f1"));
        assert!(is_ancestor(&commits, "f1", "merge").unwrap());
    }
}
