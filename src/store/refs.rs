//! Named refs and the attached/detached HEAD model.
//!
//! HEAD is stored as ref_name="HEAD". When attached it carries a
//! symbolic_target (e.g. "refs/heads/main") and the branch ref stores the
//! actual commit hash; when detached it stores the commit hash directly.
//! Branches are "refs/heads/{name}"; arbitrary named refs (ORIG_HEAD, user
//! refs) are plain rows.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{Result, TractError};

const HEADS_PREFIX: &str = "refs/heads/";

/// Git-style branch name validation: non-empty; no `..`, `~`, `^`, `:`,
/// `?`, `*`, `[`, `\`, or whitespace; no leading/trailing `.`; no `.lock`
/// suffix.
pub fn validate_branch_name(name: &str) -> Result<()> {
    let invalid = |_: &str| TractError::InvalidBranchName(name.to_string());
    if name.is_empty() {
        return Err(invalid(name));
    }
    if name.contains("..") {
        return Err(invalid(name));
    }
    if name
        .chars()
        .any(|c| matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\') || c.is_whitespace())
    {
        return Err(invalid(name));
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err(invalid(name));
    }
    if name.ends_with(".lock") {
        return Err(invalid(name));
    }
    Ok(())
}

pub struct RefStore<'a> {
    conn: &'a Connection,
}

impl<'a> RefStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn row(&self, tract_id: &str, ref_name: &str) -> Result<Option<(Option<String>, Option<String>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT commit_hash, symbolic_target FROM refs
                 WHERE tract_id = ?1 AND ref_name = ?2",
                [tract_id, ref_name],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    fn upsert(
        &self,
        tract_id: &str,
        ref_name: &str,
        commit_hash: Option<&str>,
        symbolic_target: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO refs (tract_id, ref_name, commit_hash, symbolic_target)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tract_id, ref_name) DO UPDATE
             SET commit_hash = excluded.commit_hash,
                 symbolic_target = excluded.symbolic_target",
            params![tract_id, ref_name, commit_hash, symbolic_target],
        )?;
        Ok(())
    }

    /// The HEAD commit hash, resolving a symbolic HEAD through its branch.
    pub fn head(&self, tract_id: &str) -> Result<Option<String>> {
        let Some((commit, symbolic)) = self.row(tract_id, "HEAD")? else {
            return Ok(None);
        };
        match symbolic {
            Some(target) => Ok(self.row(tract_id, &target)?.and_then(|(hash, _)| hash)),
            None => Ok(commit),
        }
    }

    /// True when HEAD exists and points directly at a commit.
    pub fn is_detached(&self, tract_id: &str) -> Result<bool> {
        Ok(match self.row(tract_id, "HEAD")? {
            Some((_, symbolic)) => symbolic.is_none(),
            None => false,
        })
    }

    /// Move HEAD to a new commit.
    ///
    /// First commit ever: creates symbolic HEAD -> refs/heads/main plus the
    /// main branch ref. Attached HEAD: updates the target branch. Detached
    /// HEAD: updates the stored hash.
    pub fn update_head(&self, tract_id: &str, commit_hash: &str) -> Result<()> {
        match self.row(tract_id, "HEAD")? {
            None => {
                let main = format!("{HEADS_PREFIX}main");
                self.upsert(tract_id, "HEAD", None, Some(&main))?;
                self.upsert(tract_id, &main, Some(commit_hash), None)?;
            }
            Some((_, Some(target))) => {
                self.upsert(tract_id, &target, Some(commit_hash), None)?;
            }
            Some((_, None)) => {
                self.upsert(tract_id, "HEAD", Some(commit_hash), None)?;
            }
        }
        Ok(())
    }

    /// Attach HEAD to a branch (symbolic ref).
    pub fn attach_head(&self, tract_id: &str, branch_name: &str) -> Result<()> {
        let target = format!("{HEADS_PREFIX}{branch_name}");
        self.upsert(tract_id, "HEAD", None, Some(&target))
    }

    /// Detach HEAD onto a specific commit.
    pub fn detach_head(&self, tract_id: &str, commit_hash: &str) -> Result<()> {
        self.upsert(tract_id, "HEAD", Some(commit_hash), None)
    }

    /// The branch HEAD is attached to, if any.
    pub fn current_branch(&self, tract_id: &str) -> Result<Option<String>> {
        let Some((_, Some(target))) = self.row(tract_id, "HEAD")? else {
            return Ok(None);
        };
        Ok(target.strip_prefix(HEADS_PREFIX).map(str::to_owned))
    }

    pub fn branch(&self, tract_id: &str, branch_name: &str) -> Result<Option<String>> {
        let ref_name = format!("{HEADS_PREFIX}{branch_name}");
        Ok(self.row(tract_id, &ref_name)?.and_then(|(hash, _)| hash))
    }

    pub fn set_branch(&self, tract_id: &str, branch_name: &str, commit_hash: &str) -> Result<()> {
        let ref_name = format!("{HEADS_PREFIX}{branch_name}");
        self.upsert(tract_id, &ref_name, Some(commit_hash), None)
    }

    pub fn delete_branch(&self, tract_id: &str, branch_name: &str) -> Result<()> {
        let ref_name = format!("{HEADS_PREFIX}{branch_name}");
        self.delete_ref(tract_id, &ref_name)
    }

    /// Branch names, sorted.
    pub fn list_branches(&self, tract_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT ref_name FROM refs
             WHERE tract_id = ?1 AND ref_name LIKE 'refs/heads/%'
             ORDER BY ref_name",
        )?;
        let rows = stmt.query_map([tract_id], |r| r.get::<_, String>(0))?;
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter_map(|n| n.strip_prefix(HEADS_PREFIX).map(str::to_owned))
            .collect())
    }

    /// Read an arbitrary named ref (e.g. ORIG_HEAD).
    pub fn get_ref(&self, tract_id: &str, ref_name: &str) -> Result<Option<String>> {
        Ok(self.row(tract_id, ref_name)?.and_then(|(hash, _)| hash))
    }

    pub fn set_ref(&self, tract_id: &str, ref_name: &str, commit_hash: &str) -> Result<()> {
        self.upsert(tract_id, ref_name, Some(commit_hash), None)
    }

    pub fn delete_ref(&self, tract_id: &str, ref_name: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM refs WHERE tract_id = ?1 AND ref_name = ?2",
            [tract_id, ref_name],
        )?;
        Ok(())
    }

    /// Commit hashes referenced by any direct (non-symbolic) ref of any
    /// tract. Used by GC reachability.
    pub fn all_ref_targets(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT tract_id, commit_hash FROM refs WHERE commit_hash IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn branch_name_validation_matches_git_rules() {
        for good in ["main", "feature/login", "hot-fix_2"] {
            assert!(validate_branch_name(good).is_ok(), "{good}");
        }
        for bad in [
            "", "a..b", "a~b", "a^b", "a:b", "a?b", "a*b", "a[b", "a\\b", "a b", ".hidden",
            "trailing.", "name.lock",
        ] {
            assert!(validate_branch_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn first_update_creates_symbolic_head_on_main() {
        let store = Store::open(":memory:").unwrap();
        let refs = store.refs();
        refs.update_head("t", "c1").unwrap();
        assert_eq!(refs.head("t").unwrap().as_deref(), Some("c1"));
        assert_eq!(refs.current_branch("t").unwrap().as_deref(), Some("main"));
        assert!(!refs.is_detached("t").unwrap());

        refs.update_head("t", "c2").unwrap();
        assert_eq!(refs.branch("t", "main").unwrap().as_deref(), Some("c2"));
    }

    #[test]
    fn detach_and_reattach() {
        let store = Store::open(":memory:").unwrap();
        let refs = store.refs();
        refs.update_head("t", "c1").unwrap();
        refs.detach_head("t", "c1").unwrap();
        assert!(refs.is_detached("t").unwrap());
        assert!(refs.current_branch("t").unwrap().is_none());

        // Updates while detached move HEAD only, not the branch.
        refs.update_head("t", "c9").unwrap();
        assert_eq!(refs.head("t").unwrap().as_deref(), Some("c9"));
        assert_eq!(refs.branch("t", "main").unwrap().as_deref(), Some("c1"));

        refs.attach_head("t", "main").unwrap();
        assert_eq!(refs.head("t").unwrap().as_deref(), Some("c1"));
    }

    #[test]
    fn named_refs_and_branch_listing() {
        let store = Store::open(":memory:").unwrap();
        let refs = store.refs();
        refs.update_head("t", "c1").unwrap();
        refs.set_branch("t", "feature", "c1").unwrap();
        refs.set_ref("t", "ORIG_HEAD", "c1").unwrap();

        assert_eq!(refs.list_branches("t").unwrap(), ["feature", "main"]);
        assert_eq!(refs.get_ref("t", "ORIG_HEAD").unwrap().as_deref(), Some("c1"));
        refs.delete_branch("t", "feature").unwrap();
        assert_eq!(refs.list_branches("t").unwrap(), ["main"]);
    }
}
