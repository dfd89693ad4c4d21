//! Loader configuration store.
//!
//! Persists the four collections the loader owns: `config` (the core pin),
//! `repos` (plugin repositories), `removed` (plugin names the operator
//! removed), and `constraint` (selection constraint rules). Backed by an
//! embedded sled database; collections map to trees, documents are JSON.
//!
//! The store is the source of truth; the loader's in-memory snapshots are
//! write-through. All mutations flush synchronously before returning.
//!
//! # Example
//!
//! ```
//! use loadout_store::{RepoDoc, Store};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = Store::open(dir.path()).unwrap();
//!
//! store.insert_repo(&RepoDoc {
//!     priority: 0,
//!     branch: "main".into(),
//!     version: String::new(),
//!     url: "https://github.com/alice/foo".into(),
//! }).unwrap();
//!
//! assert_eq!(store.list_repos().unwrap().len(), 1);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use loadout_types::ConstraintKind;

/// Store failures.
///
/// `Unavailable` is fatal at boot; teardown paths surface and ignore it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store document corrupt: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

const CONFIG_CORE_KEY: &str = "core";

/// The single `config` document: which branch/version the core is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreDoc {
    pub branch: String,
    pub version: String,
}

/// One plugin repository document, keyed by origin URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoDoc {
    pub priority: i32,
    pub branch: String,
    pub version: String,
    pub url: String,
}

/// One constraint rule document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintDoc {
    #[serde(rename = "type")]
    pub kind: ConstraintKind,
    pub data: String,
}

/// Handle to the loader's document database.
#[derive(Debug, Clone)]
pub struct Store {
    db: sled::Db,
    config: sled::Tree,
    repos: sled::Tree,
    removed: sled::Tree,
    constraint: sled::Tree,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = sled::open(path)?;

        Ok(Self {
            config: db.open_tree("config")?,
            repos: db.open_tree("repos")?,
            removed: db.open_tree("removed")?,
            constraint: db.open_tree("constraint")?,
            db,
        })
    }

    fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn get_doc<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> StoreResult<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_doc<T: Serialize>(tree: &sled::Tree, key: &[u8], doc: &T) -> StoreResult<()> {
        tree.insert(key, serde_json::to_vec(doc)?)?;
        Ok(())
    }

    fn list_docs<T: DeserializeOwned>(tree: &sled::Tree) -> StoreResult<Vec<T>> {
        let mut docs = Vec::new();
        for item in tree.iter() {
            let (_, bytes) = item?;
            docs.push(serde_json::from_slice(&bytes)?);
        }
        Ok(docs)
    }

    // config

    pub fn load_core(&self) -> StoreResult<Option<CoreDoc>> {
        Self::get_doc(&self.config, CONFIG_CORE_KEY.as_bytes())
    }

    pub fn upsert_core(&self, doc: &CoreDoc) -> StoreResult<()> {
        Self::put_doc(&self.config, CONFIG_CORE_KEY.as_bytes(), doc)?;
        self.flush()
    }

    // repos

    /// All repo documents, in stable (URL) order.
    pub fn list_repos(&self) -> StoreResult<Vec<RepoDoc>> {
        Self::list_docs(&self.repos)
    }

    pub fn insert_repo(&self, doc: &RepoDoc) -> StoreResult<()> {
        Self::put_doc(&self.repos, doc.url.as_bytes(), doc)?;
        self.flush()
    }

    /// Write back a mutated repo document (same key space as insert).
    pub fn update_repo(&self, doc: &RepoDoc) -> StoreResult<()> {
        self.insert_repo(doc)
    }

    pub fn delete_repo_by_url(&self, url: &str) -> StoreResult<()> {
        self.repos.remove(url.as_bytes())?;
        self.flush()
    }

    // removed plugins

    pub fn list_removed(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        for item in self.removed.iter() {
            let (key, _) = item?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    pub fn insert_many_removed<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> StoreResult<()> {
        for name in names {
            self.removed.insert(name.as_bytes(), &[])?;
        }
        self.flush()
    }

    pub fn delete_removed_by_names<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> StoreResult<()> {
        for name in names {
            self.removed.remove(name.as_bytes())?;
        }
        self.flush()
    }

    pub fn drop_removed(&self) -> StoreResult<()> {
        self.removed.clear()?;
        self.flush()
    }

    // constraints

    fn constraint_key(kind: ConstraintKind, raw: &str) -> Vec<u8> {
        format!("{kind}:{raw}").into_bytes()
    }

    pub fn list_constraints(&self) -> StoreResult<Vec<ConstraintDoc>> {
        Self::list_docs(&self.constraint)
    }

    pub fn insert_constraints<'a>(
        &self,
        kind: ConstraintKind,
        raws: impl IntoIterator<Item = &'a str>,
    ) -> StoreResult<()> {
        for raw in raws {
            let doc = ConstraintDoc {
                kind,
                data: raw.to_string(),
            };
            Self::put_doc(&self.constraint, &Self::constraint_key(kind, raw), &doc)?;
        }
        self.flush()
    }

    /// Delete rules by raw form; `kind` narrows the deletion to one set.
    pub fn delete_constraints<'a>(
        &self,
        kind: Option<ConstraintKind>,
        raws: impl IntoIterator<Item = &'a str>,
    ) -> StoreResult<()> {
        use ConstraintKind::{Exclude, In, Include};

        for raw in raws {
            for k in [Include, Exclude, In] {
                if kind.is_none_or(|want| want == k) {
                    self.constraint.remove(Self::constraint_key(k, raw))?;
                }
            }
        }
        self.flush()
    }

    /// Drop every rule, or every rule of one kind.
    pub fn clear_constraints(&self, kind: Option<ConstraintKind>) -> StoreResult<()> {
        match kind {
            None => {
                self.constraint.clear()?;
            }
            Some(kind) => {
                let prefix = format!("{kind}:");
                let keys: Vec<_> = self
                    .constraint
                    .scan_prefix(prefix.as_bytes())
                    .keys()
                    .collect::<Result<_, _>>()?;
                for key in keys {
                    self.constraint.remove(key)?;
                }
            }
        }
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, Store) {
        let td = tempdir().expect("tempdir");
        let store = Store::open(&td.path().join("db")).expect("open");
        (td, store)
    }

    fn repo(url: &str, priority: i32) -> RepoDoc {
        RepoDoc {
            priority,
            branch: "main".to_string(),
            version: String::new(),
            url: url.to_string(),
        }
    }

    #[test]
    fn open_unreachable_path_is_unavailable() {
        let err = Store::open(Path::new("/proc/definitely/not/writable")).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn core_roundtrip() {
        let (_td, store) = store();
        assert!(store.load_core().expect("load").is_none());

        let doc = CoreDoc {
            branch: "new".to_string(),
            version: "abc".to_string(),
        };
        store.upsert_core(&doc).expect("upsert");
        assert_eq!(store.load_core().expect("load"), Some(doc.clone()));

        let doc2 = CoreDoc {
            branch: "stable".to_string(),
            version: String::new(),
        };
        store.upsert_core(&doc2).expect("upsert");
        assert_eq!(store.load_core().expect("load"), Some(doc2));
    }

    #[test]
    fn repos_insert_update_delete() {
        let (_td, store) = store();

        store
            .insert_repo(&repo("https://github.com/a/b", 3))
            .expect("insert");
        store
            .insert_repo(&repo("https://github.com/c/d", 1))
            .expect("insert");

        let repos = store.list_repos().expect("list");
        assert_eq!(repos.len(), 2);

        let mut changed = repo("https://github.com/a/b", 3);
        changed.version = "deadbeef".to_string();
        store.update_repo(&changed).expect("update");

        let repos = store.list_repos().expect("list");
        let found = repos
            .iter()
            .find(|r| r.url == "https://github.com/a/b")
            .expect("present");
        assert_eq!(found.version, "deadbeef");

        store
            .delete_repo_by_url("https://github.com/a/b")
            .expect("delete");
        assert_eq!(store.list_repos().expect("list").len(), 1);
    }

    #[test]
    fn removed_set_operations() {
        let (_td, store) = store();

        store
            .insert_many_removed(["ping", "echo"])
            .expect("insert");
        let mut names = store.list_removed().expect("list");
        names.sort();
        assert_eq!(names, vec!["echo".to_string(), "ping".to_string()]);

        store.delete_removed_by_names(["ping"]).expect("delete");
        assert_eq!(store.list_removed().expect("list"), vec!["echo".to_string()]);

        store.drop_removed().expect("drop");
        assert!(store.list_removed().expect("list").is_empty());
    }

    #[test]
    fn constraints_by_kind() {
        let (_td, store) = store();

        store
            .insert_constraints(ConstraintKind::Include, ["alpha", "misc/"])
            .expect("insert");
        store
            .insert_constraints(ConstraintKind::Exclude, ["beta"])
            .expect("insert");

        assert_eq!(store.list_constraints().expect("list").len(), 3);

        store.clear_constraints(Some(ConstraintKind::Include)).expect("clear");
        let left = store.list_constraints().expect("list");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].kind, ConstraintKind::Exclude);

        store.clear_constraints(None).expect("clear all");
        assert!(store.list_constraints().expect("list").is_empty());
    }

    #[test]
    fn delete_constraints_without_kind_hits_all_sets() {
        let (_td, store) = store();

        store
            .insert_constraints(ConstraintKind::Include, ["alpha"])
            .expect("insert");
        store
            .insert_constraints(ConstraintKind::Exclude, ["alpha"])
            .expect("insert");

        store.delete_constraints(None, ["alpha"]).expect("delete");
        assert!(store.list_constraints().expect("list").is_empty());
    }

    #[test]
    fn delete_constraints_with_kind_is_narrow() {
        let (_td, store) = store();

        store
            .insert_constraints(ConstraintKind::Include, ["alpha"])
            .expect("insert");
        store
            .insert_constraints(ConstraintKind::Exclude, ["alpha"])
            .expect("insert");

        store
            .delete_constraints(Some(ConstraintKind::Include), ["alpha"])
            .expect("delete");
        let left = store.list_constraints().expect("list");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].kind, ConstraintKind::Exclude);
    }

    #[test]
    fn insert_is_idempotent_per_key() {
        let (_td, store) = store();

        store
            .insert_repo(&repo("https://github.com/a/b", 0))
            .expect("insert");
        store
            .insert_repo(&repo("https://github.com/a/b", 0))
            .expect("insert again");
        assert_eq!(store.list_repos().expect("list").len(), 1);
    }

    #[test]
    fn reopen_preserves_data() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("db");

        {
            let store = Store::open(&path).expect("open");
            store
                .insert_repo(&repo("https://github.com/a/b", 0))
                .expect("insert");
        }

        let store = Store::open(&path).expect("reopen");
        assert_eq!(store.list_repos().expect("list").len(), 1);
    }
}
