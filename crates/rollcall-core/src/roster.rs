//! Persisted roster of privileged (admin) person ids.
//!
//! Stored as one person id per line; blank lines are ignored on read.

use crate::gallery::GallerySnapshot;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("{0} is not enrolled")]
    NotEnrolled(String),
    #[error("roster i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RosterStore {
    path: PathBuf,
}

impl RosterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fresh snapshot of the roster, in file order, without duplicates.
    /// A missing file is an empty roster.
    pub fn list(&self) -> Result<Vec<String>, RosterError> {
        let mut ids: Vec<String> = Vec::new();
        for line in self.read_raw()?.lines() {
            let id = line.trim();
            if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Grant `person_id` elevated access.
    ///
    /// The person must be enrolled in `gallery`. Returns `Ok(false)` without
    /// touching the file if they are already listed.
    pub fn add(&self, person_id: &str, gallery: &GallerySnapshot) -> Result<bool, RosterError> {
        let person_id = person_id.trim();
        if !gallery.is_enrolled(person_id) {
            return Err(RosterError::NotEnrolled(person_id.to_string()));
        }

        let raw = self.read_raw()?;
        if raw.lines().any(|line| line.trim() == person_id) {
            return Ok(false);
        }

        let mut line = String::new();
        if !raw.is_empty() && !raw.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(person_id);
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        file.write_all(line.as_bytes()).map_err(|e| self.io_err(e))?;

        tracing::info!(person = person_id, "added to roster");
        Ok(true)
    }

    /// Revoke the first occurrence of `person_id`. Absent ids are a no-op (`Ok(false)`).
    pub fn remove(&self, person_id: &str) -> Result<bool, RosterError> {
        let person_id = person_id.trim();
        let raw = self.read_raw()?;
        let lines: Vec<&str> = raw.lines().collect();
        let Some(idx) = lines.iter().position(|line| line.trim() == person_id) else {
            return Ok(false);
        };

        let mut contents = String::with_capacity(raw.len());
        for (i, line) in lines.iter().enumerate() {
            if i != idx {
                contents.push_str(line);
                contents.push('\n');
            }
        }

        // Write-then-rename so a failed write never truncates the roster.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;

        tracing::info!(person = person_id, "removed from roster");
        Ok(true)
    }

    fn read_raw(&self) -> Result<String, RosterError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn io_err(&self, source: std::io::Error) -> RosterError {
        RosterError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::Gallery;
    use crate::types::{Embedding, GalleryEntry};

    fn gallery(persons: &[&str]) -> GallerySnapshot {
        Gallery::from_entries(persons.iter().map(|p| GalleryEntry {
            person_id: p.to_string(),
            embedding: Embedding::new(vec![0.0, 1.0]),
        }))
        .unwrap()
        .snapshot()
    }

    fn store() -> (tempfile::TempDir, RosterStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RosterStore::new(dir.path().join("admins.txt"));
        (dir, store)
    }

    #[test]
    fn test_add_twice_lists_once() {
        let (_dir, store) = store();
        let g = gallery(&["bob"]);
        assert!(store.add("bob", &g).unwrap());
        assert!(!store.add("bob", &g).unwrap());
        assert_eq!(store.list().unwrap(), vec!["bob"]);
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "bob\n");
    }

    #[test]
    fn test_remove_then_absent() {
        let (_dir, store) = store();
        let g = gallery(&["bob", "alice"]);
        store.add("alice", &g).unwrap();
        store.add("bob", &g).unwrap();
        assert!(store.remove("bob").unwrap());
        assert_eq!(store.list().unwrap(), vec!["alice"]);
    }

    #[test]
    fn test_remove_never_added_is_noop() {
        let (_dir, store) = store();
        let g = gallery(&["alice"]);
        store.add("alice", &g).unwrap();
        assert!(!store.remove("carol").unwrap());
        assert_eq!(store.list().unwrap(), vec!["alice"]);
    }

    #[test]
    fn test_remove_on_missing_file_is_noop() {
        let (_dir, store) = store();
        assert!(!store.remove("carol").unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_add_rejects_unenrolled() {
        let (_dir, store) = store();
        let err = store.add("mallory", &gallery(&["alice"])).unwrap_err();
        assert!(matches!(err, RosterError::NotEnrolled(ref id) if id == "mallory"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_ignores_blank_lines_and_whitespace() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "\n  admin1 \n\nadmin2\n").unwrap();
        assert_eq!(store.list().unwrap(), vec!["admin1", "admin2"]);
    }

    #[test]
    fn test_remove_only_first_occurrence() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "admin1\nbob\nadmin1\n").unwrap();
        assert!(store.remove("admin1").unwrap());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "bob\nadmin1\n");
    }

    #[test]
    fn test_add_after_unterminated_line() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "admin1").unwrap();
        store.add("bob", &gallery(&["bob"])).unwrap();
        assert_eq!(store.list().unwrap(), vec!["admin1", "bob"]);
    }
}
