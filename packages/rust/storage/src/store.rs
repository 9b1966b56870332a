//! Payload storage.

use std::path::{Path, PathBuf};

use gridharvest_shared::{HarvestError, Result};
use uuid::Uuid;

/// Where accepted payloads are kept, addressed by bare filename.
pub trait PayloadStore: Send + Sync {
    /// Write `payload` under `name`, replacing any previous content atomically.
    fn write(&self, name: &str, payload: &[u8]) -> Result<()>;

    /// Whether a payload named `name` exists.
    fn exists(&self, name: &str) -> bool;

    /// Read a payload, `None` if it does not exist.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Every stored name. This is a full scan; only the rebuilder calls it.
    fn list(&self) -> Result<Vec<String>>;

    /// Remove temp files left by writes that never reached their rename.
    /// Only safe while no writer is active. Returns how many were removed.
    fn sweep_temp(&self) -> Result<usize> {
        Ok(0)
    }
}

/// A flat directory of payload files.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Use `root` as the payload directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| HarvestError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(HarvestError::validation(format!(
                "payload name must be a bare filename, got '{name}'"
            )));
        }
        Ok(self.root.join(name))
    }
}

impl PayloadStore for FsStore {
    fn write(&self, name: &str, payload: &[u8]) -> Result<()> {
        let path = self.path_for(name)?;

        // Atomic write via temp file + rename
        let tmp_path = self.root.join(format!(".{name}.{}.tmp", Uuid::now_v7()));
        std::fs::write(&tmp_path, payload).map_err(|e| HarvestError::disk_write(name, e))?;
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(HarvestError::disk_write(name, e));
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_ok_and(|p| p.is_file())
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HarvestError::io(path, e)),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let dir = std::fs::read_dir(&self.root).map_err(|e| HarvestError::io(&self.root, e))?;

        let mut names = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|e| HarvestError::io(&self.root, e))?;
            let is_file = entry.file_type().is_ok_and(|t| t.is_file());
            if !is_file {
                continue;
            }
            // Skip hidden files (in-progress temp writes among them).
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn sweep_temp(&self) -> Result<usize> {
        let dir = std::fs::read_dir(&self.root).map_err(|e| HarvestError::io(&self.root, e))?;

        let mut removed = 0;
        for entry in dir {
            let entry = entry.map_err(|e| HarvestError::io(&self.root, e))?;
            let is_file = entry.file_type().is_ok_and(|t| t.is_file());
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with('.') && n.ends_with(".tmp"));
            if is_file && is_temp {
                let path = entry.path();
                std::fs::remove_file(&path).map_err(|e| HarvestError::io(&path, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> FsStore {
        let dir = std::env::temp_dir().join(format!("gh-store-test-{}", Uuid::now_v7()));
        FsStore::open(dir).expect("open store")
    }

    #[test]
    fn write_read_exists() {
        let store = temp_store();
        assert!(!store.exists("siteInfo_1.00_2.00.xml"));
        assert_eq!(store.read("siteInfo_1.00_2.00.xml").unwrap(), None);

        store.write("siteInfo_1.00_2.00.xml", b"<Site/>").unwrap();
        assert!(store.exists("siteInfo_1.00_2.00.xml"));
        assert_eq!(
            store.read("siteInfo_1.00_2.00.xml").unwrap().as_deref(),
            Some(b"<Site/>".as_slice())
        );

        // Rewriting the same item is idempotent.
        store.write("siteInfo_1.00_2.00.xml", b"<Site v='2'/>").unwrap();
        assert_eq!(store.list().unwrap(), vec!["siteInfo_1.00_2.00.xml".to_string()]);

        let _ = std::fs::remove_dir_all(store.root());
    }

    #[test]
    fn rejects_path_like_names() {
        let store = temp_store();
        assert!(store.write("../escape.xml", b"x").is_err());
        assert!(store.write("sub/dir.xml", b"x").is_err());
        assert!(store.write(".hidden", b"x").is_err());
        assert!(!store.exists("../escape.xml"));
        let _ = std::fs::remove_dir_all(store.root());
    }

    #[test]
    fn list_skips_hidden_and_directories() {
        let store = temp_store();
        store.write("species_1.00_2.00_specId_8.xml", b"<S/>").unwrap();
        std::fs::write(store.root().join(".partial.tmp"), b"x").unwrap();
        std::fs::create_dir(store.root().join("nested")).unwrap();

        let names = store.list().unwrap();
        assert_eq!(names, vec!["species_1.00_2.00_specId_8.xml".to_string()]);

        let _ = std::fs::remove_dir_all(store.root());
    }

    #[test]
    fn sweep_temp_removes_only_stale_temp_files() {
        let store = temp_store();
        store.write("siteInfo_1.00_2.00.xml", b"<Site/>").unwrap();
        let stale = store
            .root()
            .join(format!(".siteInfo_3.00_4.00.xml.{}.tmp", Uuid::now_v7()));
        std::fs::write(&stale, b"<Sit").unwrap();
        std::fs::write(store.root().join(".keep"), b"x").unwrap();

        assert_eq!(store.sweep_temp().unwrap(), 1);
        assert!(!stale.exists());
        assert!(store.root().join(".keep").exists());
        assert!(store.exists("siteInfo_1.00_2.00.xml"));
        assert_eq!(store.sweep_temp().unwrap(), 0);

        let _ = std::fs::remove_dir_all(store.root());
    }
}
