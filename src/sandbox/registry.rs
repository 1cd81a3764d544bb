//! Durable mapping of sandbox name to record.
//!
//! The registry is one JSON document. Every mutation takes an exclusive
//! advisory lock, re-reads the document, applies the change and atomically
//! replaces the file (temp file + rename). A document that fails to parse is
//! treated as empty; the broken file is preserved before it is overwritten.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};

use crate::config::AgentPaths;
use crate::error::{Error, Result};

use super::record::{is_valid_name, SandboxRecord};

/// Registry document: name -> record.
pub type RegistryDocument = BTreeMap<String, SandboxRecord>;

/// Persistent sandbox registry.
#[derive(Debug, Clone)]
pub struct Registry {
    paths: AgentPaths,
}

impl Registry {
    /// Creates a registry rooted at `paths`.
    pub fn new(paths: AgentPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AgentPaths {
        &self.paths
    }

    /// Returns the record for `name`, if any.
    pub fn get(&self, name: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.load()?.remove(name))
    }

    /// Returns the record for `name` or `NotFound`.
    pub fn require(&self, name: &str) -> Result<SandboxRecord> {
        self.get(name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Inserts or replaces the record stored under `name`.
    pub fn put(&self, name: &str, record: SandboxRecord) -> Result<()> {
        if !is_valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        if record.name != name {
            return Err(Error::InvalidName(format!(
                "record name '{}' does not match key '{}'",
                record.name, name
            )));
        }
        self.update(|doc| {
            doc.insert(name.to_string(), record);
        })
    }

    /// Removes `name`, returning the record that was stored.
    pub fn remove(&self, name: &str) -> Result<Option<SandboxRecord>> {
        let mut removed = None;
        self.update(|doc| {
            removed = doc.remove(name);
        })?;
        Ok(removed)
    }

    /// Returns every record.
    pub fn list_all(&self) -> Result<RegistryDocument> {
        self.load()
    }

    /// Reports whether the persisted document parses.
    pub fn check(&self) -> Result<()> {
        let path = self.paths.registry_file();
        match std::fs::read_to_string(&path) {
            Ok(content) => parse_document(&path, &content).map(|_| ()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the document, recovering a corrupt one as empty.
    fn load(&self) -> Result<RegistryDocument> {
        let path = self.paths.registry_file();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryDocument::new())
            }
            Err(e) => return Err(e.into()),
        };

        match parse_document(&path, &content) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                tracing::error!(error = %e, "treating sandbox registry as empty");
                Ok(RegistryDocument::new())
            }
        }
    }

    /// Applies `mutate` to the document under the registry lock.
    fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RegistryDocument),
    {
        std::fs::create_dir_all(self.paths.root())?;
        let _lock = self.lock()?;

        if let Err(e) = self.check() {
            if matches!(e, Error::RegistryCorrupt { .. }) {
                self.preserve_corrupt()?;
            }
        }

        let mut doc = self.load()?;
        mutate(&mut doc);
        self.save(&doc)
    }

    /// Writes the document atomically.
    fn save(&self, doc: &RegistryDocument) -> Result<()> {
        let path = self.paths.registry_file();
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| Error::Serialization(format!("failed to serialize registry: {}", e)))?;

        let tmp = self
            .paths
            .root()
            .join(format!(".sandboxes.json.{}.tmp", uuid::Uuid::new_v4()));
        let result = write_synced(&tmp, json.as_bytes()).and_then(|_| {
            std::fs::rename(&tmp, &path)?;
            Ok(())
        });
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    /// Copies an unparsable document aside so it is not lost on rewrite.
    fn preserve_corrupt(&self) -> Result<()> {
        let path = self.paths.registry_file();
        let backup = path.with_file_name(format!(
            "sandboxes.json.corrupt-{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S")
        ));
        std::fs::copy(&path, &backup)?;
        tracing::warn!(backup = %backup.display(), "preserved corrupt sandbox registry");
        Ok(())
    }

    fn lock(&self) -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.paths.lock_file())?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::Io(std::io::Error::from(errno)))
    }
}

fn parse_document(path: &Path, content: &str) -> Result<RegistryDocument> {
    if content.trim().is_empty() {
        return Ok(RegistryDocument::new());
    }
    serde_json::from_str(content).map_err(|e| Error::RegistryCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::record::{AuthMode, ResourceSpec, SandboxState, SyncMode};
    use chrono::Utc;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn record(name: &str) -> SandboxRecord {
        let now = Utc::now();
        SandboxRecord {
            name: name.to_string(),
            state: SandboxState::Stopped,
            project_path: PathBuf::from("/p"),
            workspace_path: PathBuf::from("/s/workspace"),
            state_dir: PathBuf::from("/s"),
            resource_spec: ResourceSpec::default(),
            sync_mode: SyncMode::Manual,
            process_handle: None,
            ssh_port: 2223,
            ssh_user: "sandbox".to_string(),
            auth_mode: AuthMode::PublicKey,
            runner_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn registry() -> (TempDir, Registry) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let registry = Registry::new(AgentPaths::new(dir.path()));
        (dir, registry)
    }

    #[test]
    fn empty_registry_lists_nothing() {
        let (_dir, registry) = registry();
        assert!(registry.list_all().unwrap().is_empty());
        assert!(registry.get("missing").unwrap().is_none());
    }

    #[test]
    fn put_get_remove_round_trip() {
        let (_dir, registry) = registry();

        registry.put("alpha", record("alpha")).unwrap();
        registry.put("beta", record("beta")).unwrap();

        assert_eq!(registry.get("alpha").unwrap().unwrap().name, "alpha");
        assert_eq!(registry.list_all().unwrap().len(), 2);

        let removed = registry.remove("alpha").unwrap();
        assert!(removed.is_some());
        assert!(registry.get("alpha").unwrap().is_none());
        assert!(registry.remove("alpha").unwrap().is_none());
    }

    #[test]
    fn put_replaces_existing_record() {
        let (_dir, registry) = registry();
        registry.put("alpha", record("alpha")).unwrap();

        let mut updated = record("alpha");
        updated.ssh_port = 2300;
        registry.put("alpha", updated).unwrap();

        assert_eq!(registry.require("alpha").unwrap().ssh_port, 2300);
        assert_eq!(registry.list_all().unwrap().len(), 1);
    }

    #[test]
    fn put_rejects_mismatched_name() {
        let (_dir, registry) = registry();
        let err = registry.put("alpha", record("beta")).unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)));
    }

    #[test]
    fn require_missing_is_not_found() {
        let (_dir, registry) = registry();
        assert!(matches!(
            registry.require("ghost").unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn corrupt_document_reads_as_empty_and_is_reported() {
        let (dir, registry) = registry();
        std::fs::write(dir.path().join("sandboxes.json"), "{ not json").unwrap();

        assert!(registry.list_all().unwrap().is_empty());
        assert!(matches!(
            registry.check().unwrap_err(),
            Error::RegistryCorrupt { .. }
        ));
    }

    #[test]
    fn write_over_corrupt_document_preserves_backup() {
        let (dir, registry) = registry();
        std::fs::write(dir.path().join("sandboxes.json"), "garbage").unwrap();

        registry.put("alpha", record("alpha")).unwrap();

        assert!(registry.check().is_ok());
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("sandboxes.json.corrupt-")
            })
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let (dir, registry) = registry();
        registry.put("alpha", record("alpha")).unwrap();

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn document_is_a_top_level_name_mapping() {
        let (dir, registry) = registry();
        registry.put("alpha", record("alpha")).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("sandboxes.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("alpha").is_some());
        assert_eq!(value["alpha"]["state"], "stopped");
    }
}
