//! Keeps the generated configuration directory in step with the store
//!
//! Every sync is a full rebuild: previously generated artifacts are purged,
//! then one document is written for the global settings, one for the access
//! lists and one per host. The directory is owned exclusively by this module.

use crate::compiler::{compile_access_lists, compile_global, compile_host};
use crate::model::Snapshot;
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const GLOBAL_ARTIFACT: &str = "global.yaml";
pub const ACCESS_LISTS_ARTIFACT: &str = "access-lists.yaml";

/// Mode of artifacts the proxy's user only needs to read
pub const ARTIFACT_MODE: u32 = 0o644;

/// Default mode of artifacts carrying credentials
pub const DEFAULT_SECRET_ARTIFACT_MODE: u32 = 0o640;

/// Prefix of in-flight temporary files; leftovers from a crash are purged
const TEMP_PREFIX: &str = ".proxydeck-";
const TEMP_SUFFIX: &str = ".tmp";

/// A family of per-entity artifacts named `<prefix><id>.<ext>`
#[derive(Debug, Clone, Copy)]
pub struct ArtifactFamily {
    pub prefix: &'static str,
    pub extensions: &'static [&'static str],
    /// Nothing writes legacy families any more; they are only purged
    pub legacy: bool,
}

/// Every artifact family that may exist in a config directory.
///
/// Redirections and streams used to be written as separate families before
/// they were folded into one document per host. Append new entries here when
/// a naming scheme is retired.
pub const ARTIFACT_FAMILIES: &[ArtifactFamily] = &[
    ArtifactFamily {
        prefix: "host-",
        extensions: &["yaml"],
        legacy: false,
    },
    ArtifactFamily {
        prefix: "redirect-",
        extensions: &["yaml", "yml"],
        legacy: true,
    },
    ArtifactFamily {
        prefix: "stream-",
        extensions: &["yaml", "yml"],
        legacy: true,
    },
];

impl ArtifactFamily {
    /// Whether a directory entry belongs to this family
    pub fn matches(&self, file_name: &str) -> bool {
        let Some(rest) = file_name.strip_prefix(self.prefix) else {
            return false;
        };
        self.extensions.iter().any(|ext| {
            rest.strip_suffix(ext)
                .and_then(|stem| stem.strip_suffix('.'))
                .is_some_and(|stem| !stem.is_empty())
        })
    }

    /// Every file name this family could have used for an entity id
    pub fn file_names(&self, id: i64) -> impl Iterator<Item = String> + '_ {
        self.extensions
            .iter()
            .map(move |ext| format!("{}{}.{}", self.prefix, id, ext))
    }
}

/// File name of a host's artifact
pub fn host_artifact_name(id: i64) -> String {
    format!("host-{}.yaml", id)
}

/// Whether a file name is something a sync is allowed to delete
pub fn is_generated_artifact(file_name: &str) -> bool {
    ARTIFACT_FAMILIES.iter().any(|f| f.matches(file_name))
        || (file_name.starts_with(TEMP_PREFIX) && file_name.ends_with(TEMP_SUFFIX))
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode {artifact}: {source}")]
    Encode {
        artifact: String,
        source: serde_yaml::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result of a completed sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Artifacts written, in write order
    pub written: Vec<String>,
    /// Stale artifacts removed during cleanup
    pub removed: usize,
}

/// Strategy that turns a snapshot into files on disk.
///
/// The full-rebuild implementation is [`DirectorySynchronizer`]; an
/// incremental one can replace it without touching the compiler.
pub trait ConfigSynchronizer: Send + Sync {
    /// Make the directory reflect exactly this snapshot
    fn sync(&self, snapshot: &Snapshot) -> Result<SyncReport, SyncError>;

    /// Remove one host's current and legacy artifacts. Missing files are fine.
    fn remove_host(&self, host_id: i64) -> Result<usize, SyncError>;

    fn config_dir(&self) -> &Path;
}

/// Full-rebuild synchronizer for a single directory
pub struct DirectorySynchronizer {
    dir: PathBuf,
    secret_mode: u32,
}

impl DirectorySynchronizer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            secret_mode: DEFAULT_SECRET_ARTIFACT_MODE,
        }
    }

    /// Mode for `access-lists.yaml`, which holds basic-auth passwords
    pub fn with_secret_mode(mut self, mode: u32) -> Self {
        self.secret_mode = mode;
        self
    }

    fn mode_for(&self, name: &str) -> u32 {
        if name == ACCESS_LISTS_ARTIFACT {
            self.secret_mode
        } else {
            ARTIFACT_MODE
        }
    }

    /// Encode every document before anything on disk is touched
    fn render(snapshot: &Snapshot) -> Result<Vec<(String, String)>, SyncError> {
        let mut artifacts = Vec::with_capacity(snapshot.hosts.len() + 2);

        artifacts.push((
            GLOBAL_ARTIFACT.to_string(),
            encode(GLOBAL_ARTIFACT, &compile_global(&snapshot.settings))?,
        ));
        artifacts.push((
            ACCESS_LISTS_ARTIFACT.to_string(),
            encode(
                ACCESS_LISTS_ARTIFACT,
                &compile_access_lists(&snapshot.access_lists),
            )?,
        ));

        for host in &snapshot.hosts {
            let name = host_artifact_name(host.id);
            let contents = encode(&name, &compile_host(host))?;
            artifacts.push((name, contents));
        }

        Ok(artifacts)
    }

    /// Best-effort purge of generated artifacts; failures are logged and ignored
    fn purge_generated(&self) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list config directory, skipping cleanup");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !is_generated_artifact(name) {
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(artifact = name, "Removed artifact");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(artifact = name, error = %e, "Failed to remove artifact, ignoring");
                }
            }
        }
        removed
    }

    /// Write through a temporary file and rename, so readers never observe a
    /// truncated document
    fn write_artifact(&self, name: &str, contents: &str, mode: u32) -> Result<(), SyncError> {
        let path = self.dir.join(name);
        let write_err = |source| SyncError::Write {
            path: path.clone(),
            source,
        };

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)
            .map_err(write_err)?;
        tmp.write_all(contents.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;

        // The proxy usually runs as another user
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))
                .map_err(write_err)?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        tmp.persist(&path).map_err(|e| write_err(e.error))?;
        debug!(artifact = name, bytes = contents.len(), "Wrote artifact");
        Ok(())
    }
}

fn encode<T: Serialize>(artifact: &str, document: &T) -> Result<String, SyncError> {
    serde_yaml::to_string(document).map_err(|source| SyncError::Encode {
        artifact: artifact.to_string(),
        source,
    })
}

impl ConfigSynchronizer for DirectorySynchronizer {
    fn sync(&self, snapshot: &Snapshot) -> Result<SyncReport, SyncError> {
        let artifacts = Self::render(snapshot)?;

        std::fs::create_dir_all(&self.dir).map_err(|source| SyncError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let removed = self.purge_generated();

        let mut written = Vec::with_capacity(artifacts.len());
        for (name, contents) in artifacts {
            self.write_artifact(&name, &contents, self.mode_for(&name))?;
            written.push(name);
        }

        info!(
            dir = %self.dir.display(),
            written = written.len(),
            removed,
            "Config directory synchronized"
        );

        Ok(SyncReport { written, removed })
    }

    fn remove_host(&self, host_id: i64) -> Result<usize, SyncError> {
        let mut removed = 0;

        for family in ARTIFACT_FAMILIES {
            for name in family.file_names(host_id) {
                let path = self.dir.join(&name);
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(host_id, artifact = %name, "Removed host artifact");
                        removed += 1;
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(source) => return Err(SyncError::Remove { path, source }),
                }
            }
        }

        Ok(removed)
    }

    fn config_dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HostInput, Location, Upstream};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn snapshot_with_hosts(ids: &[i64]) -> Snapshot {
        Snapshot {
            hosts: ids
                .iter()
                .map(|id| {
                    HostInput {
                        domains: vec![format!("app{}.example.com", id)],
                        locations: vec![Location::proxy(
                            "/",
                            vec![Upstream::new("10.0.0.1", 8080)],
                        )],
                        ..HostInput::default()
                    }
                    .into_host(*id)
                })
                .collect(),
            ..Snapshot::default()
        }
    }

    fn dir_listing(dir: &Path) -> BTreeSet<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[cfg(unix)]
    #[test]
    fn test_access_lists_are_not_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let mode = |name: &str| {
            std::fs::metadata(tmp.path().join(name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };

        DirectorySynchronizer::new(tmp.path())
            .sync(&snapshot_with_hosts(&[1]))
            .unwrap();
        assert_eq!(mode("access-lists.yaml"), 0o640);
        assert_eq!(mode("global.yaml"), 0o644);
        assert_eq!(mode("host-1.yaml"), 0o644);

        DirectorySynchronizer::new(tmp.path())
            .with_secret_mode(0o600)
            .sync(&snapshot_with_hosts(&[1]))
            .unwrap();
        assert_eq!(mode("access-lists.yaml"), 0o600);
    }

    #[test]
    fn test_family_matching() {
        let host = &ARTIFACT_FAMILIES[0];
        assert!(host.matches("host-12.yaml"));
        assert!(!host.matches("host-.yaml"));
        assert!(!host.matches("host-12.yaml.bak"));
        assert!(!host.matches("hosts.yaml"));

        assert!(is_generated_artifact("redirect-3.yml"));
        assert!(is_generated_artifact("stream-8.yaml"));
        assert!(is_generated_artifact(".proxydeck-abc123.tmp"));
        assert!(!is_generated_artifact("global.yaml"));
        assert!(!is_generated_artifact("custom.conf"));
    }

    #[test]
    fn test_sync_creates_directory_and_writes_all_artifacts() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("conf.d");
        let sync = DirectorySynchronizer::new(&dir);

        let report = sync.sync(&snapshot_with_hosts(&[1, 2])).unwrap();

        assert_eq!(
            report.written,
            vec!["global.yaml", "access-lists.yaml", "host-1.yaml", "host-2.yaml"]
        );
        assert_eq!(
            dir_listing(&dir),
            names(&["global.yaml", "access-lists.yaml", "host-1.yaml", "host-2.yaml"])
        );
    }

    #[test]
    fn test_sync_removes_orphans_and_legacy_artifacts() {
        let tmp = TempDir::new().unwrap();
        for stale in [
            "host-7.yaml",
            "redirect-1.yaml",
            "stream-2.yml",
            ".proxydeck-dead.tmp",
        ] {
            std::fs::write(tmp.path().join(stale), "stale").unwrap();
        }
        std::fs::write(tmp.path().join("README"), "operator notes").unwrap();

        let sync = DirectorySynchronizer::new(tmp.path());
        let report = sync.sync(&snapshot_with_hosts(&[1])).unwrap();

        assert_eq!(report.removed, 4);
        assert_eq!(
            dir_listing(tmp.path()),
            names(&["README", "global.yaml", "access-lists.yaml", "host-1.yaml"])
        );
    }

    #[test]
    fn test_sync_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let sync = DirectorySynchronizer::new(tmp.path());
        let snapshot = snapshot_with_hosts(&[3, 1, 2]);

        sync.sync(&snapshot).unwrap();
        let first: Vec<(String, Vec<u8>)> = dir_listing(tmp.path())
            .into_iter()
            .map(|n| {
                let bytes = std::fs::read(tmp.path().join(&n)).unwrap();
                (n, bytes)
            })
            .collect();

        sync.sync(&snapshot).unwrap();
        let second: Vec<(String, Vec<u8>)> = dir_listing(tmp.path())
            .into_iter()
            .map(|n| {
                let bytes = std::fs::read(tmp.path().join(&n)).unwrap();
                (n, bytes)
            })
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_written_host_document_parses_back() {
        let tmp = TempDir::new().unwrap();
        let sync = DirectorySynchronizer::new(tmp.path());
        let snapshot = snapshot_with_hosts(&[5]);

        sync.sync(&snapshot).unwrap();

        let text = std::fs::read_to_string(tmp.path().join("host-5.yaml")).unwrap();
        let doc: crate::compiler::HostDocument = serde_yaml::from_str(&text).unwrap();
        assert_eq!(doc, compile_host(&snapshot.hosts[0]));
    }

    #[test]
    fn test_remove_host_removes_current_and_legacy_names() {
        let tmp = TempDir::new().unwrap();
        for name in ["host-4.yaml", "redirect-4.yml", "stream-4.yaml", "host-40.yaml"] {
            std::fs::write(tmp.path().join(name), "x").unwrap();
        }

        let sync = DirectorySynchronizer::new(tmp.path());
        assert_eq!(sync.remove_host(4).unwrap(), 3);
        assert_eq!(dir_listing(tmp.path()), names(&["host-40.yaml"]));

        // Nothing left to remove is not an error
        assert_eq!(sync.remove_host(4).unwrap(), 0);
    }

    #[test]
    fn test_unwritable_target_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let not_a_dir = tmp.path().join("occupied");
        std::fs::write(&not_a_dir, "file in the way").unwrap();

        let sync = DirectorySynchronizer::new(&not_a_dir);
        let err = sync.sync(&snapshot_with_hosts(&[1])).unwrap_err();

        assert!(matches!(err, SyncError::CreateDir { .. }));
    }
}
