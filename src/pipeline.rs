//! Mutation-triggered resync
//!
//! Every state change goes through [`ControlPlane`]: persist the mutation,
//! rebuild the configuration directory from a fresh snapshot, then ask the
//! proxy to reload. Nothing is queued or batched. The sequence runs under one
//! in-process lock so overlapping requests cannot interleave their purges and
//! writes.

use crate::db::Database;
use crate::model::{
    AccessListInput, Host, HostInput, LocationKind, RedirectionInput, StreamInput,
};
use crate::reload::ReloadSignaler;
use crate::sync::{ConfigSynchronizer, SyncError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Failure of a control-plane action
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// Input rejected before anything was stored
    #[error("{0:#}")]
    Invalid(anyhow::Error),

    #[error("store error: {0:#}")]
    Store(anyhow::Error),

    /// The mutation is stored but the artifacts on disk are stale
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<anyhow::Error> for ApplyError {
    fn from(e: anyhow::Error) -> Self {
        ApplyError::Store(e)
    }
}

/// Outcome of a successful action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Identifier of the created or modified entity, if any
    pub id: Option<i64>,
    /// Artifact file names written by the resync
    pub artifacts: Vec<String>,
    /// Whether the proxy acknowledged the reload; `false` does not undo anything
    pub reloaded: bool,
}

pub struct ControlPlane {
    db: Arc<Database>,
    synchronizer: Box<dyn ConfigSynchronizer>,
    reloader: ReloadSignaler,
    lock: Mutex<()>,
}

impl ControlPlane {
    pub fn new(
        db: Arc<Database>,
        synchronizer: Box<dyn ConfigSynchronizer>,
        reloader: ReloadSignaler,
    ) -> Self {
        Self {
            db,
            synchronizer,
            reloader,
            lock: Mutex::new(()),
        }
    }

    /// Read access for listing endpoints
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Rebuild and reload without a mutation
    pub async fn resync(&self) -> Result<ApplyReport, ApplyError> {
        let _guard = self.lock.lock().await;
        self.resync_locked(None).await
    }

    // ==================== Hosts ====================

    pub async fn create_host(&self, input: HostInput) -> Result<ApplyReport, ApplyError> {
        input.validate().map_err(ApplyError::Invalid)?;

        let _guard = self.lock.lock().await;
        self.check_group(input.group_id)?;
        let id = self.db.create_host(&input)?;
        info!(host_id = id, domains = ?input.domains, "Host created");

        self.resync_locked(Some(id)).await
    }

    pub async fn update_host(&self, id: i64, input: HostInput) -> Result<ApplyReport, ApplyError> {
        input.validate().map_err(ApplyError::Invalid)?;

        let _guard = self.lock.lock().await;
        self.check_group(input.group_id)?;
        if !self.db.update_host(id, &input)? {
            return Err(ApplyError::NotFound { kind: "host", id });
        }
        info!(host_id = id, "Host updated");

        self.resync_locked(Some(id)).await
    }

    pub async fn delete_host(&self, id: i64) -> Result<ApplyReport, ApplyError> {
        let _guard = self.lock.lock().await;
        self.delete_host_locked(id, "host").await
    }

    pub async fn set_host_enabled(&self, id: i64, enabled: bool) -> Result<ApplyReport, ApplyError> {
        let _guard = self.lock.lock().await;
        if !self.db.set_host_enabled(id, enabled)? {
            return Err(ApplyError::NotFound { kind: "host", id });
        }
        info!(host_id = id, enabled, "Host enabled state changed");

        self.resync_locked(Some(id)).await
    }

    /// Flip the enabled flag
    pub async fn toggle_host(&self, id: i64) -> Result<ApplyReport, ApplyError> {
        let _guard = self.lock.lock().await;
        let host = self
            .db
            .get_host(id)?
            .ok_or(ApplyError::NotFound { kind: "host", id })?;

        self.db.set_host_enabled(id, !host.enabled)?;
        info!(host_id = id, enabled = !host.enabled, "Host toggled");

        self.resync_locked(Some(id)).await
    }

    // ==================== Groups ====================

    pub async fn create_group(&self, name: &str) -> Result<ApplyReport, ApplyError> {
        let name = validate_group_name(name)?;

        let _guard = self.lock.lock().await;
        let id = self.db.create_group(name)?;
        info!(group_id = id, name, "Group created");

        self.resync_locked(Some(id)).await
    }

    pub async fn rename_group(&self, id: i64, name: &str) -> Result<ApplyReport, ApplyError> {
        let name = validate_group_name(name)?;

        let _guard = self.lock.lock().await;
        if !self.db.rename_group(id, name)? {
            return Err(ApplyError::NotFound { kind: "group", id });
        }
        info!(group_id = id, name, "Group renamed");

        self.resync_locked(Some(id)).await
    }

    /// Delete a group; its hosts stay, ungrouped
    pub async fn delete_group(&self, id: i64) -> Result<ApplyReport, ApplyError> {
        let _guard = self.lock.lock().await;
        if !self.db.delete_group(id)? {
            return Err(ApplyError::NotFound { kind: "group", id });
        }
        info!(group_id = id, "Group deleted");

        self.resync_locked(Some(id)).await
    }

    // ==================== Access lists ====================

    pub async fn create_access_list(&self, input: AccessListInput) -> Result<ApplyReport, ApplyError> {
        input.validate().map_err(ApplyError::Invalid)?;

        let _guard = self.lock.lock().await;
        let id = self.db.create_access_list(&input)?;
        info!(access_list_id = id, name = %input.name, "Access list created");

        self.resync_locked(Some(id)).await
    }

    pub async fn update_access_list(
        &self,
        id: i64,
        input: AccessListInput,
    ) -> Result<ApplyReport, ApplyError> {
        input.validate().map_err(ApplyError::Invalid)?;

        let _guard = self.lock.lock().await;
        if !self.db.update_access_list(id, &input)? {
            return Err(ApplyError::NotFound { kind: "access list", id });
        }
        info!(access_list_id = id, "Access list updated");

        self.resync_locked(Some(id)).await
    }

    /// Locations that still reference the list keep the dangling id
    pub async fn delete_access_list(&self, id: i64) -> Result<ApplyReport, ApplyError> {
        let _guard = self.lock.lock().await;
        if !self.db.delete_access_list(id)? {
            return Err(ApplyError::NotFound { kind: "access list", id });
        }
        info!(access_list_id = id, "Access list deleted");

        self.resync_locked(Some(id)).await
    }

    // ==================== Redirections ====================

    pub async fn create_redirection(&self, input: RedirectionInput) -> Result<ApplyReport, ApplyError> {
        self.create_host(input.into()).await
    }

    pub async fn update_redirection(
        &self,
        id: i64,
        input: RedirectionInput,
    ) -> Result<ApplyReport, ApplyError> {
        let input: HostInput = input.into();
        input.validate().map_err(ApplyError::Invalid)?;

        let _guard = self.lock.lock().await;
        self.require_shape(id, "redirection", is_redirection)?;
        self.db.update_host(id, &input)?;
        info!(host_id = id, "Redirection updated");

        self.resync_locked(Some(id)).await
    }

    pub async fn delete_redirection(&self, id: i64) -> Result<ApplyReport, ApplyError> {
        let _guard = self.lock.lock().await;
        self.require_shape(id, "redirection", is_redirection)?;
        self.delete_host_locked(id, "redirection").await
    }

    // ==================== Streams ====================

    pub async fn create_stream(&self, input: StreamInput) -> Result<ApplyReport, ApplyError> {
        self.create_host(input.into()).await
    }

    pub async fn update_stream(&self, id: i64, input: StreamInput) -> Result<ApplyReport, ApplyError> {
        let input: HostInput = input.into();
        input.validate().map_err(ApplyError::Invalid)?;

        let _guard = self.lock.lock().await;
        self.require_shape(id, "stream", is_stream)?;
        self.db.update_host(id, &input)?;
        info!(host_id = id, "Stream updated");

        self.resync_locked(Some(id)).await
    }

    pub async fn delete_stream(&self, id: i64) -> Result<ApplyReport, ApplyError> {
        let _guard = self.lock.lock().await;
        self.require_shape(id, "stream", is_stream)?;
        self.delete_host_locked(id, "stream").await
    }

    // ==================== Settings ====================

    /// Upsert each key; keys not mentioned are left alone
    pub async fn update_settings(
        &self,
        values: HashMap<String, String>,
    ) -> Result<ApplyReport, ApplyError> {
        if values.keys().any(|k| k.trim().is_empty()) {
            return Err(ApplyError::Invalid(anyhow::anyhow!(
                "Setting keys must not be empty"
            )));
        }

        let _guard = self.lock.lock().await;
        self.db.set_settings(&values)?;
        info!(keys = values.len(), "Settings updated");

        self.resync_locked(None).await
    }

    // ==================== Internals ====================

    /// Caller holds `lock`
    async fn delete_host_locked(&self, id: i64, kind: &'static str) -> Result<ApplyReport, ApplyError> {
        if !self.db.delete_host(id)? {
            return Err(ApplyError::NotFound { kind, id });
        }
        info!(host_id = id, kind, "Host deleted");

        // The full resync purges it too; this only narrows the stale window
        match self.synchronizer.remove_host(id) {
            Ok(removed) => debug!(host_id = id, removed, "Removed host artifacts"),
            Err(e) => warn!(host_id = id, error = %e, "Failed to remove host artifacts directly"),
        }

        self.resync_locked(Some(id)).await
    }

    /// Snapshot, sync, reload. Caller holds `lock`.
    async fn resync_locked(&self, id: Option<i64>) -> Result<ApplyReport, ApplyError> {
        let snapshot = self.db.read_snapshot()?;

        let report = self.synchronizer.sync(&snapshot).map_err(|e| {
            error!(
                dir = %self.synchronizer.config_dir().display(),
                error = %e,
                "Config sync failed; proxy configuration is stale"
            );
            ApplyError::Sync(e)
        })?;

        let reloaded = self.reloader.signal_reload().await;

        info!(
            hosts = snapshot.hosts.len(),
            access_lists = snapshot.access_lists.len(),
            artifacts = report.written.len(),
            removed = report.removed,
            reloaded,
            "Configuration resynced"
        );

        Ok(ApplyReport {
            id,
            artifacts: report.written,
            reloaded,
        })
    }

    fn check_group(&self, group_id: Option<i64>) -> Result<(), ApplyError> {
        let Some(group_id) = group_id else {
            return Ok(());
        };
        if self.db.list_groups()?.iter().any(|g| g.id == group_id) {
            Ok(())
        } else {
            Err(ApplyError::Invalid(anyhow::anyhow!(
                "Invalid host:\n  - group {} does not exist",
                group_id
            )))
        }
    }

    /// A host of the wrong shape counts as missing for typed actions
    fn require_shape(
        &self,
        id: i64,
        kind: &'static str,
        matches: fn(&Host) -> bool,
    ) -> Result<(), ApplyError> {
        match self.db.get_host(id)? {
            Some(host) if matches(&host) => Ok(()),
            _ => Err(ApplyError::NotFound { kind, id }),
        }
    }
}

fn validate_group_name(name: &str) -> Result<&str, ApplyError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApplyError::Invalid(anyhow::anyhow!(
            "Group name must not be empty"
        )));
    }
    Ok(name)
}

/// A single redirect location at the root and no stream ports
fn is_redirection(host: &Host) -> bool {
    host.stream_ports.is_empty()
        && host.locations.len() == 1
        && host.locations[0].kind() == LocationKind::Redirect
}

/// Stream ports only
fn is_stream(host: &Host) -> bool {
    host.locations.is_empty() && !host.stream_ports.is_empty()
}
