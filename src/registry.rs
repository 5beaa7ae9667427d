//! Instance registry and lifecycle
//!
//! The authoritative map of worker instances and their hierarchy. Every
//! other component reads instances from here; only the registry creates,
//! restarts or removes them.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::scm::SourceControl;
use crate::store::StateStore;
use crate::transport::Transport;
use crate::types::{InstanceId, InstanceRole, InstanceStatus, WorkspaceMode};

const INSTANCE_SET: &str = "instances";

/// A supervised worker instance
pub struct Instance {
    pub id: InstanceId,
    pub role: InstanceRole,
    pub parent_id: Option<InstanceId>,
    /// Transport session name; same string as the id
    pub session: String,
    pub working_path: PathBuf,
    pub workspace_mode: WorkspaceMode,
    pub branch_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    status: RwLock<InstanceStatus>,
    child_ids: RwLock<Vec<InstanceId>>,
    restarted_at: RwLock<Option<DateTime<Utc>>>,
}

impl Instance {
    pub fn status(&self) -> InstanceStatus {
        *self.status.read()
    }

    fn set_status(&self, status: InstanceStatus) {
        debug!(instance_id = %self.id, status = ?status, "Status transition");
        *self.status.write() = status;
    }

    pub fn children(&self) -> Vec<InstanceId> {
        self.child_ids.read().clone()
    }

    fn add_child(&self, child: InstanceId) {
        let mut children = self.child_ids.write();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    fn remove_child(&self, child: &InstanceId) {
        self.child_ids.write().retain(|id| id != child);
    }

    pub fn restarted_at(&self) -> Option<DateTime<Utc>> {
        *self.restarted_at.read()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            role: self.role,
            parent_id: self.parent_id.clone(),
            child_ids: self.children(),
            session: self.session.clone(),
            working_path: self.working_path.clone(),
            workspace_mode: self.workspace_mode,
            branch_ref: self.branch_ref.clone(),
            status: self.status(),
            created_at: self.created_at,
            restarted_at: self.restarted_at(),
        }
    }
}

/// Serialized instance state persisted to the store for crash recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub role: InstanceRole,
    pub parent_id: Option<InstanceId>,
    pub child_ids: Vec<InstanceId>,
    pub session: String,
    pub working_path: PathBuf,
    pub workspace_mode: WorkspaceMode,
    pub branch_ref: Option<String>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub restarted_at: Option<DateTime<Utc>>,
}

/// Shared handle to an instance
#[derive(Clone)]
pub struct InstanceHandle {
    inner: Arc<Instance>,
}

impl InstanceHandle {
    fn new(instance: Instance) -> Self {
        Self {
            inner: Arc::new(instance),
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.inner.id
    }
}

impl std::ops::Deref for InstanceHandle {
    type Target = Instance;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Authoritative registry of worker instances
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, InstanceHandle>>,
    transport: Arc<dyn Transport>,
    scm: Arc<dyn SourceControl>,
    store: Arc<dyn StateStore>,
    config: OrchestratorConfig,
}

impl InstanceRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        scm: Arc<dyn SourceControl>,
        store: Arc<dyn StateStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            transport,
            scm,
            store,
            config,
        }
    }

    /// Spawn a new instance under `parent_id`.
    ///
    /// The instance is created in `Initializing`, its transport session and
    /// worker process are started, and only on success is it registered as
    /// `Active`. On any failure the half-built session is torn down and
    /// nothing is registered.
    pub async fn spawn(
        &self,
        role: InstanceRole,
        parent_id: Option<&InstanceId>,
        workspace_mode: WorkspaceMode,
    ) -> Result<InstanceHandle, OrchestratorError> {
        self.validate_spawn(role, parent_id, workspace_mode)?;

        let id = InstanceId::generate(role);
        let session = id.as_str().to_string();
        let working_path = match workspace_mode {
            WorkspaceMode::Isolated => self.config.base_dir.join(id.as_str()),
            WorkspaceMode::Shared => self.config.base_dir.clone(),
        };

        // Specialists and Shared Managers work on their own branch
        let branch_ref = match (role, workspace_mode) {
            (InstanceRole::Specialist, _) => Some(format!("work/{id}")),
            (InstanceRole::Manager, WorkspaceMode::Shared) => Some(format!("work/{id}")),
            _ => None,
        };

        let instance = Instance {
            id: id.clone(),
            role,
            parent_id: parent_id.cloned(),
            session: session.clone(),
            working_path: working_path.clone(),
            workspace_mode,
            branch_ref: branch_ref.clone(),
            created_at: Utc::now(),
            status: RwLock::new(InstanceStatus::Initializing),
            child_ids: RwLock::new(Vec::new()),
            restarted_at: RwLock::new(None),
        };

        tokio::fs::create_dir_all(&working_path).await?;
        self.transport.create_session(&session, &working_path).await?;

        if let Err(e) = self
            .transport
            .send_keys(&session, &self.config.worker_command, true)
            .await
        {
            // Failed spawn is discarded, never registered
            self.transport.kill_session(&session).await.ok();
            return Err(e.into());
        }

        if let Some(branch) = &branch_ref {
            if let Err(e) = self.scm.create_branch(&working_path, branch).await {
                warn!(instance_id = %id, error = %e, "Branch setup failed");
            }
        }

        instance.set_status(InstanceStatus::Active);
        let handle = InstanceHandle::new(instance);

        self.instances.write().insert(id.clone(), handle.clone());
        if let Some(pid) = parent_id {
            if let Some(parent) = self.get(pid) {
                parent.add_child(id.clone());
                self.persist(&parent).await;
            }
        }
        self.persist(&handle).await;

        info!(
            instance_id = %id,
            role = %role,
            parent = ?parent_id,
            "Spawned instance"
        );

        Ok(handle)
    }

    fn validate_spawn(
        &self,
        role: InstanceRole,
        parent_id: Option<&InstanceId>,
        workspace_mode: WorkspaceMode,
    ) -> Result<(), OrchestratorError> {
        if workspace_mode == WorkspaceMode::Shared && role != InstanceRole::Manager {
            return Err(OrchestratorError::InvalidWorkspaceMode {
                role,
                reason: "only managers may share a workspace".into(),
            });
        }

        match role {
            InstanceRole::Executive => {
                if parent_id.is_some() {
                    return Err(OrchestratorError::SpawnDenied(
                        "executive is the hierarchy root and takes no parent".into(),
                    ));
                }
                let has_root = self
                    .instances
                    .read()
                    .values()
                    .any(|h| h.role == InstanceRole::Executive);
                if has_root {
                    return Err(OrchestratorError::SpawnDenied(
                        "an executive already exists".into(),
                    ));
                }
            }
            InstanceRole::Manager | InstanceRole::Specialist => {
                let pid = parent_id.ok_or_else(|| {
                    OrchestratorError::SpawnDenied(format!("{role} requires a parent"))
                })?;
                let parent = self
                    .get(pid)
                    .ok_or_else(|| OrchestratorError::InstanceNotFound(pid.clone()))?;
                if !parent.role.can_spawn(role) {
                    return Err(OrchestratorError::RoleViolation {
                        role: parent.role,
                        child: role,
                    });
                }
            }
        }
        Ok(())
    }

    /// Terminate an instance. With `cascade`, all descendants are
    /// terminated depth-first before the instance itself; without it, the
    /// call is refused while children remain.
    pub async fn terminate(
        &self,
        id: &InstanceId,
        cascade: bool,
    ) -> Result<(), OrchestratorError> {
        let handle = self
            .get(id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.clone()))?;

        let children = handle.children();
        if !children.is_empty() {
            if !cascade {
                return Err(OrchestratorError::HasChildren(id.clone()));
            }
            for child in children {
                if let Err(e) = Box::pin(self.terminate(&child, true)).await {
                    warn!(instance_id = %child, error = %e, "Child teardown failed");
                }
            }
        }

        // Session teardown happens before registry removal; transport
        // failure is logged and removal proceeds anyway
        handle.set_status(InstanceStatus::Terminated);
        if let Err(e) = self.transport.kill_session(&handle.session).await {
            warn!(instance_id = %id, error = %e, "Session teardown failed");
        }

        self.instances.write().remove(id);
        if let Some(pid) = &handle.parent_id {
            if let Some(parent) = self.get(pid) {
                parent.remove_child(id);
                self.persist(&parent).await;
            }
        }
        self.purge(id).await;

        info!(instance_id = %id, "Terminated instance");
        Ok(())
    }

    /// Restart an inactive instance in place, reusing its id, session name
    /// and working path
    pub async fn restart(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        let handle = self
            .get(id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.clone()))?;

        let current = handle.status();
        if current != InstanceStatus::Inactive {
            return Err(OrchestratorError::InvalidTransition {
                id: id.clone(),
                from: current,
                to: InstanceStatus::Restarting,
            });
        }

        handle.set_status(InstanceStatus::Restarting);

        if self.transport.session_exists(&handle.session).await {
            self.transport.kill_session(&handle.session).await.ok();
        }

        let started = async {
            self.transport
                .create_session(&handle.session, &handle.working_path)
                .await?;
            self.transport
                .send_keys(&handle.session, &self.config.worker_command, true)
                .await
        }
        .await;

        if let Err(e) = started {
            handle.set_status(InstanceStatus::Inactive);
            return Err(e.into());
        }

        handle.set_status(InstanceStatus::Active);
        *handle.restarted_at.write() = Some(Utc::now());
        self.persist(&handle).await;

        info!(instance_id = %id, "Restarted instance");
        Ok(())
    }

    /// Mark an instance inactive (e.g. its worker died); the precondition
    /// for `restart`
    pub async fn mark_inactive(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        let handle = self
            .get(id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.clone()))?;
        handle.set_status(InstanceStatus::Inactive);
        self.persist(&handle).await;
        Ok(())
    }

    pub fn get(&self, id: &InstanceId) -> Option<InstanceHandle> {
        self.instances.read().get(id).cloned()
    }

    pub fn is_active(&self, id: &InstanceId) -> bool {
        self.get(id)
            .map(|h| h.status() == InstanceStatus::Active)
            .unwrap_or(false)
    }

    /// List instances, optionally filtered by role and/or parent
    pub fn list(
        &self,
        role: Option<InstanceRole>,
        parent: Option<&InstanceId>,
    ) -> Vec<InstanceHandle> {
        self.instances
            .read()
            .values()
            .filter(|h| role.map(|r| h.role == r).unwrap_or(true))
            .filter(|h| {
                parent
                    .map(|p| h.parent_id.as_ref() == Some(p))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    pub fn active_count(&self, role: InstanceRole) -> usize {
        self.instances
            .read()
            .values()
            .filter(|h| h.role == role && h.status() == InstanceStatus::Active)
            .count()
    }

    /// The active Executive root, if present
    pub fn executive(&self) -> Option<InstanceHandle> {
        self.instances
            .read()
            .values()
            .find(|h| h.role == InstanceRole::Executive && h.status() == InstanceStatus::Active)
            .cloned()
    }

    /// Children of `id` that are currently active
    pub fn active_children(&self, id: &InstanceId) -> Vec<InstanceHandle> {
        let Some(handle) = self.get(id) else {
            return Vec::new();
        };
        handle
            .children()
            .iter()
            .filter_map(|cid| self.get(cid))
            .filter(|c| c.status() == InstanceStatus::Active)
            .collect()
    }

    /// Reconcile persisted and in-memory instances against the transport's
    /// live session list. Instances whose session is gone are treated as
    /// already terminated and purged, not as errors.
    pub async fn reconcile(&self) -> Result<(), OrchestratorError> {
        let live: HashSet<String> = self
            .transport
            .list_sessions()
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();

        // Drop in-memory instances with no backing session
        let stale: Vec<InstanceId> = self
            .instances
            .read()
            .values()
            .filter(|h| !live.contains(&h.session))
            .map(|h| h.id.clone())
            .collect();
        for id in &stale {
            let removed = self.instances.write().remove(id);
            if let Some(handle) = removed {
                if let Some(pid) = &handle.parent_id {
                    if let Some(parent) = self.get(pid) {
                        parent.remove_child(id);
                    }
                }
            }
            self.purge(id).await;
            info!(instance_id = %id, "Evicted instance with no session");
        }

        // Rehydrate persisted instances whose session survived
        let persisted = self.store.set_members(INSTANCE_SET).await.unwrap_or_default();
        let mut revived = 0usize;
        for raw_id in persisted {
            let id = InstanceId::from(raw_id.clone());
            if self.get(&id).is_some() {
                continue;
            }
            let Ok(Some(json)) = self.store.get(&format!("instance:{id}")).await else {
                self.store.set_remove(INSTANCE_SET, &raw_id).await.ok();
                continue;
            };
            let Ok(snap) = serde_json::from_str::<InstanceSnapshot>(&json) else {
                warn!(instance_id = %id, "Unreadable instance snapshot, purging");
                self.purge(&id).await;
                continue;
            };
            if !live.contains(&snap.session) {
                self.purge(&id).await;
                info!(instance_id = %id, "Purged persisted instance with no session");
                continue;
            }
            let instance = Instance {
                id: snap.id.clone(),
                role: snap.role,
                parent_id: snap.parent_id.clone(),
                session: snap.session,
                working_path: snap.working_path,
                workspace_mode: snap.workspace_mode,
                branch_ref: snap.branch_ref,
                created_at: snap.created_at,
                status: RwLock::new(InstanceStatus::Active),
                child_ids: RwLock::new(Vec::new()),
                restarted_at: RwLock::new(snap.restarted_at),
            };
            self.instances
                .write()
                .insert(snap.id, InstanceHandle::new(instance));
            revived += 1;
        }

        // Rebuild parent/child links, evicting orphans whose parent is gone
        let handles: Vec<InstanceHandle> = self.instances.read().values().cloned().collect();
        for handle in &handles {
            if let Some(pid) = &handle.parent_id {
                match self.get(pid) {
                    Some(parent) => parent.add_child(handle.id.clone()),
                    None => {
                        self.instances.write().remove(&handle.id);
                        self.purge(&handle.id).await;
                        warn!(instance_id = %handle.id, "Evicted orphan with missing parent");
                    }
                }
            }
        }

        info!(
            evicted = stale.len(),
            revived,
            total = self.instances.read().len(),
            "Registry reconciled"
        );
        Ok(())
    }

    /// Best-effort snapshot persistence; durability failures never fail the
    /// lifecycle operation itself
    async fn persist(&self, handle: &InstanceHandle) {
        let snapshot = handle.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                let key = format!("instance:{}", handle.id);
                if let Err(e) = self.store.set(&key, &json, None).await {
                    warn!(instance_id = %handle.id, error = %e, "Snapshot write failed");
                }
                if let Err(e) = self.store.set_add(INSTANCE_SET, handle.id.as_str()).await {
                    warn!(instance_id = %handle.id, error = %e, "Snapshot index failed");
                }
            }
            Err(e) => warn!(instance_id = %handle.id, error = %e, "Snapshot encode failed"),
        }
    }

    async fn purge(&self, id: &InstanceId) {
        self.store.delete(&format!("instance:{id}")).await.ok();
        self.store.set_remove(INSTANCE_SET, id.as_str()).await.ok();
    }
}
