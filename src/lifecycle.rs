use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::{PgPool, Row};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::compute::{self, ComputeBackend, MachineSpec, MachineState, MountSpec};
use crate::error::{AppError, AppResult};
use crate::preview::PreviewCache;
use crate::workspaces::{self, Workspace, WorkspaceStatus};

const START_DEADLINE: Duration = Duration::from_secs(120);
const STOP_DEADLINE: Duration = Duration::from_secs(30);

/// Mount point of the persistent volume inside the workspace; the same tree
/// the file-ops channel is pinned to.
pub const PROJECT_MOUNT: &str = crate::files::WORKING_DIR;

/// Outcome of a successful Start: enough to hand the caller a connection.
#[derive(Debug, Clone)]
pub struct Started {
    pub machine_id: String,
    pub private_ip: String,
}

/// Owns the workspace state machine and drives the compute backend to match.
/// All Start/Stop/Delete calls on the same workspace are serialised by an
/// in-memory per-id mutex; the DB conditional UPDATE remains the source of
/// truth so a second gateway replica cannot corrupt state either.
pub struct LifecycleManager {
    pool: PgPool,
    backend: Arc<dyn ComputeBackend>,
    cache: Arc<PreviewCache>,
    locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl LifecycleManager {
    pub fn new(pool: PgPool, backend: Arc<dyn ComputeBackend>, cache: Arc<PreviewCache>) -> Self {
        Self {
            pool,
            backend,
            cache,
            locks: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    pub fn backend_handle(&self) -> Arc<dyn ComputeBackend> {
        Arc::clone(&self.backend)
    }

    fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Record activity so the idle reaper leaves the workspace alone.
    pub async fn touch(&self, id: Uuid) {
        if let Err(err) = sqlx::query("UPDATE projects SET last_accessed_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(?err, workspace_id = %id, "failed to update last_accessed_at");
        }
    }

    async fn set_status(&self, id: Uuid, status: WorkspaceStatus) -> AppResult<()> {
        sqlx::query("UPDATE projects SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, message: &str) {
        tracing::error!(workspace_id = %id, message, "workspace entered error state");
        let result = sqlx::query(
            "UPDATE projects SET status = 'error', error_message = $1, updated_at = now() \
             WHERE id = $2",
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            tracing::error!(?err, workspace_id = %id, "failed to persist error state");
        }
    }

    /// Start a workspace. The operation is spawned as a detached task, so a
    /// client disconnect or request timeout abandons only the wait, never
    /// the operation: the state machine always runs to its own deadline.
    /// The caller merely awaits the reported outcome.
    pub async fn start(self: Arc<Self>, id: Uuid) -> AppResult<Started> {
        let (tx, rx) = oneshot::channel();
        let manager = self;
        tokio::spawn(async move {
            let result = manager.start_locked(id).await;
            if tx.send(result).is_err() {
                tracing::debug!(workspace_id = %id, "start finished with no listener");
            }
        });
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(AppError::Internal(
                "start task ended without reporting".into(),
            )),
        }
    }

    /// Stop a workspace, detached from the caller like [`Self::start`].
    pub async fn stop(self: Arc<Self>, id: Uuid) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        let manager = self;
        tokio::spawn(async move {
            let result = manager.stop_locked(id).await;
            if tx.send(result).is_err() {
                tracing::debug!(workspace_id = %id, "stop finished with no listener");
            }
        });
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(AppError::Internal(
                "stop task ended without reporting".into(),
            )),
        }
    }

    /// Delete a workspace, detached from the caller like [`Self::start`].
    pub async fn delete(self: Arc<Self>, id: Uuid) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        let manager = self;
        tokio::spawn(async move {
            let result = manager.delete_locked(id).await;
            if tx.send(result).is_err() {
                tracing::debug!(workspace_id = %id, "delete finished with no listener");
            }
        });
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(AppError::Internal(
                "delete task ended without reporting".into(),
            )),
        }
    }

    /// Start algorithm per the state machine: stopped|error → starting →
    /// running, volume and machine created on first start and reused after.
    async fn start_locked(&self, id: Uuid) -> AppResult<Started> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        // Two passes at most: the second only after a stale-running row was
        // corrected against the backend.
        for corrected in [false, true] {
            let claimed = sqlx::query(
                "UPDATE projects SET status = 'starting', error_message = NULL, \
                 updated_at = now() \
                 WHERE id = $1 AND status IN ('stopped', 'error') RETURNING id",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            if claimed.is_some() {
                return match self.run_start(id).await {
                    Ok(started) => Ok(started),
                    Err(err) => {
                        self.fail(id, &err.to_string()).await;
                        Err(err)
                    }
                };
            }

            let current = workspaces::get_workspace(&self.pool, id).await?;
            match current.status {
                // Already running: idempotent success, unless the backend
                // disagrees, in which case the backend wins and the row is
                // corrected before one more attempt.
                WorkspaceStatus::Running => {
                    let machine_id = current.machine_id.clone().ok_or_else(|| {
                        AppError::Internal(format!("workspace {id} running without machine_id"))
                    })?;
                    match self.backend.get_machine(&machine_id).await {
                        Ok(machine) => {
                            let private_ip = machine.private_ip.ok_or_else(|| {
                                AppError::BackendUnavailable("machine has no address".into())
                            })?;
                            return Ok(Started {
                                machine_id,
                                private_ip,
                            });
                        }
                        Err(AppError::NotFound) if !corrected => {
                            tracing::warn!(workspace_id = %id, %machine_id,
                                "running row with vanished machine; correcting");
                            sqlx::query(
                                "UPDATE projects SET status = 'stopped', machine_id = NULL, \
                                 updated_at = now() WHERE id = $1",
                            )
                            .bind(id)
                            .execute(&self.pool)
                            .await?;
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
                other => {
                    return Err(AppError::Conflict(format!(
                        "workspace is {}",
                        other.as_str()
                    )))
                }
            }
        }
        Err(AppError::Internal("start correction loop exhausted".into()))
    }

    async fn run_start(&self, id: Uuid) -> AppResult<Started> {
        let mut workspace = workspaces::get_workspace(&self.pool, id).await?;
        let prefix = workspace.prefix();

        if workspace.volume_id.is_none() {
            let name = format!("ws-{prefix}");
            let size = workspace.hardware.volume_gb;
            let region = crate::config::MACHINES_REGION.clone();
            let backend = &self.backend;
            let volume =
                compute::with_retries(|| backend.create_volume(&name, size, &region)).await?;
            sqlx::query("UPDATE projects SET volume_id = $1, updated_at = now() WHERE id = $2")
                .bind(&volume.id)
                .bind(id)
                .execute(&self.pool)
                .await?;
            workspace.volume_id = Some(volume.id);
        }
        let volume_id = workspace.volume_id.clone().unwrap_or_default();

        let mut created_machine = None;
        let machine_id = match workspace.machine_id.clone() {
            Some(machine_id) => {
                let backend = &self.backend;
                let mid = machine_id.clone();
                compute::with_retries(|| backend.start_machine(&mid)).await?;
                machine_id
            }
            None => {
                let env = self.compose_env(&workspace).await?;
                let spec = MachineSpec {
                    name: format!("ws-{prefix}"),
                    image: workspace.base_image.clone(),
                    guest: workspace.hardware.guest(),
                    env,
                    mounts: vec![MountSpec {
                        volume_id: volume_id.clone(),
                        path: PROJECT_MOUNT.to_string(),
                    }],
                    ports: vec![2222],
                    owner_label: workspace.user_id.to_string(),
                };
                let backend = &self.backend;
                let machine = compute::with_retries(|| backend.create_machine(&spec)).await?;
                sqlx::query("UPDATE projects SET machine_id = $1, updated_at = now() WHERE id = $2")
                    .bind(&machine.id)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                if machine.state != MachineState::Started {
                    self.backend.start_machine(&machine.id).await?;
                }
                created_machine = Some(machine.id.clone());
                machine.id
            }
        };

        let waited = self
            .backend
            .wait_for_state(&machine_id, MachineState::Started, START_DEADLINE)
            .await;
        let machine = match waited {
            Ok(machine) => machine,
            Err(err) => {
                // Partial-start cleanup: a machine created by this attempt is
                // torn down so retry starts from a clean slate. The volume is
                // always retained.
                if let Some(ref mid) = created_machine {
                    if let Err(cleanup_err) = self.backend.delete_machine(mid).await {
                        tracing::warn!(?cleanup_err, machine_id = %mid, "start cleanup failed");
                    } else {
                        let _ = sqlx::query(
                            "UPDATE projects SET machine_id = NULL, updated_at = now() \
                             WHERE id = $1",
                        )
                        .bind(id)
                        .execute(&self.pool)
                        .await;
                    }
                }
                return Err(err);
            }
        };
        let private_ip = machine
            .private_ip
            .ok_or_else(|| AppError::BackendUnavailable("machine has no address".into()))?;

        sqlx::query(
            "UPDATE projects SET status = 'running', last_accessed_at = now(), \
             updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.cache.invalidate_prefix(&prefix).await;
        tracing::info!(workspace_id = %id, %machine_id, "workspace running");

        Ok(Started {
            machine_id,
            private_ip,
        })
    }

    /// Machine env = declared overrides ∪ the user's unsealed provider keys
    /// ∪ connection vars of every ready infra service of this workspace.
    async fn compose_env(&self, workspace: &Workspace) -> AppResult<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        if let Some(obj) = workspace.env_overrides.as_object() {
            for (k, v) in obj {
                let value = match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                };
                env.insert(k.clone(), value);
            }
        }
        match crate::keys::unsealed_api_keys(&self.pool, workspace.user_id).await {
            Ok(keys) => {
                for (provider, secret) in keys {
                    if let Some(var) = crate::providers::env_var_for(&provider) {
                        env.insert(var.to_string(), secret);
                    }
                }
            }
            Err(AppError::BackendUnavailable(_)) => {
                // No master key configured; the feature is off.
            }
            Err(err) => return Err(err),
        }
        let service_env = crate::infra::connection_env_for_project(&self.pool, workspace.id).await?;
        env.extend(service_env);
        Ok(env)
    }

    /// Stop algorithm. Stopping a stopped workspace is a no-op success.
    async fn stop_locked(&self, id: Uuid) -> AppResult<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let claimed = sqlx::query(
            "UPDATE projects SET status = 'stopping', updated_at = now() \
             WHERE id = $1 AND status = 'running' RETURNING machine_id",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = claimed else {
            let current = workspaces::get_workspace(&self.pool, id).await?;
            return match current.status {
                WorkspaceStatus::Stopped => Ok(()),
                other => Err(AppError::Conflict(format!(
                    "workspace is {}",
                    other.as_str()
                ))),
            };
        };

        let machine_id: Option<String> = row.get("machine_id");
        if let Some(machine_id) = machine_id {
            let backend = &self.backend;
            let mid = machine_id.clone();
            if let Err(err) = compute::with_retries(|| backend.stop_machine(&mid)).await {
                self.fail(id, &format!("stop failed: {err}")).await;
                return Err(err);
            }
            if let Err(err) = self
                .backend
                .wait_for_state(&machine_id, MachineState::Stopped, STOP_DEADLINE)
                .await
            {
                self.fail(id, &format!("machine did not stop: {err}")).await;
                return Err(err);
            }
        }

        self.set_status(id, WorkspaceStatus::Stopped).await?;
        let workspace = workspaces::get_workspace(&self.pool, id).await?;
        self.cache.invalidate_prefix(&workspace.prefix()).await;
        tracing::info!(workspace_id = %id, "workspace stopped");
        Ok(())
    }

    /// Destroy compute, then the row. Volume deletion failures are logged
    /// but do not block machine deletion; the orphan sweep picks strays up.
    async fn delete_locked(&self, id: Uuid) -> AppResult<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let workspace = workspaces::get_workspace(&self.pool, id).await?;

        crate::infra::destroy_services_for_project(&self.pool, self.backend.as_ref(), id).await;

        if let Some(ref machine_id) = workspace.machine_id {
            let backend = &self.backend;
            compute::with_retries(|| backend.delete_machine(machine_id)).await?;
        }
        if let Some(ref volume_id) = workspace.volume_id {
            if let Err(err) = self.backend.delete_volume(volume_id).await {
                tracing::warn!(?err, %volume_id, workspace_id = %id, "volume deletion failed");
            }
        }

        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.cache.invalidate_prefix(&workspace.prefix()).await;
        self.locks.remove(&id);
        tracing::info!(workspace_id = %id, "workspace deleted");
        Ok(())
    }

    /// Periodic reconcile so rows diverging from the backend (machine died,
    /// provider lost it) converge without waiting for user traffic.
    pub fn spawn_reconcile_ticker(self: Arc<Self>) {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(120));
            // Consume the immediate first tick; startup already reconciled.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = manager.reconcile().await {
                    tracing::error!(?err, "periodic reconcile failed");
                }
            }
        });
    }

    /// The backend is authoritative. Rows claiming live machines that the
    /// backend cannot corroborate are corrected; called at startup and
    /// whenever a stale read is detected.
    pub async fn reconcile(&self) -> AppResult<()> {
        let rows = sqlx::query(
            "SELECT id, machine_id, status FROM projects \
             WHERE status IN ('running', 'starting', 'stopping')",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let id: Uuid = row.get("id");
            let machine_id: Option<String> = row.get("machine_id");
            let status: String = row.get("status");

            let Some(machine_id) = machine_id else {
                self.fail(id, &format!("status {status} with no machine")).await;
                continue;
            };

            match self.backend.get_machine(&machine_id).await {
                Ok(machine) => match machine.state {
                    MachineState::Started => {
                        // A row stuck in 'starting' (crashed or abandoned
                        // operation) with a live machine becomes 'running';
                        // rows mid-stop are left to the in-flight stop.
                        let corrected = sqlx::query(
                            "UPDATE projects SET status = 'running', \
                             last_accessed_at = COALESCE(last_accessed_at, now()), \
                             updated_at = now() WHERE id = $1 AND status = 'starting'",
                        )
                        .bind(id)
                        .execute(&self.pool)
                        .await;
                        match corrected {
                            Ok(done) if done.rows_affected() > 0 => {
                                self.cache
                                    .invalidate_prefix(&workspaces::prefix8(&id))
                                    .await;
                                tracing::warn!(workspace_id = %id, %machine_id,
                                    "stale starting row promoted to running");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::error!(?err, workspace_id = %id,
                                    "failed to promote stale starting row");
                            }
                        }
                    }
                    MachineState::Starting => {
                        // Boot still in progress; nothing to correct yet.
                    }
                    MachineState::Stopped | MachineState::Created => {
                        let _ = sqlx::query(
                            "UPDATE projects SET status = 'stopped', updated_at = now() \
                             WHERE id = $1",
                        )
                        .bind(id)
                        .execute(&self.pool)
                        .await;
                    }
                    MachineState::Failed => {
                        self.fail(id, "backend reports machine failed").await;
                    }
                    MachineState::Stopping | MachineState::Destroyed => {
                        let _ = sqlx::query(
                            "UPDATE projects SET status = 'stopped', machine_id = NULL, \
                             updated_at = now() WHERE id = $1",
                        )
                        .bind(id)
                        .execute(&self.pool)
                        .await;
                    }
                },
                Err(AppError::NotFound) => {
                    // Machine vanished cleanly; the volume survives.
                    let _ = sqlx::query(
                        "UPDATE projects SET status = 'stopped', machine_id = NULL, \
                         updated_at = now() WHERE id = $1",
                    )
                    .bind(id)
                    .execute(&self.pool)
                    .await;
                    tracing::warn!(workspace_id = %id, %machine_id, "machine vanished; row corrected");
                }
                Err(err) => {
                    tracing::warn!(?err, workspace_id = %id, "reconcile probe failed");
                }
            }
        }
        Ok(())
    }

    /// Destroy machines the backend still holds for users whose rows no
    /// longer reference them.
    pub async fn sweep_orphans(&self) -> AppResult<()> {
        let owners = sqlx::query("SELECT DISTINCT user_id FROM projects")
            .fetch_all(&self.pool)
            .await?;
        for row in owners {
            let owner: Uuid = row.get("user_id");
            let machines = match self.backend.list_machines_by_label(&owner.to_string()).await {
                Ok(machines) => machines,
                Err(err) => {
                    tracing::warn!(?err, %owner, "orphan listing failed");
                    continue;
                }
            };
            for machine in machines {
                let referenced = sqlx::query(
                    "SELECT 1 AS one FROM projects WHERE machine_id = $1 \
                     UNION SELECT 1 FROM infra_services WHERE machine_id = $1",
                )
                .bind(&machine.id)
                .fetch_optional(&self.pool)
                .await?;
                if referenced.is_none() {
                    tracing::warn!(machine_id = %machine.id, %owner, "destroying orphaned machine");
                    if let Err(err) = self.backend.delete_machine(&machine.id).await {
                        tracing::warn!(?err, machine_id = %machine.id, "orphan deletion failed");
                    }
                }
            }
        }
        Ok(())
    }
}
