pub mod local;
pub mod remote;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Shared machine state vocabulary. Both backends report these and nothing
/// else; the rest of the gateway never branches on which backend is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Destroyed,
    Failed,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Created => "created",
            MachineState::Starting => "starting",
            MachineState::Started => "started",
            MachineState::Stopping => "stopping",
            MachineState::Stopped => "stopped",
            MachineState::Destroyed => "destroyed",
            MachineState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct Machine {
    pub id: String,
    pub state: MachineState,
    pub private_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuestSpec {
    pub cpu_class: String,
    pub cpus: i32,
    pub memory_mb: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub volume_id: String,
    pub path: String,
}

/// Everything a backend needs to create a machine.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub name: String,
    pub image: String,
    pub guest: GuestSpec,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub ports: Vec<u16>,
    /// Owner label attached to the machine so orphans can be swept later.
    pub owner_label: String,
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn create_volume(&self, name: &str, size_gb: i32, region: &str) -> AppResult<Volume>;

    async fn delete_volume(&self, id: &str) -> AppResult<()>;

    async fn create_machine(&self, spec: &MachineSpec) -> AppResult<Machine>;

    async fn get_machine(&self, id: &str) -> AppResult<Machine>;

    async fn start_machine(&self, id: &str) -> AppResult<()>;

    async fn stop_machine(&self, id: &str) -> AppResult<()>;

    async fn delete_machine(&self, id: &str) -> AppResult<()>;

    /// All machines carrying the given owner label. Used by the orphan sweep.
    async fn list_machines_by_label(&self, owner: &str) -> AppResult<Vec<Machine>>;

    /// Address clients of the workspace sshd should dial. The remote backend
    /// returns the provider-assigned private address and port 2222; the local
    /// backend discovers the engine's host-port mapping.
    async fn ssh_addr(&self, id: &str) -> AppResult<(String, u16)>;

    /// Poll until the machine reaches `state` or the deadline passes.
    async fn wait_for_state(
        &self,
        id: &str,
        state: MachineState,
        deadline: Duration,
    ) -> AppResult<Machine> {
        let started = tokio::time::Instant::now();
        loop {
            let machine = self.get_machine(id).await?;
            if machine.state == state {
                return Ok(machine);
            }
            if machine.state == MachineState::Failed {
                return Err(AppError::BackendUnavailable(format!(
                    "machine {id} entered failed state while waiting for {}",
                    state.as_str()
                )));
            }
            if started.elapsed() >= deadline {
                return Err(AppError::Timeout(format!(
                    "machine {id} did not reach {} within {:?} (last: {})",
                    state.as_str(),
                    deadline,
                    machine.state.as_str()
                )));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

/// Run `op` with up to three attempts, backing off exponentially to 2 s.
/// Only transient (`BackendUnavailable`, timeout, transport) errors retry.
pub async fn with_retries<T, F, Fut>(mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    let mut delay = Duration::from_millis(500);
    let mut last = None;
    for attempt in 1..=3u32 {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if is_transient(&err) => {
                tracing::warn!(?err, attempt, "transient backend error, retrying");
                last = Some(err);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(2));
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| AppError::Internal("retry loop exhausted".into())))
}

fn is_transient(err: &AppError) -> bool {
    matches!(
        err,
        AppError::BackendUnavailable(_) | AppError::Timeout(_) | AppError::MachinesApi(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = with_retries(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::BackendUnavailable("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let out: AppResult<()> = with_retries(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::NotFound) }
        })
        .await;
        assert!(matches!(out, Err(AppError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let out: AppResult<()> = with_retries(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::BackendUnavailable("down".into())) }
        })
        .await;
        assert!(matches!(out, Err(AppError::BackendUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
