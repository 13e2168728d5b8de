//! Maps a workspace and a role to the concrete address a channel should dial.

use crate::compute::ComputeBackend;
use crate::error::{AppError, AppResult};
use crate::workspaces::{Workspace, WorkspaceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Ssh,
    Http(u16),
}

pub async fn resolve(
    backend: &dyn ComputeBackend,
    workspace: &Workspace,
    role: Role,
) -> AppResult<(String, u16)> {
    if workspace.status != WorkspaceStatus::Running {
        return Err(AppError::BackendUnavailable(format!(
            "workspace is {}",
            workspace.status.as_str()
        )));
    }
    let machine_id = workspace
        .machine_id
        .as_deref()
        .ok_or_else(|| AppError::BackendUnavailable("running workspace has no machine".into()))?;

    match role {
        Role::Ssh => backend.ssh_addr(machine_id).await,
        Role::Http(port) => {
            let machine = backend.get_machine(machine_id).await?;
            let ip = machine
                .private_ip
                .ok_or_else(|| AppError::BackendUnavailable("machine has no address".into()))?;
            Ok((ip, port))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::compute::{Machine, MachineSpec, MachineState, Volume};
    use async_trait::async_trait;
    use uuid::Uuid;

    /// In-memory backend used by resolver and channel tests.
    pub(crate) struct StubBackend {
        pub machine: Machine,
    }

    #[async_trait]
    impl ComputeBackend for StubBackend {
        async fn create_volume(&self, name: &str, _: i32, _: &str) -> AppResult<Volume> {
            Ok(Volume { id: name.to_string() })
        }
        async fn delete_volume(&self, _: &str) -> AppResult<()> {
            Ok(())
        }
        async fn create_machine(&self, _: &MachineSpec) -> AppResult<Machine> {
            Ok(self.machine.clone())
        }
        async fn get_machine(&self, id: &str) -> AppResult<Machine> {
            if id == self.machine.id {
                Ok(self.machine.clone())
            } else {
                Err(AppError::NotFound)
            }
        }
        async fn start_machine(&self, _: &str) -> AppResult<()> {
            Ok(())
        }
        async fn stop_machine(&self, _: &str) -> AppResult<()> {
            Ok(())
        }
        async fn delete_machine(&self, _: &str) -> AppResult<()> {
            Ok(())
        }
        async fn list_machines_by_label(&self, _: &str) -> AppResult<Vec<Machine>> {
            Ok(vec![self.machine.clone()])
        }
        async fn ssh_addr(&self, _: &str) -> AppResult<(String, u16)> {
            Ok(("10.0.0.5".into(), 2222))
        }
    }

    fn running_workspace(machine_id: Option<&str>) -> Workspace {
        Workspace {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "ws".into(),
            description: None,
            hardware: crate::workspaces::HardwareSpec::default(),
            status: WorkspaceStatus::Running,
            error_message: None,
            machine_id: machine_id.map(str::to_string),
            volume_id: Some("v1".into()),
            base_image: "img".into(),
            env_overrides: serde_json::json!({}),
            preview_token: None,
            idle_timeout_minutes: None,
            last_accessed_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn stub() -> StubBackend {
        StubBackend {
            machine: Machine {
                id: "m1".into(),
                state: MachineState::Started,
                private_ip: Some("10.0.0.5".into()),
            },
        }
    }

    #[tokio::test]
    async fn ssh_role_resolves_to_port_2222() {
        let workspace = running_workspace(Some("m1"));
        let (host, port) = resolve(&stub(), &workspace, Role::Ssh).await.unwrap();
        assert_eq!((host.as_str(), port), ("10.0.0.5", 2222));
    }

    #[tokio::test]
    async fn http_role_uses_requested_port() {
        let workspace = running_workspace(Some("m1"));
        let (host, port) = resolve(&stub(), &workspace, Role::Http(5173)).await.unwrap();
        assert_eq!((host.as_str(), port), ("10.0.0.5", 5173));
    }

    #[tokio::test]
    async fn not_running_workspace_refused() {
        let mut workspace = running_workspace(Some("m1"));
        workspace.status = WorkspaceStatus::Stopped;
        assert!(matches!(
            resolve(&stub(), &workspace, Role::Ssh).await,
            Err(AppError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn missing_machine_refused() {
        let workspace = running_workspace(None);
        assert!(matches!(
            resolve(&stub(), &workspace, Role::Ssh).await,
            Err(AppError::BackendUnavailable(_))
        ));
    }
}
