//! Local compute backend: machines are containers on the host engine,
//! volumes are named volumes. Used for single-box development deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;

use super::{ComputeBackend, Machine, MachineSpec, MachineState, Volume};
use crate::error::{AppError, AppResult};

const OWNER_LABEL: &str = "devgate.owner";
const SSH_PORT_KEY: &str = "2222/tcp";

pub struct LocalBackend {
    docker: Docker,
}

impl LocalBackend {
    pub fn connect() -> AppResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(AppError::Engine)?;
        Ok(Self { docker })
    }

    /// Address at which containers published on the host are reachable from
    /// the gateway. Inside a container the host loopback is not ours.
    fn host_addr() -> String {
        if std::path::Path::new("/.dockerenv").exists() {
            "host.docker.internal".to_string()
        } else {
            "127.0.0.1".to_string()
        }
    }

    fn map_status(status: Option<ContainerStateStatusEnum>) -> MachineState {
        match status {
            Some(ContainerStateStatusEnum::CREATED) => MachineState::Created,
            Some(ContainerStateStatusEnum::RUNNING) => MachineState::Started,
            Some(ContainerStateStatusEnum::RESTARTING) => MachineState::Starting,
            Some(ContainerStateStatusEnum::REMOVING) => MachineState::Stopping,
            Some(ContainerStateStatusEnum::PAUSED) => MachineState::Stopped,
            Some(ContainerStateStatusEnum::EXITED) => MachineState::Stopped,
            Some(ContainerStateStatusEnum::DEAD) => MachineState::Failed,
            _ => MachineState::Failed,
        }
    }
}

#[async_trait]
impl ComputeBackend for LocalBackend {
    async fn create_volume(&self, name: &str, _size_gb: i32, _region: &str) -> AppResult<Volume> {
        // Named volumes have no size quota on the local engine; the guest
        // shape's volume_gb is advisory here.
        let mut labels = HashMap::new();
        labels.insert("devgate.volume".to_string(), name.to_string());
        let created = self
            .docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                labels,
                ..Default::default()
            })
            .await?;
        Ok(Volume { id: created.name })
    }

    async fn delete_volume(&self, id: &str) -> AppResult<()> {
        self.docker
            .remove_volume(id, Some(RemoveVolumeOptions { force: true }))
            .await?;
        Ok(())
    }

    async fn create_machine(&self, spec: &MachineSpec) -> AppResult<Machine> {
        // Remove any stale container with the same name so re-creation after
        // a crashed delete succeeds.
        let _ = self
            .docker
            .remove_container(
                &spec.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        let env_vars: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| format!("{}:{}", m.volume_id, m.path))
            .collect();

        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for port in &spec.ports {
            let key = format!("{port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            // Host port left empty: the engine assigns one, discovered later
            // through ssh_addr.
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: None,
                }]),
            );
        }

        let mut labels = HashMap::new();
        labels.insert(OWNER_LABEL.to_string(), spec.owner_label.clone());

        let host_cfg = HostConfig {
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            nano_cpus: Some(i64::from(spec.guest.cpus) * 1_000_000_000),
            memory: Some(i64::from(spec.guest.memory_mb) * 1024 * 1024),
            device_requests: spec.guest.gpu.as_ref().map(|_| {
                vec![bollard::models::DeviceRequest {
                    driver: Some("nvidia".into()),
                    count: Some(-1),
                    capabilities: Some(vec![vec!["gpu".into()]]),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        };
        let container_config = ContainerConfig::<String> {
            image: Some(spec.image.clone()),
            env: Some(env_vars),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_cfg),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await?;

        Ok(Machine {
            id: created.id,
            state: MachineState::Created,
            private_ip: Some(Self::host_addr()),
        })
    }

    async fn get_machine(&self, id: &str) -> AppResult<Machine> {
        let info = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(AppError::NotFound),
            Err(err) => return Err(AppError::Engine(err)),
        };
        let state = Self::map_status(info.state.and_then(|s| s.status));
        Ok(Machine {
            id: info.id.unwrap_or_else(|| id.to_string()),
            state,
            private_ip: Some(Self::host_addr()),
        })
    }

    async fn start_machine(&self, id: &str) -> AppResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_machine(&self, id: &str) -> AppResult<()> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped is a success for our callers.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => Err(AppError::Engine(err)),
        }
    }

    async fn delete_machine(&self, id: &str) -> AppResult<()> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(AppError::Engine(err)),
        }
    }

    async fn list_machines_by_label(&self, owner: &str) -> AppResult<Vec<Machine>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{OWNER_LABEL}={owner}")],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        let mut machines = Vec::with_capacity(containers.len());
        for c in containers {
            let Some(id) = c.id else { continue };
            machines.push(self.get_machine(&id).await?);
        }
        Ok(machines)
    }

    async fn ssh_addr(&self, id: &str) -> AppResult<(String, u16)> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let port = info
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|mut ports| ports.remove(SSH_PORT_KEY).flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|b| b.host_port)
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| {
                AppError::BackendUnavailable(format!("no host port mapping for {id} ssh"))
            })?;
        Ok((Self::host_addr(), port))
    }
}
