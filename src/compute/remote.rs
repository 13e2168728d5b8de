//! Remote compute backend: a cloud provider's machines API over HTTPS.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ComputeBackend, Machine, MachineSpec, MachineState, Volume};
use crate::error::{AppError, AppResult};

pub struct RemoteBackend {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct VolumeResponse {
    id: String,
}

#[derive(Deserialize)]
struct MachineResponse {
    id: String,
    state: String,
    #[serde(default)]
    private_ip: Option<String>,
}

impl MachineResponse {
    fn into_machine(self) -> AppResult<Machine> {
        let state = match self.state.as_str() {
            "created" => MachineState::Created,
            "starting" => MachineState::Starting,
            "started" => MachineState::Started,
            "stopping" => MachineState::Stopping,
            "stopped" => MachineState::Stopped,
            "destroyed" => MachineState::Destroyed,
            "failed" => MachineState::Failed,
            other => {
                return Err(AppError::Internal(format!(
                    "provider reported unknown machine state {other:?}"
                )))
            }
        };
        Ok(Machine {
            id: self.id,
            state,
            private_ip: self.private_ip,
        })
    }
}

impl RemoteBackend {
    pub fn new(base_url: String, token: String) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(AppError::MachinesApi)?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    pub fn from_env() -> AppResult<Self> {
        let token = crate::config::MACHINES_API_TOKEN
            .clone()
            .ok_or_else(|| AppError::Internal("MACHINES_API_TOKEN missing".into()))?;
        Self::new(crate::config::MACHINES_API_URL.clone(), token)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> AppResult<reqwest::Response> {
        // Idempotent retries on 5xx; connection errors surface as
        // BackendUnavailable so callers' retry policy applies.
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut req = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.token);
            if let Some(ref body) = body {
                req = req.json(body);
            }
            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(err) if attempt < 3 => {
                    tracing::warn!(?err, %url, attempt, "machines api transport error, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                    continue;
                }
                Err(err) => {
                    return Err(AppError::BackendUnavailable(format!(
                        "machines api unreachable: {err}"
                    )))
                }
            };
            let status = resp.status();
            if status.is_server_error() && attempt < 3 {
                tracing::warn!(%status, %url, attempt, "machines api 5xx, retrying");
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                continue;
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(AppError::NotFound);
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(AppError::BackendUnavailable(format!(
                    "machines api returned {status}: {text}"
                )));
            }
            return Ok(resp);
        }
    }
}

#[async_trait]
impl ComputeBackend for RemoteBackend {
    async fn create_volume(&self, name: &str, size_gb: i32, region: &str) -> AppResult<Volume> {
        let resp = self
            .request(
                reqwest::Method::POST,
                "/volumes",
                Some(json!({ "name": name, "size_gb": size_gb, "region": region })),
            )
            .await?;
        let vol: VolumeResponse = resp.json().await.map_err(AppError::MachinesApi)?;
        Ok(Volume { id: vol.id })
    }

    async fn delete_volume(&self, id: &str) -> AppResult<()> {
        self.request(reqwest::Method::DELETE, &format!("/volumes/{id}"), None)
            .await?;
        Ok(())
    }

    async fn create_machine(&self, spec: &MachineSpec) -> AppResult<Machine> {
        let mounts: Vec<_> = spec
            .mounts
            .iter()
            .map(|m| json!({ "volume": m.volume_id, "path": m.path }))
            .collect();
        let body = json!({
            "name": spec.name,
            "region": crate::config::MACHINES_REGION.as_str(),
            "config": {
                "image": spec.image,
                "guest": spec.guest,
                "env": spec.env,
                "mounts": mounts,
                "services": spec.ports.iter().map(|p| json!({ "internal_port": p })).collect::<Vec<_>>(),
                "metadata": { "owner": spec.owner_label },
            },
        });
        let resp = self
            .request(reqwest::Method::POST, "/machines", Some(body))
            .await?;
        let machine: MachineResponse = resp.json().await.map_err(AppError::MachinesApi)?;
        machine.into_machine()
    }

    async fn get_machine(&self, id: &str) -> AppResult<Machine> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/machines/{id}"), None)
            .await?;
        let machine: MachineResponse = resp.json().await.map_err(AppError::MachinesApi)?;
        machine.into_machine()
    }

    async fn start_machine(&self, id: &str) -> AppResult<()> {
        self.request(reqwest::Method::POST, &format!("/machines/{id}/start"), None)
            .await?;
        Ok(())
    }

    async fn stop_machine(&self, id: &str) -> AppResult<()> {
        self.request(reqwest::Method::POST, &format!("/machines/{id}/stop"), None)
            .await?;
        Ok(())
    }

    async fn delete_machine(&self, id: &str) -> AppResult<()> {
        self.request(reqwest::Method::DELETE, &format!("/machines/{id}"), None)
            .await?;
        Ok(())
    }

    async fn list_machines_by_label(&self, owner: &str) -> AppResult<Vec<Machine>> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/machines?metadata.owner={owner}"),
                None,
            )
            .await?;
        let machines: Vec<MachineResponse> = resp.json().await.map_err(AppError::MachinesApi)?;
        machines.into_iter().map(MachineResponse::into_machine).collect()
    }

    async fn ssh_addr(&self, id: &str) -> AppResult<(String, u16)> {
        let machine = self.get_machine(id).await?;
        let ip = machine
            .private_ip
            .ok_or_else(|| AppError::BackendUnavailable(format!("machine {id} has no address")))?;
        Ok((ip, 2222))
    }
}
