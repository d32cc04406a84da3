use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{client::conn::http1, header, Method, Request};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::UnixStream;

use crate::{EmberError, EmberResult};

use super::{
    ActionType, ApiFault, BootSource, Drive, InstanceAction, MachineConfiguration,
    NetworkInterface, SnapshotCreateParams, SnapshotLoadParams, VmRunState, VmStateUpdate,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Client for the hypervisor's HTTP API, served over a unix socket.
///
/// Every call opens a fresh connection. The API is only used for a handful of requests per VM
/// lifetime and a dead hypervisor then surfaces as a connect error instead of a stale connection.
#[derive(Debug, Clone)]
pub struct FirecrackerClient {
    socket_path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirecrackerClient {
    /// Creates a client for the API socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// The API socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether something accepts connections on the socket.
    pub async fn is_reachable(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    /// `GET /`, returning the raw instance description.
    pub async fn describe_instance(&self) -> EmberResult<serde_json::Value> {
        let body = self.send(Method::GET, "/", None).await?;
        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// `PUT /boot-source`
    pub async fn put_boot_source(&self, boot_source: &BootSource) -> EmberResult<()> {
        self.call(Method::PUT, "/boot-source", boot_source).await
    }

    /// `PUT /drives/{id}`
    pub async fn put_drive(&self, drive: &Drive) -> EmberResult<()> {
        let path = format!("/drives/{}", drive.drive_id);
        self.call(Method::PUT, &path, drive).await
    }

    /// `PUT /machine-config`
    pub async fn put_machine_config(&self, machine: &MachineConfiguration) -> EmberResult<()> {
        self.call(Method::PUT, "/machine-config", machine).await
    }

    /// `PUT /network-interfaces/{id}`
    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> EmberResult<()> {
        let path = format!("/network-interfaces/{}", iface.iface_id);
        self.call(Method::PUT, &path, iface).await
    }

    /// Boots the configured guest.
    pub async fn start_instance(&self) -> EmberResult<()> {
        self.action(ActionType::InstanceStart).await
    }

    /// Asks the guest to shut down through a keyboard reset.
    pub async fn send_ctrl_alt_del(&self) -> EmberResult<()> {
        self.action(ActionType::SendCtrlAltDel).await
    }

    /// Freezes the guest's vCPUs.
    pub async fn pause(&self) -> EmberResult<()> {
        self.set_run_state(VmRunState::Paused).await
    }

    /// Unfreezes the guest's vCPUs.
    pub async fn resume(&self) -> EmberResult<()> {
        self.set_run_state(VmRunState::Resumed).await
    }

    /// `PUT /snapshot/create`. The guest must be paused.
    pub async fn create_snapshot(&self, params: &SnapshotCreateParams) -> EmberResult<()> {
        self.call(Method::PUT, "/snapshot/create", params).await
    }

    /// `PUT /snapshot/load`. Only valid before the guest has been configured.
    pub async fn load_snapshot(&self, params: &SnapshotLoadParams) -> EmberResult<()> {
        self.call(Method::PUT, "/snapshot/load", params).await
    }

    async fn action(&self, action_type: ActionType) -> EmberResult<()> {
        self.call(Method::PUT, "/actions", &InstanceAction { action_type })
            .await
    }

    async fn set_run_state(&self, state: VmRunState) -> EmberResult<()> {
        self.call(Method::PATCH, "/vm", &VmStateUpdate { state })
            .await
    }

    async fn call<T: Serialize>(&self, method: Method, path: &str, body: &T) -> EmberResult<()> {
        let body = serde_json::to_vec(body)?;
        self.send(method, path, Some(body)).await.map(|_| ())
    }

    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> EmberResult<Bytes> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            EmberError::HypervisorTransport(format!(
                "cannot connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| EmberError::HypervisorTransport(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::trace!(error = %e, "hypervisor api connection closed");
            }
        });

        let request = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(header::HOST, "localhost")
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| EmberError::HypervisorTransport(e.to_string()))?;

        tracing::trace!(method = %method, path, "hypervisor api request");

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| EmberError::HypervisorTransport(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| EmberError::HypervisorTransport(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            let message = serde_json::from_slice::<ApiFault>(&body)
                .map(|fault| fault.fault_message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());

            return Err(EmberError::Hypervisor {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: message,
            });
        }

        Ok(body)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{OriginalUri, State},
        http::StatusCode,
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    use crate::vm::{MemoryBackend, MemoryBackendType};

    use super::*;

    type Seen = Arc<Mutex<Vec<(String, String, serde_json::Value)>>>;

    async fn record(
        State(seen): State<Seen>,
        method: axum::http::Method,
        OriginalUri(uri): OriginalUri,
        body: Bytes,
    ) -> impl IntoResponse {
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        seen.lock()
            .unwrap()
            .push((method.to_string(), uri.path().to_string(), value));

        if uri.path() == "/snapshot/load" {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "fault_message": "snapshot file missing" })),
            )
                .into_response();
        }

        StatusCode::NO_CONTENT.into_response()
    }

    async fn fake_api(dir: &TempDir) -> (FirecrackerClient, Seen) {
        let socket = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let seen: Seen = Arc::default();

        let app = Router::new()
            .route(
                "/",
                get(|| async { Json(serde_json::json!({ "state": "Running" })) }),
            )
            .fallback(record)
            .with_state(seen.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (FirecrackerClient::new(socket), seen)
    }

    #[tokio::test]
    async fn test_requests_use_expected_paths_and_bodies() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let (client, seen) = fake_api(&dir).await;

        client
            .put_drive(&Drive {
                drive_id: "1".to_string(),
                path_on_host: PathBuf::from("/srv/1-web.ext4"),
                is_root_device: true,
                is_read_only: false,
            })
            .await?;
        client.start_instance().await?;
        client.pause().await?;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);

        assert_eq!(seen[0].0, "PUT");
        assert_eq!(seen[0].1, "/drives/1");
        assert_eq!(seen[0].2["path_on_host"], "/srv/1-web.ext4");
        assert_eq!(seen[0].2["is_root_device"], true);

        assert_eq!(seen[1].1, "/actions");
        assert_eq!(seen[1].2["action_type"], "InstanceStart");

        assert_eq!(seen[2].0, "PATCH");
        assert_eq!(seen[2].1, "/vm");
        assert_eq!(seen[2].2["state"], "Paused");
        Ok(())
    }

    #[tokio::test]
    async fn test_error_status_carries_fault_message() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let (client, _) = fake_api(&dir).await;

        let err = client
            .load_snapshot(&SnapshotLoadParams {
                snapshot_path: PathBuf::from("/missing.file"),
                mem_backend: MemoryBackend {
                    backend_type: MemoryBackendType::File,
                    backend_path: PathBuf::from("/missing.mem"),
                },
                enable_diff_snapshots: true,
                resume_vm: false,
            })
            .await
            .unwrap_err();

        match err {
            EmberError::Hypervisor {
                method,
                path,
                status,
                body,
            } => {
                assert_eq!(method, "PUT");
                assert_eq!(path, "/snapshot/load");
                assert_eq!(status, 400);
                assert_eq!(body, "snapshot file missing");
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_describe_instance_and_reachability() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let (client, _) = fake_api(&dir).await;

        assert!(client.is_reachable().await);
        assert_eq!(client.describe_instance().await?["state"], "Running");

        let missing = FirecrackerClient::new(dir.path().join("nobody.sock"));
        assert!(!missing.is_reachable().await);
        assert!(matches!(
            missing.start_instance().await.unwrap_err(),
            EmberError::HypervisorTransport(_)
        ));
        Ok(())
    }
}
