use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::de::DeserializeOwned;

use common::auth::RequestContext;
use common::fsm::RegistryError;

use super::names::{parse_volume, NameError, PluginVolume};
use super::protocol::{
    Capabilities, CapabilitiesResponse, ErrResponse, GetResponse, ImplementsResponse, ListResponse,
    MountRequest, MountResponse, Volume, VolumeRequest,
};
use crate::ServiceState;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("malformed request: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Name(#[from] NameError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no such volume: {0}")]
    NotFound(String),
    #[error("failed to prepare mountpoint: {0}")]
    Mount(#[from] std::io::Error),
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, PluginError> {
    Ok(serde_json::from_slice(body)?)
}

fn err_string(endpoint: &str, e: PluginError) -> String {
    tracing::error!(endpoint = endpoint, error = %e, "volume plugin request failed");
    e.to_string()
}

fn ok_or_err(endpoint: &str, result: Result<(), PluginError>) -> Json<ErrResponse> {
    Json(ErrResponse {
        err: result.err().map(|e| err_string(endpoint, e)).unwrap_or_default(),
    })
}

pub async fn activate() -> Json<ImplementsResponse> {
    tracing::debug!("volume plugin activated");
    Json(ImplementsResponse {
        implements: vec!["VolumeDriver".to_string()],
    })
}

pub async fn capabilities() -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        capabilities: Capabilities {
            scope: "global".to_string(),
        },
    })
}

/// Docker's create makes the dot exist; it is mastered here if it is new
pub async fn create(State(state): State<ServiceState>, body: Bytes) -> Json<ErrResponse> {
    let result = async {
        let request: VolumeRequest = decode(&body)?;
        let volume = parse_volume(&request.name)?;
        let filesystem_id = state
            .registry()
            .procure(&RequestContext::admin(), &volume.name)
            .await?;
        tracing::info!(
            name = %volume.name,
            filesystem_id = %filesystem_id,
            "volume created for docker"
        );
        Ok::<_, PluginError>(())
    }
    .await;
    ok_or_err("create", result)
}

/// Dots outlive docker's references to them, so removal does nothing
pub async fn remove() -> Json<ErrResponse> {
    Json(ErrResponse::default())
}

pub async fn path(State(state): State<ServiceState>, body: Bytes) -> Json<MountResponse> {
    let result = decode::<MountRequest>(&body)
        .and_then(|request| Ok(parse_volume(&request.name)?))
        .map(|volume| subvolume_path(&state, &volume));
    mount_response("path", result)
}

pub async fn mount(State(state): State<ServiceState>, body: Bytes) -> Json<MountResponse> {
    let result = async {
        let request: MountRequest = decode(&body)?;
        let volume = parse_volume(&request.name)?;
        let filesystem_id = state
            .registry()
            .procure(&RequestContext::admin(), &volume.name)
            .await?;
        let target = state.registry().context().engine.mount_path(&filesystem_id);
        let path = state
            .mounts()
            .link(&volume.name, &target, &volume.subvolume)
            .await?;
        tracing::info!(
            name = %volume.name,
            filesystem_id = %filesystem_id,
            container_id = %request.id,
            mountpoint = %path.display(),
            "volume mounted for docker"
        );
        Ok::<_, PluginError>(path.display().to_string())
    }
    .await;
    mount_response("mount", result)
}

pub async fn unmount() -> Json<ErrResponse> {
    Json(ErrResponse::default())
}

pub async fn list(State(state): State<ServiceState>) -> Json<ListResponse> {
    match state.registry().filesystems().await {
        Ok(filesystems) => Json(ListResponse {
            volumes: filesystems
                .into_iter()
                .map(|(name, _)| Volume {
                    name: name.string_without_admin(),
                    mountpoint: state.mounts().mountpoint(&name).display().to_string(),
                    ..Default::default()
                })
                .collect(),
            err: String::new(),
        }),
        Err(e) => Json(ListResponse {
            volumes: Vec::new(),
            err: err_string("list", e.into()),
        }),
    }
}

pub async fn get(State(state): State<ServiceState>, body: Bytes) -> Json<GetResponse> {
    let result = async {
        let request: VolumeRequest = decode(&body)?;
        let volume = parse_volume(&request.name)?;
        if state.registry().lookup(&volume.name).await?.is_none() {
            return Err(PluginError::NotFound(request.name));
        }
        Ok::<_, PluginError>(Volume {
            mountpoint: subvolume_path(&state, &volume),
            name: request.name,
            ..Default::default()
        })
    }
    .await;

    match result {
        Ok(volume) => Json(GetResponse {
            volume,
            err: String::new(),
        }),
        Err(e) => Json(GetResponse {
            volume: Volume::default(),
            err: err_string("get", e),
        }),
    }
}

fn subvolume_path(state: &ServiceState, volume: &PluginVolume) -> String {
    state
        .mounts()
        .subvolume_path(&volume.name, &volume.subvolume)
        .display()
        .to_string()
}

fn mount_response(endpoint: &str, result: Result<String, PluginError>) -> Json<MountResponse> {
    match result {
        Ok(mountpoint) => Json(MountResponse {
            mountpoint,
            err: String::new(),
        }),
        Err(e) => Json(MountResponse {
            mountpoint: String::new(),
            err: err_string(endpoint, e),
        }),
    }
}
