//! Docker volume plugin.
//!
//! Docker talks to the plugin over HTTP, POSTing JSON to one path per call.
//! Errors never change the status code: every answer is a 200 whose `Err`
//! field says what went wrong.

mod handlers;
mod mounts;
mod names;
mod protocol;

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::routing::post;
use axum::Router;

use crate::ServiceState;

pub use handlers::PluginError;
pub use mounts::ContainerMounts;
pub use names::{parse_volume, NameError, PluginVolume};
pub use protocol::*;

/// Name docker knows the driver by, e.g. `--volume-driver=dots`
pub const DRIVER_NAME: &str = "dots";

pub fn router(state: ServiceState) -> Router<ServiceState> {
    Router::new()
        .route("/Plugin.Activate", post(handlers::activate))
        .route("/VolumeDriver.Create", post(handlers::create))
        .route("/VolumeDriver.Remove", post(handlers::remove))
        .route("/VolumeDriver.Path", post(handlers::path))
        .route("/VolumeDriver.Mount", post(handlers::mount))
        .route("/VolumeDriver.Unmount", post(handlers::unmount))
        .route("/VolumeDriver.List", post(handlers::list))
        .route("/VolumeDriver.Get", post(handlers::get))
        .route("/VolumeDriver.Capabilities", post(handlers::capabilities))
        .with_state(state)
}

/// Advertise the plugin to docker by writing `<dir>/dots.spec`
pub async fn write_spec_file(dir: &Path, addr: SocketAddr) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.spec", DRIVER_NAME));
    tokio::fs::write(&path, format!("tcp://{}\n", addr)).await?;
    tracing::info!(path = %path.display(), addr = %addr, "wrote volume plugin spec file");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spec_file_points_at_listener() {
        let dir = tempfile::tempdir().unwrap();
        let addr: SocketAddr = "127.0.0.1:6970".parse().unwrap();
        let path = write_spec_file(&dir.path().join("plugins"), addr)
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "dots.spec");
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "tcp://127.0.0.1:6970\n"
        );
    }
}
