// ctr-fuzzing/src/client/mod.rs
//! Client interface to the daemon under test
//!
//! The driver treats the daemon as a black box reached through these traits.
//! [`containerd`] provides the production implementation over the daemon's
//! gRPC socket; tests substitute recording fakes.

pub mod containerd;

use std::path::Path;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::generators::ContainerSpec;

pub use containerd::{ContainerdClient, ContainerdConnector};

/// An image known to the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub id: String,
    pub tags: Vec<String>,
}

impl ImageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: Vec::new(),
        }
    }

    /// Name to address the image by: first tag, else the id
    pub fn reference(&self) -> &str {
        self.tags.first().map(String::as_str).unwrap_or(&self.id)
    }
}

/// A container created through the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
}

/// Options for container creation
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    pub image: Option<ImageRef>,
    pub spec: Option<ContainerSpec>,
}

impl ContainerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: ImageRef) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_spec(mut self, spec: ContainerSpec) -> Self {
        self.spec = Some(spec);
        self
    }
}

/// Options for container deletion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Also remove the container's filesystem snapshot
    pub snapshot_cleanup: bool,
}

impl DeleteOptions {
    pub fn with_snapshot_cleanup() -> Self {
        Self {
            snapshot_cleanup: true,
        }
    }
}

/// Opens client connections to a daemon socket
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &Path) -> Result<Box<dyn RuntimeClient>, ClientError>;
}

/// Operations the driver issues against the daemon
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Whether the daemon reports itself as serving requests
    async fn is_serving(&self) -> Result<bool, ClientError>;

    async fn list_images(&self) -> Result<Vec<ImageRef>, ClientError>;

    /// Import an image archive
    async fn import(&self, archive: Vec<u8>) -> Result<(), ClientError>;

    async fn new_container(
        &self,
        id: &str,
        options: ContainerOptions,
    ) -> Result<ContainerRef, ClientError>;

    async fn image_size(&self, image: &ImageRef) -> Result<i64, ClientError>;

    async fn is_unpacked(&self, image: &ImageRef, snapshotter: &str) -> Result<bool, ClientError>;

    async fn unpack(&self, image: &ImageRef, snapshotter: &str) -> Result<(), ClientError>;

    async fn delete_container(
        &self,
        container: &ContainerRef,
        options: DeleteOptions,
    ) -> Result<(), ClientError>;

    /// Release the connection. Called once per client.
    async fn close(&mut self) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_reference_prefers_tags() {
        let mut image = ImageRef::new("sha256:abc");
        assert_eq!(image.reference(), "sha256:abc");

        image.tags.push("docker.io/library/busybox:latest".to_string());
        assert_eq!(image.reference(), "docker.io/library/busybox:latest");
    }

    #[test]
    fn test_container_options_builder() {
        let options = ContainerOptions::new()
            .with_image(ImageRef::new("img"))
            .with_spec(ContainerSpec::default());

        assert_eq!(options.image.map(|image| image.id), Some("img".to_string()));
        assert!(options.spec.is_some());
        assert!(DeleteOptions::with_snapshot_cleanup().snapshot_cleanup);
    }
}
