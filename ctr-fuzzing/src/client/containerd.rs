// ctr-fuzzing/src/client/containerd.rs
//! containerd gRPC client over the daemon's Unix socket

use std::collections::HashMap;
use std::error::Error as StdError;
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use containerd_client::services::v1::container::Runtime;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::diff_client::DiffClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    CommitSnapshotRequest, PrepareSnapshotRequest, RemoveSnapshotRequest, StatSnapshotRequest,
};
use containerd_client::services::v1::version_client::VersionClient;
use containerd_client::services::v1::{
    ApplyRequest, Container, CreateContainerRequest, CreateImageRequest, DeleteContainerRequest,
    GetContainerRequest, GetImageRequest, Image, ListImagesRequest, ReadContentRequest,
    UpdateImageRequest, WriteAction, WriteContentRequest,
};
use containerd_client::types::Descriptor;
use prost_types::Any;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::{Code, Request};
use uuid::Uuid;

use crate::client::{
    ContainerOptions, ContainerRef, Connector, DeleteOptions, ImageRef, RuntimeClient,
};
use crate::constants::{DEFAULT_CLIENT_TIMEOUT_SECS, DEFAULT_NAMESPACE, DEFAULT_RUNTIME};
use crate::error::ClientError;
use crate::generators::ContainerSpec;

const NAMESPACE_HEADER: &str = "containerd-namespace";

/// Type URL containerd registers for runtime specs carried in an `Any`
pub const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";

const OCI_VERSION: &str = "1.1.0";

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Connects [`ContainerdClient`]s to a daemon socket
#[derive(Debug, Clone)]
pub struct ContainerdConnector {
    timeout: Duration,
    namespace: String,
    runtime: String,
}

impl ContainerdConnector {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            namespace: DEFAULT_NAMESPACE.to_string(),
            runtime: DEFAULT_RUNTIME.to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

impl Default for ContainerdConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_TIMEOUT_SECS)
    }
}

#[async_trait]
impl Connector for ContainerdConnector {
    async fn connect(&self, address: &Path) -> Result<Box<dyn RuntimeClient>, ClientError> {
        if !address.exists() {
            return Err(ClientError::DaemonNotRunning(format!(
                "no socket at {}",
                address.display()
            )));
        }

        let socket = address.display().to_string();
        let channel = match tokio::time::timeout(self.timeout, containerd_client::connect(address)).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(err)) => return Err(classify_connect_error(&socket, &err)),
            Err(_) => {
                return Err(ClientError::Connect(format!(
                    "{socket}: no handshake within {:?}",
                    self.timeout
                )))
            }
        };

        log::debug!("connected to daemon at {socket}");
        Ok(Box::new(ContainerdClient {
            channel,
            namespace: self.namespace.clone(),
            runtime: self.runtime.clone(),
            closed: false,
        }))
    }
}

/// Map a failed dial to `DaemonNotRunning` when nothing is listening
fn classify_connect_error(socket: &str, err: &(dyn StdError + 'static)) -> ClientError {
    let mut source = Some(err);
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) {
                return ClientError::DaemonNotRunning(format!("{socket}: {io_err}"));
            }
        }
        source = current.source();
    }
    ClientError::Connect(format!("{socket}: {err}"))
}

/// A live connection to the daemon
pub struct ContainerdClient {
    channel: Channel,
    namespace: String,
    runtime: String,
    closed: bool,
}

impl ContainerdClient {
    /// Wrap a message with the namespace header
    fn request<T>(&self, message: T) -> Result<Request<T>, ClientError> {
        if self.closed {
            return Err(ClientError::Connect("client is closed".to_string()));
        }
        let namespace: MetadataValue<Ascii> = self
            .namespace
            .parse()
            .map_err(|_| ClientError::Rejected(format!("invalid namespace {:?}", self.namespace)))?;
        let mut request = Request::new(message);
        request.metadata_mut().insert(NAMESPACE_HEADER, namespace);
        Ok(request)
    }

    async fn write_blob(&self, digest: &str, data: Vec<u8>) -> Result<(), ClientError> {
        let write = WriteContentRequest {
            action: WriteAction::Commit as i32,
            r#ref: format!("ctr-fuzzing-{}", Uuid::new_v4()),
            total: i64::try_from(data.len()).unwrap_or(i64::MAX),
            expected: digest.to_string(),
            data,
            ..Default::default()
        };
        let request = self.request(futures::stream::iter(vec![write]))?;

        let written = ContentClient::new(self.channel.clone()).write(request).await;
        let mut responses = match written {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::AlreadyExists => return Ok(()),
            Err(status) => return Err(status.into()),
        };
        loop {
            match responses.message().await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(status) if status.code() == Code::AlreadyExists => return Ok(()),
                Err(status) => return Err(status.into()),
            }
        }
    }

    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>, ClientError> {
        let request = self.request(ReadContentRequest {
            digest: digest.to_string(),
            ..Default::default()
        })?;
        let mut chunks = ContentClient::new(self.channel.clone())
            .read(request)
            .await?
            .into_inner();

        let mut data = Vec::new();
        while let Some(chunk) = chunks.message().await? {
            data.extend_from_slice(&chunk.data);
        }
        Ok(data)
    }

    /// Create an image record, replacing one of the same name
    async fn put_image(&self, image: Image) -> Result<(), ClientError> {
        let mut images = ImagesClient::new(self.channel.clone());
        let create = CreateImageRequest {
            image: Some(image.clone()),
            ..Default::default()
        };
        match images.create(self.request(create)?).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::AlreadyExists => {
                let update = UpdateImageRequest {
                    image: Some(image),
                    ..Default::default()
                };
                images.update(self.request(update)?).await?;
                Ok(())
            }
            Err(status) => Err(status.into()),
        }
    }

    async fn image_target(&self, image: &ImageRef) -> Result<Descriptor, ClientError> {
        let request = self.request(GetImageRequest {
            name: image.reference().to_string(),
        })?;
        let found = ImagesClient::new(self.channel.clone())
            .get(request)
            .await?
            .into_inner();
        found
            .image
            .and_then(|image| image.target)
            .ok_or_else(|| ClientError::Rejected(format!("{} has no target", image.reference())))
    }

    /// Resolve an image to its manifest, following one level of index
    async fn manifest(&self, image: &ImageRef) -> Result<(Vec<Descriptor>, Manifest), ClientError> {
        let target = self.image_target(image).await?;
        let manifest: Manifest = serde_json::from_slice(&self.read_blob(&target.digest).await?)?;

        match manifest.manifests.first() {
            Some(child) => {
                let child = child.to_descriptor();
                let inner: Manifest = serde_json::from_slice(&self.read_blob(&child.digest).await?)?;
                Ok((vec![target, child], inner))
            }
            None => Ok((vec![target], manifest)),
        }
    }

    /// Layers paired with their chain ids
    async fn layer_chain(&self, image: &ImageRef) -> Result<Vec<(Descriptor, String)>, ClientError> {
        let (_, manifest) = self.manifest(image).await?;
        let config = manifest
            .config
            .ok_or_else(|| ClientError::Rejected(format!("{} has no config", image.reference())))?;
        let config: ImageConfig = serde_json::from_slice(&self.read_blob(&config.digest).await?)?;

        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(ClientError::Rejected(format!(
                "{}: {} layers but {} diff ids",
                image.reference(),
                manifest.layers.len(),
                config.rootfs.diff_ids.len()
            )));
        }
        Ok(manifest
            .layers
            .iter()
            .map(LayerDescriptor::to_descriptor)
            .zip(chain_ids(&config.rootfs.diff_ids))
            .collect())
    }

    async fn snapshot_exists(&self, snapshotter: &str, key: &str) -> Result<bool, ClientError> {
        let request = self.request(StatSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            key: key.to_string(),
        })?;
        match SnapshotsClient::new(self.channel.clone()).stat(request).await {
            Ok(_) => Ok(true),
            Err(status) if status.code() == Code::NotFound => Ok(false),
            Err(status) => Err(status.into()),
        }
    }

    async fn remove_snapshot(&self, snapshotter: &str, key: &str) -> Result<(), ClientError> {
        let request = self.request(RemoveSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            key: key.to_string(),
        })?;
        SnapshotsClient::new(self.channel.clone()).remove(request).await?;
        Ok(())
    }

    /// Apply one layer on top of `parent` and commit it as `chain_id`
    async fn apply_layer(
        &self,
        snapshotter: &str,
        layer: Descriptor,
        parent: &str,
        chain_id: &str,
    ) -> Result<(), ClientError> {
        let key = format!("extract-{} {chain_id}", Uuid::new_v4());
        let mut snapshots = SnapshotsClient::new(self.channel.clone());

        let prepare = PrepareSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            key: key.clone(),
            parent: parent.to_string(),
            ..Default::default()
        };
        let mounts = snapshots.prepare(self.request(prepare)?).await?.into_inner().mounts;

        let apply = ApplyRequest {
            diff: Some(layer),
            mounts,
            ..Default::default()
        };
        if let Err(status) = DiffClient::new(self.channel.clone()).apply(self.request(apply)?).await {
            if let Err(err) = self.remove_snapshot(snapshotter, &key).await {
                log::debug!("removing {key}: {err}");
            }
            return Err(status.into());
        }

        let commit = CommitSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            name: chain_id.to_string(),
            key,
            ..Default::default()
        };
        match snapshots.commit(self.request(commit)?).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::AlreadyExists => Ok(()),
            Err(status) => Err(status.into()),
        }
    }
}

#[async_trait]
impl RuntimeClient for ContainerdClient {
    async fn is_serving(&self) -> Result<bool, ClientError> {
        let request = self.request(())?;
        let version = VersionClient::new(self.channel.clone())
            .version(request)
            .await?
            .into_inner();
        log::debug!("daemon {} ({})", version.version, version.revision);
        Ok(true)
    }

    async fn list_images(&self) -> Result<Vec<ImageRef>, ClientError> {
        let request = self.request(ListImagesRequest::default())?;
        let listed = ImagesClient::new(self.channel.clone())
            .list(request)
            .await?
            .into_inner();
        Ok(listed
            .images
            .into_iter()
            .map(|image| ImageRef::new(image.name))
            .collect())
    }

    async fn import(&self, archive: Vec<u8>) -> Result<(), ClientError> {
        let layout = ImageLayout::read(&archive)?;

        for (digest, data) in layout.blobs {
            self.write_blob(&digest, data).await?;
        }
        for manifest in layout.index.manifests {
            let name = manifest
                .annotations
                .get(REF_NAME_ANNOTATION)
                .cloned()
                .unwrap_or_else(|| format!("import-{}", manifest.digest));
            log::debug!("registering image {name}");
            let image = Image {
                name,
                target: Some(manifest.to_descriptor()),
                ..Default::default()
            };
            self.put_image(image).await?;
        }
        Ok(())
    }

    async fn new_container(
        &self,
        id: &str,
        options: ContainerOptions,
    ) -> Result<ContainerRef, ClientError> {
        let container = Container {
            id: id.to_string(),
            image: options
                .image
                .as_ref()
                .map(|image| image.reference().to_string())
                .unwrap_or_default(),
            runtime: Some(Runtime {
                name: self.runtime.clone(),
                options: None,
            }),
            spec: options.spec.as_ref().map(spec_any).transpose()?,
            ..Default::default()
        };
        let request = self.request(CreateContainerRequest {
            container: Some(container),
        })?;
        let created = ContainersClient::new(self.channel.clone())
            .create(request)
            .await?
            .into_inner();
        let id = created
            .container
            .map(|container| container.id)
            .unwrap_or_else(|| id.to_string());
        Ok(ContainerRef { id })
    }

    async fn image_size(&self, image: &ImageRef) -> Result<i64, ClientError> {
        let (descriptors, manifest) = self.manifest(image).await?;
        let size = descriptors.iter().map(|descriptor| descriptor.size).sum::<i64>()
            + manifest.config.map(|config| config.size).unwrap_or_default()
            + manifest.layers.iter().map(|layer| layer.size).sum::<i64>();
        Ok(size)
    }

    async fn is_unpacked(&self, image: &ImageRef, snapshotter: &str) -> Result<bool, ClientError> {
        match self.layer_chain(image).await?.last() {
            Some((_, chain_id)) => self.snapshot_exists(snapshotter, chain_id).await,
            None => Ok(false),
        }
    }

    async fn unpack(&self, image: &ImageRef, snapshotter: &str) -> Result<(), ClientError> {
        let mut parent = String::new();
        for (layer, chain_id) in self.layer_chain(image).await? {
            if !self.snapshot_exists(snapshotter, &chain_id).await? {
                self.apply_layer(snapshotter, layer, &parent, &chain_id).await?;
            }
            parent = chain_id;
        }
        log::debug!("unpacked {} on {snapshotter}", image.reference());
        Ok(())
    }

    async fn delete_container(
        &self,
        container: &ContainerRef,
        options: DeleteOptions,
    ) -> Result<(), ClientError> {
        let mut containers = ContainersClient::new(self.channel.clone());

        let snapshot = if options.snapshot_cleanup {
            let request = self.request(GetContainerRequest {
                id: container.id.clone(),
            })?;
            containers
                .get(request)
                .await?
                .into_inner()
                .container
                .filter(|found| !found.snapshot_key.is_empty())
                .map(|found| (found.snapshotter, found.snapshot_key))
        } else {
            None
        };

        let request = self.request(DeleteContainerRequest {
            id: container.id.clone(),
        })?;
        containers.delete(request).await?;

        if let Some((snapshotter, key)) = snapshot {
            self.remove_snapshot(&snapshotter, &key).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Connect("client is closed".to_string()));
        }
        self.closed = true;
        Ok(())
    }
}

/// Encode a generated spec the way containerd stores runtime specs
pub fn spec_any(spec: &ContainerSpec) -> Result<Any, ClientError> {
    let mut document = serde_json::to_value(spec)?;
    if let Some(fields) = document.as_object_mut() {
        fields.insert("ociVersion".to_string(), OCI_VERSION.into());
    }
    Ok(Any {
        type_url: SPEC_TYPE_URL.to_string(),
        value: serde_json::to_vec(&document)?,
    })
}

/// Chain ids for a stack of layer diff ids, bottom first
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = match chain.last() {
            Some(parent) => {
                let digest = Sha256::digest(format!("{parent} {diff_id}").as_bytes());
                format!("sha256:{}", hex::encode(digest))
            }
            None => diff_id.clone(),
        };
        chain.push(next);
    }
    chain
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LayerDescriptor {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    digest: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

impl LayerDescriptor {
    fn to_descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size,
            annotations: self.annotations.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ImageIndex {
    #[serde(default)]
    manifests: Vec<LayerDescriptor>,
}

/// An image manifest, or an index when `manifests` is populated
#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    config: Option<LayerDescriptor>,
    #[serde(default)]
    layers: Vec<LayerDescriptor>,
    #[serde(default)]
    manifests: Vec<LayerDescriptor>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    rootfs: RootFs,
}

#[derive(Debug, Default, Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// An OCI image layout read out of an archive
#[derive(Debug, Default)]
struct ImageLayout {
    index: ImageIndex,
    blobs: Vec<(String, Vec<u8>)>,
}

impl ImageLayout {
    fn read(archive: &[u8]) -> Result<Self, ClientError> {
        let mut index = None;
        let mut blobs = Vec::new();

        let mut reader = tar::Archive::new(Cursor::new(archive));
        for entry in reader.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let path = path.trim_start_matches("./");

            if path == "index.json" {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                index = Some(serde_json::from_slice::<ImageIndex>(&data)?);
            } else if let Some(digest) = blob_digest(path) {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                blobs.push((digest, data));
            }
        }

        let index = index.ok_or_else(|| ClientError::Rejected("index.json not found".to_string()))?;
        Ok(Self { index, blobs })
    }
}

/// `blobs/<algorithm>/<hex>` to `<algorithm>:<hex>`
fn blob_digest(path: &str) -> Option<String> {
    let mut parts = path.strip_prefix("blobs/")?.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(algorithm), Some(encoded), None) if !algorithm.is_empty() && !encoded.is_empty() => {
            Some(format!("{algorithm}:{encoded}"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::MountSpec;

    fn layout_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_missing_socket_reports_daemon_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("containerd.sock");

        let result = ContainerdConnector::default().connect(&socket).await;

        match result {
            Err(err @ ClientError::DaemonNotRunning(_)) => {
                assert!(err.to_string().contains("daemon is not running"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a missing socket"),
        }
    }

    #[test]
    fn test_refused_dial_is_daemon_not_running() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let err = classify_connect_error("/tmp/containerd.sock", &refused);
        assert!(matches!(err, ClientError::DaemonNotRunning(_)));

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "permission denied");
        let err = classify_connect_error("/tmp/containerd.sock", &other);
        assert!(matches!(err, ClientError::Connect(_)));
    }

    #[test]
    fn test_spec_is_carried_as_runtime_spec_json() {
        let mut spec = ContainerSpec::default();
        spec.hostname = "fuzz".to_string();
        spec.process.args = vec!["/bin/true".to_string()];
        spec.mounts.push(MountSpec {
            destination: "/data".to_string(),
            source: "/srv".to_string(),
            kind: "bind".to_string(),
            options: vec!["rbind".to_string()],
        });

        let any = spec_any(&spec).unwrap();
        assert_eq!(any.type_url, SPEC_TYPE_URL);

        let document: serde_json::Value = serde_json::from_slice(&any.value).unwrap();
        assert_eq!(document["ociVersion"], OCI_VERSION);
        assert_eq!(document["hostname"], "fuzz");
        assert_eq!(document["process"]["args"][0], "/bin/true");
        assert_eq!(document["mounts"][0]["type"], "bind");
    }

    #[test]
    fn test_chain_ids() {
        assert!(chain_ids(&[]).is_empty());

        let diff_ids = vec![
            "sha256:aaa".to_string(),
            "sha256:bbb".to_string(),
            "sha256:ccc".to_string(),
        ];
        assert_eq!(
            chain_ids(&diff_ids),
            vec![
                "sha256:aaa".to_string(),
                "sha256:56efb1d4f6c79b745d37d6eff87e3ed8dd2be28104e124ba73fd6e6c4892c792".to_string(),
                "sha256:5f37250437ffd4d0a708296d64527afcea82547c8f3683aed2e2e1abbc1999c2".to_string(),
            ]
        );
    }

    #[test]
    fn test_blob_digest() {
        assert_eq!(blob_digest("blobs/sha256/abc"), Some("sha256:abc".to_string()));
        assert_eq!(blob_digest("blobs/sha256/"), None);
        assert_eq!(blob_digest("blobs/sha256/abc/extra"), None);
        assert_eq!(blob_digest("oci-layout"), None);
    }

    #[test]
    fn test_layout_is_read_from_archive() {
        let index = br#"{"schemaVersion":2,"manifests":[{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:abc","size":7,"annotations":{"org.opencontainers.image.ref.name":"fuzz:latest"}}]}"#;
        let archive = layout_archive(&[
            ("oci-layout", b"{}"),
            ("./index.json", index),
            ("blobs/sha256/abc", b"payload"),
        ]);

        let layout = ImageLayout::read(&archive).unwrap();

        assert_eq!(layout.blobs, vec![("sha256:abc".to_string(), b"payload".to_vec())]);
        let manifest = &layout.index.manifests[0];
        assert_eq!(manifest.size, 7);
        assert_eq!(
            manifest.annotations.get(REF_NAME_ANNOTATION).map(String::as_str),
            Some("fuzz:latest")
        );
    }

    #[test]
    fn test_archive_without_index_is_rejected() {
        let archive = layout_archive(&[("blobs/sha256/abc", b"payload")]);
        match ImageLayout::read(&archive) {
            Err(ClientError::Rejected(reason)) => assert_eq!(reason, "index.json not found"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
