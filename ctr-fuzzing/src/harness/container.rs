// ctr-fuzzing/src/harness/container.rs
//! Container construction from fuzz input

use std::fmt;

use crate::client::{ContainerOptions, ContainerRef, ImageRef, RuntimeClient};
use crate::constants::CONSTRUCTION_STRATEGIES;
use crate::error::ClientError;
use crate::generators::{ContainerSpec, FuzzConsumer};

/// How a container's creation options are assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstructionStrategy {
    /// Generated spec, no image
    SpecOnly,
    /// Existing image plus a generated spec
    SpecWithImage,
    /// Existing image only
    ImageOnly,
}

impl ConstructionStrategy {
    /// Map any selector, negative included, onto a strategy
    pub fn select(selector: i32) -> Self {
        match selector.rem_euclid(CONSTRUCTION_STRATEGIES) {
            0 => ConstructionStrategy::SpecOnly,
            1 => ConstructionStrategy::SpecWithImage,
            _ => ConstructionStrategy::ImageOnly,
        }
    }
}

impl fmt::Display for ConstructionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstructionStrategy::SpecOnly => "spec-only",
            ConstructionStrategy::SpecWithImage => "spec-with-image",
            ConstructionStrategy::ImageOnly => "image-only",
        };
        f.write_str(name)
    }
}

/// Create one container with `id` using the strategy chosen by `selector`
///
/// `images` is the listing taken for this iteration. No retries: a failed
/// decode or create is returned to the caller.
pub async fn build(
    client: &dyn RuntimeClient,
    input: &mut FuzzConsumer<'_>,
    images: &[ImageRef],
    id: &str,
    selector: i32,
    snapshotter: &str,
) -> Result<ContainerRef, ClientError> {
    let strategy = ConstructionStrategy::select(selector);
    let options = match strategy {
        ConstructionStrategy::SpecOnly => {
            let spec: ContainerSpec = input.next_struct()?;
            ContainerOptions::new().with_spec(spec)
        }
        ConstructionStrategy::SpecWithImage => {
            let image = pick_image(input, images)?;
            probe_image(client, input, &image, snapshotter).await?;
            let spec: ContainerSpec = input.next_struct()?;
            ContainerOptions::new().with_image(image).with_spec(spec)
        }
        ConstructionStrategy::ImageOnly => {
            let image = pick_image(input, images)?;
            probe_image(client, input, &image, snapshotter).await?;
            ContainerOptions::new().with_image(image)
        }
    };

    log::debug!("creating {id} ({strategy})");
    client.new_container(id, options).await
}

/// Choose an image by a decoded index
pub fn pick_image(input: &mut FuzzConsumer<'_>, images: &[ImageRef]) -> Result<ImageRef, ClientError> {
    if images.is_empty() {
        return Err(ClientError::NoImages);
    }
    let index = wrap_index(input.next_int()?, images.len());
    Ok(images[index].clone())
}

/// Reduce a decoded integer onto `0..len` without truncating `len`
fn wrap_index(raw: i32, len: usize) -> usize {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    i64::from(raw).rem_euclid(len) as usize
}

/// Exercise the image's size and unpack paths
///
/// Client failures here are swallowed. Only running out of input is an error,
/// and input is only consumed when the image reports as not unpacked.
async fn probe_image(
    client: &dyn RuntimeClient,
    input: &mut FuzzConsumer<'_>,
    image: &ImageRef,
    snapshotter: &str,
) -> Result<(), ClientError> {
    if let Err(err) = client.image_size(image).await {
        log::debug!("size of {}: {err}", image.reference());
    }

    match client.is_unpacked(image, snapshotter).await {
        Ok(false) => {
            if input.next_bool()? {
                if let Err(err) = client.unpack(image, snapshotter).await {
                    log::debug!("unpack {}: {err}", image.reference());
                }
            }
        }
        Ok(true) => {}
        Err(err) => log::debug!("unpack status of {}: {err}", image.reference()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DeleteOptions;
    use crate::error::InputError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        unpacked: bool,
        calls: Mutex<Vec<String>>,
        created: Mutex<Vec<ContainerOptions>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RuntimeClient for Recorder {
        async fn is_serving(&self) -> Result<bool, ClientError> {
            Ok(true)
        }
        async fn list_images(&self) -> Result<Vec<ImageRef>, ClientError> {
            Ok(Vec::new())
        }
        async fn import(&self, _archive: Vec<u8>) -> Result<(), ClientError> {
            Ok(())
        }
        async fn new_container(
            &self,
            id: &str,
            options: ContainerOptions,
        ) -> Result<ContainerRef, ClientError> {
            self.created.lock().unwrap().push(options);
            Ok(ContainerRef { id: id.to_string() })
        }
        async fn image_size(&self, _image: &ImageRef) -> Result<i64, ClientError> {
            self.calls.lock().unwrap().push("size".to_string());
            Err(ClientError::Rejected("no size".to_string()))
        }
        async fn is_unpacked(&self, _image: &ImageRef, _snapshotter: &str) -> Result<bool, ClientError> {
            self.calls.lock().unwrap().push("is_unpacked".to_string());
            Ok(self.unpacked)
        }
        async fn unpack(&self, _image: &ImageRef, _snapshotter: &str) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push("unpack".to_string());
            Ok(())
        }
        async fn delete_container(
            &self,
            _container: &ContainerRef,
            _options: DeleteOptions,
        ) -> Result<(), ClientError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn images() -> Vec<ImageRef> {
        vec![ImageRef::new("first"), ImageRef::new("second")]
    }

    #[test]
    fn test_select_covers_all_strategies() {
        assert_eq!(ConstructionStrategy::select(0), ConstructionStrategy::SpecOnly);
        assert_eq!(ConstructionStrategy::select(1), ConstructionStrategy::SpecWithImage);
        assert_eq!(ConstructionStrategy::select(2), ConstructionStrategy::ImageOnly);
        assert_eq!(ConstructionStrategy::select(3), ConstructionStrategy::SpecOnly);
        assert_eq!(ConstructionStrategy::select(-1), ConstructionStrategy::ImageOnly);
        assert_eq!(ConstructionStrategy::select(i32::MIN), ConstructionStrategy::SpecWithImage);
    }

    #[test]
    fn test_pick_image_wraps_negative_index() {
        let bytes = (-1i32).to_le_bytes();
        let mut input = FuzzConsumer::new(&bytes);

        let image = pick_image(&mut input, &images()).unwrap();
        assert_eq!(image.id, "second");
    }

    #[test]
    fn test_wrap_index_handles_lengths_beyond_i32() {
        assert_eq!(wrap_index(-1, 2), 1);
        assert_eq!(wrap_index(i32::MIN, 3), 1);
        assert_eq!(wrap_index(7, 1 << 32), 7);
        assert_eq!(wrap_index(-1, (1 << 32) + 5), (1 << 32) + 4);
        assert_eq!(wrap_index(5, usize::MAX), 5);
    }

    #[test]
    fn test_pick_image_without_images() {
        let mut input = FuzzConsumer::new(&[0, 0, 0, 0]);
        assert!(matches!(pick_image(&mut input, &[]), Err(ClientError::NoImages)));
        assert_eq!(input.remaining(), 4);
    }

    #[tokio::test]
    async fn test_spec_only_creates_without_image() {
        let client = Recorder::default();
        let bytes = [7u8; 64];
        let mut input = FuzzConsumer::new(&bytes);

        let container = build(&client, &mut input, &images(), "c1", 0, "overlayfs")
            .await
            .unwrap();

        assert_eq!(container.id, "c1");
        assert!(client.calls().is_empty());
        let created = client.created.lock().unwrap();
        assert!(created[0].image.is_none());
        assert!(created[0].spec.is_some());
    }

    #[tokio::test]
    async fn test_image_only_unpacks_when_asked() {
        let client = Recorder::default();
        let mut bytes = 0i32.to_le_bytes().to_vec();
        bytes.push(1);
        let mut input = FuzzConsumer::new(&bytes);

        build(&client, &mut input, &images(), "c2", 2, "overlayfs")
            .await
            .unwrap();

        assert_eq!(client.calls(), vec!["size", "is_unpacked", "unpack"]);
        let created = client.created.lock().unwrap();
        assert_eq!(created[0].image.as_ref().map(|i| i.id.as_str()), Some("first"));
        assert!(created[0].spec.is_none());
    }

    #[tokio::test]
    async fn test_unpacked_image_consumes_no_bool() {
        let client = Recorder {
            unpacked: true,
            ..Default::default()
        };
        let bytes = 1i32.to_le_bytes();
        let mut input = FuzzConsumer::new(&bytes);

        build(&client, &mut input, &images(), "c3", 2, "overlayfs")
            .await
            .unwrap();

        assert_eq!(client.calls(), vec!["size", "is_unpacked"]);
        assert!(input.is_exhausted());
    }

    #[tokio::test]
    async fn test_exhausted_input_creates_nothing() {
        let client = Recorder::default();
        let bytes = 0i32.to_le_bytes();
        let mut input = FuzzConsumer::new(&bytes);

        let err = build(&client, &mut input, &images(), "c4", 1, "overlayfs")
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Input(InputError::Exhausted(_))));
        assert!(client.created.lock().unwrap().is_empty());
    }
}
