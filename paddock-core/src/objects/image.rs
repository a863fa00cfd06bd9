use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::str_prop;
use crate::error::{PaddockError, PaddockResult};
use crate::graph::{CreateRequest, ManagedObject, ObjectFactory, ObjectType, Properties};
use crate::registry::FormatContext;

pub const MANIFEST_FILE: &str = "manifest.yml";

/// A way of exposing one format of an image on the filesystem
#[async_trait]
pub trait ImageFormat: Send + Sync {
    fn name(&self) -> &str;

    /// Make the format available under `basedir`; returns the mountpoint
    async fn mount(&self, basedir: &Path) -> PaddockResult<PathBuf>;

    async fn unmount(&self, _mountpoint: &Path) -> PaddockResult<()> {
        Ok(())
    }
}

/// Contents of `manifest.yml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(default)]
    pub formats: Vec<Value>,

    /// Defaults handed to node drivers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<Properties>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,

    #[serde(rename = "aa-profile", default, skip_serializing_if = "Option::is_none")]
    pub aa_profile: Option<String>,

    #[serde(flatten)]
    pub extra: Properties,
}

impl ImageManifest {
    /// Driver named by the manifest's `node` section
    pub fn node_driver(&self) -> Option<&str> {
        let node = self.node.as_ref()?;
        str_prop(node, "driver").or_else(|| str_prop(node, "interior"))
    }
}

/// A declared format and where it ended up
pub struct ImageMount {
    pub format: Properties,
    pub driver: Option<Arc<dyn ImageFormat>>,
    pub mountpoint: Option<PathBuf>,
}

impl ImageMount {
    pub fn format_name(&self) -> Option<&str> {
        str_prop(&self.format, "name")
    }
}

/// An image directory with its manifest and mounted formats
pub struct Image {
    id: String,
    properties: Properties,
    basedir: PathBuf,
    manifest: ImageManifest,
    mounts: Vec<ImageMount>,
}

impl Image {
    pub fn name(&self) -> Option<&str> {
        str_prop(&self.properties, "name")
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn mounts(&self) -> &[ImageMount] {
        &self.mounts
    }

    pub fn find_mount(&self, format: &str) -> Option<&ImageMount> {
        self.mounts.iter().find(|m| m.format_name() == Some(format))
    }

    /// Mountpoint of `format`, if it was mounted
    pub fn mount_path(&self, format: &str) -> Option<&Path> {
        self.find_mount(format)?.mountpoint.as_deref()
    }
}

#[async_trait]
impl ManagedObject for Image {
    fn object_type(&self) -> ObjectType {
        ObjectType::Image
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn dump(&self) -> Value {
        let mounts: Vec<Value> = self
            .mounts
            .iter()
            .map(|m| {
                json!({
                    "format": m.format,
                    "mountpoint": m.mountpoint.as_ref().map(|p| json!({ "path": p })),
                })
            })
            .collect();
        json!({
            "name": self.name(),
            "basedir": self.basedir,
            "manifest": self.manifest,
            "mounts": mounts,
        })
    }

    async fn destruct(&self) -> PaddockResult<()> {
        unmount_all(&self.id, &self.mounts).await;
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

async fn unmount_all(image_id: &str, mounts: &[ImageMount]) {
    for mount in mounts {
        if let (Some(driver), Some(path)) = (&mount.driver, &mount.mountpoint) {
            if let Err(e) = driver.unmount(path).await {
                warn!(id = %image_id, "Unmount of {} failed: {}", path.display(), e);
            }
        }
    }
}

pub struct ImageFactory;

#[async_trait]
impl ObjectFactory for ImageFactory {
    async fn create(&self, req: CreateRequest<'_>) -> PaddockResult<Arc<dyn ManagedObject>> {
        let basedir = PathBuf::from(str_prop(&req.properties, "dir").unwrap_or(&req.id));

        let text = tokio::fs::read_to_string(basedir.join(MANIFEST_FILE)).await?;
        let manifest: ImageManifest = serde_yaml::from_str(&text)?;

        let mut mounts = Vec::new();
        for entry in &manifest.formats {
            let Some(format) = entry.as_object() else {
                continue;
            };
            let Some(format_name) = str_prop(format, "name") else {
                continue;
            };

            let Some(driver_name) = str_prop(format, "driver") else {
                debug!(id = %req.id, "Format {} declares no driver", format_name);
                mounts.push(ImageMount {
                    format: format.clone(),
                    driver: None,
                    mountpoint: None,
                });
                continue;
            };

            let mounted = async {
                let driver = req.context.plugins().create_format(
                    format_name,
                    driver_name,
                    FormatContext {
                        image_id: req.id.clone(),
                        params: format.clone(),
                    },
                )?;
                let mountpoint = driver.mount(&basedir).await?;
                Ok::<_, PaddockError>((driver, mountpoint))
            }
            .await;

            match mounted {
                Ok((driver, mountpoint)) => {
                    debug!(id = %req.id, "Mounted {} at {}", format_name, mountpoint.display());
                    mounts.push(ImageMount {
                        format: format.clone(),
                        driver: Some(driver),
                        mountpoint: Some(mountpoint),
                    });
                }
                Err(e) => {
                    unmount_all(&req.id, &mounts).await;
                    return Err(e);
                }
            }
        }

        Ok(Arc::new(Image {
            id: req.id,
            properties: req.properties,
            basedir,
            manifest,
            mounts,
        }))
    }
}
