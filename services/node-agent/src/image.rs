//! Boot disk materialization.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use stratus_id::{DiskId, ImageId};
use tracing::info;

use crate::command::CommandRunner;
use crate::error::{Error, Result};
use crate::paths::Paths;

/// Writes boot disks from source images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Materialize `image` as the disk file of `disk`, sized `size_gb` GiB.
    ///
    /// Returns the backing image path when the disk is a qcow2 overlay.
    async fn write_image(
        &self,
        image: &ImageId,
        disk: &DiskId,
        size_gb: u32,
        backing: bool,
    ) -> Result<Option<PathBuf>>;
}

/// Image store driving `qemu-img` over images kept under the lib dir.
pub struct QemuImgStore {
    runner: Arc<dyn CommandRunner>,
    paths: Paths,
}

impl QemuImgStore {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: Paths) -> Self {
        Self { runner, paths }
    }

    pub fn image_path(&self, image: &ImageId) -> PathBuf {
        self.paths.images_dir().join(format!("{}.qcow2", image))
    }
}

#[async_trait]
impl ImageStore for QemuImgStore {
    async fn write_image(
        &self,
        image: &ImageId,
        disk: &DiskId,
        size_gb: u32,
        backing: bool,
    ) -> Result<Option<PathBuf>> {
        let source = self.image_path(image);
        if !tokio::fs::try_exists(&source).await? {
            return Err(Error::NotFound(format!("image {}", image)));
        }

        tokio::fs::create_dir_all(self.paths.disks_dir()).await?;
        let target = self.paths.disk_path(disk);
        let src = source.to_string_lossy();
        let dst = target.to_string_lossy();
        let size = format!("{}G", size_gb);

        info!(
            image_id = %image,
            disk_id = %disk,
            size_gb,
            backing,
            "Writing boot disk"
        );

        if backing {
            self.runner
                .run(
                    "qemu-img",
                    &["create", "-f", "qcow2", "-F", "qcow2", "-b", &src, &dst, &size],
                )
                .await?;
            return Ok(Some(source.clone()));
        }

        self.runner
            .run("qemu-img", &["convert", "-f", "qcow2", "-O", "qcow2", &src, &dst])
            .await?;
        self.runner
            .run("qemu-img", &["resize", &dst, &size])
            .await?;
        Ok(None)
    }
}
