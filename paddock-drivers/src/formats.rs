//! Image formats: plain directories and squashfs files

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use paddock_core::graph::Properties;
use paddock_core::objects::image::ImageFormat;
use paddock_core::registry::{FormatContext, ImageFormatFactory};
use paddock_core::{PaddockError, PaddockResult};

use crate::exec::{self, ExecOptions, Executor};
use crate::params::str_param;

/// A directory inside the image; `dir` defaults to the image base directory
pub struct DirFormat {
    dir: Option<String>,
}

impl DirFormat {
    pub fn new(params: &Properties) -> Self {
        Self {
            dir: str_param(params, "dir").map(str::to_string),
        }
    }
}

#[async_trait]
impl ImageFormat for DirFormat {
    fn name(&self) -> &str {
        "dir"
    }

    async fn mount(&self, basedir: &Path) -> PaddockResult<PathBuf> {
        Ok(match &self.dir {
            Some(dir) => basedir.join(dir),
            None => basedir.to_path_buf(),
        })
    }
}

/// A squashfs file loop-mounted under the image
pub struct SquashfsFormat {
    file: Option<String>,
    mountdir: Option<String>,
    executor: Executor,
}

impl SquashfsFormat {
    pub fn new(params: &Properties, executor: Executor) -> Self {
        Self {
            file: str_param(params, "file").map(str::to_string),
            mountdir: str_param(params, "mountdir").map(str::to_string),
            executor,
        }
    }
}

#[async_trait]
impl ImageFormat for SquashfsFormat {
    fn name(&self) -> &str {
        "squashfs"
    }

    async fn mount(&self, basedir: &Path) -> PaddockResult<PathBuf> {
        let file = self.file.as_ref().ok_or_else(|| PaddockError::no_attr("file"))?;
        let mountdir = self.mountdir.as_ref().ok_or_else(|| PaddockError::no_attr("mountdir"))?;
        let file = basedir.join(file);
        let mountdir = basedir.join(mountdir);

        tokio::fs::create_dir_all(&mountdir).await?;
        let args = [
            "-t".to_string(),
            "squashfs".to_string(),
            file.display().to_string(),
            mountdir.display().to_string(),
        ];
        exec::run(self.executor.as_ref(), "mount", &args, &ExecOptions::default()).await?;
        Ok(mountdir)
    }

    async fn unmount(&self, mountpoint: &Path) -> PaddockResult<()> {
        let args = [mountpoint.display().to_string()];
        exec::run(self.executor.as_ref(), "umount", &args, &ExecOptions::default()).await?;
        Ok(())
    }
}

/// Directory format, registered once per format name it can serve
pub struct DirFormatFactory {
    format: &'static str,
}

impl DirFormatFactory {
    pub fn new(format: &'static str) -> Self {
        Self { format }
    }
}

impl ImageFormatFactory for DirFormatFactory {
    fn format(&self) -> &'static str {
        self.format
    }

    fn name(&self) -> &'static str {
        "dir"
    }

    fn description(&self) -> &'static str {
        "Path inside the image directory, used as is"
    }

    fn create(&self, ctx: FormatContext) -> PaddockResult<Arc<dyn ImageFormat>> {
        Ok(Arc::new(DirFormat::new(&ctx.params)))
    }
}

pub struct SquashfsFormatFactory {
    executor: Executor,
}

impl SquashfsFormatFactory {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }
}

impl ImageFormatFactory for SquashfsFormatFactory {
    fn format(&self) -> &'static str {
        "rootfs"
    }

    fn name(&self) -> &'static str {
        "squashfs"
    }

    fn description(&self) -> &'static str {
        "Root filesystem packed in a squashfs file"
    }

    fn create(&self, ctx: FormatContext) -> PaddockResult<Arc<dyn ImageFormat>> {
        Ok(Arc::new(SquashfsFormat::new(&ctx.params, Arc::clone(&self.executor))))
    }
}
