//! Node.js runtime packaging for the remote host
//!
//! The remote backend's native modules are built against one runtime
//! version, so the exact release is installed next to the application
//! rather than relying on whatever the host provides.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use super::exec::quote;
use super::platform::RemotePlatform;
use super::SetupError;
use crate::config::RuntimeOptions;
use crate::native::Downloader;

const CACHE_DIR_NAME: &str = "oxide-remote";

pub struct RuntimeInstaller {
    options: RuntimeOptions,
    downloader: Arc<dyn Downloader>,
    cache_dir: PathBuf,
}

impl RuntimeInstaller {
    /// Archives are cached under the user cache directory
    pub fn new(options: RuntimeOptions, downloader: Arc<dyn Downloader>) -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(CACHE_DIR_NAME);
        Self::with_cache_dir(options, downloader, cache_dir)
    }

    pub fn with_cache_dir(
        options: RuntimeOptions,
        downloader: Arc<dyn Downloader>,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            options,
            downloader,
            cache_dir,
        }
    }

    /// `node-v<version>-<platform>-<arch>`; Windows releases use `win`
    pub fn directory_name(&self, platform: RemotePlatform) -> String {
        let platform_id = match platform {
            RemotePlatform::Windows => "win",
            other => other.as_str(),
        };
        format!(
            "node-v{}-{}-{}",
            self.options.version, platform_id, self.options.arch
        )
    }

    pub fn archive_name(&self, platform: RemotePlatform) -> String {
        let extension = match platform {
            RemotePlatform::Windows => "zip",
            RemotePlatform::Darwin => "tar.gz",
            RemotePlatform::Linux => "tar.xz",
        };
        format!("{}.{}", self.directory_name(platform), extension)
    }

    pub fn download_url(&self, platform: RemotePlatform) -> String {
        format!(
            "{}/v{}/{}",
            self.options.download_base_url.trim_end_matches('/'),
            self.options.version,
            self.archive_name(platform)
        )
    }

    /// Shell script that downloads and unpacks the runtime on the remote
    /// host itself. Windows hosts always use the local download path.
    pub fn install_script(&self, platform: RemotePlatform, app_dir: &str) -> Option<String> {
        if platform == RemotePlatform::Windows {
            return None;
        }
        let url = quote(platform, &self.download_url(platform));
        let archive = quote(platform, &self.archive_name(platform));
        Some(format!(
            "cd {dir} && \
             if command -v curl >/dev/null 2>&1; then curl -fsSL {url} -o {archive}; \
             elif command -v wget >/dev/null 2>&1; then wget -q {url} -O {archive}; \
             else echo 'curl or wget is required' >&2; exit 1; fi && \
             tar -xf {archive} && rm -f {archive}",
            dir = quote(platform, app_dir),
            url = url,
            archive = archive,
        ))
    }

    /// Local path of the runtime archive, downloading it on first use
    pub async fn download(&self, platform: RemotePlatform) -> Result<PathBuf, SetupError> {
        let path = self.cache_dir.join(self.archive_name(platform));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("[remote-setup] Using cached runtime {}", path.display());
            return Ok(path);
        }

        let url = self.download_url(platform);
        info!("[remote-setup] Downloading runtime from {}", url);
        let buffer = self
            .downloader
            .download(&url)
            .await
            .map_err(|e| SetupError::RuntimeDownload(e.to_string()))?;

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| SetupError::LocalIo(e.to_string()))?;
        // Write beside the final name so an interrupted download is never reused
        let partial = path.with_extension("part");
        tokio::fs::write(&partial, &buffer)
            .await
            .map_err(|e| SetupError::LocalIo(e.to_string()))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| SetupError::LocalIo(e.to_string()))?;
        Ok(path)
    }
}
