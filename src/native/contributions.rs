//! Built-in native dependency contributions

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{
    ArchiveKind, DependencyDownload, DownloadOptions, FileDependencyResult,
    NativeDependencyContribution,
};
use super::NativeDependencyError;
use crate::setup::RemotePlatform;

const NATIVE_DIR: &str = "lib/backend/native";

/// A single `.node` module published as `{name}-{platform}-x64.zip`
pub struct PrebuiltModule {
    id: &'static str,
    target: &'static str,
}

impl PrebuiltModule {
    pub const fn new(id: &'static str, target: &'static str) -> Self {
        Self { id, target }
    }
}

#[async_trait]
impl NativeDependencyContribution for PrebuiltModule {
    fn dependency_id(&self) -> &str {
        self.id
    }

    async fn download(
        &self,
        options: &DownloadOptions<'_>,
    ) -> Result<DependencyDownload, NativeDependencyError> {
        let buffer = options.download(&options.default_url(self.id)).await?;
        Ok(DependencyDownload::File {
            archive: Some(ArchiveKind::Zip),
            file: FileDependencyResult::new(format!("{}/{}", NATIVE_DIR, self.target)),
            buffer,
        })
    }
}

/// The `rg` binary used by workspace search
pub struct Ripgrep;

impl Ripgrep {
    pub fn url(base: &str, platform: RemotePlatform) -> String {
        let suffix = match platform {
            RemotePlatform::Darwin => "x86_64-apple-darwin.tar.gz",
            RemotePlatform::Windows => "i686-pc-windows-msvc.zip",
            RemotePlatform::Linux => "aarch64-unknown-linux-gnu.tar.gz",
        };
        format!("{}-{}", base, suffix)
    }
}

#[async_trait]
impl NativeDependencyContribution for Ripgrep {
    fn dependency_id(&self) -> &str {
        "ripgrep"
    }

    async fn download(
        &self,
        options: &DownloadOptions<'_>,
    ) -> Result<DependencyDownload, NativeDependencyError> {
        let platform = options.remote_platform;
        let buffer = options
            .download(&Self::url(options.ripgrep_base_url, platform))
            .await?;
        let (archive, binary) = match platform {
            RemotePlatform::Windows => (ArchiveKind::Zip, "rg.exe"),
            _ => (ArchiveKind::Tgz, "rg"),
        };
        Ok(DependencyDownload::File {
            archive: Some(archive),
            file: FileDependencyResult::new(format!("{}/{}", NATIVE_DIR, binary)).with_mode(0o777),
            buffer,
        })
    }
}

/// Pseudo-terminal support: the addon plus its helper executables
pub struct NodePty;

impl NodePty {
    pub fn map_file(path: &str) -> FileDependencyResult {
        if path.ends_with("pty.node") {
            return FileDependencyResult::new(format!("{}/pty.node", NATIVE_DIR));
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        let result = FileDependencyResult::new(format!("lib/build/Release/{}", name));
        if name.ends_with(".node") {
            result
        } else {
            result.with_mode(0o777)
        }
    }
}

#[async_trait]
impl NativeDependencyContribution for NodePty {
    fn dependency_id(&self) -> &str {
        "node-pty"
    }

    async fn download(
        &self,
        options: &DownloadOptions<'_>,
    ) -> Result<DependencyDownload, NativeDependencyError> {
        let buffer = options.download(&options.default_url("node-pty")).await?;
        Ok(DependencyDownload::Directory {
            archive: ArchiveKind::Zip,
            files: Box::new(Self::map_file),
            buffer,
        })
    }
}

/// Every contribution the remote backend needs
pub fn builtin_contributions() -> Vec<Arc<dyn NativeDependencyContribution>> {
    vec![
        Arc::new(PrebuiltModule::new("drivelist", "drivelist.node")),
        Arc::new(PrebuiltModule::new("keytar", "keytar.node")),
        Arc::new(PrebuiltModule::new("nsfw", "nsfw.node")),
        Arc::new(PrebuiltModule::new("find-git-repositories", "findGitRepos.node")),
        Arc::new(Ripgrep),
        Arc::new(NodePty),
    ]
}
