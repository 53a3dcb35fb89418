//! Native dependency descriptors

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use super::download::Downloader;
use super::NativeDependencyError;
use crate::setup::RemotePlatform;

/// Archive format of a downloaded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    Tgz,
    Zip,
}

/// Where one file lands in the application directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDependencyResult {
    /// Path relative to the remote application directory
    pub target_file: String,
    pub mode: Option<u32>,
}

impl FileDependencyResult {
    pub fn new(target_file: impl Into<String>) -> Self {
        Self {
            target_file: target_file.into(),
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Maps an extracted archive path to its target
pub type FileMapper = Box<dyn Fn(&str) -> FileDependencyResult + Send + Sync>;

/// Payload returned by a contribution
pub enum DependencyDownload {
    /// One file, either raw or as the first entry of an archive
    File {
        archive: Option<ArchiveKind>,
        file: FileDependencyResult,
        buffer: Bytes,
    },
    /// An archive whose every entry is mapped through `files`
    Directory {
        archive: ArchiveKind,
        files: FileMapper,
        buffer: Bytes,
    },
}

impl std::fmt::Debug for DependencyDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File {
                archive,
                file,
                buffer,
            } => f
                .debug_struct("File")
                .field("archive", archive)
                .field("file", file)
                .field("bytes", &buffer.len())
                .finish(),
            Self::Directory {
                archive, buffer, ..
            } => f
                .debug_struct("Directory")
                .field("archive", archive)
                .field("bytes", &buffer.len())
                .finish(),
        }
    }
}

/// A local file ready to ship, with its remote target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDependencyFile {
    pub path: PathBuf,
    pub target: String,
    pub mode: Option<u32>,
}

/// Context handed to each contribution
pub struct DownloadOptions<'a> {
    pub remote_platform: RemotePlatform,
    /// Release tag of the prebuilt binaries
    pub version: &'a str,
    pub base_url: &'a str,
    pub ripgrep_base_url: &'a str,
    pub downloader: &'a dyn Downloader,
}

impl DownloadOptions<'_> {
    pub async fn download(&self, url: &str) -> Result<Bytes, NativeDependencyError> {
        Ok(self.downloader.download(url).await?)
    }

    /// `{base}/{version}/{name}-{platform}-x64.zip`
    pub fn default_url(&self, name: &str) -> String {
        format!(
            "{}/{}/{}-{}-x64.zip",
            self.base_url.trim_end_matches('/'),
            self.version,
            name,
            self.remote_platform
        )
    }
}

/// A prebuilt binary the remote backend needs
#[async_trait]
pub trait NativeDependencyContribution: Send + Sync {
    /// Deduplication key
    fn dependency_id(&self) -> &str;

    async fn download(
        &self,
        options: &DownloadOptions<'_>,
    ) -> Result<DependencyDownload, NativeDependencyError>;
}
