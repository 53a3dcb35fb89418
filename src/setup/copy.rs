//! Remote Copy Service
//!
//! Copy contributions register the local files the remote backend needs.
//! The manifest is built once per service; native dependencies are
//! downloaded per target platform on every copy.
//!
//! Two strategies:
//! - `Archive`: pack everything into one gzip tarball, upload it, and let the
//!   caller extract it remotely (a single SFTP transfer is far faster than
//!   many small ones)
//! - `Files`: upload every file individually, concurrently

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::future::{join_all, try_join_all};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::exec::quote;
use super::platform::RemotePlatform;
use crate::native::{NativeDependencyFile, NativeDependencyService};
use crate::ssh::{RemoteTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("Invalid glob pattern {pattern}: {message}")]
    Pattern { pattern: String, message: String },

    #[error("Failed to build archive: {0}")]
    Archive(String),

    #[error("Native dependencies: {0}")]
    Native(String),

    #[error("Remote command failed: {0}")]
    Remote(String),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One entry of the manifest
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemoteFile {
    /// Path relative to the project root
    pub path: String,
    /// Path relative to the remote application directory
    pub target: String,
    pub mode: Option<u32>,
}

/// Collects [`RemoteFile`]s registered by contributions
pub struct RemoteCopyRegistry {
    project_path: PathBuf,
    files: Mutex<Vec<RemoteFile>>,
}

impl RemoteCopyRegistry {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            files: Mutex::new(Vec::new()),
        }
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Register one file, shipped under the same relative path
    pub fn file(&self, path: &str) {
        self.file_with(path, path, None);
    }

    pub fn file_with(&self, path: &str, target: &str, mode: Option<u32>) {
        self.files.lock().push(RemoteFile {
            path: normalize(path),
            target: normalize(target),
            mode,
        });
    }

    /// Register every file matching `pattern` (relative to the project root)
    pub async fn glob(&self, pattern: &str) -> Result<usize, CopyError> {
        let root = self.project_path.clone();
        let pattern = pattern.to_string();
        let matched = tokio::task::spawn_blocking(move || -> Result<Vec<String>, CopyError> {
            let full = root.join(&pattern);
            let paths = glob::glob(&full.to_string_lossy()).map_err(|e| CopyError::Pattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            Ok(paths
                .filter_map(Result::ok)
                .filter(|p| p.is_file())
                .filter_map(|p| relative_to(&root, &p))
                .collect())
        })
        .await
        .map_err(|e| CopyError::Archive(e.to_string()))??;

        let count = matched.len();
        for path in matched {
            self.file(&path);
        }
        Ok(count)
    }

    /// Register every file below `path`, recursively
    pub async fn directory(&self, path: &str) -> Result<usize, CopyError> {
        let root = self.project_path.clone();
        let dir = root.join(path);
        let matched = tokio::task::spawn_blocking(move || {
            WalkDir::new(&dir)
                .follow_links(true)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| relative_to(&root, e.path()))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| CopyError::Archive(e.to_string()))?;

        let count = matched.len();
        for path in matched {
            self.file(&path);
        }
        Ok(count)
    }

    /// Registered files ordered by target, one per target.
    /// The first registration of a target wins.
    pub fn files(&self) -> Vec<RemoteFile> {
        let mut by_target = BTreeMap::new();
        for file in self.files.lock().iter() {
            by_target
                .entry(file.target.clone())
                .or_insert_with(|| file.clone());
        }
        by_target.into_values().collect()
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}

fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    Some(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

/// Registers local files for the remote application payload
#[async_trait]
pub trait CopyContribution: Send + Sync {
    async fn copy(&self, registry: &RemoteCopyRegistry) -> Result<(), CopyError>;
}

/// The backend bundle: `package.json` plus `lib/backend/`
pub struct BackendCopyContribution;

#[async_trait]
impl CopyContribution for BackendCopyContribution {
    async fn copy(&self, registry: &RemoteCopyRegistry) -> Result<(), CopyError> {
        registry.file("package.json");
        registry.directory("lib/backend").await?;
        Ok(())
    }
}

pub struct RemoteCopyService {
    registry: RemoteCopyRegistry,
    contributions: Vec<Arc<dyn CopyContribution>>,
    native: Arc<NativeDependencyService>,
    manifest: OnceCell<Vec<RemoteFile>>,
}

impl RemoteCopyService {
    pub fn new(
        project_path: impl Into<PathBuf>,
        contributions: Vec<Arc<dyn CopyContribution>>,
        native: Arc<NativeDependencyService>,
    ) -> Self {
        Self {
            registry: RemoteCopyRegistry::new(project_path),
            contributions,
            native,
            manifest: OnceCell::new(),
        }
    }

    /// Files contributed to the payload, computed once
    pub async fn files(&self) -> Result<&[RemoteFile], CopyError> {
        let files = self
            .manifest
            .get_or_try_init(|| async {
                try_join_all(self.contributions.iter().map(|c| c.copy(&self.registry))).await?;
                let files = self.registry.files();
                debug!("[remote-copy] Manifest has {} files", files.len());
                Ok::<_, CopyError>(files)
            })
            .await?;
        Ok(files.as_slice())
    }

    async fn native_files(
        &self,
        platform: RemotePlatform,
        scratch: &Path,
    ) -> Result<Vec<NativeDependencyFile>, CopyError> {
        self.native
            .download_dependencies(platform, scratch)
            .await
            .map_err(|e| CopyError::Native(e.to_string()))
    }

    /// Upload the payload as one gzip tarball to `destination`
    pub async fn copy_archive(
        &self,
        transport: &dyn RemoteTransport,
        platform: RemotePlatform,
        destination: &str,
    ) -> Result<(), CopyError> {
        let files = self.files().await?.to_vec();
        let scratch = tempfile::tempdir()?;
        let native = self.native_files(platform, &scratch.path().join("native")).await?;

        let name = destination
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(destination)
            .to_string();
        let archive = scratch.path().join(name);
        let project = self.registry.project_path().to_path_buf();
        let archive_path = archive.clone();
        tokio::task::spawn_blocking(move || build_archive(&archive_path, &project, &files, &native))
            .await
            .map_err(|e| CopyError::Archive(e.to_string()))??;

        info!("[remote-copy] Uploading payload to {}", destination);
        transport.copy(&archive, destination).await?;
        // scratch (and the archive in it) is removed on drop
        Ok(())
    }

    /// Upload every payload file individually below `app_dir`
    pub async fn copy_files(
        &self,
        transport: &dyn RemoteTransport,
        platform: RemotePlatform,
        app_dir: &str,
    ) -> Result<(), CopyError> {
        let project = self.registry.project_path().to_path_buf();
        let scratch = tempfile::tempdir()?;
        let mut uploads: Vec<(PathBuf, String, Option<u32>)> = self
            .files()
            .await?
            .iter()
            .map(|f| (project.join(&f.path), f.target.clone(), f.mode))
            .collect();
        uploads.extend(
            self.native_files(platform, &scratch.path().join("native"))
                .await?
                .into_iter()
                .map(|f| (f.path, f.target, f.mode)),
        );

        let remote_path = |target: &str| {
            let mut segments = vec![app_dir];
            segments.extend(target.split('/'));
            platform.join_path(&segments)
        };

        let directories: BTreeSet<String> = uploads
            .iter()
            .filter_map(|(_, target, _)| target.rsplit_once('/').map(|(dir, _)| remote_path(dir)))
            .collect();
        for dir in &directories {
            let recursive = if platform == RemotePlatform::Windows { "" } else { " -p" };
            let result = transport
                .exec(&format!("mkdir{} {}", recursive, quote(platform, dir)))
                .await?;
            // Windows mkdir complains about existing directories
            if !result.stderr.is_empty() && platform != RemotePlatform::Windows {
                return Err(CopyError::Remote(result.stderr));
            }
        }

        info!("[remote-copy] Uploading {} files to {}", uploads.len(), app_dir);
        let results = join_all(uploads.iter().map(|(local, target, mode)| async move {
            let remote = remote_path(target);
            transport.copy(local, &remote).await?;
            if let (Some(mode), false) = (mode, platform == RemotePlatform::Windows) {
                let result = transport
                    .exec(&format!("chmod {:o} {}", mode, quote(platform, &remote)))
                    .await?;
                if !result.stderr.is_empty() {
                    return Err(CopyError::Remote(result.stderr));
                }
            }
            Ok::<_, CopyError>(())
        }))
        .await;
        results.into_iter().collect()
    }
}

fn build_archive(
    archive: &Path,
    project: &Path,
    files: &[RemoteFile],
    native: &[NativeDependencyFile],
) -> Result<(), CopyError> {
    let encoder = GzEncoder::new(File::create(archive)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for file in files {
        append(&mut builder, &project.join(&file.path), &file.target, file.mode)?;
    }
    for file in native {
        append(&mut builder, &file.path, &file.target, file.mode)?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

fn append<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    local: &Path,
    name: &str,
    mode: Option<u32>,
) -> Result<(), CopyError> {
    let mut source = File::open(local)?;
    let metadata = source.metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_metadata(&metadata);
    if let Some(mode) = mode {
        header.set_mode(mode);
    }
    builder.append_data(&mut header, name, &mut source)?;
    Ok(())
}
