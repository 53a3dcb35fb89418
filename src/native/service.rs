//! Contribution registry and concurrent installer

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, error, info};

use super::download::Downloader;
use super::extract::extract;
use super::types::{
    DependencyDownload, DownloadOptions, NativeDependencyContribution, NativeDependencyFile,
};
use super::NativeDependencyError;
use crate::config::NativeOptions;
use crate::setup::RemotePlatform;

pub struct NativeDependencyService {
    contributions: Vec<Arc<dyn NativeDependencyContribution>>,
    downloader: Arc<dyn Downloader>,
    options: NativeOptions,
}

impl NativeDependencyService {
    pub fn new(downloader: Arc<dyn Downloader>, options: NativeOptions) -> Self {
        Self {
            contributions: Vec::new(),
            downloader,
            options,
        }
    }

    /// Register a contribution. Returns false if its id is already taken.
    pub fn register(&mut self, contribution: Arc<dyn NativeDependencyContribution>) -> bool {
        let id = contribution.dependency_id();
        if self.contributions.iter().any(|c| c.dependency_id() == id) {
            debug!("[native-deps] Ignoring duplicate contribution {}", id);
            return false;
        }
        self.contributions.push(contribution);
        true
    }

    pub fn dependency_ids(&self) -> Vec<String> {
        self.contributions
            .iter()
            .map(|c| c.dependency_id().to_string())
            .collect()
    }

    /// Download every dependency for `platform` into `directory`.
    ///
    /// Contributions run concurrently and a failing one does not stop the
    /// others. Failures are reported together, tagged with their ids.
    pub async fn download_dependencies(
        &self,
        platform: RemotePlatform,
        directory: &Path,
    ) -> Result<Vec<NativeDependencyFile>, NativeDependencyError> {
        let options = DownloadOptions {
            remote_platform: platform,
            version: &self.options.version,
            base_url: &self.options.download_base_url,
            ripgrep_base_url: &self.options.ripgrep_base_url,
            downloader: self.downloader.as_ref(),
        };
        info!(
            "[native-deps] Downloading {} for {}",
            self.dependency_ids().join(", "),
            platform
        );

        let results = join_all(self.contributions.iter().map(|contribution| {
            let options = &options;
            async move {
                let id = contribution.dependency_id();
                let scratch = directory.join(id);
                let outcome = match contribution.download(options).await {
                    Ok(download) => store_dependency(download, &scratch).await,
                    Err(e) => Err(e),
                };
                outcome.map_err(|e| {
                    error!("[native-deps] Failed to download dependency {}: {}", id, e);
                    NativeDependencyError::Failed {
                        id: id.to_string(),
                        message: e.to_string(),
                    }
                })
            }
        }))
        .await;

        let mut files = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(stored) => files.extend(stored),
                Err(e) => failures.push(e),
            }
        }

        if !failures.is_empty() {
            return Err(NativeDependencyError::Incomplete(failures));
        }
        info!(
            "[native-deps] {} files ready for {}",
            files.len(),
            platform
        );
        Ok(files)
    }
}

/// Write or extract one download below `directory`
pub async fn store_dependency(
    download: DependencyDownload,
    directory: &Path,
) -> Result<Vec<NativeDependencyFile>, NativeDependencyError> {
    match download {
        DependencyDownload::File {
            archive: None,
            file,
            buffer,
        } => {
            tokio::fs::create_dir_all(directory).await?;
            let name = file
                .target_file
                .rsplit('/')
                .next()
                .unwrap_or(&file.target_file);
            let path = directory.join(name);
            tokio::fs::write(&path, &buffer).await?;
            Ok(vec![NativeDependencyFile {
                path,
                target: file.target_file,
                mode: file.mode,
            }])
        }
        DependencyDownload::File {
            archive: Some(kind),
            file,
            buffer,
        } => {
            let extracted = extract(kind, buffer, directory).await?;
            let first = extracted
                .into_iter()
                .next()
                .ok_or(NativeDependencyError::EmptyArchive)?;
            Ok(vec![NativeDependencyFile {
                path: local_path(directory, &first),
                target: file.target_file,
                mode: file.mode,
            }])
        }
        DependencyDownload::Directory {
            archive,
            files,
            buffer,
        } => {
            let extracted = extract(archive, buffer, directory).await?;
            Ok(extracted
                .iter()
                .map(|relative| {
                    let mapped = files(relative);
                    NativeDependencyFile {
                        path: local_path(directory, relative),
                        target: mapped.target_file,
                        mode: mapped.mode,
                    }
                })
                .collect())
        }
    }
}

fn local_path(directory: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(directory.to_path_buf(), |path, part| path.join(part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::contributions::builtin_contributions;
    use crate::native::download::DownloadError;
    use crate::native::extract::tests::{tgz_bytes, zip_bytes};
    use crate::native::types::{ArchiveKind, FileDependencyResult};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Serves a zip for every URL except those containing `fail`
    #[derive(Default)]
    struct FakeDownloader {
        fail: Option<&'static str>,
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Downloader for FakeDownloader {
        async fn download(&self, url: &str) -> Result<Bytes, DownloadError> {
            self.requested.lock().push(url.to_string());
            if self.fail.is_some_and(|f| url.contains(f)) {
                return Err(DownloadError::Status {
                    url: url.to_string(),
                    status: 404,
                });
            }
            if url.ends_with(".tar.gz") {
                return Ok(tgz_bytes(&[("ripgrep/bin/rg", b"rg")]));
            }
            if url.contains("node-pty") {
                return Ok(zip_bytes(&[
                    ("build/Release/pty.node", b"pty"),
                    ("build/Release/spawn-helper", b"helper"),
                ]));
            }
            Ok(zip_bytes(&[("build/Release/module.node", b"module")]))
        }
    }

    fn service(downloader: FakeDownloader) -> NativeDependencyService {
        let options = NativeOptions {
            download_base_url: "https://dl.example.com".into(),
            version: "1.2.3".into(),
            ripgrep_base_url: "https://rg.example.com/rg".into(),
        };
        let mut service = NativeDependencyService::new(Arc::new(downloader), options);
        for contribution in builtin_contributions() {
            service.register(contribution);
        }
        service
    }

    #[tokio::test]
    async fn test_raw_buffer_written_to_basename() {
        let dir = TempDir::new().unwrap();
        let files = store_dependency(
            DependencyDownload::File {
                archive: None,
                file: FileDependencyResult::new("lib/backend/native/tool").with_mode(0o755),
                buffer: Bytes::from_static(b"raw"),
            },
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, dir.path().join("tool"));
        assert_eq!(files[0].target, "lib/backend/native/tool");
        assert_eq!(files[0].mode, Some(0o755));
        assert_eq!(std::fs::read(&files[0].path).unwrap(), b"raw");
    }

    #[tokio::test]
    async fn test_archived_file_maps_first_entry() {
        let dir = TempDir::new().unwrap();
        let buffer = zip_bytes(&[("first.node", b"1"), ("second.node", b"2")]);
        let files = store_dependency(
            DependencyDownload::File {
                archive: Some(ArchiveKind::Zip),
                file: FileDependencyResult::new("lib/backend/native/keytar.node"),
                buffer,
            },
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, dir.path().join("first.node"));
        assert_eq!(files[0].target, "lib/backend/native/keytar.node");
        // the raw buffer is never written under the target's basename
        assert!(!dir.path().join("keytar.node").exists());
    }

    #[tokio::test]
    async fn test_duplicate_id_first_wins() {
        let mut service = service(FakeDownloader::default());
        let again = builtin_contributions().remove(0);
        assert!(!service.register(again));
        assert_eq!(service.dependency_ids().len(), 6);
    }

    #[tokio::test]
    async fn test_download_all_for_linux() {
        let dir = TempDir::new().unwrap();
        let service = service(FakeDownloader::default());
        let files = service
            .download_dependencies(RemotePlatform::Linux, dir.path())
            .await
            .unwrap();

        let targets: Vec<_> = files.iter().map(|f| f.target.as_str()).collect();
        assert!(targets.contains(&"lib/backend/native/keytar.node"));
        assert!(targets.contains(&"lib/backend/native/findGitRepos.node"));
        assert!(targets.contains(&"lib/backend/native/pty.node"));
        assert!(targets.contains(&"lib/build/Release/spawn-helper"));

        let rg = files.iter().find(|f| f.target == "lib/backend/native/rg").unwrap();
        assert_eq!(rg.mode, Some(0o777));
        assert_eq!(std::fs::read(&rg.path).unwrap(), b"rg");
    }

    #[tokio::test]
    async fn test_urls_follow_convention() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(FakeDownloader::default());
        let mut service = NativeDependencyService::new(
            downloader.clone(),
            NativeOptions {
                download_base_url: "https://dl.example.com/".into(),
                version: "1.2.3".into(),
                ripgrep_base_url: "https://rg.example.com/rg".into(),
            },
        );
        for contribution in builtin_contributions() {
            service.register(contribution);
        }
        service
            .download_dependencies(RemotePlatform::Darwin, dir.path())
            .await
            .unwrap();
        let requested = downloader.requested.lock().clone();
        assert!(requested.contains(&"https://dl.example.com/1.2.3/drivelist-darwin-x64.zip".to_string()));
        assert!(requested.contains(&"https://rg.example.com/rg-x86_64-apple-darwin.tar.gz".to_string()));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_others() {
        let dir = TempDir::new().unwrap();
        let service = service(FakeDownloader {
            fail: Some("nsfw"),
            ..Default::default()
        });
        let err = service
            .download_dependencies(RemotePlatform::Linux, dir.path())
            .await
            .unwrap_err();

        let NativeDependencyError::Incomplete(failures) = &err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], NativeDependencyError::Failed { id, .. } if id == "nsfw"));
        assert!(err.to_string().contains("Failed to download dependency nsfw"));
        // siblings still completed
        assert!(dir.path().join("keytar").join("build/Release/module.node").exists());
        assert!(dir.path().join("node-pty").join("build/Release/spawn-helper").exists());
    }
}
