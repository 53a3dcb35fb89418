//! Native Dependency Installer
//!
//! The remote backend loads a handful of prebuilt native modules that must
//! match the remote platform rather than the local one. Each is provided by
//! an independently registered [`NativeDependencyContribution`]:
//!
//! ```text
//! NativeDependencyService
//!   ├── drivelist / keytar / nsfw / find-git-repositories  (zip, one file)
//!   ├── ripgrep                                            (zip|tgz, 0o777)
//!   └── node-pty                                           (zip, directory)
//!          │ download (concurrently)
//!          ▼
//!   raw buffer ──► <scratch>/<id>/<basename>
//!   archive    ──► extract ──► map entries ──► NativeDependencyFile[]
//! ```
//!
//! The resulting files are handed to the copy service, which ships them to
//! their target paths inside the remote application directory.

pub mod contributions;
pub mod download;
pub mod extract;
pub mod service;
pub mod types;

pub use contributions::builtin_contributions;
pub use download::{DownloadError, Downloader, HttpDownloader};
pub use service::NativeDependencyService;
pub use types::{
    ArchiveKind, DependencyDownload, DownloadOptions, FileDependencyResult, FileMapper,
    NativeDependencyContribution, NativeDependencyFile,
};

#[derive(Debug, thiserror::Error)]
pub enum NativeDependencyError {
    #[error("{0}")]
    Download(#[from] DownloadError),

    #[error("Failed to extract archive: {0}")]
    Extract(String),

    #[error("Archive contained no files")]
    EmptyArchive,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to download dependency {id}: {message}")]
    Failed { id: String, message: String },

    #[error("{}", join_failures(.0))]
    Incomplete(Vec<NativeDependencyError>),
}

fn join_failures(failures: &[NativeDependencyError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
