//! Archive extraction into a scratch directory
//!
//! Returns the relative paths of the extracted regular files in archive
//! order. Runs on the blocking pool.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;

use super::types::ArchiveKind;
use super::NativeDependencyError;

/// Extract `buffer` into `directory`
pub async fn extract(
    kind: ArchiveKind,
    buffer: Bytes,
    directory: &Path,
) -> Result<Vec<String>, NativeDependencyError> {
    let directory = directory.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(kind, &buffer, &directory))
        .await
        .map_err(|e| NativeDependencyError::Extract(e.to_string()))?
}

fn extract_blocking(
    kind: ArchiveKind,
    buffer: &[u8],
    directory: &Path,
) -> Result<Vec<String>, NativeDependencyError> {
    std::fs::create_dir_all(directory)?;
    match kind {
        ArchiveKind::Tar => extract_tar(tar::Archive::new(Cursor::new(buffer)), directory),
        ArchiveKind::Tgz => extract_tar(
            tar::Archive::new(GzDecoder::new(Cursor::new(buffer))),
            directory,
        ),
        ArchiveKind::Zip => extract_zip(buffer, directory),
    }
}

fn extract_tar<R: std::io::Read>(
    mut archive: tar::Archive<R>,
    directory: &Path,
) -> Result<Vec<String>, NativeDependencyError> {
    let mut files = Vec::new();
    let entries = archive
        .entries()
        .map_err(|e| NativeDependencyError::Extract(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| NativeDependencyError::Extract(e.to_string()))?;
        let is_file = entry.header().entry_type().is_file();
        let path: PathBuf = entry
            .path()
            .map_err(|e| NativeDependencyError::Extract(e.to_string()))?
            .into_owned();
        // unpack_in refuses paths escaping the directory
        let unpacked = entry
            .unpack_in(directory)
            .map_err(|e| NativeDependencyError::Extract(e.to_string()))?;
        if is_file && unpacked {
            files.push(relative_string(&path));
        }
    }
    Ok(files)
}

fn extract_zip(buffer: &[u8], directory: &Path) -> Result<Vec<String>, NativeDependencyError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(buffer))
        .map_err(|e| NativeDependencyError::Extract(e.to_string()))?;
    let mut files = Vec::new();
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| NativeDependencyError::Extract(e.to_string()))?;
        let Some(relative) = file.enclosed_name() else {
            continue;
        };
        let target = directory.join(&relative);
        if file.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut file, &mut out)?;
        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o7777))?;
        }
        files.push(relative_string(&relative));
    }
    Ok(files)
}

fn relative_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    pub fn tgz_bytes(entries: &[(&str, &[u8])]) -> Bytes {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        Bytes::from(builder.into_inner().unwrap().finish().unwrap())
    }

    #[tokio::test]
    async fn test_extract_zip_in_order() {
        let dir = TempDir::new().unwrap();
        let buffer = zip_bytes(&[("build/a.node", b"A"), ("build/b.so", b"B")]);
        let files = extract(ArchiveKind::Zip, buffer, dir.path()).await.unwrap();
        assert_eq!(files, vec!["build/a.node", "build/b.so"]);
        assert_eq!(std::fs::read(dir.path().join("build/b.so")).unwrap(), b"B");
    }

    #[tokio::test]
    async fn test_extract_tgz() {
        let dir = TempDir::new().unwrap();
        let buffer = tgz_bytes(&[("rg-13/rg", b"binary")]);
        let files = extract(ArchiveKind::Tgz, buffer, dir.path()).await.unwrap();
        assert_eq!(files, vec!["rg-13/rg"]);
        assert_eq!(std::fs::read(dir.path().join("rg-13/rg")).unwrap(), b"binary");
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_error() {
        let dir = TempDir::new().unwrap();
        let err = extract(ArchiveKind::Zip, Bytes::from_static(b"nope"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, NativeDependencyError::Extract(_)));
    }
}
