//! Instance work directories
//!
//! A cloned instance starts from a copy of its source's work directory
//! `<storage>/<id>`. Only local storage (a bare path or `file://`) is
//! supported.

use conduit_core::domain::pipeline::PipelineSpec;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

const FILE_SCHEME: &str = "file://";

#[derive(Debug, Error)]
pub enum WorkDirError {
    #[error("unsupported storage location {0}")]
    UnsupportedScheme(String),

    #[error("cannot copy {src} to {dst}: {source}")]
    Io {
        src: String,
        dst: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, WorkDirError>;

/// Local path of a storage location
pub fn local_path(location: &str) -> Result<PathBuf> {
    if let Some(path) = location.strip_prefix(FILE_SCHEME) {
        return Ok(PathBuf::from(path));
    }
    if location.contains("://") {
        return Err(WorkDirError::UnsupportedScheme(location.to_string()));
    }
    Ok(PathBuf::from(location))
}

/// Copies the work directory of instance `from` to the one of instance `to`
///
/// Returns `false` when there was nothing to copy: the spec has no storage
/// or the source never wrote its directory.
pub async fn copy_work_dir(spec: &PipelineSpec, from: u64, to: u64) -> Result<bool> {
    if spec.storage.is_empty() {
        return Ok(false);
    }

    let src_dir = spec.work_dir(from);
    let dst_dir = spec.work_dir(to);
    let src = local_path(&src_dir)?;
    let dst = local_path(&dst_dir)?;

    let io_error = |source| WorkDirError::Io {
        src: src_dir.clone(),
        dst: dst_dir.clone(),
        source,
    };

    match fs::metadata(&src).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_error(e)),
    }

    let copied = copy_directory_contents(&src, &dst).await.map_err(io_error)?;
    tracing::debug!("Copied {} file(s) from {} to {}", copied, src_dir, dst_dir);
    Ok(true)
}

async fn copy_directory_contents(src: &Path, dst: &Path) -> io::Result<usize> {
    fs::create_dir_all(dst).await?;

    let mut count = 0;
    let mut entries = fs::read_dir(src).await?;

    while let Some(entry) = entries.next_entry().await? {
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type().await?;

        if file_type.is_dir() {
            count += Box::pin(copy_directory_contents(&src_path, &dst_path)).await?;
        } else if file_type.is_file() {
            fs::copy(&src_path, &dst_path).await?;
            count += 1;
        } else {
            tracing::debug!("Skipping {} (not a regular file)", src_path.display());
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(storage: &str) -> PipelineSpec {
        PipelineSpec {
            storage: storage.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("file:///data/etl").unwrap(), PathBuf::from("/data/etl"));
        assert_eq!(local_path("/data/etl").unwrap(), PathBuf::from("/data/etl"));
        assert!(matches!(
            local_path("gs://bucket/etl"),
            Err(WorkDirError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_copies_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("1");
        std::fs::create_dir_all(source.join("shards/a")).unwrap();
        std::fs::write(source.join("manifest.json"), "{}").unwrap();
        std::fs::write(source.join("shards/a/part-0"), "rows").unwrap();

        let storage = format!("file://{}", dir.path().display());
        assert!(copy_work_dir(&spec(&storage), 1, 2).await.unwrap());

        let target = dir.path().join("2");
        assert_eq!(std::fs::read_to_string(target.join("manifest.json")).unwrap(), "{}");
        assert_eq!(
            std::fs::read_to_string(target.join("shards/a/part-0")).unwrap(),
            "rows"
        );
        assert!(source.join("manifest.json").exists());
    }

    #[tokio::test]
    async fn test_nothing_to_copy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().display().to_string();

        assert!(!copy_work_dir(&spec(""), 1, 2).await.unwrap());
        assert!(!copy_work_dir(&spec(&storage), 1, 2).await.unwrap());
        assert!(!dir.path().join("2").exists());
    }

    #[tokio::test]
    async fn test_remote_storage_is_refused() {
        let result = copy_work_dir(&spec("gs://bucket/etl"), 1, 2).await;
        assert!(matches!(result, Err(WorkDirError::UnsupportedScheme(_))));
    }
}
