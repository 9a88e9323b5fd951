use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::PipelineError;
use crate::traits::BlobStorage;

const DOCUMENT_EXTENSIONS: [&str; 6] = ["txt", "md", "markdown", "html", "htm", "pdf"];

pub fn discover_document_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_document = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                DOCUMENT_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            });

        if is_document {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Default)]
pub struct FsBlobStorage;

#[async_trait]
impl BlobStorage for FsBlobStorage {
    async fn read(&self, locator: &str) -> Result<Vec<u8>, PipelineError> {
        Ok(tokio::fs::read(locator).await?)
    }

    async fn exists(&self, locator: &str) -> Result<bool, PipelineError> {
        Ok(tokio::fs::try_exists(locator).await?)
    }

    async fn size(&self, locator: &str) -> Result<u64, PipelineError> {
        let metadata = tokio::fs::metadata(locator).await?;
        Ok(metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_recursive_and_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("b.txt")).and_then(|mut file| file.write_all(b"beta"))?;
        File::create(nested.join("a.md")).and_then(|mut file| file.write_all(b"alpha"))?;
        File::create(base.join("skip.bin")).and_then(|mut file| file.write_all(b"binary"))?;

        let files = discover_document_files(base);
        assert_eq!(files.len(), 2);
        assert!(files.windows(2).all(|pair| pair[0] <= pair[1]));
        Ok(())
    }

    #[tokio::test]
    async fn storage_reads_and_sizes_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("doc.txt");
        fs::write(&path, b"hello storage")?;

        let storage = FsBlobStorage;
        let locator = path.to_string_lossy().to_string();

        assert!(storage.exists(&locator).await?);
        assert_eq!(storage.size(&locator).await?, 13);
        assert_eq!(storage.read(&locator).await?, b"hello storage");
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let storage = FsBlobStorage;
        let result = storage.read("/definitely/not/here.txt").await;
        assert!(matches!(result, Err(PipelineError::Io(_))));
    }
}
