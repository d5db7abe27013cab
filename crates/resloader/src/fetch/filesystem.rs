//! Support to fetch resources from the local filesystem.

use std::io;
use std::path::Path;

use tokio::fs;

use crate::error::{LoadError, LoadResult};
use crate::types::Payload;

/// Fetcher implementation for local filesystem sources.
#[derive(Debug)]
pub struct FilesystemFetcher {}

impl FilesystemFetcher {
    pub fn new() -> Self {
        Self {}
    }

    /// Reads a resource from the local filesystem.
    ///
    /// Filesystem payloads carry no header metadata.
    pub async fn fetch_source(&self, path: &Path) -> LoadResult<Payload> {
        tracing::debug!("Reading resource from {:?}", path);

        match fs::read(path).await {
            Ok(bytes) => Ok(Payload::from_body(bytes.into())),
            Err(e) => match e.kind() {
                io::ErrorKind::NotFound => Err(LoadError::NotFound),
                io::ErrorKind::PermissionDenied => Err(LoadError::PermissionDenied(e.to_string())),
                _ => Err(LoadError::Fetch(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_local_files() {
        let dir = resloader_test::tempdir();
        let path = dir.path().join("resource.bin");
        std::fs::write(&path, b"local bytes").unwrap();

        let fetcher = FilesystemFetcher::new();
        let payload = fetcher.fetch_source(&path).await.unwrap();

        assert_eq!(payload.body, bytes::Bytes::from("local bytes"));
        assert!(payload.headers.is_empty());
    }

    #[tokio::test]
    async fn missing_files_are_not_found() {
        let dir = resloader_test::tempdir();

        let fetcher = FilesystemFetcher::new();
        let result = fetcher.fetch_source(&dir.path().join("nope")).await;

        assert_eq!(result, Err(LoadError::NotFound));
    }
}
