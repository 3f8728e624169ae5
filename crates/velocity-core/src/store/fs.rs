//! Filesystem-backed document store.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use super::{DocumentStore, DocumentStoreError};

/// Serves documents from a root directory, keyed by relative path.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a store path under the root, rejecting traversal components.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn download(&self, path: &str) -> Result<Bytes, DocumentStoreError> {
        let Some(full) = self.resolve(path) else {
            return Err(DocumentStoreError::NotFound { path: path.into() });
        };
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DocumentStoreError::NotFound { path: path.into() })
            }
            Err(e) => Err(DocumentStoreError::Io {
                path: path.into(),
                source: e,
            }),
        }
    }
}
