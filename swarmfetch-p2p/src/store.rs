//! Local content lookup for uploads.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use swarmfetch_core::ContentHash;
use tokio::io::AsyncRead;

use crate::protocol::RequestPayload;

/// An open file ready to be streamed to a peer.
pub struct ContentReader {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub size: u64,
}

impl std::fmt::Debug for ContentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentReader").field("size", &self.size).finish()
    }
}

/// Where uploaded content comes from.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Open the content named by `request`, or `None` if it is not held.
    async fn open(&self, request: &RequestPayload) -> io::Result<Option<ContentReader>>;
}

/// Files under a root directory.
///
/// Content-addressed objects live at `objects/<first two hex>/<hash>`;
/// path requests resolve relative to the root and must stay inside it.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of a content-addressed object.
    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.root
            .join("objects")
            .join(hash.prefix())
            .join(hash.as_str())
    }

    /// Store `data` as the object for `hash`.
    pub async fn put_object(&self, hash: &ContentHash, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.object_path(hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    async fn resolve(&self, request: &RequestPayload) -> io::Result<Option<PathBuf>> {
        let candidate = match request {
            RequestPayload::Hash(hash) => self.object_path(hash),
            RequestPayload::Path { path, .. } => self.root.join(path.as_path()),
        };

        let resolved = match tokio::fs::canonicalize(&candidate).await {
            Ok(resolved) => resolved,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let root = tokio::fs::canonicalize(&self.root).await?;

        // Symlinks must not lead outside the root
        if !resolved.starts_with(&root) {
            tracing::warn!(path = %candidate.display(), "Content path escapes store root");
            return Ok(None);
        }
        Ok(Some(resolved))
    }
}

#[async_trait]
impl ContentStore for DirStore {
    async fn open(&self, request: &RequestPayload) -> io::Result<Option<ContentReader>> {
        let Some(path) = self.resolve(request).await? else {
            return Ok(None);
        };

        let file = tokio::fs::File::open(&path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Ok(None);
        }
        Ok(Some(ContentReader {
            reader: Box::pin(file),
            size: metadata.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SafePath;
    use tokio::io::AsyncReadExt;

    const SHA1_ABC: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";

    #[tokio::test]
    async fn test_object_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        let hash = ContentHash::parse(SHA1_ABC).unwrap();

        let path = store.put_object(&hash, b"abc").await.unwrap();
        assert!(path.ends_with(format!("objects/a9/{}", SHA1_ABC)));

        let mut content = store
            .open(&RequestPayload::Hash(hash))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.size, 3);

        let mut buf = Vec::new();
        content.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"abc");
    }

    #[tokio::test]
    async fn test_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        let hash = ContentHash::parse(SHA1_ABC).unwrap();
        assert!(store.open(&RequestPayload::Hash(hash)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_path_lookup() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("libraries"))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("libraries/lib.jar"), b"jar")
            .await
            .unwrap();

        let store = DirStore::new(dir.path());
        let request = RequestPayload::Path {
            hash: ContentHash::parse(SHA1_ABC).unwrap(),
            path: SafePath::parse("libraries/lib.jar").unwrap(),
        };
        let content = store.open(&request).await.unwrap().unwrap();
        assert_eq!(content.size, 3);

        let dir_request = RequestPayload::Path {
            hash: ContentHash::parse(SHA1_ABC).unwrap(),
            path: SafePath::parse("libraries").unwrap(),
        };
        assert!(store.open(&dir_request).await.unwrap().is_none());
    }
}
