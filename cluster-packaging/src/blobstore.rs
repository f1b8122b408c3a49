// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Content-addressed blob storage.

Blobs live on the filesystem under a two-level sharded layout derived
from their SHA-512 digest. Writes stream into a temporary file in the
same filesystem and are published with an atomic rename, so concurrent
writers of identical content converge on one file without locking.
*/

use {
    crate::{
        error::{ClusterPackagingError, Result},
        io::{ContentDigest, Digester, PackageStream},
    },
    chrono::{DateTime, Utc},
    futures::AsyncReadExt,
    std::{
        io::Write,
        path::{Path, PathBuf},
    },
};

/// Size and creation time of a stored blob.
#[derive(Clone, Debug)]
pub struct BlobEnvelope {
    pub digest: ContentDigest,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Filesystem-backed blob store.
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open a blob store rooted at the given directory, creating it if
    /// necessary.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        std::fs::create_dir_all(&root)
            .map_err(|e| ClusterPackagingError::IoPath(format!("{}", root.display()), e))?;

        Ok(Self { root })
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.digest_hex();

        self.root.join(&hex[0..2]).join(hex)
    }

    /// Write a blob from a stream.
    ///
    /// The digest is computed as content is written. Writing content
    /// that already exists is a no-op returning the existing digest.
    pub async fn write_blob(&self, mut reader: PackageStream) -> Result<(ContentDigest, u64)> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| ClusterPackagingError::IoPath(format!("{}", self.root.display()), e))?;

        let mut digester = Digester::default();
        let mut buf = [0u8; 32768];

        loop {
            let count = reader.read(&mut buf).await?;
            if count == 0 {
                break;
            }

            digester.update(&buf[0..count]);
            temp.write_all(&buf[0..count])?;
        }

        let (digest, size) = digester.finish();
        let dest_path = self.blob_path(&digest);

        if dest_path.exists() {
            // Content-addressed: an existing file has identical bytes.
            return Ok((digest, size));
        }

        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ClusterPackagingError::IoPath(format!("{}", parent.display()), e))?;
        }

        temp.persist(&dest_path).map_err(|e| {
            ClusterPackagingError::IoPath(format!("{}", dest_path.display()), e.error)
        })?;

        Ok((digest, size))
    }

    /// Open a blob for reading.
    pub fn open_blob(&self, digest: &ContentDigest) -> Result<PackageStream> {
        let path = self.blob_path(digest);

        let file = std::fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ClusterPackagingError::NotFound(format!("blob {}", digest))
            } else {
                ClusterPackagingError::IoPath(format!("{}", path.display()), e)
            }
        })?;

        Ok(Box::pin(futures::io::AllowStdIo::new(
            std::io::BufReader::new(file),
        )))
    }

    /// Obtain size and modification time of a blob.
    pub fn blob_envelope(&self, digest: &ContentDigest) -> Result<BlobEnvelope> {
        let path = self.blob_path(digest);

        let metadata = std::fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ClusterPackagingError::NotFound(format!("blob {}", digest))
            } else {
                ClusterPackagingError::IoPath(format!("{}", path.display()), e)
            }
        })?;

        Ok(BlobEnvelope {
            digest: digest.clone(),
            size_bytes: metadata.len(),
            modified: metadata.modified()?.into(),
        })
    }

    /// Whether a blob exists.
    pub fn exists(&self, digest: &ContentDigest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Delete a blob.
    pub fn delete_blob(&self, digest: &ContentDigest) -> Result<()> {
        let path = self.blob_path(digest);

        std::fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ClusterPackagingError::NotFound(format!("blob {}", digest))
            } else {
                ClusterPackagingError::IoPath(format!("{}", path.display()), e)
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stream(data: &[u8]) -> PackageStream {
        Box::pin(futures::io::Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn write_read_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = BlobStore::open(dir.path())?;

        let (digest, size) = store.write_blob(stream(b"blob content")).await?;

        assert_eq!(size, 12);
        assert_eq!(digest, ContentDigest::of(b"blob content"));
        assert!(store.exists(&digest));

        let mut reader = store.open_blob(&digest)?;
        let mut read_back = vec![];
        reader.read_to_end(&mut read_back).await?;
        assert_eq!(read_back, b"blob content");

        Ok(())
    }

    #[tokio::test]
    async fn second_write_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = BlobStore::open(dir.path())?;

        let (first, _) = store.write_blob(stream(b"same")).await?;
        let (second, _) = store.write_blob(stream(b"same")).await?;

        assert_eq!(first, second);
        assert_eq!(store.blob_envelope(&first)?.size_bytes, 4);

        Ok(())
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = BlobStore::open(dir.path())?;
        let digest = ContentDigest::of(b"never written");

        assert!(matches!(
            store.open_blob(&digest),
            Err(ClusterPackagingError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_blob(&digest),
            Err(ClusterPackagingError::NotFound(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = BlobStore::open(dir.path())?;

        let (digest, _) = store.write_blob(stream(b"to delete")).await?;
        store.delete_blob(&digest)?;

        assert!(!store.exists(&digest));

        Ok(())
    }
}
