// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The on-disk package store. */

use {
    crate::{
        archive,
        blobstore::BlobStore,
        catalog::Catalog,
        envelope::{Envelope, PackageOptions, Repository, RuntimeLabels},
        error::{ClusterPackagingError, Result},
        io::PackageStream,
        locator::{validate_repository_name, Locator},
        store::{resolve_latest, PackageStore},
        BLOBS_DIR, CATALOG_FILE_NAME, UNPACKED_DIR,
    },
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    std::path::{Path, PathBuf},
};

/// Identity recorded on packages created without an explicit creator.
const DEFAULT_CREATED_BY: &str = "cluster-packaging";

/// Marker file signalling a completed unpack.
const UNPACKED_MARKER: &str = ".unpacked";

/// Package store backed by a state directory.
///
/// The directory holds the catalog database, the content-addressed
/// blob tree, and a lazily populated tree of unpacked package content.
pub struct LocalPackageStore {
    base_dir: PathBuf,
    catalog: Catalog,
    blobs: BlobStore,
    read_only: bool,
}

impl LocalPackageStore {
    /// Open a writable store in the given state directory, creating
    /// the layout on first use.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();

        let catalog = Catalog::open(base_dir.join(CATALOG_FILE_NAME))?;
        let blobs = BlobStore::open(base_dir.join(BLOBS_DIR))?;

        Ok(Self {
            base_dir,
            catalog,
            blobs,
            read_only: false,
        })
    }

    /// Open an existing store for reading only.
    ///
    /// No writer lock is taken, so this can inspect a state directory
    /// another process is building in, or an unpacked installer image.
    pub fn open_read_only(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();

        let catalog = Catalog::open_read_only(base_dir.join(CATALOG_FILE_NAME))?;
        let blobs = BlobStore::open(base_dir.join(BLOBS_DIR))?;

        Ok(Self {
            base_dir,
            catalog,
            blobs,
            read_only: true,
        })
    }

    /// Root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(ClusterPackagingError::AccessDenied(
                "package store is read-only".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Conventional directory a package unpacks into.
    pub fn unpacked_path(&self, locator: &Locator) -> PathBuf {
        self.base_dir
            .join(UNPACKED_DIR)
            .join(&locator.repository)
            .join(&locator.name)
            .join(&locator.version)
    }

    /// Extract a package's payload into an arbitrary directory.
    pub async fn unpack_into(&self, locator: &Locator, target: &Path) -> Result<()> {
        let (_, payload) = self.read_package(locator).await?;

        std::fs::create_dir_all(target)
            .map_err(|e| ClusterPackagingError::IoPath(format!("{}", target.display()), e))?;

        archive::unpack_stream(payload, target).await
    }

    /// Extract a package's payload into its conventional directory.
    ///
    /// Idempotent: a completed unpack leaves a marker file and later
    /// calls return without touching the tree.
    pub async fn unpack(&self, locator: &Locator) -> Result<PathBuf> {
        let locator = resolve_latest(self, locator).await?;
        let target = self.unpacked_path(&locator);

        if target.join(UNPACKED_MARKER).exists() {
            return Ok(target);
        }

        self.unpack_into(&locator, &target).await?;

        std::fs::write(target.join(UNPACKED_MARKER), b"")?;

        Ok(target)
    }

    /// Delete the payload blob unless other envelopes still reference it.
    fn try_delete_blob(&self, envelope: &Envelope) -> Result<()> {
        if self.catalog.count_digest_references(&envelope.sha512)? > 0 {
            return Ok(());
        }

        let digest = envelope.digest()?;

        if self.blobs.exists(&digest) {
            self.blobs.delete_blob(&digest)?;
        }

        Ok(())
    }

    async fn write_package(
        &self,
        locator: &Locator,
        payload: PackageStream,
        options: PackageOptions,
        replace: bool,
    ) -> Result<Envelope> {
        self.check_writable()?;

        if locator.is_latest() || locator.is_zero_version() {
            return Err(ClusterPackagingError::BadParameter(format!(
                "cannot store package under meta-version locator {}",
                locator
            )));
        }

        let (digest, size) = self.blobs.write_blob(payload).await?;

        let envelope = Envelope {
            locator: locator.clone(),
            size_bytes: size,
            sha512: digest.digest_hex(),
            runtime_labels: options.labels,
            hidden: options.hidden,
            encrypted: options.encrypted,
            package_type: options.package_type,
            manifest: options.manifest,
            created: Utc::now(),
            created_by: options
                .created_by
                .unwrap_or_else(|| DEFAULT_CREATED_BY.to_string()),
        };

        if replace {
            // A replaced envelope may orphan its previous blob.
            let previous = self.catalog.get_package(locator)?;

            self.catalog.insert_package(&envelope, true)?;

            if let Some(previous) = previous {
                if previous.sha512 != envelope.sha512 {
                    self.try_delete_blob(&previous)?;
                }
            }
        } else {
            self.catalog.insert_package(&envelope, false)?;
        }

        Ok(envelope)
    }
}

#[async_trait]
impl PackageStore for LocalPackageStore {
    async fn upsert_repository(
        &self,
        name: &str,
        expires: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.check_writable()?;
        validate_repository_name(name)?;

        self.catalog.upsert_repository(name, expires)
    }

    async fn get_repositories(&self) -> Result<Vec<Repository>> {
        self.catalog.get_repositories()
    }

    async fn get_repository(&self, name: &str) -> Result<Repository> {
        self.catalog.get_repository(name)
    }

    async fn delete_repository(&self, name: &str) -> Result<()> {
        self.check_writable()?;

        for envelope in self.catalog.delete_repository(name)? {
            self.try_delete_blob(&envelope)?;
        }

        Ok(())
    }

    async fn get_packages(&self, repository: &str) -> Result<Vec<Envelope>> {
        self.catalog.get_packages(repository)
    }

    async fn create_package(
        &self,
        locator: &Locator,
        payload: PackageStream,
        options: PackageOptions,
    ) -> Result<Envelope> {
        // Creation requires the repository to already exist.
        self.catalog.get_repository(&locator.repository)?;

        self.write_package(locator, payload, options, false).await
    }

    async fn upsert_package(
        &self,
        locator: &Locator,
        payload: PackageStream,
        options: PackageOptions,
    ) -> Result<Envelope> {
        self.check_writable()?;
        self.catalog.upsert_repository(&locator.repository, None)?;

        self.write_package(locator, payload, options, true).await
    }

    async fn read_package(&self, locator: &Locator) -> Result<(Envelope, PackageStream)> {
        let envelope = self.read_package_envelope(locator).await?;
        let payload = self.blobs.open_blob(&envelope.digest()?)?;

        Ok((envelope, payload))
    }

    async fn read_package_envelope(&self, locator: &Locator) -> Result<Envelope> {
        let locator = resolve_latest(self, locator).await?;

        self.catalog
            .get_package(&locator)?
            .ok_or(ClusterPackagingError::PackageNotFound(locator))
    }

    async fn delete_package(&self, locator: &Locator) -> Result<()> {
        self.check_writable()?;

        let envelope = self.catalog.delete_package(locator)?;
        self.try_delete_blob(&envelope)?;

        let unpacked = self.unpacked_path(locator);
        if unpacked.exists() {
            std::fs::remove_dir_all(&unpacked).map_err(|e| {
                ClusterPackagingError::IoPath(format!("{}", unpacked.display()), e)
            })?;
        }

        Ok(())
    }

    async fn update_package_labels(
        &self,
        locator: &Locator,
        add: RuntimeLabels,
        remove: Vec<String>,
    ) -> Result<()> {
        self.check_writable()?;

        let locator = resolve_latest(self, locator).await?;

        self.catalog.update_labels(&locator, &add, &remove)
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::io::ContentDigest, futures::AsyncReadExt};

    fn payload(data: &[u8]) -> PackageStream {
        Box::pin(futures::io::Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn create_requires_repository() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;
        let locator = Locator::parse("example.com/app:1.0.0")?;

        assert!(matches!(
            store
                .create_package(&locator, payload(b"data"), PackageOptions::default())
                .await,
            Err(ClusterPackagingError::RepositoryNotFound(_))
        ));

        store.upsert_repository("example.com", None).await?;
        store
            .create_package(&locator, payload(b"data"), PackageOptions::default())
            .await?;

        // Same locator again is a conflict.
        assert!(matches!(
            store
                .create_package(&locator, payload(b"data"), PackageOptions::default())
                .await,
            Err(ClusterPackagingError::PackageExists(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn upsert_then_read_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;
        let locator = Locator::parse("example.com/app:1.0.0")?;

        let envelope = store
            .upsert_package(&locator, payload(b"payload bytes"), PackageOptions::default())
            .await?;

        assert_eq!(
            envelope.sha512,
            ContentDigest::of(b"payload bytes").digest_hex()
        );

        let (read_envelope, mut stream) = store.read_package(&locator).await?;
        assert_eq!(read_envelope.sha512, envelope.sha512);

        let mut data = vec![];
        stream.read_to_end(&mut data).await?;
        assert_eq!(data, b"payload bytes");

        // Upserting identical content is observationally a no-op.
        let again = store
            .upsert_package(&locator, payload(b"payload bytes"), PackageOptions::default())
            .await?;
        assert_eq!(again.sha512, envelope.sha512);
        assert_eq!(again.size_bytes, envelope.size_bytes);

        Ok(())
    }

    #[tokio::test]
    async fn delete_is_not_found_twice() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;
        let locator = Locator::parse("example.com/app:1.0.0")?;

        store
            .upsert_package(&locator, payload(b"data"), PackageOptions::default())
            .await?;

        store.delete_package(&locator).await?;

        assert!(matches!(
            store.delete_package(&locator).await,
            Err(ClusterPackagingError::PackageNotFound(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn shared_blob_survives_until_last_reference() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;

        let a = Locator::parse("example.com/a:1.0.0")?;
        let b = Locator::parse("example.com/b:1.0.0")?;

        let envelope = store
            .upsert_package(&a, payload(b"shared"), PackageOptions::default())
            .await?;
        store
            .upsert_package(&b, payload(b"shared"), PackageOptions::default())
            .await?;

        let digest = envelope.digest()?;

        store.delete_package(&a).await?;
        assert!(store.blobs.exists(&digest), "blob still referenced by b");

        store.delete_package(&b).await?;
        assert!(!store.blobs.exists(&digest), "last reference removes blob");

        Ok(())
    }

    #[tokio::test]
    async fn unpack_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;
        let locator = Locator::parse("example.com/app:1.0.0")?;

        let content_dir = tempfile::tempdir()?;
        std::fs::write(content_dir.path().join("file.txt"), b"inside")?;
        let tarball = archive::pack_directory(content_dir.path())?;

        store
            .upsert_package(&locator, tarball, PackageOptions::default())
            .await?;

        let unpacked = store.unpack(&locator).await?;
        assert_eq!(std::fs::read(unpacked.join("file.txt"))?, b"inside");

        // A second unpack must not fail or rewrite.
        let again = store.unpack(&locator).await?;
        assert_eq!(unpacked, again);

        Ok(())
    }

    #[tokio::test]
    async fn read_only_store_rejects_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let store = LocalPackageStore::open(dir.path())?;
            store
                .upsert_package(
                    &Locator::parse("example.com/app:1.0.0")?,
                    payload(b"data"),
                    PackageOptions::default(),
                )
                .await?;
        }

        let store = LocalPackageStore::open_read_only(dir.path())?;

        assert!(store
            .read_package_envelope(&Locator::parse("example.com/app:1.0.0")?)
            .await
            .is_ok());

        assert!(matches!(
            store
                .upsert_package(
                    &Locator::parse("example.com/app:2.0.0")?,
                    payload(b"data"),
                    PackageOptions::default(),
                )
                .await,
            Err(ClusterPackagingError::AccessDenied(_))
        ));

        Ok(())
    }
}
