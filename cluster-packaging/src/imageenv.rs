// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading installer images.

An installer tarball (or a directory it was unpacked into) can be
opened as an immutable package store for inspection. Two modes exist:
[OpenMode::Full] materializes the whole archive and can enumerate the
vendored container images; [OpenMode::CatalogOnly] extracts just the
catalog and the application manifest, which is enough for fast
introspection of large images.
*/

use {
    crate::{
        archive,
        envelope::Envelope,
        error::{ClusterPackagingError, Result},
        manifest::{Application, ApplicationManifest, MANIFEST_FILE_NAME},
        store::{get_application, local::LocalPackageStore, PackageStore},
        vendor::ImageIndex,
        CATALOG_FILE_NAME, RESOURCES_DIR,
    },
    std::path::{Path, PathBuf},
    tempfile::TempDir,
};

/// How much of an installer image to materialize.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Extract everything. Required to access payloads and the
    /// vendored registry.
    Full,

    /// Extract only the catalog and the application manifest.
    CatalogOnly,
}

/// An installer image opened for inspection.
pub struct ImageEnvironment {
    dir: PathBuf,
    mode: OpenMode,
    store: LocalPackageStore,

    // Keeps extracted tarball content alive.
    _temp: Option<TempDir>,
}

impl ImageEnvironment {
    /// Open an installer tarball.
    pub fn open_tarball(path: &Path, mode: OpenMode) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| ClusterPackagingError::IoPath(format!("{}", path.display()), e))?;

        let temp = TempDir::new()?;

        match mode {
            OpenMode::Full => {
                archive::unpack_reader(file, temp.path())?;

                if !temp.path().join(CATALOG_FILE_NAME).is_file() {
                    return Err(ClusterPackagingError::BadParameter(format!(
                        "{} is not an installer image: no catalog found",
                        path.display()
                    )));
                }
            }
            OpenMode::CatalogOnly => {
                let manifest_entry = format!("{}/{}", RESOURCES_DIR, MANIFEST_FILE_NAME);
                let extracted = archive::unpack_selected(
                    file,
                    temp.path(),
                    &[CATALOG_FILE_NAME, manifest_entry.as_str()],
                )?;

                if !extracted.iter().any(|p| p == Path::new(CATALOG_FILE_NAME)) {
                    return Err(ClusterPackagingError::BadParameter(format!(
                        "{} is not an installer image: no catalog found",
                        path.display()
                    )));
                }
            }
        }

        let store = LocalPackageStore::open_read_only(temp.path())?;

        Ok(Self {
            dir: temp.path().to_path_buf(),
            mode,
            store,
            _temp: Some(temp),
        })
    }

    /// Open a directory an installer was unpacked into.
    pub fn open_directory(dir: &Path, mode: OpenMode) -> Result<Self> {
        if !dir.join(CATALOG_FILE_NAME).is_file() {
            return Err(ClusterPackagingError::BadParameter(format!(
                "{} is not an installer image: no catalog found",
                dir.display()
            )));
        }

        let store = LocalPackageStore::open_read_only(dir)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            mode,
            store,
            _temp: None,
        })
    }

    /// The package store over the image's catalog.
    pub fn store(&self) -> &LocalPackageStore {
        &self.store
    }

    /// Every package envelope in the image, ordered by locator string.
    pub async fn packages(&self) -> Result<Vec<Envelope>> {
        let mut envelopes = vec![];

        for repository in self.store.get_repositories().await? {
            envelopes.extend(self.store.get_packages(&repository.name).await?);
        }

        envelopes.sort_by_key(|e| e.locator.to_string());

        Ok(envelopes)
    }

    /// The application manifest the image was built from.
    pub fn manifest(&self) -> Result<ApplicationManifest> {
        let path = self.dir.join(RESOURCES_DIR).join(MANIFEST_FILE_NAME);

        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ClusterPackagingError::NotFound(format!("{}", path.display()))
            } else {
                ClusterPackagingError::IoPath(format!("{}", path.display()), e)
            }
        })?;

        ApplicationManifest::parse(&data)
    }

    /// The application record the image was built from.
    pub async fn application(&self) -> Result<Application> {
        let locator = self.manifest()?.locator()?;

        get_application(&self.store, &locator).await
    }

    /// The container images vendored into the application.
    ///
    /// Requires [OpenMode::Full]: the registry content lives inside
    /// the application package payload.
    pub async fn vendored_images(&self) -> Result<Vec<String>> {
        if self.mode != OpenMode::Full {
            return Err(ClusterPackagingError::BadParameter(
                "image was opened catalog-only; reopen it in full mode to list images"
                    .to_string(),
            ));
        }

        let application = self.application().await?;
        let unpacked = self.store.unpack(application.locator()).await?;

        Ok(ImageIndex::read(&unpacked)?.images)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            envelope::PackageOptions,
            installer::InstallerBuilder,
            io::{spool_to_temp_file, PackageStream},
            locator::Locator,
            vendor::{ManifestRewriteVendorer, VendorOptions, Vendorer},
        },
    };

    fn payload(data: &[u8]) -> PackageStream {
        Box::pin(futures::io::Cursor::new(data.to_vec()))
    }

    // Builds a small installer tarball on disk and returns its path.
    async fn build_installer(dir: &Path) -> Result<PathBuf> {
        let state_dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(state_dir.path())?;

        // A vendored application payload: resources plus registry index.
        let vendor_dir = tempfile::tempdir()?;
        let resources = vendor_dir.path().join(RESOURCES_DIR);
        std::fs::create_dir_all(&resources)?;

        let manifest = "metadata:\n  name: app\n  resourceVersion: 0.0.1\n";
        std::fs::write(resources.join(MANIFEST_FILE_NAME), manifest)?;
        std::fs::write(
            resources.join("deployment.yaml"),
            "spec:\n  containers:\n    - image: nginx:1.21\n",
        )?;

        ManifestRewriteVendorer
            .vendor_dir(vendor_dir.path(), &VendorOptions::default())
            .await?;

        let tarball = crate::archive::pack_directory(vendor_dir.path())?;
        let tar_bytes = crate::io::read_stream_to_vec(tarball).await?;

        let locator = Locator::parse("cluster.local/app:0.0.1")?;
        store
            .upsert_package(
                &locator,
                payload(&tar_bytes),
                PackageOptions::application(manifest.as_bytes().to_vec()),
            )
            .await?;

        let application = crate::store::get_application(&store, &locator).await?;

        let stream = InstallerBuilder::with_parallelism(2)
            .build(&store, &application, &[])
            .await?;

        let output = dir.join("app-0.0.1.tar");
        let mut file = spool_to_temp_file(stream).await?;
        let mut out = std::fs::File::create(&output)?;
        std::io::copy(&mut file, &mut out)?;

        Ok(output)
    }

    #[tokio::test]
    async fn full_open_lists_packages_and_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tarball = build_installer(dir.path()).await?;

        let image = ImageEnvironment::open_tarball(&tarball, OpenMode::Full)?;

        let packages = image.packages().await?;
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].locator.to_string(), "cluster.local/app:0.0.1");

        assert_eq!(image.vendored_images().await?, vec!["nginx:1.21"]);

        Ok(())
    }

    #[tokio::test]
    async fn catalog_only_open_reads_metadata_without_payloads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tarball = build_installer(dir.path()).await?;

        let image = ImageEnvironment::open_tarball(&tarball, OpenMode::CatalogOnly)?;

        assert_eq!(image.manifest()?.metadata.name, "app");
        assert_eq!(image.packages().await?.len(), 1);

        assert!(matches!(
            image.vendored_images().await,
            Err(ClusterPackagingError::BadParameter(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn non_installer_tarball_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let content = tempfile::tempdir()?;
        std::fs::write(content.path().join("random.txt"), b"not an image")?;

        let stream = crate::archive::pack_directory(content.path())?;
        let mut file = spool_to_temp_file(stream).await?;

        let tarball = dir.path().join("bogus.tar");
        let mut out = std::fs::File::create(&tarball)?;
        std::io::copy(&mut file, &mut out)?;

        assert!(matches!(
            ImageEnvironment::open_tarball(&tarball, OpenMode::CatalogOnly),
            Err(ClusterPackagingError::BadParameter(_))
        ));

        Ok(())
    }
}
