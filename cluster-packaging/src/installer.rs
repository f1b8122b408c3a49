// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Installer image assembly.

The installer is a single uncompressed tar archive holding a fresh
catalog, the blob tree for the application's dependency closure plus
any upgrade-hop artifacts, and a copy of the application manifest
under `resources/app.yaml`. The archive layout doubles as the state
directory layout, so the installed cluster opens it directly as a
package store.
*/

use {
    crate::{
        archive,
        error::{ClusterPackagingError, Result},
        io::PackageStream,
        locator::Locator,
        manifest::{Application, MANIFEST_FILE_NAME},
        puller::AppPuller,
        resolver,
        runtime::{BaseImage, RUNTIME_PACKAGE_NAME},
        store::{local::LocalPackageStore, PackageStore},
        upgrade::UpgradeArtifact,
        RESOURCES_DIR,
    },
    futures::StreamExt,
};

/// Assembles installer images from a package store.
pub struct InstallerBuilder {
    /// Maximum number of concurrent package transfers.
    pub parallelism: usize,
}

impl Default for InstallerBuilder {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
        }
    }
}

impl InstallerBuilder {
    pub fn with_parallelism(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    /// Assemble the installer for an application.
    ///
    /// `additional` carries upgrade-hop artifacts to embed alongside
    /// the application's own closure. The returned stream stays valid
    /// after the staging directory is gone.
    pub async fn build(
        &self,
        store: &dyn PackageStore,
        application: &Application,
        additional: &[UpgradeArtifact],
    ) -> Result<PackageStream> {
        let staging = tempfile::tempdir()?;

        {
            let installer_store = LocalPackageStore::open(staging.path())?;

            self.populate(store, &installer_store, application, additional)
                .await?;
        }

        // The staging store is closed; its writer lock file is not
        // part of the image.
        let lock_path = staging
            .path()
            .join(crate::CATALOG_FILE_NAME)
            .with_extension("lock");
        if lock_path.exists() {
            std::fs::remove_file(&lock_path)?;
        }

        self.write_resources(staging.path(), application)?;

        archive::pack_directory(staging.path())
    }

    async fn populate(
        &self,
        store: &dyn PackageStore,
        installer_store: &LocalPackageStore,
        application: &Application,
        additional: &[UpgradeArtifact],
    ) -> Result<()> {
        let dependencies = resolver::get_dependencies(store, application.locator()).await?;

        let base_image = match &application.manifest.base_image {
            Some(reference) => Some(BaseImage::parse(reference)?),
            None => None,
        };

        let packages = dependencies
            .packages
            .into_iter()
            .map(|locator| substitute_base(locator, base_image.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let puller = AppPuller::with_parallelism(self.parallelism);

        let work = packages
            .into_iter()
            .chain(dependencies.apps.into_iter())
            .chain(std::iter::once(application.locator().clone()))
            .map(|locator| puller.pull_package(store, installer_store, locator))
            .collect::<Vec<_>>();

        let mut transfers =
            futures::stream::iter(work).buffer_unordered(self.parallelism.max(1));

        while let Some(result) = transfers.next().await {
            result?;
        }

        for artifact in additional {
            puller
                .pull_package(store, installer_store, artifact.locator.clone())
                .await?;

            installer_store
                .update_package_labels(&artifact.locator, artifact.labels.clone(), vec![])
                .await?;
        }

        Ok(())
    }

    fn write_resources(&self, dir: &std::path::Path, application: &Application) -> Result<()> {
        let resources_dir = dir.join(RESOURCES_DIR);

        std::fs::create_dir_all(&resources_dir).map_err(|e| {
            ClusterPackagingError::IoPath(format!("{}", resources_dir.display()), e)
        })?;

        let manifest = application.envelope.manifest.as_ref().ok_or_else(|| {
            ClusterPackagingError::Internal(format!(
                "application {} has no manifest",
                application.locator()
            ))
        })?;

        std::fs::write(resources_dir.join(MANIFEST_FILE_NAME), manifest)?;

        Ok(())
    }
}

// The base image overrides the version of the runtime container
// package everywhere it appears in the closure.
fn substitute_base(locator: Locator, base: Option<&BaseImage>) -> Result<Locator> {
    match base {
        Some(base) if locator.name == RUNTIME_PACKAGE_NAME => {
            locator.with_version(&base.version.to_string())
        }
        _ => Ok(locator),
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            envelope::PackageOptions,
            imageenv::{ImageEnvironment, OpenMode},
            io::PackageStream,
            store::get_application,
        },
    };

    fn payload(data: &[u8]) -> PackageStream {
        Box::pin(futures::io::Cursor::new(data.to_vec()))
    }

    async fn seed(store: &LocalPackageStore) -> Result<Application> {
        for (name, version) in [("planet", "0.0.1"), ("planet", "0.0.2"), ("gravity", "0.0.1")] {
            store
                .upsert_package(
                    &Locator::parse(&format!("cluster.local/{}:{}", name, version))?,
                    payload(format!("{}-{}", name, version).as_bytes()),
                    PackageOptions::default(),
                )
                .await?;
        }

        let runtime_manifest = "metadata:\n  name: kubernetes\n  resourceVersion: 0.0.1\n\
                                dependencies:\n  packages:\n    - name: cluster.local/planet:0.0.1\n    - name: cluster.local/gravity:0.0.1\n";

        store
            .upsert_package(
                &Locator::parse("cluster.local/kubernetes:0.0.1")?,
                payload(runtime_manifest.as_bytes()),
                PackageOptions::application(runtime_manifest.as_bytes().to_vec()),
            )
            .await?;

        let app_manifest = "metadata:\n  name: app\n  resourceVersion: 0.0.1\n\
                            systemOptions:\n  runtime:\n    version: 0.0.1\n";

        let locator = Locator::parse("cluster.local/app:0.0.1")?;

        store
            .upsert_package(
                &locator,
                payload(app_manifest.as_bytes()),
                PackageOptions::application(app_manifest.as_bytes().to_vec()),
            )
            .await?;

        get_application(store, &locator).await
    }

    async fn installer_locators(stream: PackageStream) -> Result<Vec<String>> {
        let file = crate::io::spool_to_temp_file(stream).await?;
        let dir = tempfile::tempdir()?;
        crate::archive::unpack_reader(file, dir.path())?;

        let image = ImageEnvironment::open_directory(dir.path(), OpenMode::Full)?;

        let mut locators = vec![];
        for envelope in image.packages().await? {
            locators.push(envelope.locator.to_string());
        }
        locators.sort();

        Ok(locators)
    }

    #[tokio::test]
    async fn installer_holds_the_full_closure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;
        let application = seed(&store).await?;

        let stream = InstallerBuilder::with_parallelism(2)
            .build(&store, &application, &[])
            .await?;

        assert_eq!(
            installer_locators(stream).await?,
            vec![
                "cluster.local/app:0.0.1",
                "cluster.local/gravity:0.0.1",
                "cluster.local/kubernetes:0.0.1",
                "cluster.local/planet:0.0.1",
            ]
        );

        Ok(())
    }

    #[tokio::test]
    async fn base_image_substitutes_runtime_container() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;
        let mut application = seed(&store).await?;

        // Rebuild the application with a base image override baked in.
        application.manifest.base_image =
            Some("quay.io/gravitational/planet:0.0.2".to_string());
        let manifest_bytes = application.manifest.to_yaml()?;
        application.envelope.manifest = Some(manifest_bytes.clone());

        let stream = InstallerBuilder::with_parallelism(2)
            .build(&store, &application, &[])
            .await?;

        let locators = installer_locators(stream).await?;

        assert!(locators.contains(&"cluster.local/planet:0.0.2".to_string()));
        assert!(!locators.contains(&"cluster.local/planet:0.0.1".to_string()));

        Ok(())
    }

    #[tokio::test]
    async fn builds_are_reproducible() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;
        let application = seed(&store).await?;

        let builder = InstallerBuilder::with_parallelism(2);

        let first = installer_locators(builder.build(&store, &application, &[]).await?).await?;
        let second =
            installer_locators(builder.build(&store, &application, &[]).await?).await?;

        assert_eq!(first, second);

        Ok(())
    }
}
