// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Pulling application closures between stores.

The puller copies an application, its dependency packages and its
dependency applications from a source store into a destination store.
Up to `parallelism` transfers run concurrently; the first failure
cancels the remaining transfers and is returned.
*/

use {
    crate::{
        envelope::{PackageOptions, RuntimeLabels},
        error::{ClusterPackagingError, Result},
        io::{ContentValidatingReader, PackageStream},
        locator::Locator,
        resolver,
        store::{has_package_with_digest, resolve_latest, PackageStore},
    },
    futures::StreamExt,
};

/// Progress notifications emitted while pulling.
#[derive(Clone, Debug)]
pub enum PullEvent {
    /// A package was copied into the destination.
    Pulled(Locator, u64),

    /// The destination already held the package with matching content.
    Skipped(Locator),
}

/// Copies application closures between package stores.
pub struct AppPuller {
    /// Maximum number of concurrent transfers.
    pub parallelism: usize,

    /// Extra labels merged into every pulled artifact.
    pub labels: RuntimeLabels,

    /// Progress callback.
    pub progress: Option<Box<dyn Fn(PullEvent) + Send + Sync>>,
}

impl Default for AppPuller {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            labels: RuntimeLabels::new(),
            progress: None,
        }
    }
}

impl AppPuller {
    /// Construct a puller with the given parallelism.
    pub fn with_parallelism(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            ..Default::default()
        }
    }

    fn emit(&self, event: PullEvent) {
        if let Some(cb) = &self.progress {
            cb(event);
        }
    }

    /// Pull an application, its dependency closure included, from
    /// `src` into `dst`.
    pub async fn pull_app(
        &self,
        src: &dyn PackageStore,
        dst: &dyn PackageStore,
        app: &Locator,
    ) -> Result<()> {
        let app = resolve_latest(src, app).await?;

        let dependencies = resolver::get_dependencies(src, &app).await?;

        let work = dependencies
            .packages
            .into_iter()
            .chain(dependencies.apps.into_iter())
            .chain(std::iter::once(app));

        let fetches = work
            .map(|locator| self.pull_package(src, dst, locator))
            .collect::<Vec<_>>();

        let mut buffered = futures::stream::iter(fetches).buffer_unordered(self.parallelism);

        while let Some(result) = buffered.next().await {
            // Dropping the stream on error cancels outstanding fetches.
            result?;
        }

        Ok(())
    }

    /// Pull a single package from `src` into `dst`.
    ///
    /// Skips the transfer when the destination already has an envelope
    /// with the same locator and digest; labels configured on the
    /// puller are still applied.
    pub async fn pull_package(
        &self,
        src: &dyn PackageStore,
        dst: &dyn PackageStore,
        locator: Locator,
    ) -> Result<()> {
        let envelope = src.read_package_envelope(&locator).await?;

        if has_package_with_digest(dst, &locator, &envelope.sha512).await? {
            self.emit(PullEvent::Skipped(locator.clone()));

            if !self.labels.is_empty() {
                dst.update_package_labels(&locator, self.labels.clone(), vec![])
                    .await?;
            }

            return Ok(());
        }

        let (envelope, payload) = src.read_package(&locator).await?;

        // Abort mid-stream if the source sends bytes that do not
        // match the advertised digest.
        let payload: PackageStream = Box::pin(ContentValidatingReader::new(
            payload,
            envelope.size_bytes,
            envelope.digest()?,
        ));

        let mut options = PackageOptions::from_envelope(&envelope);
        options
            .labels
            .extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        let written = dst.upsert_package(&locator, payload, options).await?;

        if written.sha512 != envelope.sha512 {
            return Err(ClusterPackagingError::DigestMismatch {
                path: locator.to_string(),
                expected: envelope.sha512,
                actual: written.sha512,
            });
        }

        self.emit(PullEvent::Pulled(locator, written.size_bytes));

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            envelope::PackageOptions,
            error::ClusterPackagingError,
            io::PackageStream,
            store::local::LocalPackageStore,
        },
        std::sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    fn payload(data: &[u8]) -> PackageStream {
        Box::pin(futures::io::Cursor::new(data.to_vec()))
    }

    async fn seed_runtime(store: &LocalPackageStore) -> Result<Locator> {
        for name in ["planet", "gravity"] {
            store
                .upsert_package(
                    &Locator::parse(&format!("cluster.local/{}:0.0.1", name))?,
                    payload(name.as_bytes()),
                    PackageOptions::default(),
                )
                .await?;
        }

        let manifest = "metadata:\n  name: kubernetes\n  resourceVersion: 0.0.1\n\
                        dependencies:\n  packages:\n    - name: cluster.local/planet:0.0.1\n    - name: cluster.local/gravity:0.0.1\n";

        let locator = Locator::parse("cluster.local/kubernetes:0.0.1")?;

        store
            .upsert_package(
                &locator,
                payload(manifest.as_bytes()),
                PackageOptions::application(manifest.as_bytes().to_vec()),
            )
            .await?;

        Ok(locator)
    }

    #[tokio::test]
    async fn pull_copies_entire_closure() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let dst_dir = tempfile::tempdir()?;

        let src = LocalPackageStore::open(src_dir.path())?;
        let dst = LocalPackageStore::open(dst_dir.path())?;

        let runtime = seed_runtime(&src).await?;

        AppPuller::with_parallelism(2)
            .pull_app(&src, &dst, &runtime)
            .await?;

        for locator in [
            "cluster.local/planet:0.0.1",
            "cluster.local/gravity:0.0.1",
            "cluster.local/kubernetes:0.0.1",
        ] {
            let envelope = dst
                .read_package_envelope(&Locator::parse(locator)?)
                .await?;
            let source = src
                .read_package_envelope(&Locator::parse(locator)?)
                .await?;
            assert_eq!(envelope.sha512, source.sha512);
            assert_eq!(envelope.package_type, source.package_type);
        }

        Ok(())
    }

    #[tokio::test]
    async fn pull_skips_matching_content() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let dst_dir = tempfile::tempdir()?;

        let src = LocalPackageStore::open(src_dir.path())?;
        let dst = LocalPackageStore::open(dst_dir.path())?;

        let runtime = seed_runtime(&src).await?;

        let puller = AppPuller::with_parallelism(2);
        puller.pull_app(&src, &dst, &runtime).await?;

        let skips = Arc::new(AtomicUsize::new(0));
        let counter = skips.clone();

        let second = AppPuller {
            parallelism: 2,
            labels: RuntimeLabels::new(),
            progress: Some(Box::new(move |event| {
                if matches!(event, PullEvent::Skipped(_)) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })),
        };

        second.pull_app(&src, &dst, &runtime).await?;

        assert_eq!(skips.load(Ordering::SeqCst), 3);

        Ok(())
    }

    #[tokio::test]
    async fn extra_labels_are_applied() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let dst_dir = tempfile::tempdir()?;

        let src = LocalPackageStore::open(src_dir.path())?;
        let dst = LocalPackageStore::open(dst_dir.path())?;

        let runtime = seed_runtime(&src).await?;

        let mut labels = RuntimeLabels::new();
        labels.insert("purpose".to_string(), "runtime-upgrade".to_string());

        let puller = AppPuller {
            parallelism: 1,
            labels,
            progress: None,
        };

        puller.pull_app(&src, &dst, &runtime).await?;

        let envelope = dst
            .read_package_envelope(&Locator::parse("cluster.local/planet:0.0.1")?)
            .await?;
        assert_eq!(envelope.label("purpose"), Some("runtime-upgrade"));

        Ok(())
    }

    #[tokio::test]
    async fn missing_dependency_fails_the_pull() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let dst_dir = tempfile::tempdir()?;

        let src = LocalPackageStore::open(src_dir.path())?;
        let dst = LocalPackageStore::open(dst_dir.path())?;

        let manifest = "metadata:\n  name: kubernetes\n  resourceVersion: 0.0.1\n\
                        dependencies:\n  packages:\n    - name: cluster.local/planet:0.0.1\n";
        let locator = Locator::parse("cluster.local/kubernetes:0.0.1")?;

        src.upsert_package(
            &locator,
            payload(manifest.as_bytes()),
            PackageOptions::application(manifest.as_bytes().to_vec()),
        )
        .await?;

        assert!(matches!(
            AppPuller::with_parallelism(2)
                .pull_app(&src, &dst, &locator)
                .await,
            Err(ClusterPackagingError::PackageNotFound(_))
        ));

        Ok(())
    }
}
