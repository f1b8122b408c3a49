// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Layered package stores.

A layered store unions a read-write upper layer (a build's scratch
store) over a read-only lower layer (the shared cache). Reads consult
the upper layer first, writes go to the upper layer only, so the cache
is copy-on-write from the build's perspective.
*/

use {
    crate::{
        envelope::{Envelope, PackageOptions, Repository, RuntimeLabels},
        error::Result,
        io::PackageStream,
        locator::Locator,
        store::{resolve_latest, PackageStore},
    },
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    std::{collections::BTreeMap, sync::Arc},
};

/// Read-through union of two package stores.
pub struct LayeredPackageStore {
    lower: Arc<dyn PackageStore>,
    upper: Arc<dyn PackageStore>,
}

impl LayeredPackageStore {
    /// Construct from a lower (cache) and upper (scratch) store.
    pub fn new(lower: Arc<dyn PackageStore>, upper: Arc<dyn PackageStore>) -> Self {
        Self { lower, upper }
    }

    /// The read-only cache layer.
    pub fn lower(&self) -> &Arc<dyn PackageStore> {
        &self.lower
    }

    /// The read-write scratch layer.
    pub fn upper(&self) -> &Arc<dyn PackageStore> {
        &self.upper
    }
}

#[async_trait]
impl PackageStore for LayeredPackageStore {
    async fn upsert_repository(
        &self,
        name: &str,
        expires: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.upper.upsert_repository(name, expires).await
    }

    async fn get_repositories(&self) -> Result<Vec<Repository>> {
        // Upper entries win on name conflicts.
        let mut merged = BTreeMap::new();

        for repository in self.lower.get_repositories().await? {
            merged.insert(repository.name.clone(), repository);
        }

        for repository in self.upper.get_repositories().await? {
            merged.insert(repository.name.clone(), repository);
        }

        Ok(merged.into_values().collect())
    }

    async fn get_repository(&self, name: &str) -> Result<Repository> {
        match self.upper.get_repository(name).await {
            Ok(repository) => Ok(repository),
            Err(e) if e.is_not_found() => self.lower.get_repository(name).await,
            Err(e) => Err(e),
        }
    }

    async fn delete_repository(&self, name: &str) -> Result<()> {
        self.upper.delete_repository(name).await
    }

    async fn get_packages(&self, repository: &str) -> Result<Vec<Envelope>> {
        // Deduplicated by locator string, upper wins, sorted.
        let mut merged = BTreeMap::new();

        for envelope in self.lower.get_packages(repository).await? {
            merged.insert(envelope.locator.to_string(), envelope);
        }

        for envelope in self.upper.get_packages(repository).await? {
            merged.insert(envelope.locator.to_string(), envelope);
        }

        Ok(merged.into_values().collect())
    }

    async fn create_package(
        &self,
        locator: &Locator,
        payload: PackageStream,
        options: PackageOptions,
    ) -> Result<Envelope> {
        self.upper.create_package(locator, payload, options).await
    }

    async fn upsert_package(
        &self,
        locator: &Locator,
        payload: PackageStream,
        options: PackageOptions,
    ) -> Result<Envelope> {
        self.upper.upsert_package(locator, payload, options).await
    }

    async fn read_package(&self, locator: &Locator) -> Result<(Envelope, PackageStream)> {
        // Resolve the meta-version over the union so an older upper
        // layer cannot shadow a newer cached version.
        let locator = resolve_latest(self, locator).await?;

        match self.upper.read_package(&locator).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_not_found() => self.lower.read_package(&locator).await,
            Err(e) => Err(e),
        }
    }

    async fn read_package_envelope(&self, locator: &Locator) -> Result<Envelope> {
        let locator = resolve_latest(self, locator).await?;

        match self.upper.read_package_envelope(&locator).await {
            Ok(envelope) => Ok(envelope),
            Err(e) if e.is_not_found() => self.lower.read_package_envelope(&locator).await,
            Err(e) => Err(e),
        }
    }

    async fn delete_package(&self, locator: &Locator) -> Result<()> {
        self.upper.delete_package(locator).await
    }

    async fn update_package_labels(
        &self,
        locator: &Locator,
        add: RuntimeLabels,
        remove: Vec<String>,
    ) -> Result<()> {
        match self
            .upper
            .update_package_labels(locator, add.clone(), remove.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                // Best effort when the package only exists in the cache.
                match self.lower.update_package_labels(locator, add, remove).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{error::ClusterPackagingError, store::local::LocalPackageStore},
        futures::AsyncReadExt,
    };

    fn payload(data: &[u8]) -> PackageStream {
        Box::pin(futures::io::Cursor::new(data.to_vec()))
    }

    struct Fixture {
        _lower_dir: tempfile::TempDir,
        _upper_dir: tempfile::TempDir,
        lower: Arc<LocalPackageStore>,
        layered: LayeredPackageStore,
    }

    async fn fixture() -> Result<Fixture> {
        let lower_dir = tempfile::tempdir()?;
        let upper_dir = tempfile::tempdir()?;

        let lower = Arc::new(LocalPackageStore::open(lower_dir.path())?);
        let upper = Arc::new(LocalPackageStore::open(upper_dir.path())?);

        let layered = LayeredPackageStore::new(lower.clone(), upper.clone());

        Ok(Fixture {
            _lower_dir: lower_dir,
            _upper_dir: upper_dir,
            lower,
            layered,
        })
    }

    #[tokio::test]
    async fn reads_fall_through_to_lower() -> Result<()> {
        let fixture = fixture().await?;
        let locator = Locator::parse("example.com/cached:1.0.0")?;

        fixture
            .lower
            .upsert_package(&locator, payload(b"cached"), PackageOptions::default())
            .await?;

        let (envelope, mut stream) = fixture.layered.read_package(&locator).await?;
        assert_eq!(envelope.locator, locator);

        let mut data = vec![];
        stream.read_to_end(&mut data).await?;
        assert_eq!(data, b"cached");

        Ok(())
    }

    #[tokio::test]
    async fn upper_shadows_lower() -> Result<()> {
        let fixture = fixture().await?;
        let locator = Locator::parse("example.com/app:1.0.0")?;

        fixture
            .lower
            .upsert_package(&locator, payload(b"old"), PackageOptions::default())
            .await?;
        fixture
            .layered
            .upsert_package(&locator, payload(b"new"), PackageOptions::default())
            .await?;

        let (_, mut stream) = fixture.layered.read_package(&locator).await?;
        let mut data = vec![];
        stream.read_to_end(&mut data).await?;
        assert_eq!(data, b"new");

        // The cache layer still holds the original content.
        let (_, mut stream) = fixture.lower.read_package(&locator).await?;
        let mut data = vec![];
        stream.read_to_end(&mut data).await?;
        assert_eq!(data, b"old");

        Ok(())
    }

    #[tokio::test]
    async fn listings_are_deduplicated_unions() -> Result<()> {
        let fixture = fixture().await?;

        fixture
            .lower
            .upsert_package(
                &Locator::parse("example.com/a:1.0.0")?,
                payload(b"lower a"),
                PackageOptions::default(),
            )
            .await?;
        fixture
            .lower
            .upsert_package(
                &Locator::parse("example.com/b:1.0.0")?,
                payload(b"lower b"),
                PackageOptions::default(),
            )
            .await?;
        fixture
            .layered
            .upsert_package(
                &Locator::parse("example.com/b:1.0.0")?,
                payload(b"upper b"),
                PackageOptions::default(),
            )
            .await?;

        let packages = fixture.layered.get_packages("example.com").await?;
        assert_eq!(packages.len(), 2);

        let b = packages
            .iter()
            .find(|e| e.locator.name == "b")
            .expect("b should be listed");
        assert_eq!(b.sha512, crate::io::ContentDigest::of(b"upper b").digest_hex());

        let repositories = fixture.layered.get_repositories().await?;
        assert_eq!(repositories.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn latest_resolution_spans_both_layers() -> Result<()> {
        let fixture = fixture().await?;

        fixture
            .lower
            .upsert_package(
                &Locator::parse("example.com/app:0.0.2")?,
                payload(b"newer cached"),
                PackageOptions::default(),
            )
            .await?;
        fixture
            .layered
            .upsert_package(
                &Locator::parse("example.com/app:0.0.1")?,
                payload(b"older scratch"),
                PackageOptions::default(),
            )
            .await?;

        let envelope = fixture
            .layered
            .read_package_envelope(&Locator::parse("example.com/app")?)
            .await?;
        assert_eq!(envelope.locator.version, "0.0.2");

        Ok(())
    }

    #[tokio::test]
    async fn writes_never_touch_lower() -> Result<()> {
        let fixture = fixture().await?;
        let locator = Locator::parse("example.com/app:1.0.0")?;

        fixture
            .layered
            .upsert_package(&locator, payload(b"data"), PackageOptions::default())
            .await?;

        assert!(matches!(
            fixture.lower.read_package_envelope(&locator).await,
            Err(ClusterPackagingError::PackageNotFound(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn label_update_falls_back_to_lower() -> Result<()> {
        let fixture = fixture().await?;
        let locator = Locator::parse("example.com/cached:1.0.0")?;

        fixture
            .lower
            .upsert_package(&locator, payload(b"cached"), PackageOptions::default())
            .await?;

        let mut add = RuntimeLabels::new();
        add.insert("installed".to_string(), "installed".to_string());

        fixture
            .layered
            .update_package_labels(&locator, add, vec![])
            .await?;

        let envelope = fixture.lower.read_package_envelope(&locator).await?;
        assert_eq!(envelope.label("installed"), Some("installed"));

        Ok(())
    }
}
