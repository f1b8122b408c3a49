// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package stores.

A package store is a catalog of repositories and envelopes combined
with payload access. The local store persists both on disk, the hub
client speaks the same read interface over HTTP, and the layered store
unions a read-only cache with a per-build scratch store.
*/

use {
    crate::{
        envelope::{Envelope, PackageOptions, Repository, RuntimeLabels},
        error::{ClusterPackagingError, Result},
        io::PackageStream,
        locator::Locator,
        manifest::Application,
    },
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

pub mod archive;
pub mod http;
pub mod layered;
pub mod local;

/// Common interface of every package store flavor.
///
/// Read-only stores (remote clients, opened installer images) return
/// `AccessDenied` from mutating operations.
#[async_trait]
pub trait PackageStore: Send + Sync {
    /// Create a repository if it does not exist yet.
    async fn upsert_repository(
        &self,
        name: &str,
        expires: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn get_repositories(&self) -> Result<Vec<Repository>>;

    async fn get_repository(&self, name: &str) -> Result<Repository>;

    /// Delete a repository and every package it holds.
    async fn delete_repository(&self, name: &str) -> Result<()>;

    /// List envelopes in a repository, ordered by locator string.
    async fn get_packages(&self, repository: &str) -> Result<Vec<Envelope>>;

    /// Record a new package. The repository must exist and the
    /// locator must be unused.
    async fn create_package(
        &self,
        locator: &Locator,
        payload: PackageStream,
        options: PackageOptions,
    ) -> Result<Envelope>;

    /// Record a package, creating the repository and replacing any
    /// existing envelope.
    async fn upsert_package(
        &self,
        locator: &Locator,
        payload: PackageStream,
        options: PackageOptions,
    ) -> Result<Envelope>;

    /// Read an envelope and its payload. Latest meta-version locators
    /// are resolved against the store's contents.
    async fn read_package(&self, locator: &Locator) -> Result<(Envelope, PackageStream)>;

    /// Read an envelope without its payload.
    async fn read_package_envelope(&self, locator: &Locator) -> Result<Envelope>;

    async fn delete_package(&self, locator: &Locator) -> Result<()>;

    /// Merge runtime label changes into an envelope.
    async fn update_package_labels(
        &self,
        locator: &Locator,
        add: RuntimeLabels,
        remove: Vec<String>,
    ) -> Result<()>;
}

/// Resolve a latest meta-version locator against a store.
///
/// Scans the locator's repository for the largest semver of the named
/// package. Concrete locators are returned unchanged.
pub async fn resolve_latest(store: &dyn PackageStore, locator: &Locator) -> Result<Locator> {
    if !locator.is_latest() {
        return Ok(locator.clone());
    }

    let mut best: Option<(semver::Version, Locator)> = None;

    for envelope in store.get_packages(&locator.repository).await? {
        if envelope.locator.name != locator.name {
            continue;
        }

        let version = envelope.locator.semver()?;

        let better = match &best {
            Some((current, _)) => version > *current,
            None => true,
        };

        if better {
            best = Some((version, envelope.locator));
        }
    }

    best.map(|(_, locator)| locator)
        .ok_or_else(|| ClusterPackagingError::PackageNotFound(locator.clone()))
}

/// Read an application record from a store.
pub async fn get_application(store: &dyn PackageStore, locator: &Locator) -> Result<Application> {
    let envelope = store.read_package_envelope(locator).await?;

    if !envelope.is_application() {
        return Err(ClusterPackagingError::BadParameter(format!(
            "package {} is not an application",
            envelope.locator
        )));
    }

    Application::from_envelope(envelope)
}

/// Whether a store holds an envelope matching both locator and digest.
pub async fn has_package_with_digest(
    store: &dyn PackageStore,
    locator: &Locator,
    sha512: &str,
) -> Result<bool> {
    match store.read_package_envelope(locator).await {
        Ok(envelope) => Ok(envelope.sha512 == sha512),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
