// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Intermediate upgrade composition.

An installer can carry artifacts for runtime versions between the
cluster's current version and the target version, so upgrades can hop
through them. Each hop contributes its runtime application plus the
minimal set of system packages needed to run that hop, all labeled
with the hop version.
*/

use {
    crate::{
        envelope::{labels, RuntimeLabels},
        error::Result,
        locator::Locator,
        resolver,
        runtime::{
            runtime_locator, AGENT_PACKAGE_NAME, CLUSTER_MANAGER_PACKAGE_NAME,
            RUNTIME_PACKAGE_NAME,
        },
        store::PackageStore,
    },
    semver::Version,
    std::collections::BTreeSet,
};

/// Package names carried for every intermediate hop.
pub const UPGRADE_SYSTEM_PACKAGES: &[&str] = &[
    RUNTIME_PACKAGE_NAME,
    AGENT_PACKAGE_NAME,
    CLUSTER_MANAGER_PACKAGE_NAME,
];

/// An artifact the installer carries in addition to the application's
/// own dependency closure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpgradeArtifact {
    pub locator: Locator,
    pub labels: RuntimeLabels,
}

fn hop_labels(version: &Version) -> RuntimeLabels {
    let mut labels_map = RuntimeLabels::new();

    labels_map.insert(
        labels::PURPOSE.to_string(),
        labels::PURPOSE_RUNTIME_UPGRADE.to_string(),
    );
    labels_map.insert(
        labels::RUNTIME_UPGRADE_VERSION.to_string(),
        version.to_string(),
    );

    labels_map
}

/// Compose the additional artifact set for a list of intermediate
/// runtime versions.
///
/// For each hop the runtime application's closure is looked up in the
/// cache, its packages are narrowed to [UPGRADE_SYSTEM_PACKAGES], and
/// every kept artifact is labeled with the hop version. Hops are
/// processed in input order; an artifact contributed by an earlier hop
/// is not repeated.
pub async fn intermediate_upgrade_artifacts(
    cache: &dyn PackageStore,
    hops: &[Version],
) -> Result<Vec<UpgradeArtifact>> {
    let mut seen = BTreeSet::new();
    let mut artifacts = vec![];

    for hop in hops {
        let runtime = runtime_locator(hop)?;
        let dependencies = resolver::get_dependencies(cache, &runtime).await?;
        let labels_map = hop_labels(hop);

        let packages = dependencies
            .packages
            .into_iter()
            .filter(|locator| {
                UPGRADE_SYSTEM_PACKAGES.contains(&locator.name.as_str())
            });

        let apps = dependencies
            .apps
            .into_iter()
            .chain(std::iter::once(runtime));

        for locator in packages.chain(apps) {
            if seen.insert(locator.to_string()) {
                artifacts.push(UpgradeArtifact {
                    locator,
                    labels: labels_map.clone(),
                });
            }
        }
    }

    Ok(artifacts)
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            envelope::PackageOptions,
            io::PackageStream,
            store::local::LocalPackageStore,
        },
    };

    fn payload(data: &[u8]) -> PackageStream {
        Box::pin(futures::io::Cursor::new(data.to_vec()))
    }

    async fn seed_runtime(store: &LocalPackageStore, version: &str) -> Result<()> {
        for name in ["planet", "gravity", "teleport", "extras"] {
            store
                .upsert_package(
                    &Locator::parse(&format!("cluster.local/{}:{}", name, version))?,
                    payload(format!("{}-{}", name, version).as_bytes()),
                    PackageOptions::default(),
                )
                .await?;
        }

        let manifest = format!(
            "metadata:\n  name: kubernetes\n  resourceVersion: {v}\n\
             dependencies:\n  packages:\n    - name: cluster.local/planet:{v}\n    - name: cluster.local/gravity:{v}\n    - name: cluster.local/teleport:{v}\n    - name: cluster.local/extras:{v}\n",
            v = version
        );

        store
            .upsert_package(
                &Locator::parse(&format!("cluster.local/kubernetes:{}", version))?,
                payload(manifest.as_bytes()),
                PackageOptions::application(manifest.as_bytes().to_vec()),
            )
            .await?;

        Ok(())
    }

    #[tokio::test]
    async fn hop_keeps_system_packages_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;

        seed_runtime(&store, "0.0.1").await?;

        let artifacts =
            intermediate_upgrade_artifacts(&store, &[Version::new(0, 0, 1)]).await?;

        let names = artifacts
            .iter()
            .map(|a| a.locator.name.as_str())
            .collect::<Vec<_>>();

        assert_eq!(names, vec!["planet", "gravity", "teleport", "kubernetes"]);

        for artifact in &artifacts {
            assert_eq!(
                artifact.labels.get(labels::PURPOSE).map(|v| v.as_str()),
                Some(labels::PURPOSE_RUNTIME_UPGRADE)
            );
            assert_eq!(
                artifact
                    .labels
                    .get(labels::RUNTIME_UPGRADE_VERSION)
                    .map(|v| v.as_str()),
                Some("0.0.1")
            );
        }

        Ok(())
    }

    #[tokio::test]
    async fn hops_are_unioned_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;

        seed_runtime(&store, "0.0.1").await?;
        seed_runtime(&store, "0.0.2").await?;

        let artifacts = intermediate_upgrade_artifacts(
            &store,
            &[Version::new(0, 0, 1), Version::new(0, 0, 2)],
        )
        .await?;

        assert_eq!(artifacts.len(), 8);
        assert!(artifacts[0].locator.version == "0.0.1");
        assert!(artifacts[4].locator.version == "0.0.2");

        Ok(())
    }

    #[tokio::test]
    async fn missing_hop_runtime_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalPackageStore::open(dir.path())?;

        let result =
            intermediate_upgrade_artifacts(&store, &[Version::new(0, 0, 9)]).await;

        assert!(result.is_err());

        Ok(())
    }
}
