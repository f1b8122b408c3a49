// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Base runtime selection.

An application builds against a runtime application and its companion
system packages. The runtime version is either pinned by the manifest
or defaults to the version of the builder itself, and must stay within
the builder's major.minor band.
*/

use {
    crate::{
        error::{ClusterPackagingError, Result},
        locator::Locator,
        manifest::ApplicationManifest,
    },
    semver::Version,
};

/// Name of the runtime application.
pub const RUNTIME_APP_NAME: &str = "kubernetes";

/// Name of the runtime container package.
pub const RUNTIME_PACKAGE_NAME: &str = "planet";

/// Name of the cluster agent binary package.
pub const AGENT_PACKAGE_NAME: &str = "gravity";

/// Name of the cluster manager binary package.
pub const CLUSTER_MANAGER_PACKAGE_NAME: &str = "teleport";

/// Locator of the runtime application at a specific version.
pub fn runtime_locator(version: &Version) -> Result<Locator> {
    Locator::system(RUNTIME_APP_NAME, &version.to_string())
}

/// Whether a builder of version `builder` can build against runtime
/// version `runtime`.
///
/// Versions are compatible when they share the major.minor band and
/// the builder is at least as new as the runtime.
pub fn versions_compatible(builder: &Version, runtime: &Version) -> bool {
    builder.major == runtime.major && builder.minor == runtime.minor && builder >= runtime
}

/// Fail unless the runtime version is buildable by this builder.
pub fn check_runtime_version(builder: &Version, runtime: &Version) -> Result<()> {
    if versions_compatible(builder, runtime) {
        Ok(())
    } else {
        Err(ClusterPackagingError::BadParameter(format!(
            "runtime version {} is not compatible with builder version {}; \
             use a builder from the {}.{}.x line",
            runtime, builder, runtime.major, runtime.minor
        )))
    }
}

/// A parsed base image reference, e.g. `quay.io/example/planet:0.0.2`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BaseImage {
    pub name: String,
    pub version: Version,
}

impl BaseImage {
    /// Parse a container image reference into a base image.
    ///
    /// Only the runtime container image is accepted as a base; any
    /// other image name is rejected.
    pub fn parse(reference: &str) -> Result<Self> {
        let (path, tag) = reference.rsplit_once(':').ok_or_else(|| {
            ClusterPackagingError::UnsupportedBaseImage(reference.to_string())
        })?;

        let name = path.rsplit('/').next().unwrap_or(path);

        if name != RUNTIME_PACKAGE_NAME {
            return Err(ClusterPackagingError::UnsupportedBaseImage(
                reference.to_string(),
            ));
        }

        let version = Version::parse(tag).map_err(|_| {
            ClusterPackagingError::UnsupportedBaseImage(reference.to_string())
        })?;

        Ok(Self {
            name: name.to_string(),
            version,
        })
    }

    /// Locator of the runtime container package this base image maps to.
    pub fn package_locator(&self) -> Result<Locator> {
        Locator::system(RUNTIME_PACKAGE_NAME, &self.version.to_string())
    }
}

/// Select the runtime version to build against.
///
/// A manifest pin wins; otherwise the builder's own version is used.
/// A base image present in the manifest is validated as a side effect
/// so unsupported images fail before any work happens.
pub fn select_runtime(
    manifest: &ApplicationManifest,
    builder_version: &Version,
) -> Result<Version> {
    if let Some(reference) = &manifest.base_image {
        BaseImage::parse(reference)?;
    }

    let version = match manifest.pinned_runtime_version()? {
        Some(version) => version,
        None => builder_version.clone(),
    };

    check_runtime_version(builder_version, &version)?;

    Ok(version)
}
