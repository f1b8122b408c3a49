// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package locators.

Every artifact is addressed by an immutable `(repository, name,
version)` triple. The textual form is `repository/name:version`, with
shorter forms defaulting the repository to the system repository and
the version to the latest meta-version.
*/

use {
    crate::error::{ClusterPackagingError, Result},
    serde::{Deserialize, Serialize},
    std::fmt::Formatter,
};

/// Repository holding packages distributed with the builder itself.
pub const SYSTEM_REPOSITORY: &str = "cluster.local";

/// Version string used when referring to any version of a package.
pub const ZERO_VERSION: &str = "0.0.0";

/// Version sentinel resolved to the largest available version of a
/// package at lookup time.
pub const LATEST_META_VERSION: &str = "0.0.0+latest";

/// Address of a single package version.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Locator {
    /// DNS-like namespace the package lives in.
    pub repository: String,

    /// Identifier unique within the repository.
    pub name: String,

    /// Semantic version, possibly carrying build metadata.
    pub version: String,
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

impl std::str::FromStr for Locator {
    type Err = ClusterPackagingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Locator {
    /// Construct a locator from validated components.
    pub fn new(repository: &str, name: &str, version: &str) -> Result<Self> {
        validate_repository_name(repository)?;
        validate_package_name(name)?;

        // Validates the version string as a side effect.
        parse_version(version)?;

        Ok(Self {
            repository: repository.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// Construct a locator for a package in the system repository.
    pub fn system(name: &str, version: &str) -> Result<Self> {
        Self::new(SYSTEM_REPOSITORY, name, version)
    }

    /// Parse the textual locator form.
    ///
    /// Accepts `repository/name:version`, `name:version`, and bare
    /// `name`. Omitted components default to [SYSTEM_REPOSITORY] and
    /// [LATEST_META_VERSION] respectively.
    pub fn parse(s: &str) -> Result<Self> {
        let (repository, rest) = match s.split_once('/') {
            Some((repository, rest)) => (repository, rest),
            None => (SYSTEM_REPOSITORY, s),
        };

        let (name, version) = match rest.split_once(':') {
            Some((name, version)) => (name, version),
            None => (rest, LATEST_META_VERSION),
        };

        if name.is_empty() || version.is_empty() || repository.is_empty() {
            return Err(ClusterPackagingError::BadParameter(format!(
                "invalid package locator: {}",
                s
            )));
        }

        Self::new(repository, name, version)
    }

    /// Obtain the zero-version form of this locator.
    ///
    /// The zero-version form is used as a stable key when a record
    /// refers to any version of a package.
    pub fn zero_version(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            name: self.name.clone(),
            version: ZERO_VERSION.to_string(),
        }
    }

    /// Obtain a copy of this locator with a different version.
    pub fn with_version(&self, version: &str) -> Result<Self> {
        Self::new(&self.repository, &self.name, version)
    }

    /// Whether the version is the latest meta-version sentinel.
    pub fn is_latest(&self) -> bool {
        self.version == LATEST_META_VERSION
    }

    /// Whether the version is the zero-version placeholder.
    pub fn is_zero_version(&self) -> bool {
        self.version == ZERO_VERSION
    }

    /// Whether this locator and another address the same package,
    /// ignoring versions.
    pub fn same_package(&self, other: &Self) -> bool {
        self.repository == other.repository && self.name == other.name
    }

    /// Parse the version component.
    pub fn semver(&self) -> Result<semver::Version> {
        parse_version(&self.version)
    }
}

fn parse_version(version: &str) -> Result<semver::Version> {
    Ok(semver::Version::parse(version)?)
}

/// Validate a DNS-like repository name.
pub fn validate_repository_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        });

    if valid {
        Ok(())
    } else {
        Err(ClusterPackagingError::BadParameter(format!(
            "invalid repository name: {}",
            name
        )))
    }
}

fn validate_package_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(ClusterPackagingError::BadParameter(format!(
            "invalid package name: {}",
            name
        )))
    }
}
