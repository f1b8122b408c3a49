// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Application manifests.

The manifest is mostly opaque to the builder. Only the fields inspected
by the build pipeline are modeled; everything else is preserved
verbatim through a flattened map so re-serialized manifests keep user
content.
*/

use {
    crate::{
        envelope::Envelope,
        error::{ClusterPackagingError, Result},
        locator::{Locator, SYSTEM_REPOSITORY},
        runtime::RUNTIME_APP_NAME,
    },
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

/// File name of an application manifest inside a source directory.
pub const MANIFEST_FILE_NAME: &str = "app.yaml";

/// File name of a Helm chart descriptor.
pub const CHART_FILE_NAME: &str = "Chart.yaml";

/// Version sentinel requesting the most recent runtime.
pub const LATEST_RUNTIME: &str = "latest";

/// A reference to a dependency package or application.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Dependency {
    /// Locator string of the dependency.
    pub name: String,
}

impl Dependency {
    pub fn locator(&self) -> Result<Locator> {
        Locator::parse(&self.name)
    }
}

/// Declared dependencies of an application.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Dependencies {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<Dependency>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<Dependency>,
}

/// The base runtime an application requires.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuntimeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Specific semver or the [LATEST_RUNTIME] sentinel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SystemOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeSpec>,

    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_yaml::Value>,
}

/// A lifecycle hook backed by a Kubernetes job.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Hook {
    pub job: String,
}

/// Lifecycle hooks recognized by the install agent.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<Hook>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<Hook>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Hook>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall: Option<Hook>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Metadata {
    pub name: String,

    #[serde(rename = "resourceVersion")]
    pub resource_version: String,

    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_yaml::Value>,
}

/// An application manifest.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ApplicationManifest {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    pub metadata: Metadata,

    /// Container image to use as the base runtime instead of the
    /// default runtime container.
    #[serde(rename = "baseImage", default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,

    #[serde(
        rename = "systemOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub system_options: Option<SystemOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Dependencies>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,

    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_yaml::Value>,
}

impl ApplicationManifest {
    /// Parse a manifest from YAML bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(data)?)
    }

    /// Serialize the manifest back to YAML.
    pub fn to_yaml(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_vec(self)?)
    }

    /// The locator of the application this manifest describes.
    pub fn locator(&self) -> Result<Locator> {
        Locator::new(
            SYSTEM_REPOSITORY,
            &self.metadata.name,
            &self.metadata.resource_version,
        )
    }

    /// The pinned runtime version, if the manifest pins one.
    ///
    /// Returns `None` when the manifest is silent or requests the
    /// latest runtime.
    pub fn pinned_runtime_version(&self) -> Result<Option<semver::Version>> {
        let version = self
            .system_options
            .as_ref()
            .and_then(|options| options.runtime.as_ref())
            .and_then(|runtime| runtime.version.as_deref());

        match version {
            None | Some(LATEST_RUNTIME) => Ok(None),
            Some(v) => Ok(Some(semver::Version::parse(v)?)),
        }
    }

    /// Overwrite the base runtime version.
    pub fn set_runtime_version(&mut self, version: &semver::Version) {
        let options = self.system_options.get_or_insert_with(SystemOptions::default);

        options.runtime = Some(RuntimeSpec {
            name: Some(RUNTIME_APP_NAME.to_string()),
            version: Some(version.to_string()),
        });
    }

    /// Declared package dependencies as locators.
    pub fn package_dependencies(&self) -> Result<Vec<Locator>> {
        self.dependency_locators(|d| &d.packages)
    }

    /// Declared application dependencies as locators.
    pub fn app_dependencies(&self) -> Result<Vec<Locator>> {
        self.dependency_locators(|d| &d.apps)
    }

    /// The locator of the base runtime application, when one is set.
    pub fn runtime_locator(&self) -> Result<Option<Locator>> {
        match self.pinned_runtime_version()? {
            Some(version) => Ok(Some(Locator::system(
                RUNTIME_APP_NAME,
                &version.to_string(),
            )?)),
            None => Ok(None),
        }
    }

    fn dependency_locators(
        &self,
        select: impl Fn(&Dependencies) -> &Vec<Dependency>,
    ) -> Result<Vec<Locator>> {
        match &self.dependencies {
            Some(dependencies) => select(dependencies)
                .iter()
                .map(|d| d.locator())
                .collect::<Result<Vec<_>>>(),
            None => Ok(vec![]),
        }
    }
}

/// A catalog application: its envelope plus parsed manifest.
#[derive(Clone, Debug)]
pub struct Application {
    pub envelope: Envelope,
    pub manifest: ApplicationManifest,
}

impl Application {
    /// Construct from an envelope carrying manifest bytes.
    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let data = envelope.manifest.as_ref().ok_or_else(|| {
            ClusterPackagingError::Internal(format!(
                "application {} has no manifest",
                envelope.locator
            ))
        })?;

        let manifest = ApplicationManifest::parse(data)?;

        Ok(Self { envelope, manifest })
    }

    pub fn locator(&self) -> &Locator {
        &self.envelope.locator
    }
}
