// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Application source detection.

A build starts from a filesystem path: a manifest file, a directory
containing a manifest, or a Helm chart directory. Charts have no
manifest of their own, so one is synthesized from the chart descriptor,
including the lifecycle hook jobs the install agent expects.
*/

use {
    crate::{
        error::{ClusterPackagingError, Result},
        manifest::{
            ApplicationManifest, Hook, Hooks, Metadata, CHART_FILE_NAME, MANIFEST_FILE_NAME,
        },
        runtime::AGENT_PACKAGE_NAME,
    },
    serde::Deserialize,
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// A detected application source.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageSource {
    /// A manifest file given directly.
    ManifestFile(PathBuf),

    /// A directory containing a manifest file.
    ManifestDir {
        dir: PathBuf,
        manifest_path: PathBuf,
    },

    /// A Helm chart directory.
    Chart { dir: PathBuf, chart_path: PathBuf },
}

impl ImageSource {
    /// Classify a source path.
    pub fn detect(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|_| {
            ClusterPackagingError::BadParameter(format!(
                "source path {} does not exist",
                path.display()
            ))
        })?;

        if metadata.is_file() {
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();

            return if matches!(extension, "yaml" | "yml") {
                Ok(Self::ManifestFile(path.to_path_buf()))
            } else {
                Err(ClusterPackagingError::BadParameter(format!(
                    "invalid manifest filename: {}",
                    path.display()
                )))
            };
        }

        let manifest_path = path.join(MANIFEST_FILE_NAME);
        if manifest_path.is_file() {
            return Ok(Self::ManifestDir {
                dir: path.to_path_buf(),
                manifest_path,
            });
        }

        let chart_path = path.join(CHART_FILE_NAME);
        if chart_path.is_file() {
            return Ok(Self::Chart {
                dir: path.to_path_buf(),
                chart_path,
            });
        }

        Err(ClusterPackagingError::BadParameter(format!(
            "{} is neither an application manifest directory nor a Helm chart",
            path.display()
        )))
    }

    /// The directory whose contents become the application resources.
    pub fn resources_dir(&self) -> Option<&Path> {
        match self {
            Self::ManifestFile(_) => None,
            Self::ManifestDir { dir, .. } | Self::Chart { dir, .. } => Some(dir),
        }
    }

    /// Load or synthesize the application manifest.
    pub fn load_manifest(&self) -> Result<ApplicationManifest> {
        match self {
            Self::ManifestFile(path) | Self::ManifestDir {
                manifest_path: path,
                ..
            } => {
                let data = std::fs::read(path).map_err(|e| {
                    ClusterPackagingError::IoPath(format!("{}", path.display()), e)
                })?;

                ApplicationManifest::parse(&data)
            }
            Self::Chart { chart_path, .. } => {
                let data = std::fs::read(chart_path).map_err(|e| {
                    ClusterPackagingError::IoPath(format!("{}", chart_path.display()), e)
                })?;

                let descriptor: ChartDescriptor = serde_yaml::from_slice(&data)?;

                synthesize_chart_manifest(&descriptor)
            }
        }
    }
}

/// The subset of a Helm chart descriptor used to synthesize a manifest.
#[derive(Clone, Debug, Deserialize)]
pub struct ChartDescriptor {
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,
}

/// Synthesize an application manifest from a chart descriptor.
///
/// The manifest embeds four generated lifecycle hook jobs that invoke
/// the install agent for install, upgrade, rollback and uninstall.
pub fn synthesize_chart_manifest(chart: &ChartDescriptor) -> Result<ApplicationManifest> {
    // Chart versions feed the resource version, so they must be semver.
    semver::Version::parse(&chart.version).map_err(|_| {
        ClusterPackagingError::BadParameter(format!(
            "chart version {} is not a semantic version",
            chart.version
        ))
    })?;

    let mut metadata_rest = BTreeMap::new();
    if let Some(description) = &chart.description {
        metadata_rest.insert(
            "description".to_string(),
            serde_yaml::Value::String(description.clone()),
        );
    }

    Ok(ApplicationManifest {
        api_version: Some("cluster/v1".to_string()),
        kind: Some("Application".to_string()),
        metadata: Metadata {
            name: chart.name.clone(),
            resource_version: chart.version.clone(),
            rest: metadata_rest,
        },
        base_image: None,
        system_options: None,
        dependencies: None,
        hooks: Some(Hooks {
            install: Some(hook_job(&chart.name, "install")),
            upgrade: Some(hook_job(&chart.name, "upgrade")),
            rollback: Some(hook_job(&chart.name, "rollback")),
            uninstall: Some(hook_job(&chart.name, "uninstall")),
        }),
        rest: BTreeMap::new(),
    })
}

fn hook_job(app: &str, phase: &str) -> Hook {
    Hook {
        job: format!(
            r#"apiVersion: batch/v1
kind: Job
metadata:
  name: {app}-{phase}
spec:
  template:
    metadata:
      name: {app}-{phase}
    spec:
      restartPolicy: OnFailure
      containers:
        - name: {phase}
          image: {agent}:latest
          command: ["/usr/local/bin/{agent}", "app", "{phase}", "{app}"]
"#,
            app = app,
            phase = phase,
            agent = AGENT_PACKAGE_NAME,
        ),
    }
}
