// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Container image vendoring.

Vendoring rewrites the container image references inside an
application's Kubernetes resources to point at the cluster's internal
registry and records the registry content beneath the vendor
directory, making the resulting image self-contained.

The full vendorer needs a container daemon to export image layers and
is supplied by the caller. [ManifestRewriteVendorer] implements the
reference-rewriting half: it rewrites resource files in place and
records the image list, which is what builds and tests exercise.
*/

use {
    crate::error::{ClusterPackagingError, Result},
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
};

/// Directory beneath a vendor directory holding registry content.
pub const REGISTRY_DIR: &str = "registry";

/// Index of vendored container images inside [REGISTRY_DIR].
pub const IMAGE_INDEX_FILE: &str = "images.json";

/// Registry host resources are rewritten to reference.
pub const DEFAULT_REGISTRY_URL: &str = "registry.cluster.local:5000";

/// Options controlling the vendoring step.
#[derive(Clone, Debug)]
pub struct VendorOptions {
    /// Override for the application package name.
    pub package_name: Option<String>,

    /// Override for the application package version.
    pub package_version: Option<String>,

    /// Glob-like patterns selecting the resource files to rewrite.
    pub resource_patterns: Vec<String>,

    /// Maximum number of concurrent image operations.
    pub parallelism: usize,

    /// Registry the rewritten references point at.
    pub registry_url: String,
}

impl Default for VendorOptions {
    fn default() -> Self {
        Self {
            package_name: None,
            package_version: None,
            resource_patterns: vec!["*.yaml".to_string(), "*.yml".to_string()],
            parallelism: num_cpus::get(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
        }
    }
}

/// Index of the container images a vendor directory embeds.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ImageIndex {
    pub images: Vec<String>,
}

impl ImageIndex {
    /// Read the index from a vendor or installer directory.
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(REGISTRY_DIR).join(IMAGE_INDEX_FILE);

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read(&path)
            .map_err(|e| ClusterPackagingError::IoPath(format!("{}", path.display()), e))?;

        Ok(serde_json::from_slice(&data)?)
    }

    fn write(&self, dir: &Path) -> Result<()> {
        let registry_dir = dir.join(REGISTRY_DIR);

        std::fs::create_dir_all(&registry_dir).map_err(|e| {
            ClusterPackagingError::IoPath(format!("{}", registry_dir.display()), e)
        })?;

        std::fs::write(
            registry_dir.join(IMAGE_INDEX_FILE),
            serde_json::to_vec_pretty(self)?,
        )?;

        Ok(())
    }
}

/// Rewrites Kubernetes resources and records registry content under a
/// directory.
#[async_trait]
pub trait Vendorer: Send + Sync {
    async fn vendor_dir(&self, dir: &Path, options: &VendorOptions) -> Result<()>;
}

/// Vendorer that rewrites image references without exporting layers.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestRewriteVendorer;

#[async_trait]
impl Vendorer for ManifestRewriteVendorer {
    async fn vendor_dir(&self, dir: &Path, options: &VendorOptions) -> Result<()> {
        let mut images = vec![];

        for path in resource_files(dir, &options.resource_patterns)? {
            rewrite_file(&path, &options.registry_url, &mut images)?;
        }

        images.sort();
        images.dedup();

        ImageIndex { images }.write(dir)
    }
}

fn resource_files(dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)
            .map_err(|e| ClusterPackagingError::IoPath(format!("{}", current.display()), e))?
        {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                // Registry content is output, not a resource.
                if path.file_name().and_then(|n| n.to_str()) != Some(REGISTRY_DIR) {
                    pending.push(path);
                }
            } else if matches_any(&path, patterns) {
                files.push(path);
            }
        }
    }

    files.sort();

    Ok(files)
}

fn matches_any(path: &Path, patterns: &[String]) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };

    patterns.iter().any(|pattern| {
        match pattern.strip_prefix('*') {
            Some(suffix) => name.ends_with(suffix),
            None => name == pattern,
        }
    })
}

fn rewrite_file(path: &Path, registry: &str, images: &mut Vec<String>) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ClusterPackagingError::IoPath(format!("{}", path.display()), e))?;

    let mut changed = false;

    let rewritten = content
        .lines()
        .map(|line| match parse_image_line(line) {
            Some((prefix, reference)) if !reference.starts_with(registry) => {
                images.push(reference.to_string());
                changed = true;

                format!("{}image: {}/{}", prefix, registry, strip_host(reference))
            }
            _ => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n");

    if changed {
        let mut output = rewritten;
        if content.ends_with('\n') {
            output.push('\n');
        }

        std::fs::write(path, output)
            .map_err(|e| ClusterPackagingError::IoPath(format!("{}", path.display()), e))?;
    }

    Ok(())
}

fn parse_image_line(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();

    let (dashed, rest) = match trimmed.strip_prefix("- ") {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let reference = rest.strip_prefix("image:")?.trim();

    if reference.is_empty() || reference.starts_with('#') {
        return None;
    }

    // The prefix is everything before the `image:` key.
    let prefix_len = line.len() - trimmed.len() + if dashed { 2 } else { 0 };

    Some((&line[..prefix_len], reference))
}

// Registry hosts contain a dot or port; single-segment references are
// implicitly on the default registry.
fn strip_host(reference: &str) -> &str {
    match reference.split_once('/') {
        Some((host, rest)) if host.contains('.') || host.contains(':') => rest,
        _ => reference,
    }
}
