// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Archive-based runtime sources.

Runtime releases can be published as plain tarballs in a bucket
instead of behind a package service. A release archive is the standard
store layout (catalog plus blob tree) compressed with gzip. The source
resolves a runtime version to a single archive URL, downloads and
extracts it into a temporary directory, and opens that directory as a
read-only package store.
*/

use {
    crate::{
        error::{ClusterPackagingError, Result},
        runtime::versions_compatible,
        store::local::LocalPackageStore,
    },
    flate2::read::GzDecoder,
    reqwest::{Client, ClientBuilder, IntoUrl, StatusCode, Url},
    semver::Version,
    serde::{Deserialize, Serialize},
    std::io::Read,
    tempfile::TempDir,
};

/// Name of the release index file at the root of an archive source.
pub const RELEASE_INDEX_FILE: &str = "releases.json";

/// A published runtime release.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Release {
    pub version: String,
}

/// Conventional archive path for a runtime version.
pub fn runtime_archive_path(version: &str) -> String {
    format!("runtime-{}.tar.gz", version)
}

/// A runtime release extracted to a temporary directory.
///
/// The directory is removed when this value drops, so keep it alive
/// for as long as the store is read from.
pub struct ExtractedRelease {
    _dir: TempDir,
    store: LocalPackageStore,
}

impl ExtractedRelease {
    /// The read-only package store over the extracted archive.
    pub fn store(&self) -> &LocalPackageStore {
        &self.store
    }
}

/// Source of runtime releases published as tarballs.
#[derive(Clone, Debug)]
pub struct ArchiveSource {
    client: Client,
    root_url: Url,
}

impl ArchiveSource {
    /// Construct an instance bound to the given base URL.
    ///
    /// `file://` URLs are supported so local mirrors work without a
    /// server.
    pub fn new(url: impl IntoUrl) -> Result<Self> {
        let client = ClientBuilder::new()
            .user_agent(super::http::USER_AGENT)
            .build()?;

        let mut root_url = url.into_url()?;

        if !root_url.path().ends_with('/') {
            root_url.set_path(&format!("{}/", root_url.path()));
        }

        Ok(Self { client, root_url })
    }

    /// The URL this source is bound to.
    pub fn url(&self) -> &Url {
        &self.root_url
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.root_url.join(path)?;

        if url.scheme() == "file" {
            let file_path = url.to_file_path().map_err(|_| {
                ClusterPackagingError::network(&url, "not a filesystem path")
            })?;

            return std::fs::read(&file_path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ClusterPackagingError::NotFound(format!("{}", url))
                } else {
                    ClusterPackagingError::IoPath(format!("{}", file_path.display()), e)
                }
            });
        }

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ClusterPackagingError::network(&self.root_url, format!("{}", e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                Err(ClusterPackagingError::NotFound(format!("{}", url)))
            }
            status if status.is_success() => Ok(response
                .bytes()
                .await
                .map_err(|e| {
                    ClusterPackagingError::network(&self.root_url, format!("{}", e))
                })?
                .to_vec()),
            status => Err(ClusterPackagingError::network(
                &self.root_url,
                format!("unexpected HTTP status {} for {}", status, url),
            )),
        }
    }

    /// List published releases from the source's index file.
    pub async fn list_releases(&self) -> Result<Vec<Release>> {
        let data = self.fetch(RELEASE_INDEX_FILE).await?;

        serde_json::from_slice(&data).map_err(|e| {
            ClusterPackagingError::network(
                &self.root_url,
                format!("malformed release index: {}", e),
            )
        })
    }

    /// The most recent published release compatible with a builder.
    pub async fn latest_compatible(&self, builder: &Version) -> Result<Version> {
        let mut best: Option<Version> = None;

        for release in self.list_releases().await? {
            let version = Version::parse(&release.version)?;

            if !versions_compatible(builder, &version) {
                continue;
            }

            if best.as_ref().map(|b| version > *b).unwrap_or(true) {
                best = Some(version);
            }
        }

        best.ok_or_else(|| {
            ClusterPackagingError::NotFound(format!(
                "no release compatible with builder version {} at {}",
                builder, self.root_url
            ))
        })
    }

    /// Download and extract the archive for a runtime version.
    pub async fn fetch_runtime(&self, version: &Version) -> Result<ExtractedRelease> {
        let path = runtime_archive_path(&version.to_string());

        let data = match self.fetch(&path).await {
            Err(e) if e.is_not_found() => {
                return Err(ClusterPackagingError::NotFound(format!(
                    "runtime version {} at {}",
                    version, self.root_url
                )))
            }
            other => other?,
        };

        let dir = TempDir::new()?;

        extract_archive(&data[..], &dir)?;

        let store = LocalPackageStore::open_read_only(dir.path())?;

        Ok(ExtractedRelease { _dir: dir, store })
    }
}

fn extract_archive(data: impl Read, dir: &TempDir) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));

    archive
        .unpack(dir.path())
        .map_err(|e| ClusterPackagingError::IoPath(format!("{}", dir.path().display()), e))?;

    Ok(())
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            envelope::PackageOptions,
            io::PackageStream,
            locator::Locator,
            store::PackageStore,
        },
        flate2::{write::GzEncoder, Compression},
        std::io::Write,
    };

    fn payload(data: &[u8]) -> PackageStream {
        Box::pin(futures::io::Cursor::new(data.to_vec()))
    }

    async fn publish_runtime_archive(root: &std::path::Path, version: &str) -> Result<()> {
        // Stage a store directory holding the runtime release.
        let stage = tempfile::tempdir()?;

        {
            let store = LocalPackageStore::open(stage.path())?;

            store
                .upsert_package(
                    &Locator::parse(&format!("cluster.local/planet:{}", version))?,
                    payload(b"planet"),
                    PackageOptions::default(),
                )
                .await?;
        }

        let tar_stream = crate::archive::pack_directory(stage.path())?;
        let tar_bytes = crate::io::read_stream_to_vec(tar_stream).await?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes)?;
        let gz = encoder.finish()?;

        std::fs::write(root.join(runtime_archive_path(version)), gz)?;

        Ok(())
    }

    fn file_source(root: &std::path::Path) -> Result<ArchiveSource> {
        ArchiveSource::new(
            Url::from_directory_path(root)
                .map_err(|_| ClusterPackagingError::Internal("bad test path".to_string()))?,
        )
    }

    #[tokio::test]
    async fn fetch_extracts_a_readable_store() -> Result<()> {
        let root = tempfile::tempdir()?;
        publish_runtime_archive(root.path(), "0.0.1").await?;

        let source = file_source(root.path())?;
        let release = source.fetch_runtime(&Version::new(0, 0, 1)).await?;

        let envelope = release
            .store()
            .read_package_envelope(&Locator::parse("cluster.local/planet:0.0.1")?)
            .await?;

        assert_eq!(envelope.locator.version, "0.0.1");

        Ok(())
    }

    #[tokio::test]
    async fn missing_archive_is_not_found() -> Result<()> {
        let root = tempfile::tempdir()?;
        let source = file_source(root.path())?;

        assert!(matches!(
            source.fetch_runtime(&Version::new(9, 9, 9)).await,
            Err(ClusterPackagingError::NotFound(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn release_index_drives_latest_compatible() -> Result<()> {
        let root = tempfile::tempdir()?;

        std::fs::write(
            root.path().join(RELEASE_INDEX_FILE),
            serde_json::to_vec(&vec![
                Release {
                    version: "5.5.0".to_string(),
                },
                Release {
                    version: "5.5.2".to_string(),
                },
                Release {
                    version: "5.6.0".to_string(),
                },
            ])?,
        )?;

        let source = file_source(root.path())?;

        assert_eq!(
            source
                .latest_compatible(&Version::parse("5.5.3")?)
                .await?,
            Version::parse("5.5.2")?
        );

        assert!(matches!(
            source.latest_compatible(&Version::parse("4.0.0")?).await,
            Err(ClusterPackagingError::NotFound(_))
        ));

        Ok(())
    }
}
