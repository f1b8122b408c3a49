// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Hub package service client.

The hub exposes the read half of the package store interface over
HTTP, so the cache synchronizer can treat a remote service and a local
directory interchangeably. Mutating operations are rejected with
`AccessDenied`.
*/

use {
    crate::{
        envelope::{Envelope, PackageOptions, Repository, RuntimeLabels},
        error::{ClusterPackagingError, Result},
        io::PackageStream,
        locator::Locator,
        store::{resolve_latest, PackageStore},
    },
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    futures::TryStreamExt,
    reqwest::{Client, ClientBuilder, IntoUrl, StatusCode, Url},
    serde::de::DeserializeOwned,
};

/// Default HTTP user agent string.
pub const USER_AGENT: &str = "cluster-packaging Rust crate";

/// Hub a builder talks to when none is configured explicitly.
pub const DEFAULT_HUB_URL: &str = "https://hub.cluster.local";

/// Credentials for a hub.
#[derive(Clone, Debug, Default)]
pub struct HubCredentials {
    pub token: Option<String>,
}

impl HubCredentials {
    /// Resolve credentials for a hub URL.
    ///
    /// The default hub serves the runtime catalog anonymously. Any
    /// other hub requires a token.
    pub fn for_hub(url: &Url, token: Option<String>) -> Result<Self> {
        if token.is_none() && url.as_str().trim_end_matches('/') != DEFAULT_HUB_URL {
            return Err(ClusterPackagingError::AccessDenied(format!(
                "no credentials for hub {}",
                url
            )));
        }

        Ok(Self { token })
    }
}

/// Client for a package service served via HTTP.
///
/// Instances are bound to a base URL, which represents the service
/// root.
#[derive(Clone, Debug)]
pub struct HubPackageClient {
    client: Client,
    root_url: Url,
    credentials: HubCredentials,
}

impl HubPackageClient {
    /// Construct an instance bound to the specified URL.
    pub fn new(url: impl IntoUrl, credentials: HubCredentials) -> Result<Self> {
        let client = ClientBuilder::new().user_agent(USER_AGENT).build()?;

        Self::new_client(client, url, credentials)
    }

    /// Construct an instance that skips TLS certificate verification.
    ///
    /// Intended for hubs behind self-signed certificates.
    pub fn new_insecure(url: impl IntoUrl, credentials: HubCredentials) -> Result<Self> {
        let client = ClientBuilder::new()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .build()?;

        Self::new_client(client, url, credentials)
    }

    pub fn new_client(
        client: Client,
        url: impl IntoUrl,
        credentials: HubCredentials,
    ) -> Result<Self> {
        let mut root_url = url.into_url()?;

        // Trailing slashes are significant to Url::join.
        if !root_url.path().ends_with('/') {
            root_url.set_path(&format!("{}/", root_url.path()));
        }

        Ok(Self {
            client,
            root_url,
            credentials,
        })
    }

    /// The URL this client is bound to.
    pub fn url(&self) -> &Url {
        &self.root_url
    }

    fn read_only_error<T>(&self) -> Result<T> {
        Err(ClusterPackagingError::AccessDenied(format!(
            "hub {} is read-only",
            self.root_url
        )))
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let request_url = self.root_url.join(path)?;

        let mut request = self.client.get(request_url.clone());

        if let Some(token) = &self.credentials.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            ClusterPackagingError::network(&self.root_url, format!("{}", e))
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ClusterPackagingError::NotFound(format!(
                "{}",
                request_url
            ))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ClusterPackagingError::AccessDenied(format!(
                    "hub {} rejected the request",
                    self.root_url
                )))
            }
            status if status.is_success() => Ok(response),
            status => Err(ClusterPackagingError::network(
                &self.root_url,
                format!("unexpected HTTP status {} for {}", status, request_url),
            )),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.get(path).await?;

        response
            .json()
            .await
            .map_err(|e| ClusterPackagingError::network(&self.root_url, format!("{}", e)))
    }

    fn package_path(locator: &Locator, suffix: &str) -> String {
        format!(
            "repositories/{}/packages/{}/{}/{}",
            locator.repository, locator.name, locator.version, suffix
        )
    }

    fn not_found_as_package(e: ClusterPackagingError, locator: &Locator) -> ClusterPackagingError {
        if e.is_not_found() {
            ClusterPackagingError::PackageNotFound(locator.clone())
        } else {
            e
        }
    }
}

#[async_trait]
impl PackageStore for HubPackageClient {
    async fn upsert_repository(
        &self,
        _name: &str,
        _expires: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.read_only_error()
    }

    async fn get_repositories(&self) -> Result<Vec<Repository>> {
        self.get_json("repositories").await
    }

    async fn get_repository(&self, name: &str) -> Result<Repository> {
        match self.get_json(&format!("repositories/{}", name)).await {
            Err(e) if e.is_not_found() => {
                Err(ClusterPackagingError::RepositoryNotFound(name.to_string()))
            }
            other => other,
        }
    }

    async fn delete_repository(&self, _name: &str) -> Result<()> {
        self.read_only_error()
    }

    async fn get_packages(&self, repository: &str) -> Result<Vec<Envelope>> {
        self.get_json(&format!("repositories/{}/packages", repository))
            .await
    }

    async fn create_package(
        &self,
        _locator: &Locator,
        _payload: PackageStream,
        _options: PackageOptions,
    ) -> Result<Envelope> {
        self.read_only_error()
    }

    async fn upsert_package(
        &self,
        _locator: &Locator,
        _payload: PackageStream,
        _options: PackageOptions,
    ) -> Result<Envelope> {
        self.read_only_error()
    }

    async fn read_package(&self, locator: &Locator) -> Result<(Envelope, PackageStream)> {
        let locator = resolve_latest(self, locator).await?;

        let envelope = self.read_package_envelope(&locator).await?;

        let response = self
            .get(&Self::package_path(&locator, "blob"))
            .await
            .map_err(|e| Self::not_found_as_package(e, &locator))?;

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", e)))
            .into_async_read();

        Ok((envelope, Box::pin(stream)))
    }

    async fn read_package_envelope(&self, locator: &Locator) -> Result<Envelope> {
        let locator = resolve_latest(self, locator).await?;

        self.get_json(&Self::package_path(&locator, "envelope"))
            .await
            .map_err(|e| Self::not_found_as_package(e, &locator))
    }

    async fn delete_package(&self, _locator: &Locator) -> Result<()> {
        self.read_only_error()
    }

    async fn update_package_labels(
        &self,
        _locator: &Locator,
        _add: RuntimeLabels,
        _remove: Vec<String>,
    ) -> Result<()> {
        self.read_only_error()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_hub_needs_no_credentials() -> Result<()> {
        let url = Url::parse(DEFAULT_HUB_URL)?;

        assert!(HubCredentials::for_hub(&url, None)?.token.is_none());

        Ok(())
    }

    #[test]
    fn other_hubs_require_a_token() -> Result<()> {
        let url = Url::parse("https://hub.example.com")?;

        assert!(matches!(
            HubCredentials::for_hub(&url, None),
            Err(ClusterPackagingError::AccessDenied(_))
        ));

        assert!(HubCredentials::for_hub(&url, Some("token".to_string())).is_ok());

        Ok(())
    }

    #[tokio::test]
    async fn writes_are_rejected() -> Result<()> {
        let client = HubPackageClient::new(
            DEFAULT_HUB_URL,
            HubCredentials::default(),
        )?;

        assert!(matches!(
            client.upsert_repository("example.com", None).await,
            Err(ClusterPackagingError::AccessDenied(_))
        ));
        assert!(matches!(
            client
                .delete_package(&Locator::parse("example.com/app:1.0.0")?)
                .await,
            Err(ClusterPackagingError::AccessDenied(_))
        ));

        Ok(())
    }

    #[test]
    fn trailing_slash_is_normalized() -> Result<()> {
        let client = HubPackageClient::new(
            "https://hub.example.com/api/v1",
            HubCredentials {
                token: Some("token".to_string()),
            },
        )?;

        assert!(client.url().path().ends_with('/'));

        Ok(())
    }
}
