// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {crate::locator::Locator, std::path::PathBuf, thiserror::Error};

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum ClusterPackagingError {
    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("unsupported base image: {0}")]
    UnsupportedBaseImage(String),

    #[error("package {0} not found")]
    PackageNotFound(Locator),

    #[error("repository {0} not found")]
    RepositoryNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("package {0} already exists")]
    PackageExists(Locator),

    #[error("state directory {} is already in use by another build", .0.display())]
    AlreadyInUse(PathBuf),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("catalog error: {0:?}")]
    Catalog(#[from] rusqlite::Error),

    #[error("error contacting {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP error: {0:?}")]
    Http(#[from] reqwest::Error),

    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("version parse error: {0:?}")]
    Version(#[from] semver::Error),

    #[error("manifest error: {0:?}")]
    Manifest(#[from] serde_yaml::Error),

    #[error("label encoding error: {0:?}")]
    LabelEncoding(#[from] serde_json::Error),

    #[error("hex parsing error: {0:?}")]
    Hex(#[from] hex::FromHexError),

    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("dependency cycle through {0}")]
    DependencyCycle(Locator),

    #[error("import operation {0} not found")]
    ImportOperationNotFound(String),

    #[error("errors while releasing build resources: {0}")]
    Close(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterPackagingError {
    /// Whether this error describes an artifact or record that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PackageNotFound(_)
                | Self::RepositoryNotFound(_)
                | Self::NotFound(_)
                | Self::ImportOperationNotFound(_)
        )
    }

    /// Wrap a transport-level error with the remote repository URL it
    /// occurred against.
    pub fn network(url: impl ToString, message: impl ToString) -> Self {
        Self::Network {
            url: url.to_string(),
            message: message.to_string(),
        }
    }
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, ClusterPackagingError>;
