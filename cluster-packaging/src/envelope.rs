// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package metadata records. */

use {
    crate::{
        error::Result,
        io::ContentDigest,
        locator::Locator,
    },
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

/// Well-known runtime label keys and values.
pub mod labels {
    /// Category of a package. Values are the `PURPOSE_*` constants.
    pub const PURPOSE: &str = "purpose";

    /// Marks the canonical installed copy of a package.
    pub const INSTALLED: &str = "installed";

    /// Zero-version locator string of the package this one configures.
    pub const CONFIG_PACKAGE_FOR: &str = "config-package-for";

    /// IP of the host the package was produced for.
    pub const ADVERTISE_IP: &str = "advertise-ip";

    /// Opaque correlation id of the operation that produced the package.
    pub const OPERATION_ID: &str = "operation-id";

    /// Runtime version an upgrade-hop artifact belongs to.
    pub const RUNTIME_UPGRADE_VERSION: &str = "runtime-upgrade-version";

    pub const PURPOSE_CA: &str = "ca";
    pub const PURPOSE_EXPORT: &str = "export";
    pub const PURPOSE_LICENSE: &str = "license";
    pub const PURPOSE_RESOURCES: &str = "resources";
    pub const PURPOSE_PLANET_SECRETS: &str = "planet-secrets";
    pub const PURPOSE_PLANET_CONFIG: &str = "planet-config";
    pub const PURPOSE_RUNTIME: &str = "runtime";
    pub const PURPOSE_TELEPORT_CONFIG: &str = "teleport-config";
    pub const PURPOSE_METADATA: &str = "metadata";
    pub const PURPOSE_RPC_SECRETS: &str = "rpc-secrets";

    /// Marks artifacts carried for an intermediate upgrade hop.
    pub const PURPOSE_RUNTIME_UPGRADE: &str = "runtime-upgrade";
}

/// Envelope type tag for application packages.
pub const TYPE_APPLICATION: &str = "app";

/// User and system labels attached to a package.
pub type RuntimeLabels = BTreeMap<String, String>;

/// Metadata describing a stored package.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Envelope {
    /// Address of the package.
    pub locator: Locator,

    /// Payload size in bytes as stored.
    pub size_bytes: u64,

    /// Hex SHA-512 of the payload bytes as stored.
    pub sha512: String,

    /// Runtime labels, both system and user supplied.
    #[serde(default)]
    pub runtime_labels: RuntimeLabels,

    /// Whether the package is hidden from listings presented to users.
    #[serde(default)]
    pub hidden: bool,

    /// Whether the payload is stored encrypted.
    #[serde(default)]
    pub encrypted: bool,

    /// Application type tag. [TYPE_APPLICATION] for applications.
    #[serde(default)]
    pub package_type: Option<String>,

    /// Opaque manifest carried alongside the payload.
    #[serde(default)]
    pub manifest: Option<Vec<u8>>,

    /// Creation timestamp.
    pub created: DateTime<Utc>,

    /// Identity that created the package.
    pub created_by: String,
}

impl Envelope {
    /// Obtain a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.runtime_labels.get(key).map(|v| v.as_str())
    }

    /// Whether this envelope describes an application.
    pub fn is_application(&self) -> bool {
        self.package_type.as_deref() == Some(TYPE_APPLICATION)
    }

    /// Whether this envelope is a metadata-only placeholder without a
    /// stored payload.
    pub fn is_metadata_placeholder(&self) -> bool {
        self.label(labels::PURPOSE) == Some(labels::PURPOSE_METADATA)
    }

    /// Parse the payload digest.
    pub fn digest(&self) -> Result<ContentDigest> {
        ContentDigest::from_hex(&self.sha512)
    }
}

/// A named bucket of packages.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Repository {
    pub name: String,

    /// When the repository and its contents expire. `None` means the
    /// repository never expires.
    pub expires: Option<DateTime<Utc>>,
}

/// Options controlling package creation.
#[derive(Clone, Debug, Default)]
pub struct PackageOptions {
    pub labels: RuntimeLabels,
    pub hidden: bool,
    pub encrypted: bool,
    pub package_type: Option<String>,
    pub manifest: Option<Vec<u8>>,
    pub created_by: Option<String>,
}

impl PackageOptions {
    /// Options for an application package carrying the given manifest.
    pub fn application(manifest: Vec<u8>) -> Self {
        Self {
            package_type: Some(TYPE_APPLICATION.to_string()),
            manifest: Some(manifest),
            ..Default::default()
        }
    }

    /// Options reproducing an existing envelope's metadata.
    ///
    /// Used when copying packages between stores so labels, manifest,
    /// type and flags survive the transfer.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            labels: envelope.runtime_labels.clone(),
            hidden: envelope.hidden,
            encrypted: envelope.encrypted,
            package_type: envelope.package_type.clone(),
            manifest: envelope.manifest.clone(),
            created_by: Some(envelope.created_by.clone()),
        }
    }
}
