// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Build self-contained cluster application images.

This crate implements the core of a cluster/application image builder:
given an application source (a manifest directory or a Helm chart) it
produces a single installer tarball embedding the application, its
dependency applications, the base runtime and its companion packages,
and the vendored container registry content.

The main moving parts:

- [locator] and [envelope] define how artifacts are named and described.
- [blobstore] and [catalog] hold content-addressed payloads and their
  metadata; [store] composes them into package stores, including the
  copy-on-write [store::layered::LayeredPackageStore] used during
  builds and remote sources speaking the same interface.
- [resolver] computes transitive dependency closures and [puller]
  copies them between stores with bounded parallelism.
- [runtime] selects the base runtime version compatible with this
  builder and [upgrade] composes the artifact sets for intermediate
  upgrade hops.
- [engine] drives the whole pipeline and [installer] assembles the
  final tarball, which [imageenv] can re-open for inspection.
*/

pub mod archive;
pub mod blobstore;
pub mod catalog;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod imageenv;
pub mod import;
pub mod installer;
pub mod io;
pub mod locator;
pub mod manifest;
pub mod puller;
pub mod resolver;
pub mod runtime;
pub mod source;
pub mod store;
pub mod upgrade;
pub mod vendor;

/// File name of the embedded catalog database inside a state directory
/// or an installer tarball.
pub const CATALOG_FILE_NAME: &str = "catalog.db";

/// Directory holding content-addressed blob files, relative to a state
/// directory or installer root.
pub const BLOBS_DIR: &str = "packages";

/// Directory holding extracted package content, created lazily.
pub const UNPACKED_DIR: &str = "unpacked";

/// Directory holding the application resources inside a vendor
/// directory or installer tarball.
pub const RESOURCES_DIR: &str = "resources";

pub use crate::{
    error::{ClusterPackagingError, Result},
    locator::Locator,
};
