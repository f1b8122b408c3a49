// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The build engine.

`BuildEngine` drives a build from an application source to an
installer tarball: detect the source, select the base runtime, fill
the local cache from a remote source, vendor the container images,
import the vendored application, and package everything into a single
archive.

Each build owns a scratch directory holding its read-write upper
store; the shared cache underneath is only ever appended to. Builds
are Linux-only and fail fast elsewhere.
*/

use {
    crate::{
        archive,
        error::{ClusterPackagingError, Result},
        import::{AppImporter, ImportChannels, ImportProgress, LocalAppImporter},
        locator::Locator,
        manifest::ApplicationManifest,
        puller::{AppPuller, PullEvent},
        resolver,
        runtime::{self, BaseImage},
        source::ImageSource,
        store::{
            archive::ArchiveSource, http::HubPackageClient, layered::LayeredPackageStore,
            local::LocalPackageStore, PackageStore,
        },
        upgrade,
        vendor::{ManifestRewriteVendorer, VendorOptions, Vendorer},
        RESOURCES_DIR,
    },
    semver::Version,
    std::{
        fmt::Formatter,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tempfile::TempDir,
};

/// Stages a build advances through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildStage {
    Init,
    SourceResolved,
    BaseSelected,
    CacheSynced,
    Vendored,
    Imported,
    Packaged,
    Done,
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Init => "initializing",
            Self::SourceResolved => "resolving application source",
            Self::BaseSelected => "selecting base runtime",
            Self::CacheSynced => "synchronizing package cache",
            Self::Vendored => "vendoring container images",
            Self::Imported => "importing application",
            Self::Packaged => "packaging installer",
            Self::Done => "done",
        })
    }
}

/// Progress notifications emitted during a build.
#[derive(Clone, Debug)]
pub enum BuildEvent {
    /// A pipeline stage completed.
    Stage(BuildStage),

    /// An artifact transfer happened while filling the cache or the
    /// installer.
    Pull(PullEvent),

    /// The importer reported progress.
    Import(ImportProgress),
}

impl std::fmt::Display for BuildEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage(stage) => write!(f, "{}", stage),
            Self::Pull(PullEvent::Pulled(locator, size)) => {
                write!(f, "pulled {} ({} bytes)", locator, size)
            }
            Self::Pull(PullEvent::Skipped(locator)) => {
                write!(f, "up to date: {}", locator)
            }
            Self::Import(progress) => {
                write!(f, "import {:>3}% {}", progress.completion, progress.message)
            }
        }
    }
}

/// Shared progress callback.
pub type ProgressCallback = Arc<dyn Fn(BuildEvent) + Send + Sync>;

/// Where runtime releases are synchronized from.
pub enum RemoteSource {
    /// An authenticated package service.
    Hub(HubPackageClient),

    /// A bucket of published release tarballs.
    Archive(ArchiveSource),

    /// No remote; the cache must already be complete.
    Offline,
}

/// Engine construction parameters.
pub struct EngineConfig {
    /// Directory holding the shared package cache.
    pub state_dir: PathBuf,

    /// Version of the builder binary, threaded in by the front-end.
    pub builder_version: Version,

    /// Remote source for runtime releases.
    pub remote: RemoteSource,

    /// Progress callback, if anyone is watching.
    pub progress: Option<ProgressCallback>,
}

/// A single build request.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    /// Application source: a manifest file, a manifest directory or a
    /// Helm chart directory.
    pub source_path: PathBuf,

    /// Output file. Defaults to `<name>-<version>.tar` next to the
    /// current directory.
    pub output_path: Option<PathBuf>,

    /// Whether an existing output file may be replaced.
    pub overwrite: bool,

    /// Base image override, replacing the manifest's own.
    pub base_image: Option<String>,

    /// Intermediate runtime versions the installer must support
    /// upgrading through.
    pub upgrade_via: Vec<String>,

    /// Vendoring options.
    pub vendor: VendorOptions,
}

impl BuildRequest {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            output_path: None,
            overwrite: false,
            base_image: None,
            upgrade_via: vec![],
            vendor: VendorOptions::default(),
        }
    }
}

// Scratch state owned by one build.
struct BuildEnvironment {
    scratch: TempDir,
    layered: Arc<LayeredPackageStore>,
}

impl BuildEnvironment {
    fn create(cache: Arc<LocalPackageStore>) -> Result<Self> {
        let scratch = TempDir::new()?;
        let upper = Arc::new(LocalPackageStore::open(scratch.path().join("state"))?);

        let layered = Arc::new(LayeredPackageStore::new(cache, upper));

        Ok(Self { scratch, layered })
    }

    fn vendor_dir(&self) -> PathBuf {
        self.scratch.path().join("vendor")
    }

    fn close(self) -> Result<()> {
        let Self { scratch, layered } = self;

        drop(layered);

        scratch.close().map_err(|e| {
            ClusterPackagingError::Close(format!("removing scratch directory: {}", e))
        })
    }
}

/// Builds installer images.
pub struct BuildEngine {
    config: EngineConfig,
    cache: Arc<LocalPackageStore>,
    vendorer: Arc<dyn Vendorer>,
}

impl BuildEngine {
    /// Construct an engine over a state directory.
    ///
    /// Fails with `AlreadyInUse` when another build holds the state
    /// directory's catalog open.
    pub fn new(config: EngineConfig) -> Result<Self> {
        check_platform()?;

        let cache = Arc::new(LocalPackageStore::open(&config.state_dir)?);

        Ok(Self {
            config,
            cache,
            vendorer: Arc::new(ManifestRewriteVendorer),
        })
    }

    /// Replace the vendorer, e.g. with one backed by a container
    /// daemon.
    pub fn with_vendorer(mut self, vendorer: Arc<dyn Vendorer>) -> Self {
        self.vendorer = vendorer;
        self
    }

    /// The shared cache this engine fills and builds from.
    pub fn cache(&self) -> &Arc<LocalPackageStore> {
        &self.cache
    }

    /// Release the engine's resources.
    ///
    /// Scratch state is owned per build and cleaned there; this closes
    /// the cache catalog and releases its writer lock. Errors from the
    /// individual steps are aggregated.
    pub fn close(self) -> Result<()> {
        let Self {
            config,
            cache,
            vendorer,
        } = self;

        drop(vendorer);
        drop(config.progress);

        // The catalog closes when the last reference drops. A caller
        // still holding the cache elsewhere keeps the lock alive.
        match Arc::try_unwrap(cache) {
            Ok(store) => {
                drop(store);
                Ok(())
            }
            Err(_) => Err(ClusterPackagingError::Close(
                "cache store is still referenced".to_string(),
            )),
        }
    }

    fn emit(&self, event: BuildEvent) {
        if let Some(cb) = &self.config.progress {
            cb(event);
        }
    }

    fn stage(&self, stage: BuildStage) {
        self.emit(BuildEvent::Stage(stage));
    }

    /// Run a build to completion, returning the output path.
    pub async fn build(&self, request: BuildRequest) -> Result<PathBuf> {
        check_platform()?;
        self.stage(BuildStage::Init);

        // Resolve the source and manifest before touching anything.
        let source = ImageSource::detect(&request.source_path)?;
        let mut manifest = source.load_manifest()?;

        apply_overrides(&mut manifest, &request)?;
        self.stage(BuildStage::SourceResolved);

        let output_path = resolve_output_path(&manifest, &request)?;

        let runtime_version =
            runtime::select_runtime(&manifest, &self.config.builder_version)?;
        manifest.set_runtime_version(&runtime_version);

        let base_image = match &manifest.base_image {
            Some(reference) => Some(BaseImage::parse(reference)?),
            None => None,
        };

        let hops = parse_hops(&request.upgrade_via)?;
        self.stage(BuildStage::BaseSelected);

        // Everything past this point owns scratch state.
        let environment = BuildEnvironment::create(self.cache.clone())?;

        let result = self
            .build_in(
                &environment,
                &source,
                &manifest,
                &runtime_version,
                base_image.as_ref(),
                &hops,
                &request,
                &output_path,
            )
            .await;

        let close_result = environment.close();

        match (result, close_result) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => {
                self.stage(BuildStage::Done);
                Ok(output_path)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_in(
        &self,
        environment: &BuildEnvironment,
        source: &ImageSource,
        manifest: &ApplicationManifest,
        runtime_version: &Version,
        base_image: Option<&BaseImage>,
        hops: &[Version],
        request: &BuildRequest,
        output_path: &Path,
    ) -> Result<()> {
        self.sync_cache(runtime_version, base_image, hops).await?;
        self.stage(BuildStage::CacheSynced);

        let vendor_dir = environment.vendor_dir();
        stage_resources(source, manifest, &vendor_dir)?;

        self.vendorer
            .vendor_dir(&vendor_dir, &request.vendor)
            .await?;
        self.stage(BuildStage::Vendored);

        let vendored = archive::pack_directory(&vendor_dir)?;

        let importer = LocalAppImporter::new(
            environment.layered.clone() as Arc<dyn PackageStore>,
            request.vendor.parallelism,
        );

        let (channels, progress_rx, errors_rx) = ImportChannels::new();
        let operation_id = importer.create_import_operation(vendored, channels).await?;

        let progress = self.config.progress.clone();
        crate::import::wait_for_import(progress_rx, errors_rx, |entry| {
            if let Some(cb) = &progress {
                cb(BuildEvent::Import(entry));
            }
        })
        .await?;

        let application = importer.get_imported_application(&operation_id).await?;
        self.stage(BuildStage::Imported);

        let additional =
            upgrade::intermediate_upgrade_artifacts(environment.layered.as_ref(), hops)
                .await?;

        let installer = importer.get_app_installer(&application, &additional).await?;
        self.stage(BuildStage::Packaged);

        write_output(installer, output_path, request.overwrite).await
    }

    // Ensure the cache holds the runtime closure for the target
    // version, every upgrade hop, and the base image override.
    async fn sync_cache(
        &self,
        runtime_version: &Version,
        base_image: Option<&BaseImage>,
        hops: &[Version],
    ) -> Result<()> {
        let mut wanted = vec![runtime_version.clone()];
        wanted.extend(hops.iter().cloned());

        for version in &wanted {
            self.sync_runtime(version).await?;
        }

        if let Some(base) = base_image {
            self.sync_base_package(base).await?;
        }

        Ok(())
    }

    async fn sync_runtime(&self, version: &Version) -> Result<()> {
        let runtime = runtime::runtime_locator(version)?;
        let cache: &dyn PackageStore = self.cache.as_ref();

        let complete = match cache.read_package_envelope(&runtime).await {
            Ok(_) => resolver::dependencies_satisfied(cache, &runtime).await?,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        if complete {
            return Ok(());
        }

        match &self.config.remote {
            RemoteSource::Offline => Err(runtime_not_found(version)),
            RemoteSource::Hub(client) => self
                .pull_runtime(client, &runtime)
                .await
                .map_err(|e| friendly_runtime_error(e, version)),
            RemoteSource::Archive(archive_source) => {
                let release = archive_source
                    .fetch_runtime(version)
                    .await
                    .map_err(|e| friendly_runtime_error(e, version))?;

                self.pull_runtime(release.store(), &runtime)
                    .await
                    .map_err(|e| friendly_runtime_error(e, version))
            }
        }
    }

    // The base image override references a runtime container version
    // outside the selected runtime's closure. Fetch just that package.
    async fn sync_base_package(&self, base: &BaseImage) -> Result<()> {
        let locator = base.package_locator()?;
        let cache: &dyn PackageStore = self.cache.as_ref();

        match cache.read_package_envelope(&locator).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let puller = self.puller();

        match &self.config.remote {
            RemoteSource::Offline => Err(ClusterPackagingError::NotFound(format!(
                "base image package {} not found in the cache",
                locator
            ))),
            RemoteSource::Hub(client) => {
                puller.pull_package(client, cache, locator.clone()).await
            }
            RemoteSource::Archive(archive_source) => {
                let release = archive_source.fetch_runtime(&base.version).await?;

                puller
                    .pull_package(release.store(), cache, locator.clone())
                    .await
            }
        }
    }

    async fn pull_runtime(
        &self,
        source: &dyn PackageStore,
        runtime: &Locator,
    ) -> Result<()> {
        self.puller()
            .pull_app(source, self.cache.as_ref(), runtime)
            .await
    }

    fn puller(&self) -> AppPuller {
        let mut puller = AppPuller::default();

        if let Some(cb) = self.config.progress.clone() {
            puller.progress = Some(Box::new(move |event| cb(BuildEvent::Pull(event))));
        }

        puller
    }
}

fn check_platform() -> Result<()> {
    if cfg!(target_os = "linux") {
        Ok(())
    } else {
        Err(ClusterPackagingError::BadParameter(
            "cluster images can only be built on Linux".to_string(),
        ))
    }
}

fn runtime_not_found(version: &Version) -> ClusterPackagingError {
    ClusterPackagingError::NotFound(format!("base image version {} not found", version))
}

fn friendly_runtime_error(
    e: ClusterPackagingError,
    version: &Version,
) -> ClusterPackagingError {
    if e.is_not_found() {
        runtime_not_found(version)
    } else {
        e
    }
}

fn apply_overrides(manifest: &mut ApplicationManifest, request: &BuildRequest) -> Result<()> {
    if let Some(name) = &request.vendor.package_name {
        manifest.metadata.name = name.clone();
    }

    if let Some(version) = &request.vendor.package_version {
        manifest.metadata.resource_version = version.clone();
    }

    if let Some(base) = &request.base_image {
        manifest.base_image = Some(base.clone());
    }

    // Overridden metadata must still form a valid locator.
    manifest.locator()?;

    Ok(())
}

fn resolve_output_path(
    manifest: &ApplicationManifest,
    request: &BuildRequest,
) -> Result<PathBuf> {
    let path = match &request.output_path {
        Some(path) => path.clone(),
        None => PathBuf::from(format!(
            "{}-{}.tar",
            manifest.metadata.name, manifest.metadata.resource_version
        )),
    };

    if path.exists() && !request.overwrite {
        return Err(ClusterPackagingError::BadParameter(format!(
            "output file {} already exists; pass the overwrite flag to replace it",
            path.display()
        )));
    }

    Ok(path)
}

// Copy the application source beside a freshly materialized manifest,
// producing the directory the vendorer operates on.
fn stage_resources(
    source: &ImageSource,
    manifest: &ApplicationManifest,
    vendor_dir: &Path,
) -> Result<()> {
    let resources_dir = vendor_dir.join(RESOURCES_DIR);

    std::fs::create_dir_all(&resources_dir)
        .map_err(|e| ClusterPackagingError::IoPath(format!("{}", resources_dir.display()), e))?;

    if let Some(dir) = source.resources_dir() {
        copy_dir_contents(dir, &resources_dir)?;
    }

    std::fs::write(
        resources_dir.join(crate::manifest::MANIFEST_FILE_NAME),
        manifest.to_yaml()?,
    )?;

    Ok(())
}

fn copy_dir_contents(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from)
        .map_err(|e| ClusterPackagingError::IoPath(format!("{}", from.display()), e))?
    {
        let entry = entry?;
        let target = to.join(entry.file_name());

        if entry.path().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| ClusterPackagingError::IoPath(format!("{}", target.display()), e))?;
            copy_dir_contents(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| {
                ClusterPackagingError::IoPath(format!("{}", target.display()), e)
            })?;
        }
    }

    Ok(())
}

fn parse_hops(versions: &[String]) -> Result<Vec<Version>> {
    versions
        .iter()
        .map(|v| {
            Version::parse(v).map_err(|_| {
                ClusterPackagingError::BadParameter(format!(
                    "invalid intermediate runtime version: {}",
                    v
                ))
            })
        })
        .collect()
}

async fn write_output(
    mut installer: crate::io::PackageStream,
    path: &Path,
    overwrite: bool,
) -> Result<()> {
    if path.exists() && !overwrite {
        return Err(ClusterPackagingError::BadParameter(format!(
            "output file {} already exists",
            path.display()
        )));
    }

    let file = std::fs::File::create(path)
        .map_err(|e| ClusterPackagingError::IoPath(format!("{}", path.display()), e))?;

    let mut writer = futures::io::AllowStdIo::new(file);

    futures::io::copy(&mut installer, &mut writer)
        .await
        .map_err(|e| ClusterPackagingError::IoPath(format!("{}", path.display()), e))?;

    Ok(())
}
