// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Application import.

Importing turns a vendored application tarball into a catalog entry:
the tarball becomes the application package's payload and the manifest
found under `resources/app.yaml` becomes its envelope manifest.

Importers report through two channels: a progress channel that closes
when the operation finishes and an error channel of capacity one.
Callers drain progress until it closes, then read the error channel
exactly once; a closed progress channel without an error means
success. [LocalAppImporter] implements the interface against a local
store so building works without a remote application service.
*/

use {
    crate::{
        archive,
        envelope::PackageOptions,
        error::{ClusterPackagingError, Result},
        installer::InstallerBuilder,
        io::{spool_to_temp_file, PackageStream},
        manifest::{Application, ApplicationManifest, MANIFEST_FILE_NAME},
        store::PackageStore,
        upgrade::UpgradeArtifact,
        RESOURCES_DIR,
    },
    async_trait::async_trait,
    futures::{channel::mpsc, StreamExt},
    std::{
        collections::HashMap,
        io::{Seek, SeekFrom},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Mutex,
        },
    },
};

/// A single progress entry emitted during an import.
#[derive(Clone, Debug)]
pub struct ImportProgress {
    /// Completion percentage, 0 to 100.
    pub completion: u8,

    pub message: String,
}

/// The channel pair an import reports through.
pub struct ImportChannels {
    pub progress: mpsc::UnboundedSender<ImportProgress>,
    pub errors: mpsc::Sender<ClusterPackagingError>,
}

impl ImportChannels {
    /// Create a channel pair plus the receiving halves.
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<ImportProgress>,
        mpsc::Receiver<ClusterPackagingError>,
    ) {
        let (progress, progress_rx) = mpsc::unbounded();
        let (errors, errors_rx) = mpsc::channel(1);

        (Self { progress, errors }, progress_rx, errors_rx)
    }
}

/// Converts vendored tarballs into catalog applications and assembles
/// their installers.
#[async_trait]
pub trait AppImporter: Send + Sync {
    /// Start an import of a vendored application tarball.
    ///
    /// Returns an operation id usable with
    /// [Self::get_imported_application] once the progress channel has
    /// closed without an error.
    async fn create_import_operation(
        &self,
        source: PackageStream,
        channels: ImportChannels,
    ) -> Result<String>;

    /// The application produced by a completed import operation.
    async fn get_imported_application(&self, operation_id: &str) -> Result<Application>;

    /// Produce the installer stream for an imported application.
    async fn get_app_installer(
        &self,
        application: &Application,
        additional: &[UpgradeArtifact],
    ) -> Result<PackageStream>;
}

/// Drain an import's progress channel, then collect its outcome.
///
/// This is the single synchronization point for import completion.
pub async fn wait_for_import(
    mut progress: mpsc::UnboundedReceiver<ImportProgress>,
    mut errors: mpsc::Receiver<ClusterPackagingError>,
    mut observer: impl FnMut(ImportProgress),
) -> Result<()> {
    while let Some(entry) = progress.next().await {
        observer(entry);
    }

    match errors.try_next() {
        Ok(Some(e)) => Err(e),
        _ => Ok(()),
    }
}

/// Importer backed by a package store.
pub struct LocalAppImporter {
    store: Arc<dyn PackageStore>,
    parallelism: usize,
    operations: Mutex<HashMap<String, Application>>,
    next_operation: AtomicU64,
}

impl LocalAppImporter {
    pub fn new(store: Arc<dyn PackageStore>, parallelism: usize) -> Self {
        Self {
            store,
            parallelism: parallelism.max(1),
            operations: Mutex::new(HashMap::new()),
            next_operation: AtomicU64::new(1),
        }
    }

    async fn import(
        &self,
        source: PackageStream,
        progress: &mpsc::UnboundedSender<ImportProgress>,
    ) -> Result<Application> {
        send_progress(progress, 10, "reading vendored application");

        let mut file = spool_to_temp_file(source).await?;

        let manifest_data = extract_manifest(&file)?;
        let manifest = ApplicationManifest::parse(&manifest_data)?;
        let locator = manifest.locator()?;

        send_progress(
            progress,
            60,
            &format!("registering application {}", locator),
        );

        file.seek(SeekFrom::Start(0))?;

        let envelope = self
            .store
            .upsert_package(
                &locator,
                Box::pin(futures::io::AllowStdIo::new(std::io::BufReader::new(file))),
                PackageOptions::application(manifest_data),
            )
            .await?;

        send_progress(progress, 100, "application registered");

        Application::from_envelope(envelope)
    }
}

fn send_progress(sender: &mpsc::UnboundedSender<ImportProgress>, completion: u8, message: &str) {
    // A dropped receiver only means nobody is watching.
    let _ = sender.unbounded_send(ImportProgress {
        completion,
        message: message.to_string(),
    });
}

fn extract_manifest(file: &std::fs::File) -> Result<Vec<u8>> {
    let temp = tempfile::tempdir()?;
    let manifest_entry = format!("{}/{}", RESOURCES_DIR, MANIFEST_FILE_NAME);

    let extracted = archive::unpack_selected(file, temp.path(), &[manifest_entry.as_str()])?;

    if extracted.is_empty() {
        return Err(ClusterPackagingError::BadParameter(format!(
            "vendored application has no {} entry",
            manifest_entry
        )));
    }

    Ok(std::fs::read(
        temp.path().join(RESOURCES_DIR).join(MANIFEST_FILE_NAME),
    )?)
}

#[async_trait]
impl AppImporter for LocalAppImporter {
    async fn create_import_operation(
        &self,
        source: PackageStream,
        channels: ImportChannels,
    ) -> Result<String> {
        let operation_id = format!(
            "import-{}",
            self.next_operation.fetch_add(1, Ordering::SeqCst)
        );

        let mut errors = channels.errors;

        match self.import(source, &channels.progress).await {
            Ok(application) => {
                self.operations
                    .lock()
                    .expect("importer lock poisoned")
                    .insert(operation_id.clone(), application);
            }
            Err(e) => {
                let _ = errors.try_send(e);
            }
        }

        // Dropping the progress sender closes the channel, signalling
        // completion to the consumer.
        Ok(operation_id)
    }

    async fn get_imported_application(&self, operation_id: &str) -> Result<Application> {
        self.operations
            .lock()
            .expect("importer lock poisoned")
            .get(operation_id)
            .cloned()
            .ok_or_else(|| {
                ClusterPackagingError::ImportOperationNotFound(operation_id.to_string())
            })
    }

    async fn get_app_installer(
        &self,
        application: &Application,
        additional: &[UpgradeArtifact],
    ) -> Result<PackageStream> {
        InstallerBuilder::with_parallelism(self.parallelism)
            .build(self.store.as_ref(), application, additional)
            .await
    }
}
