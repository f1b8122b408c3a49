// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    cluster_packaging::{
        engine::{BuildEngine, BuildEvent, BuildRequest, EngineConfig, RemoteSource},
        error::ClusterPackagingError,
        imageenv::{ImageEnvironment, OpenMode},
        store::{
            archive::ArchiveSource,
            http::{HubCredentials, HubPackageClient, DEFAULT_HUB_URL},
        },
        vendor::VendorOptions,
    },
    std::{
        path::PathBuf,
        sync::{Arc, Mutex},
    },
    thiserror::Error,
};

const BUILD_ABOUT: &str = "\
Build a cluster application image.

The SOURCE argument points at the application to build:

- a manifest file (app.yaml),
- a directory containing app.yaml, or
- a Helm chart directory (containing Chart.yaml).

The build selects a base runtime compatible with this binary,
downloads the runtime and its dependencies into the local cache,
vendors the container images referenced by the application's
Kubernetes resources, and writes a single self-contained installer
tarball.

Runtime releases are downloaded from the hub unless --runtime-archive
points at a release bucket or --offline restricts the build to the
local cache.
";

const INSPECT_ABOUT: &str = "\
Inspect a built application image.

Lists the packages embedded in an installer tarball. With --images,
also lists the vendored container images (this unpacks the image and
is slower).
";

#[derive(Debug, Error)]
pub enum TeleError {
    #[error("argument parsing error: {0:?}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Packaging(#[from] ClusterPackagingError),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("invalid version: {0:?}")]
    Version(#[from] semver::Error),

    #[error("invalid URL: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),
}

pub type Result<T> = std::result::Result<T, TeleError>;

pub async fn run_cli() -> Result<()> {
    let default_parallelism = format!("{}", num_cpus::get());

    let app = Command::new("tele")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Build self-contained cluster application images")
        .arg_required_else_help(true);

    let app = app.subcommand(
        Command::new("build")
            .about("Build an application image from a manifest or Helm chart")
            .long_about(BUILD_ABOUT)
            .arg(
                Arg::new("source")
                    .required(true)
                    .value_name("SOURCE")
                    .allow_invalid_utf8(true)
                    .help("Application manifest, manifest directory or chart directory"),
            )
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .help("Output file [default: <name>-<version>.tar]"),
            )
            .arg(
                Arg::new("force")
                    .short('f')
                    .long("force")
                    .help("Overwrite an existing output file"),
            )
            .arg(
                Arg::new("name")
                    .long("name")
                    .takes_value(true)
                    .help("Override the application package name"),
            )
            .arg(
                Arg::new("set-version")
                    .long("set-version")
                    .takes_value(true)
                    .help("Override the application package version"),
            )
            .arg(
                Arg::new("base-image")
                    .long("base-image")
                    .takes_value(true)
                    .help("Base runtime container image, e.g. planet:0.0.2"),
            )
            .arg(
                Arg::new("upgrade-via")
                    .long("upgrade-via")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .use_value_delimiter(true)
                    .help("Intermediate runtime versions to embed for multi-hop upgrades"),
            )
            .arg(
                Arg::new("parallelism")
                    .long("parallelism")
                    .takes_value(true)
                    .default_value(&default_parallelism)
                    .help("Maximum number of parallel transfers"),
            )
            .arg(
                Arg::new("registry-url")
                    .long("registry-url")
                    .takes_value(true)
                    .help("Registry host vendored image references point at"),
            )
            .arg(
                Arg::new("state-dir")
                    .long("state-dir")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .help("Directory holding the shared package cache [default: ~/.tele]"),
            )
            .arg(
                Arg::new("hub")
                    .long("hub")
                    .takes_value(true)
                    .help("Package hub to download runtime releases from"),
            )
            .arg(
                Arg::new("token")
                    .long("token")
                    .takes_value(true)
                    .help("Bearer token for the hub"),
            )
            .arg(
                Arg::new("runtime-archive")
                    .long("runtime-archive")
                    .takes_value(true)
                    .help("Base URL of a runtime release bucket instead of a hub"),
            )
            .arg(
                Arg::new("offline")
                    .long("offline")
                    .help("Build from the local cache without a remote source"),
            )
            .arg(
                Arg::new("insecure")
                    .long("insecure")
                    .help("Skip TLS certificate verification when talking to the hub"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .help("Print individual package transfers"),
            ),
    );

    let mut app = app.subcommand(
        Command::new("inspect")
            .about("List the contents of a built application image")
            .long_about(INSPECT_ABOUT)
            .arg(
                Arg::new("image")
                    .required(true)
                    .value_name("IMAGE")
                    .allow_invalid_utf8(true)
                    .help("Path to an installer tarball"),
            )
            .arg(
                Arg::new("images")
                    .long("images")
                    .help("Also list vendored container images"),
            ),
    );

    let matches = app.clone().get_matches();

    match matches.subcommand() {
        Some(("build", args)) => command_build(args).await,
        Some(("inspect", args)) => command_inspect(args).await,
        Some((command, _)) => Err(TeleError::InvalidSubCommand(command.to_string())),
        None => {
            app.print_help()?;
            Ok(())
        }
    }
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tele")
}

fn remote_source(args: &ArgMatches) -> Result<RemoteSource> {
    if args.is_present("offline") {
        return Ok(RemoteSource::Offline);
    }

    if let Some(archive_url) = args.value_of("runtime-archive") {
        return Ok(RemoteSource::Archive(ArchiveSource::new(archive_url)?));
    }

    let hub = args.value_of("hub").unwrap_or(DEFAULT_HUB_URL);
    let hub_url = url::Url::parse(hub)?;

    let credentials =
        HubCredentials::for_hub(&hub_url, args.value_of("token").map(|t| t.to_string()))?;

    let client = if args.is_present("insecure") {
        HubPackageClient::new_insecure(hub_url, credentials)?
    } else {
        HubPackageClient::new(hub_url, credentials)?
    };

    Ok(RemoteSource::Hub(client))
}

async fn command_build(args: &ArgMatches) -> Result<()> {
    let parallelism = args.value_of_t::<usize>("parallelism")?;
    let builder_version = semver::Version::parse(env!("CARGO_PKG_VERSION"))?;

    let state_dir = args
        .value_of_os("state-dir")
        .map(PathBuf::from)
        .unwrap_or_else(default_state_dir);

    let verbose = args.is_present("verbose");

    // One tick per pipeline stage.
    let bar = Arc::new(Mutex::new(pbr::ProgressBar::new(8)));
    bar.lock().unwrap().show_speed = false;
    bar.lock().unwrap().show_time_left = false;

    let progress_bar = bar.clone();
    let progress = Arc::new(move |event: BuildEvent| match &event {
        BuildEvent::Stage(stage) => {
            let mut bar = progress_bar.lock().unwrap();
            bar.message(&format!("{} ", stage));
            bar.inc();
        }
        BuildEvent::Pull(_) | BuildEvent::Import(_) => {
            if verbose {
                eprintln!("{}", event);
            }
        }
    });

    let engine = BuildEngine::new(EngineConfig {
        state_dir,
        builder_version,
        remote: remote_source(args)?,
        progress: Some(progress),
    })?;

    let mut vendor = VendorOptions {
        package_name: args.value_of("name").map(|v| v.to_string()),
        package_version: args.value_of("set-version").map(|v| v.to_string()),
        parallelism,
        ..VendorOptions::default()
    };

    if let Some(registry) = args.value_of("registry-url") {
        vendor.registry_url = registry.to_string();
    }

    let request = BuildRequest {
        source_path: PathBuf::from(
            args.value_of_os("source").expect("source argument is required"),
        ),
        output_path: args.value_of_os("output").map(PathBuf::from),
        overwrite: args.is_present("force"),
        base_image: args.value_of("base-image").map(|v| v.to_string()),
        upgrade_via: args
            .values_of("upgrade-via")
            .map(|values| values.map(|v| v.to_string()).collect())
            .unwrap_or_default(),
        vendor,
    };

    let output = engine.build(request).await?;

    bar.lock().unwrap().finish();
    println!("\nimage written to {}", output.display());

    engine.close()?;

    Ok(())
}

async fn command_inspect(args: &ArgMatches) -> Result<()> {
    let path = PathBuf::from(args.value_of_os("image").expect("image argument is required"));
    let list_images = args.is_present("images");

    let mode = if list_images {
        OpenMode::Full
    } else {
        OpenMode::CatalogOnly
    };

    let image = ImageEnvironment::open_tarball(&path, mode)?;

    let manifest = image.manifest()?;
    println!(
        "application: {}:{}",
        manifest.metadata.name, manifest.metadata.resource_version
    );

    println!("packages:");
    for envelope in image.packages().await? {
        println!("  {} ({} bytes)", envelope.locator, envelope.size_bytes);
    }

    if list_images {
        println!("container images:");
        for reference in image.vendored_images().await? {
            println!("  {}", reference);
        }
    }

    Ok(())
}
