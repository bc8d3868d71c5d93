//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use futures::TryStreamExt;
use stowage_common::paths::DEFAULT_STORE;
use stowage_distribution::{
    ProgressEvent, ProgressReporter, TransferReport, pull_full_artifact, push_full_artifact,
};
use stowage_oci::{Digest, DigestHasher};
use stowage_store::store::file_stream;
use stowage_store::{
    DockerCredentials, Flavor, ImageReference, LocalStore, OciStore, RegistryStore, Scope,
};
use tracing::{info, trace};

/// Stowage - content-addressable OCI artifact storage
#[derive(Parser)]
#[command(name = "stowage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Local store: a name under the data directory, or a path
    #[arg(long, global = true, env = "STOWAGE_STORE", default_value = DEFAULT_STORE)]
    pub store: String,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Stowage commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Pull an artifact from a registry into the local store
    Pull {
        /// Reference, e.g. ghcr.io/org/app:v1
        reference: String,

        /// Print the transfer report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Push a manifest from the local store to a registry
    Push {
        /// Digest of the manifest in the local store
        digest: String,

        /// Destination reference
        destination: String,

        /// Tag to use instead of the one in the destination
        #[arg(short, long)]
        tag: Option<String>,

        /// Print the transfer report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve a reference to its manifest descriptor
    Resolve {
        /// Reference, e.g. ghcr.io/org/app:v1
        reference: String,
    },

    /// Report whether the local store holds an object
    Stat {
        /// Object digest
        digest: String,

        /// Look among manifests rather than blobs
        #[arg(long)]
        manifest: bool,
    },

    /// Compute the digest of a file
    Digest {
        /// File to hash
        file: PathBuf,
    },
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns any store, transfer or I/O failure.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Pull { reference, json } => {
                let reference = ImageReference::parse(&reference)?;
                let store = Arc::new(LocalStore::open(&self.store).await?);
                let credentials = DockerCredentials::load_default().await?;

                let report =
                    pull_full_artifact(store, &reference, &credentials, progress_logger()).await?;
                print_report(&format!("Pulled {reference}"), &report, json)
            }

            Commands::Push {
                digest,
                destination,
                tag,
                json,
            } => {
                let digest = Digest::parse(&digest)?;
                let destination = ImageReference::parse(&destination)?;
                let store = Arc::new(LocalStore::open(&self.store).await?);
                let credentials = DockerCredentials::load_default().await?;

                let report = push_full_artifact(
                    store,
                    &digest,
                    &destination,
                    tag.as_deref(),
                    &credentials,
                    progress_logger(),
                )
                .await?;
                print_report(&format!("Pushed {digest}"), &report, json)
            }

            Commands::Resolve { reference } => {
                let reference = ImageReference::parse(&reference)?;
                let credentials = DockerCredentials::load_default().await?;
                let registry =
                    RegistryStore::connect(&reference, &[Scope::Pull], &credentials).await?;

                let descriptor = registry.describe_manifest(reference.target()).await?;
                println!("{}", serde_json::to_string_pretty(&descriptor)?);
                Ok(())
            }

            Commands::Stat { digest, manifest } => {
                let digest = Digest::parse(&digest)?;
                let flavor = if manifest {
                    Flavor::Manifest
                } else {
                    Flavor::Blob
                };
                let store = LocalStore::new(&self.store);

                match store.stat(flavor, &digest).await? {
                    Some(stat) => {
                        println!("{digest}\t{flavor}\t{}", stat.size);
                        Ok(())
                    }
                    None => Err(eyre!(
                        "{flavor} {digest} not found in {}",
                        store.root().display()
                    )),
                }
            }

            Commands::Digest { file } => {
                let mut stream = file_stream(&file).await?;
                let mut hasher = DigestHasher::new();
                while let Some(chunk) = stream.try_next().await? {
                    hasher.update(&chunk);
                }

                let size = hasher.len();
                println!("{}\t{size}", hasher.finalize());
                Ok(())
            }
        }
    }
}

fn progress_logger() -> ProgressReporter {
    ProgressReporter::from_fn(|event| match event {
        ProgressEvent::BlobProgress {
            digest,
            transferred,
            total,
        } => trace!(%digest, transferred, total, "Transferring"),
        ProgressEvent::BlobFinished { digest, size } => info!(%digest, size, "Transferred blob"),
        _ => {}
    })
}

fn print_report(headline: &str, report: &TransferReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{headline}");
    println!("  digest:    {}", report.descriptor.digest);
    println!("  type:      {}", report.descriptor.media_type);
    println!(
        "  blobs:     {} copied ({} bytes), {} already present",
        report.blobs_copied, report.bytes_copied, report.blobs_skipped
    );
    println!("  manifests: {}", report.manifests_written);
    Ok(())
}
