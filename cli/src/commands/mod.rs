//! CLI command definitions and dispatch.

mod digest;
mod manifest;
mod save;
mod unpack;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use layerfold_core::MaterializeConfig;
use layerfold_runtime::{RegistryAuth, RegistryClient};
use tokio_util::sync::CancellationToken;

/// Layerfold: unpack OCI images into directory trees or save them as bundles.
#[derive(Parser)]
#[command(name = "layerfold", version, about)]
pub struct Cli {
    /// Configuration file (YAML, or JSON by extension)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Unpack an image into a directory
    Unpack(unpack::UnpackArgs),
    /// Save an image as a single bundle archive
    Save(save::SaveArgs),
    /// Print the filesystem-safe digest name of an image or digest
    Digest(digest::DigestArgs),
    /// Show the manifest an image resolves to
    Manifest(manifest::ManifestArgs),
}

/// Load the configuration file if one was given, defaults otherwise.
pub(crate) fn load_config(path: Option<&Path>) -> Result<MaterializeConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => MaterializeConfig::from_file(path)?,
        None => MaterializeConfig::default(),
    };
    Ok(config)
}

/// Registry client using credentials from the environment.
pub(crate) fn registry_client(config: &MaterializeConfig) -> Arc<RegistryClient> {
    Arc::new(RegistryClient::with_config(RegistryAuth::from_env(), config))
}

/// Cancel `token` on Ctrl-C.
pub(crate) fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping...");
            token.cancel();
        }
    });
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Unpack(args) => unpack::execute(args, config).await,
        Command::Save(args) => save::execute(args, config).await,
        Command::Digest(args) => digest::execute(args, config).await,
        Command::Manifest(args) => manifest::execute(args, config).await,
    }
}
