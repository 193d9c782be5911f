//! `layerfold unpack` command.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use layerfold_core::config::MAX_PREFETCH_DEPTH;
use layerfold_core::{MaterializeConfig, SpecialFilePolicy};
use layerfold_runtime::{
    BundleSource, ImageReference, MaterializationTarget, MaterializeReport, Materializer,
};

use crate::output::{format_bytes, new_table, short_digest};

#[derive(Args)]
pub struct UnpackArgs {
    /// Image reference (e.g., "alpine:latest", "ghcr.io/org/image:tag")
    pub image: String,

    /// Destination directory (created if missing)
    pub dest: PathBuf,

    /// Read the image from a saved bundle instead of a registry
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Layers fetched ahead of the one being applied (0-2)
    #[arg(long)]
    pub prefetch: Option<usize>,

    /// Fail on device nodes, fifos and other special files instead of skipping them
    #[arg(long)]
    pub fail_on_special: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(args: &UnpackArgs, mut config: MaterializeConfig) -> MaterializeConfig {
    if let Some(depth) = args.prefetch {
        if depth > MAX_PREFETCH_DEPTH {
            tracing::warn!(requested = depth, max = MAX_PREFETCH_DEPTH, "Clamping prefetch depth");
        }
        config.prefetch_depth = depth.min(MAX_PREFETCH_DEPTH);
    }
    if args.fail_on_special {
        config.special_files = SpecialFilePolicy::Fail;
    }
    config
}

pub async fn execute(args: UnpackArgs, config: MaterializeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let config = apply_overrides(&args, config);
    let reference = ImageReference::parse(&args.image)?;

    let materializer = match &args.bundle {
        Some(path) => Materializer::from_source(Arc::new(BundleSource::open(path)?), config),
        None => Materializer::from_source(super::registry_client(&config), config),
    };
    super::cancel_on_ctrl_c(materializer.cancellation_token());

    if !args.json {
        println!("Unpacking {}...", reference);
    }
    let report = materializer
        .materialize(&reference, MaterializationTarget::directory(&args.dest))
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &MaterializeReport) {
    let mut table = new_table(&["LAYER", "DIGEST", "ENTRIES", "WRITTEN", "SKIPPED"]);
    for layer in &report.layers {
        let digest = layerfold_runtime::Digest::parse(&layer.digest)
            .map(|d| short_digest(&d))
            .unwrap_or_else(|_| layer.digest.clone());
        table.add_row(vec![
            layer.index.to_string(),
            digest,
            layer.entries.to_string(),
            format_bytes(layer.bytes_written),
            layer.skipped.len().to_string(),
        ]);
    }
    println!("{table}");
    println!(
        "Unpacked {} ({}) into {} ({})",
        report.reference,
        short_digest(&report.manifest_digest),
        report.target.display(),
        format_bytes(report.bytes_written())
    );
}
