//! `layerfold save` command: write an image as a single bundle archive.
//!
//! The bundle is named after the manifest digest and can be unpacked later with
//! `layerfold unpack --bundle`.

use std::path::PathBuf;

use clap::Args;
use layerfold_core::MaterializeConfig;
use layerfold_runtime::{ImageReference, MaterializationTarget, Materializer};

use crate::output::format_bytes;

#[derive(Args)]
pub struct SaveArgs {
    /// Image reference to save
    pub image: String,

    /// Output directory
    pub dir: PathBuf,

    /// Name recorded in the bundle index
    #[arg(long)]
    pub name: Option<String>,
}

pub async fn execute(args: SaveArgs, config: MaterializeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageReference::parse(&args.image)?;
    let materializer = Materializer::from_source(super::registry_client(&config), config);
    super::cancel_on_ctrl_c(materializer.cancellation_token());

    println!("Saving {}...", reference);
    let report = materializer
        .materialize(
            &reference,
            MaterializationTarget::bundle(&args.dir, args.name.clone()),
        )
        .await?;

    let size = std::fs::metadata(&report.target)
        .map(|m| m.len())
        .unwrap_or(0);

    println!(
        "Saved {} to {} ({} blobs, {})",
        args.image,
        report.target.display(),
        report.bundled_blobs,
        format_bytes(size)
    );
    Ok(())
}
