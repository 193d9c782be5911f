//! `layerfold manifest` command.

use clap::Args;
use layerfold_core::MaterializeConfig;
use layerfold_runtime::oci::manifest::BlobDescriptor;
use layerfold_runtime::{ImageReference, ManifestProvider, ResolvedManifest};

use crate::output::{format_bytes, new_table};

#[derive(Args)]
pub struct ManifestArgs {
    /// Image reference
    pub image: String,

    /// Print the manifest exactly as served by the registry
    #[arg(long)]
    pub raw: bool,
}

pub async fn execute(args: ManifestArgs, config: MaterializeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageReference::parse(&args.image)?;
    let client = super::registry_client(&config);
    let resolved = client.get_manifest(&reference).await?;

    if args.raw {
        println!("{}", String::from_utf8_lossy(&resolved.raw));
    } else {
        print_manifest(&reference, &resolved);
    }
    Ok(())
}

fn print_manifest(reference: &ImageReference, resolved: &ResolvedManifest) {
    println!("Reference: {}", reference);
    println!("Digest:    {}", resolved.digest);
    println!();

    let mut table = new_table(&["KIND", "MEDIA TYPE", "DIGEST", "SIZE"]);
    table.add_row(row("config", &resolved.manifest.config));
    for (i, layer) in resolved.layers().iter().enumerate() {
        table.add_row(row(&format!("layer {}", i), layer));
    }
    println!("{table}");
}

fn row(kind: &str, descriptor: &BlobDescriptor) -> Vec<String> {
    vec![
        kind.to_string(),
        descriptor.media_type.clone(),
        descriptor.digest.to_string(),
        format_bytes(descriptor.size.max(0) as u64),
    ]
}
