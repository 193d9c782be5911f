//! `layerfold digest` command.

use clap::Args;
use layerfold_core::MaterializeConfig;
use layerfold_runtime::resolve_digest_name;

#[derive(Args)]
pub struct DigestArgs {
    /// Image reference, or a bare digest such as "sha256:..."
    pub image: String,
}

pub async fn execute(args: DigestArgs, config: MaterializeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = super::registry_client(&config);
    let name = resolve_digest_name(client.as_ref(), &args.image).await?;
    println!("{name}");
    Ok(())
}
