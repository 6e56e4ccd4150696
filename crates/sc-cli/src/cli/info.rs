//! Info Command Implementation

use anyhow::Result;
use sc_core::NodeIdentity;
use sc_core::brand::{DESCRIPTION, PRODUCT_NAME};

use super::NodeArgs;

/// Run the info command
pub fn run(args: &NodeArgs) -> Result<()> {
    let config = args.config()?;
    let hostname = config.require_hostname()?;
    config.ensure_state_dir()?;

    let identity = NodeIdentity::load_or_generate(config.identity_path(), hostname)?;

    println!();
    println!("{} node - {}", PRODUCT_NAME, DESCRIPTION);
    println!("  Hostname:   {}", identity.hostname());
    println!("  Peer ID:    {}", identity.peer_id());
    println!("  Link:       {}", identity.to_link());
    println!("  State dir:  {}", config.state_dir.display());
    println!("  Identity:   {}", config.identity_path().display());
    println!("  Bindings:   {}", config.bindings_path.display());
    if !config.expose.is_empty() {
        let ports: Vec<String> = config.expose.iter().map(ToString::to_string).collect();
        println!("  Exposed:    {}", ports.join(", "));
    }
    println!();

    Ok(())
}
