//! Check Command Implementation

use anyhow::{Context, Result};
use sc_core::load_bindings;

use super::NodeArgs;

/// Validate the bindings file and print its forwards
pub fn run(args: &NodeArgs, json: bool) -> Result<()> {
    let config = args.config()?;
    let path = &config.bindings_path;

    let bindings = load_bindings(path)
        .with_context(|| format!("Invalid bindings in {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&bindings)?);
        return Ok(());
    }

    println!("{}: {} binding(s)", path.display(), bindings.len());
    for binding in &bindings {
        let tls = if binding.tls { "  [tls]" } else { "" };
        println!("  :{:<5} -> {}{}", binding.from, binding.to, tls);
    }

    Ok(())
}
