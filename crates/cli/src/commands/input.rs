use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use revbridge_core::pvm::AttributionRequest;

/// Reads an attribution request from a JSON file.
pub fn load_request(path: &Path) -> Result<AttributionRequest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("could not read input file `{}`", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("could not parse attribution request `{}`", path.display()))
}

pub fn describe(error: &anyhow::Error) -> String {
    format!("{error:#}")
}
