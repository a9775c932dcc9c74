use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rehearse_core::{Role, SessionSnapshot};

/// Reads a session snapshot (`session_id`, `protocol_ids`, `params`,
/// `history`, `enabled_roles`) from a JSON file.
pub fn load(path: &Path) -> Result<SessionSnapshot> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("could not read transcript `{}`", path.display()))?;
    let snapshot: SessionSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("could not parse transcript `{}`", path.display()))?;
    if snapshot.session_id.trim().is_empty() {
        bail!("transcript `{}` has an empty session_id", path.display());
    }
    Ok(snapshot)
}

pub fn parse_roles(raw: &str) -> Result<BTreeSet<Role>> {
    let roles = raw
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| key.parse::<Role>())
        .collect::<Result<BTreeSet<_>, _>>()?;
    if roles.is_empty() {
        bail!("at least one role is required");
    }
    Ok(roles)
}
