// SPDX-License-Identifier: MIT OR Apache-2.0

//! Camera registry: a JSON file mapping camera names to snapshot URLs,
//! loaded once at startup and immutable for the rest of the run.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Error};
use serde::Deserialize;
use url::Url;

/// One camera from the registry file. The name doubles as the directory
/// the camera's snapshots land in, so it must be usable as a single path
/// component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraEntry {
    pub name: String,
    pub url: Url,
}

/// Raw file contents: `{"camera name": "http://..."}`.
#[derive(Deserialize)]
#[serde(transparent)]
struct RawRegistry(BTreeMap<String, String>);

/// Loads and validates the registry file. Any problem here is fatal to the
/// whole run; an empty object is valid and yields no cameras.
pub async fn load(path: &Path) -> Result<Vec<CameraEntry>, Error> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("unable to read camera registry {}", path.display()))?;
    parse(&raw).with_context(|| format!("invalid camera registry {}", path.display()))
}

fn parse(raw: &str) -> Result<Vec<CameraEntry>, Error> {
    let RawRegistry(map) = serde_json::from_str(raw).context("registry must be a JSON object of name: URL")?;
    let mut entries = Vec::with_capacity(map.len());
    for (name, url) in map {
        if name.is_empty() {
            bail!("camera name must be non-empty");
        }
        if name == "." || name == ".." || name.contains(['/', '\\']) {
            bail!("camera name {name:?} is not usable as a directory name");
        }
        let url: Url = url
            .parse()
            .with_context(|| format!("camera {name:?} has an invalid URL"))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!(
                "camera {name:?} has unsupported URL scheme {:?}",
                url.scheme()
            );
        }
        entries.push(CameraEntry { name, url });
    }
    Ok(entries)
}
