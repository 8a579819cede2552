use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Release names recognised in a bare `VERSION` field.
pub const KNOWN_CODENAMES: &[&str] = &["noble", "jammy", "focal", "bionic", "xenial", "trusty"];

pub fn parse_os_release(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            Some((
                key.trim().to_string(),
                value.trim().trim_matches(|c| c == '"' || c == '\'').to_string(),
            ))
        })
        .collect()
}

/// The distribution codename, from `VERSION_CODENAME`, `UBUNTU_CODENAME`,
/// or a known name mentioned in `VERSION`.
pub fn codename(fields: &BTreeMap<String, String>) -> Result<String> {
    let explicit = fields
        .get("VERSION_CODENAME")
        .or_else(|| fields.get("UBUNTU_CODENAME"))
        .filter(|value| !value.is_empty());
    match explicit {
        Some(name) => {
            if name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                Ok(name.clone())
            } else {
                Err(anyhow!("invalid codename '{name}' in the OS release file"))
            }
        }
        None => {
            let version = fields
                .get("VERSION")
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_default();
            KNOWN_CODENAMES
                .iter()
                .find(|name| version.contains(*name))
                .map(|name| name.to_string())
                .ok_or_else(|| {
                    anyhow!("no VERSION_CODENAME or UBUNTU_CODENAME in the OS release file")
                })
        }
    }
}

pub fn read_codename(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    codename(&parse_os_release(&raw)).with_context(|| format!("in {}", path.display()))
}
