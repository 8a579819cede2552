use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

pub const SP_OURID: &str = "SP_OURID";
pub const SP_IFACE: &str = "SP_IFACE";
pub const SP_USE_CGROUPS: &str = "SP_USE_CGROUPS";

/// Parsed `/etc/storpool.conf`: global `KEY=VALUE` settings plus per-node
/// `[section]` blocks that override them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorpoolConf {
    global: BTreeMap<String, String>,
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl StorpoolConf {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut conf = Self::default();
        let mut section: Option<String> = None;

        for (index, line) in raw.lines().enumerate() {
            let line = strip_comment(line).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or_else(|| anyhow!("line {}: unterminated section header", index + 1))?
                    .trim();
                if name.is_empty() {
                    return Err(anyhow!("line {}: empty section name", index + 1));
                }
                conf.sections.entry(name.to_string()).or_default();
                section = Some(name.to_string());
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("line {}: expected KEY=VALUE", index + 1))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("line {}: empty key", index + 1));
            }
            let value = unquote(value.trim()).to_string();

            let target = match &section {
                Some(name) => conf.sections.entry(name.clone()).or_default(),
                None => &mut conf.global,
            };
            target.insert(key.to_string(), value);
        }

        Ok(conf)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// The effective settings for `node`: globals overlaid by its section.
    pub fn resolve(&self, node: &str) -> BTreeMap<String, String> {
        let mut out = self.global.clone();
        if let Some(overrides) = self.sections.get(node) {
            for (key, value) in overrides {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Owns the parsed view of the StorPool configuration file for one node and
/// re-reads it only after an explicit [`StorpoolConfCache::drop_cache`].
#[derive(Debug, Clone)]
pub struct StorpoolConfCache {
    path: PathBuf,
    node: String,
    cached: Option<BTreeMap<String, String>>,
}

impl StorpoolConfCache {
    pub fn new(path: impl Into<PathBuf>, node: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            node: node.into(),
            cached: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn drop_cache(&mut self) {
        self.cached = None;
    }

    pub fn get_dict(&mut self) -> Result<&BTreeMap<String, String>> {
        if self.cached.is_none() {
            let raw = fs::read_to_string(&self.path).with_context(|| {
                format!("failed to read the StorPool config: {}", self.path.display())
            })?;
            let conf = StorpoolConf::parse(&raw).with_context(|| {
                format!("failed to parse the StorPool config: {}", self.path.display())
            })?;
            let resolved = conf.resolve(&self.node);
            debug!(
                path = %self.path.display(),
                node = %self.node,
                keys = resolved.len(),
                "loaded the StorPool config"
            );
            self.cached = Some(resolved);
        }
        self.cached
            .as_ref()
            .ok_or_else(|| anyhow!("StorPool config cache unexpectedly empty"))
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.get_dict()?.get(key).cloned())
    }
}
