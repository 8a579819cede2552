use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{ConvergeError, ConvergeResult};

pub const SETTING_BYPASSED_CHECKS: &str = "bypassed_checks";

/// One `(override, base)` pair of setting maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsLayer {
    pub overrides: BTreeMap<String, String>,
    pub base: BTreeMap<String, String>,
}

impl SettingsLayer {
    pub fn from_base(base: BTreeMap<String, String>) -> Self {
        Self {
            overrides: BTreeMap::new(),
            base,
        }
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        self.overrides
            .get(key)
            .or_else(|| self.base.get(key))
            .map(String::as_str)
    }
}

/// Ordered stack of setting layers; the first layer that knows a key wins,
/// and inside a layer its override map shadows its base map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayeredSettings {
    layers: Vec<SettingsLayer>,
}

impl LayeredSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, layer: SettingsLayer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn push_layer(&mut self, layer: SettingsLayer) {
        self.layers.push(layer);
    }

    /// Inserts a layer in front of all existing ones.
    pub fn push_front_layer(&mut self, layer: SettingsLayer) {
        self.layers.insert(0, layer);
    }

    pub fn layers(&self) -> &[SettingsLayer] {
        &self.layers
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table = toml::from_str::<toml::Table>(content).context("failed parsing settings")?;
        let mut base = BTreeMap::new();
        for (key, value) in table {
            base.insert(key.clone(), flatten_toml_value(&key, &value)?);
        }
        Ok(Self::new().with_layer(SettingsLayer::from_base(base)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed to load settings file: {}", path.display()))
    }

    /// Raw lookup; an empty string is returned as-is.
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.layers.iter().find_map(|layer| layer.lookup(key))
    }

    /// Lookup that treats an empty value as unset.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.raw(key).filter(|value| !value.trim().is_empty())
    }

    pub fn bool(&self, key: &str) -> bool {
        self.string(key).map(is_truthy).unwrap_or(false)
    }

    /// Returns the values of all `keys`, or a recoverable error naming every
    /// key that is still missing.
    pub fn require(&self, keys: &[&str]) -> ConvergeResult<Vec<String>> {
        let missing = keys
            .iter()
            .filter(|key| self.string(key).is_none())
            .map(|key| key.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ConvergeError::missing(missing));
        }
        Ok(keys
            .iter()
            .filter_map(|key| self.string(key).map(ToOwned::to_owned))
            .collect())
    }

    pub fn require_one(&self, key: &str) -> ConvergeResult<String> {
        self.string(key)
            .map(ToOwned::to_owned)
            .ok_or_else(|| ConvergeError::missing([key]))
    }

    /// Whether the operator asked to skip the named safety check.
    pub fn bypassed(&self, check: &str) -> bool {
        self.string(SETTING_BYPASSED_CHECKS)
            .map(|value| value.split(',').map(str::trim).any(|item| item == check))
            .unwrap_or(false)
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "y" | "yes" | "t" | "true"
    )
}

/// Parses `key=value` pairs given on the command line into an override map.
pub fn parse_overrides<I, S>(pairs: I) -> Result<BTreeMap<String, String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut overrides = BTreeMap::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid setting override '{pair}': expected key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("invalid setting override '{pair}': empty key"));
        }
        overrides.insert(key.to_string(), value.to_string());
    }
    Ok(overrides)
}

fn flatten_toml_value(key: &str, value: &toml::Value) -> Result<String> {
    Ok(match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        toml::Value::Array(items) => items
            .iter()
            .map(|item| flatten_toml_value(key, item))
            .collect::<Result<Vec<_>>>()?
            .join(","),
        toml::Value::Table(_) => {
            return Err(anyhow!("setting '{key}' must not be a table"));
        }
    })
}
