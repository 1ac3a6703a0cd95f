// Configuration file handling for the Nearlink CLI
//
// The file is the JSON form of `NearlinkConfig`. Keys are addressed with
// dotted paths such as `initiator.auto_connect` or `reconnect.max_attempts`
// under their role.

use anyhow::{Context, Result};
use nearlink_core::NearlinkConfig;
use serde_json::Value;
use std::path::Path;

/// Write the default configuration, refusing to clobber an existing file
pub fn init(path: &Path, force: bool) -> Result<NearlinkConfig> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = NearlinkConfig::default();
    config
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(config)
}

pub fn load(path: &Path) -> Result<NearlinkConfig> {
    NearlinkConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Load `path` when given, the defaults otherwise
pub fn load_or_default(path: Option<&Path>) -> Result<NearlinkConfig> {
    match path {
        Some(path) => load(path),
        None => Ok(NearlinkConfig::default()),
    }
}

/// Flattened `key = value` pairs for display
pub fn list(config: &NearlinkConfig) -> Result<Vec<(String, String)>> {
    let value = serde_json::to_value(config)?;
    let mut out = Vec::new();
    flatten("", &value, &mut out);
    Ok(out)
}

fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

/// Set one dotted key. The value is parsed as JSON first so numbers and
/// booleans keep their type; anything else is taken as a string.
pub fn set(config: &NearlinkConfig, key: &str, raw: &str) -> Result<NearlinkConfig> {
    let mut doc = serde_json::to_value(config)?;
    let pointer = format!("/{}", key.replace('.', "/"));
    let slot = doc
        .pointer_mut(&pointer)
        .with_context(|| format!("Unknown config key: {}", key))?;
    if slot.is_object() {
        anyhow::bail!("{} is a section, not a value", key);
    }
    *slot = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

    let updated = NearlinkConfig::from_json_str(&doc.to_string())
        .with_context(|| format!("Invalid value for {}: {}", key, raw))?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nearlink.json");

        let written = init(&path, false).unwrap();
        assert_eq!(load(&path).unwrap(), written);
        assert!(init(&path, false).is_err());
        assert!(init(&path, true).is_ok());
    }

    #[test]
    fn test_set_typed_values() {
        let config = NearlinkConfig::default();

        let updated = set(&config, "initiator.auto_connect", "false").unwrap();
        assert!(!updated.initiator.auto_connect);

        let updated = set(&updated, "initiator.reconnect.max_attempts", "3").unwrap();
        assert_eq!(updated.initiator.reconnect.max_attempts, 3);

        let updated = set(&updated, "responder.local_name", "kiosk").unwrap();
        assert_eq!(updated.responder.local_name.as_deref(), Some("kiosk"));
    }

    #[test]
    fn test_set_rejects_bad_keys_and_values() {
        let config = NearlinkConfig::default();
        assert!(set(&config, "initiator.nope", "1").is_err());
        assert!(set(&config, "initiator", "1").is_err());
        assert!(set(&config, "initiator.write_verify_attempts", "0").is_err());
    }

    #[test]
    fn test_list_flattens_sections() {
        let keys: Vec<String> = list(&NearlinkConfig::default())
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert!(keys.contains(&"initiator.dedupe_ttl_ms".to_string()));
        assert!(keys.contains(&"protocol.service_uuid".to_string()));
    }
}
