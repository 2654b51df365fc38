//! Plug configuration file loading.
//!
//! The file is HuJSON (JSON with comments and trailing commas); it is
//! standardized to plain JSON before typed deserialization, mirroring how
//! the rest of the bridge treats configuration as strict once parsed.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::Plug;

/// Top-level shape of the plugs configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlugsFile {
    pub plugs: Vec<Plug>,
}

/// Reads and validates the HuJSON plug configuration file.
pub fn load_plugs(path: &Path) -> Result<PlugsFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plugs config file {}", path.display()))?;
    parse_plugs(&text).with_context(|| format!("invalid plugs config {}", path.display()))
}

/// Parses and validates plug configuration from HuJSON text.
pub fn parse_plugs(text: &str) -> Result<PlugsFile> {
    let value = jsonc_parser::parse_to_serde_value(text, &jsonc_parser::ParseOptions::default())
        .context("failed to standardize HuJSON")?
        .context("plugs config is empty")?;

    let file: PlugsFile =
        serde_json::from_value(value).context("failed to unmarshal plugs config")?;

    validate(&file)?;
    Ok(file)
}

fn validate(file: &PlugsFile) -> Result<()> {
    if file.plugs.is_empty() {
        bail!("no plugs configured");
    }

    let mut seen_ids = HashSet::with_capacity(file.plugs.len());
    for (i, plug) in file.plugs.iter().enumerate() {
        if plug.id.is_empty() {
            bail!("plug {i} has no id");
        }
        if plug.name.is_empty() {
            bail!("plug {} has no name", plug.id);
        }
        if plug.address.is_empty() {
            bail!("plug {} has no address", plug.id);
        }
        if !seen_ids.insert(plug.id.as_str()) {
            bail!("duplicate plug id {:?}", plug.id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugs::PlugType;

    const SAMPLE: &str = r#"
    {
        // Living room devices
        "plugs": [
            {
                "id": "lamp",
                "name": "Lamp",
                "address": "192.168.1.10",
                "model": "S31",
                "features": {"power_monitoring": true, "energy_tracking": true},
            },
            {
                "id": "strip",
                "name": "Light Strip",
                "address": "192.168.1.11",
                "type": "bulb",
                "homekit": false,
            },
        ],
    }
    "#;

    #[test]
    fn parses_hujson_with_comments_and_trailing_commas() {
        let file = parse_plugs(SAMPLE).unwrap();
        assert_eq!(file.plugs.len(), 2);
        assert_eq!(file.plugs[0].id, "lamp");
        assert!(file.plugs[0].features.power_monitoring);
        assert!(file.plugs[0].homekit_enabled, "homekit defaults to true");
        assert!(file.plugs[0].web_enabled, "web defaults to true");
        assert_eq!(file.plugs[1].kind, PlugType::Bulb);
        assert!(!file.plugs[1].homekit_enabled);
    }

    #[test]
    fn round_trips_through_plain_json() {
        let file = parse_plugs(SAMPLE).unwrap();
        let json = serde_json::to_string(&file).unwrap();
        let again = parse_plugs(&json).unwrap();
        assert_eq!(file.plugs, again.plugs);
    }

    #[test]
    fn rejects_empty_plug_list() {
        let err = parse_plugs(r#"{"plugs": []}"#).unwrap_err();
        assert!(err.to_string().contains("no plugs configured"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = parse_plugs(
            r#"{"plugs": [
                {"id": "a", "name": "A", "address": "10.0.0.1"},
                {"id": "a", "name": "B", "address": "10.0.0.2"}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate plug id"));
    }

    #[test]
    fn rejects_missing_fields() {
        let err = parse_plugs(r#"{"plugs": [{"id": "", "name": "A", "address": "x"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("has no id"));

        let err = parse_plugs(r#"{"plugs": [{"id": "a", "name": "", "address": "x"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("has no name"));

        let err = parse_plugs(r#"{"plugs": [{"id": "a", "name": "A", "address": ""}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("has no address"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_plugs("not json at all {{{").is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugs.hujson");
        std::fs::write(&path, SAMPLE).unwrap();
        let file = load_plugs(&path).unwrap();
        assert_eq!(file.plugs.len(), 2);

        assert!(load_plugs(&dir.path().join("missing.hujson")).is_err());
    }
}
