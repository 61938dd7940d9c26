//! Persistent JSON configuration: the approved/ignored uid sets and policy
//! flags. Load is best-effort (an absent file yields defaults); save is a
//! single atomic rewrite (write to a sibling temp file, then rename).

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(
        rename = "auto-mute-unknown",
        alias = "auto_mute_unknown",
        default = "default_true"
    )]
    pub auto_mute_unknown: bool,

    #[serde(
        rename = "require-approved",
        alias = "require_approved",
        default = "default_true"
    )]
    pub require_approved: bool,

    #[serde(
        rename = "target-channel",
        alias = "target_channel",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_channel: Option<i64>,

    #[serde(
        rename = "target-channel-name",
        alias = "target_channel_name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_channel_name: Option<String>,

    #[serde(rename = "show-ignored", alias = "show_ignored", default)]
    pub show_ignored: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            auto_mute_unknown: true,
            require_approved: true,
            target_channel: None,
            target_channel_name: None,
            show_ignored: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default)]
    pub approved: BTreeSet<String>,
    #[serde(default)]
    pub ignored: BTreeSet<String>,
    #[serde(default)]
    pub policies: Policy,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            approved: BTreeSet::new(),
            ignored: BTreeSet::new(),
            policies: Policy::default(),
        }
    }
}

impl PersistedConfig {
    /// Loads the config at `path`. A missing file is not an error: it
    /// yields the defaults, matching the daemon's best-effort load policy.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically rewrites the config file at `path`: serialize, write to a
    /// sibling `.tmp` file, then rename over the destination.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = PersistedConfig::load(&path).unwrap();
        assert_eq!(cfg, PersistedConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = PersistedConfig::default();
        cfg.approved.insert("uid-1".to_string());
        cfg.ignored.insert("uid-2".to_string());
        cfg.policies.target_channel = Some(5);
        cfg.policies.target_channel_name = Some("Lobby".to_string());
        cfg.policies.show_ignored = true;
        cfg.save(&path).unwrap();
        let loaded = PersistedConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn accepts_kebab_case_keys() {
        let json = r#"{"approved":["a"],"ignored":[],"policies":{"auto-mute-unknown":false,"require-approved":false,"target-channel":7,"target-channel-name":"Lounge","show-ignored":true}}"#;
        let cfg: PersistedConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.policies.auto_mute_unknown);
        assert_eq!(cfg.policies.target_channel, Some(7));
        assert!(cfg.policies.show_ignored);
    }

    #[test]
    fn accepts_legacy_snake_case_keys() {
        let json = r#"{"approved":[],"ignored":[],"policies":{"auto_mute_unknown":false,"require_approved":true,"target_channel":null,"target_channel_name":null,"show_ignored":false}}"#;
        let cfg: PersistedConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.policies.auto_mute_unknown);
        assert!(cfg.policies.require_approved);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let json = r#"{"approved":[],"ignored":[],"policies":{},"mystery":true}"#;
        let cfg: PersistedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.policies, Policy::default());
    }

    #[test]
    fn serialized_output_uses_kebab_case() {
        let cfg = PersistedConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("auto-mute-unknown"));
        assert!(!json.contains("auto_mute_unknown"));
    }
}
