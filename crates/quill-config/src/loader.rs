// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. Explicit config directory
    if let Ok(dir) = std::env::var("QUILL_CONFIG_DIR") {
        paths.push(PathBuf::from(&dir).join("config.yaml"));
        paths.push(PathBuf::from(&dir).join("config.yml"));
    }

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/quill/config.yaml"));
        paths.push(home.join(".config/quill/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("quill/config.yaml"));
        paths.push(cfg.join("quill/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".quill/config.yaml"));
    paths.push(PathBuf::from(".quill/config.yml"));
    paths.push(PathBuf::from(".quill.yaml"));
    paths.push(PathBuf::from(".quill.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// env-var feature toggles.  `extra` may provide an explicit path (e.g. a
/// `--config` CLI flag) that overrides everything else.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, read_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_yaml(&mut merged, read_layer(p)?);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    apply_env_toggles(&mut config);
    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Feature toggles read from the environment; unset vars leave the file/
/// default value in place.
fn apply_env_toggles(config: &mut Config) {
    if let Some(v) = env_bool("QUILL_AUTO_COMPACTION") {
        config.compaction.auto = v;
    }
    if let Some(v) = env_bool("QUILL_AUTO_RETRY") {
        config.retry.auto = v;
    }
}

fn env_bool(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            debug!(var = name, value = other, "ignoring unparseable boolean env var");
            None
        }
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_overrides() {
        let mut dst = val("compaction:\n  threshold: 0.75\n");
        merge_yaml(&mut dst, val("compaction:\n  threshold: 0.5\n"));
        let c: Config = serde_yaml::from_value(dst).unwrap();
        assert!((c.compaction.threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn merge_preserves_sibling_keys() {
        let mut dst = val("session:\n  event_buffer: 8\n");
        merge_yaml(&mut dst, val("session:\n  interrupt_mode: wait\n"));
        let c: Config = serde_yaml::from_value(dst).unwrap();
        assert_eq!(c.session.event_buffer, 8);
        assert_eq!(c.session.interrupt_mode, crate::InterruptMode::Wait);
    }

    #[test]
    fn explicit_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.yaml");
        std::fs::write(&path, "retry:\n  max_attempts: 2\n").unwrap();
        let c = load(Some(&path)).unwrap();
        assert_eq!(c.retry.max_attempts, 2);
    }

    #[test]
    fn env_bool_parses_common_spellings() {
        std::env::set_var("QUILL_TEST_BOOL_A", "yes");
        std::env::set_var("QUILL_TEST_BOOL_B", "0");
        assert_eq!(env_bool("QUILL_TEST_BOOL_A"), Some(true));
        assert_eq!(env_bool("QUILL_TEST_BOOL_B"), Some(false));
        assert_eq!(env_bool("QUILL_TEST_BOOL_MISSING"), None);
    }
}
