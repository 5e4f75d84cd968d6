use crate::cli::CliArgs;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

pub const MAX_PANES: usize = 4;

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub follow_by_default: bool,
    #[serde(alias = "max_lines")]
    pub max_log_lines: usize,
    #[serde(alias = "refresh_secs")]
    pub refresh_interval_secs: u64,
    pub show_timestamps: bool,
    pub stream_queue_depth: usize,
    pub connect_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub panes: usize,
    #[serde(alias = "kubeconfig")]
    pub kubeconfig_path: Option<PathBuf>,
    #[serde(alias = "contexts")]
    pub default_contexts: Vec<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            follow_by_default: true,
            max_log_lines: 1_000,
            refresh_interval_secs: 5,
            show_timestamps: true,
            stream_queue_depth: 100,
            connect_timeout_secs: 10,
            fetch_timeout_secs: 8,
            panes: 2,
            kubeconfig_path: None,
            default_contexts: Vec::new(),
        }
    }
}

impl Preferences {
    /// Keeps every knob inside the range the event loop can honour.
    fn normalized(mut self) -> Self {
        self.panes = self.panes.clamp(1, MAX_PANES);
        self.max_log_lines = self.max_log_lines.max(1);
        self.stream_queue_depth = self.stream_queue_depth.max(1);
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
        self.fetch_timeout_secs = self.fetch_timeout_secs.max(1);
        self
    }

    pub fn apply_cli(mut self, args: &CliArgs) -> Self {
        if let Some(refresh) = args.refresh_secs {
            self.refresh_interval_secs = refresh;
        }
        if let Some(max_lines) = args.max_log_lines {
            self.max_log_lines = max_lines;
        }
        if !args.contexts.is_empty() {
            self.default_contexts = args.contexts.clone();
        }
        self.normalized()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub source: Option<String>,
    pub preferences: Preferences,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct KtailsConfigFile {
    #[serde(default, alias = "prefs")]
    preferences: Preferences,
}

impl RuntimeConfig {
    /// Reads the first config file found; no file means defaults.
    pub fn load() -> Result<Self> {
        let Some(path) = discover_config_path() else {
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read runtime config {}", path.display()))?;
        let preferences = parse_preferences(&raw)
            .with_context(|| format!("failed to parse runtime config {}", path.display()))?;

        Ok(Self {
            source: Some(path.display().to_string()),
            preferences,
        })
    }
}

fn parse_preferences(raw: &str) -> Result<Preferences> {
    if raw.trim().is_empty() {
        return Ok(Preferences::default());
    }
    let parsed: KtailsConfigFile = serde_yaml::from_str(raw)?;
    Ok(parsed.preferences.normalized())
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KTAILS_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [PathBuf::from("ktails.yaml"), PathBuf::from(".ktails.yaml")];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let candidate = PathBuf::from(home).join(".config/ktails/config.yaml");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{Preferences, parse_preferences};
    use crate::cli::CliArgs;
    use clap::Parser;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let prefs = parse_preferences(
            r#"
preferences:
  max_log_lines: 250
  show_timestamps: false
"#,
        )
        .expect("valid yaml");
        assert_eq!(prefs.max_log_lines, 250);
        assert!(!prefs.show_timestamps);
        assert!(prefs.follow_by_default);
        assert_eq!(prefs.refresh_interval_secs, 5);
        assert_eq!(prefs.panes, 2);
    }

    #[test]
    fn empty_file_means_defaults() {
        assert_eq!(parse_preferences("  \n").expect("empty"), Preferences::default());
    }

    #[test]
    fn pane_count_is_clamped() {
        let prefs = parse_preferences("preferences:\n  panes: 9\n").expect("valid yaml");
        assert_eq!(prefs.panes, 4);
        let prefs = parse_preferences("preferences:\n  panes: 0\n").expect("valid yaml");
        assert_eq!(prefs.panes, 1);
    }

    #[test]
    fn aliases_are_accepted() {
        let prefs = parse_preferences(
            "prefs:\n  refresh_secs: 0\n  contexts: [alpha, beta]\n  kubeconfig: /tmp/kc\n",
        )
        .expect("valid yaml");
        assert_eq!(prefs.refresh_interval_secs, 0);
        assert_eq!(prefs.default_contexts, vec!["alpha", "beta"]);
        assert_eq!(
            prefs.kubeconfig_path.as_deref(),
            Some(std::path::Path::new("/tmp/kc"))
        );
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(parse_preferences("preferences: [unclosed").is_err());
    }

    #[test]
    fn cli_values_override_file_values() {
        let file = Preferences {
            refresh_interval_secs: 30,
            default_contexts: vec!["alpha".to_string()],
            ..Preferences::default()
        };
        let args = CliArgs::parse_from([
            "ktails",
            "--refresh-secs",
            "2",
            "--max-log-lines",
            "0",
            "-c",
            "beta",
        ]);
        let prefs = file.apply_cli(&args);
        assert_eq!(prefs.refresh_interval_secs, 2);
        assert_eq!(prefs.max_log_lines, 1);
        assert_eq!(prefs.default_contexts, vec!["beta"]);
    }
}
