// Sandbox settings
// Loaded from ~/.config/consoles/sandbox.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default poll interval for interruptible waits, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default number of VM instructions between interrupt checks.
pub const DEFAULT_HOOK_INTERVAL: u32 = 1_000;

/// Error reports longer than this many lines are dumped to a file.
pub const DEFAULT_REPORT_LINE_LIMIT: usize = 16;

/// File name prefix for dumped error reports.
pub const DEFAULT_DUMP_PREFIX: &str = "lua_dump";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    // Interrupt polling
    #[serde(rename = "sandbox.pollIntervalMs")]
    pub poll_interval_ms: u64,

    #[serde(rename = "sandbox.hookInterval")]
    pub hook_interval: u32,

    // Error reports
    #[serde(rename = "report.lineLimit")]
    pub report_line_limit: usize,

    #[serde(rename = "report.dumpPrefix")]
    pub dump_prefix: String,

    #[serde(rename = "report.color")]
    pub color: bool,

    // Diagnostics
    pub debug: bool,

    // Root folder for exec_file, None = <data_dir>/consoles
    #[serde(rename = "dataDir", skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            hook_interval: DEFAULT_HOOK_INTERVAL,
            report_line_limit: DEFAULT_REPORT_LINE_LIMIT,
            dump_prefix: DEFAULT_DUMP_PREFIX.to_string(),
            color: true,
            debug: false,
            data_dir: None,
        }
    }
}

impl SandboxSettings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("consoles")
            .join("sandbox.json")
    }

    /// Folder that `exec_file` paths are resolved against
    pub fn effective_data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("consoles"),
        }
    }

    /// Load settings from the default location, falling back to defaults
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load settings from `path`, falling back to defaults.
    ///
    /// A missing file is not an error. Malformed files are reported on stderr
    /// and replaced by defaults so a bad edit never blocks script execution.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    eprintln!("Error parsing {}: {}", path.display(), e);
                    eprintln!("Using default sandbox settings");
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Error reading {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parse settings JSON. Lines starting with `//` are comments.
    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        let cleaned: String = contents
            .lines()
            .filter(|line| !line.trim().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");
        serde_json::from_str(&cleaned)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;

        fs::write(path, json).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = SandboxSettings::default();
        assert_eq!(s.poll_interval_ms, 50);
        assert_eq!(s.report_line_limit, 16);
        assert_eq!(s.dump_prefix, "lua_dump");
        assert!(s.color);
        assert!(!s.debug);
    }

    #[test]
    fn test_parse_with_comments_and_partial_keys() {
        let json = r#"{
            // faster polling for tests
            "sandbox.pollIntervalMs": 5,
            "report.color": false
        }"#;
        let s = SandboxSettings::parse(json).unwrap();
        assert_eq!(s.poll_interval_ms, 5);
        assert!(!s.color);
        // Unspecified keys keep their defaults
        assert_eq!(s.hook_interval, DEFAULT_HOOK_INTERVAL);
        assert_eq!(s.report_line_limit, DEFAULT_REPORT_LINE_LIMIT);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let s = SandboxSettings::load_from(&dir.path().join("nope.json"));
        assert_eq!(s, SandboxSettings::default());
    }

    #[test]
    fn test_load_malformed_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(SandboxSettings::load_from(&path), SandboxSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sandbox.json");
        let mut s = SandboxSettings::default();
        s.debug = true;
        s.data_dir = Some(PathBuf::from("/srv/scripts"));
        s.save_to(&path).unwrap();

        let loaded = SandboxSettings::load_from(&path);
        assert_eq!(loaded, s);
        assert_eq!(loaded.effective_data_dir(), PathBuf::from("/srv/scripts"));
    }
}
