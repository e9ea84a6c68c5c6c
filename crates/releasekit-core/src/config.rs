use crate::errors::ReleaseKitError;
use std::path::Path;

pub const CONFIG_FILE: &str = "releasekit.toml";
pub const PACKAGE_CONFIG_FILE: &str = "releasekit.toml";

const ROOT_KEYS: &[&str] = &[
    "forge",
    "repo_owner",
    "repo_name",
    "default_branch",
    "pr_title_template",
    "tag_format",
    "concurrency",
    "max_retries",
    "poll_interval",
    "poll_timeout",
    "release_mode",
    "synchronize",
    "versioning_scheme",
    "bootstrap_sha",
    "hooks",
    "workspace",
];

const WORKSPACE_KEYS: &[&str] = &[
    "ecosystem",
    "tool",
    "root",
    "tag_format",
    "umbrella_tag",
    "synchronize",
    "versioning_scheme",
    "hooks",
];

const PACKAGE_KEYS: &[&str] = &["group", "tag_format", "versioning_scheme", "hooks", "hooks_replace"];

/// How releases are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseMode {
    /// Accumulate bumps on a Release PR; tag and publish on merge.
    #[default]
    Pr,
    /// Tag and publish directly from the current branch.
    Continuous,
}

impl ReleaseMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "pr" => Some(Self::Pr),
            "continuous" => Some(Self::Continuous),
            _ => None,
        }
    }
}

/// One `[workspace.<label>]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceConfig {
    pub label: String,
    pub ecosystem: String,
    pub tool: Option<String>,
    /// Workspace root, relative to the repository root.
    pub root: String,
    pub tag_format: Option<String>,
    pub umbrella_tag: Option<String>,
    pub synchronize: Option<bool>,
    pub versioning_scheme: Option<String>,
    pub hooks: Vec<String>,
}

/// Per-package `releasekit.toml` inside a package directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageOverrides {
    pub group: Option<String>,
    pub tag_format: Option<String>,
    pub versioning_scheme: Option<String>,
    pub hooks: Vec<String>,
    pub hooks_replace: bool,
}

/// Configuration for ReleaseKit, loaded from `releasekit.toml` at the
/// workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub forge: String,
    pub repo_owner: Option<String>,
    pub repo_name: Option<String>,
    pub default_branch: String,
    pub pr_title_template: String,
    pub tag_format: String,
    pub concurrency: usize,
    pub max_retries: u32,
    /// Seconds between registry availability polls.
    pub poll_interval: u64,
    /// Total polling budget in seconds.
    pub poll_timeout: u64,
    pub release_mode: ReleaseMode,
    pub synchronize: bool,
    pub versioning_scheme: String,
    /// Commits before this sha are outside every release window.
    pub bootstrap_sha: Option<String>,
    pub hooks: Vec<String>,
    pub workspaces: Vec<WorkspaceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            forge: "github".to_string(),
            repo_owner: None,
            repo_name: None,
            default_branch: "main".to_string(),
            pr_title_template: "chore(release): release {version}".to_string(),
            tag_format: "{name}-v{version}".to_string(),
            concurrency: 4,
            max_retries: 3,
            poll_interval: 10,
            poll_timeout: 600,
            release_mode: ReleaseMode::Pr,
            synchronize: false,
            versioning_scheme: "semver".to_string(),
            bootstrap_sha: None,
            hooks: Vec::new(),
            workspaces: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from `releasekit.toml` at the given root.
    ///
    /// A missing file yields the defaults; unknown keys fail with a
    /// fuzzy-close suggestion when one exists.
    pub fn load(root: &Path) -> Result<Self, ReleaseKitError> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|e| {
            ReleaseKitError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Parse configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self, ReleaseKitError> {
        let value: toml::Value = text
            .parse()
            .map_err(|e| ReleaseKitError::Config(format!("invalid {CONFIG_FILE}: {e}")))?;

        let table = value
            .as_table()
            .ok_or_else(|| ReleaseKitError::Config("configuration must be a table".into()))?;

        for key in table.keys() {
            if !ROOT_KEYS.contains(&key.as_str()) {
                return Err(unknown_key_error(key, ROOT_KEYS, "top level"));
            }
        }

        let defaults = Self::default();

        let forge = get_str(table, "forge").unwrap_or(defaults.forge);
        let repo_owner = get_str(table, "repo_owner");
        let repo_name = get_str(table, "repo_name");
        let default_branch = get_str(table, "default_branch").unwrap_or(defaults.default_branch);
        let pr_title_template =
            get_str(table, "pr_title_template").unwrap_or(defaults.pr_title_template);
        let tag_format = get_str(table, "tag_format").unwrap_or(defaults.tag_format);
        validate_tag_format(&tag_format)?;

        let concurrency = get_uint(table, "concurrency")?
            .map(|v| v as usize)
            .unwrap_or(defaults.concurrency)
            .max(1);
        let max_retries = get_uint(table, "max_retries")?
            .map(|v| v as u32)
            .unwrap_or(defaults.max_retries);
        let poll_interval = get_uint(table, "poll_interval")?.unwrap_or(defaults.poll_interval);
        let poll_timeout = get_uint(table, "poll_timeout")?.unwrap_or(defaults.poll_timeout);

        let release_mode = match get_str(table, "release_mode") {
            Some(raw) => ReleaseMode::parse(&raw).ok_or_else(|| {
                ReleaseKitError::Config(format!(
                    "release_mode must be 'pr' or 'continuous', got '{raw}'"
                ))
            })?,
            None => defaults.release_mode,
        };

        let synchronize = table
            .get("synchronize")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.synchronize);

        let versioning_scheme =
            get_str(table, "versioning_scheme").unwrap_or(defaults.versioning_scheme);
        let bootstrap_sha = get_str(table, "bootstrap_sha");
        let hooks = get_str_array(table, "hooks");

        let mut workspaces = Vec::new();
        if let Some(section) = table.get("workspace") {
            let section = section.as_table().ok_or_else(|| {
                ReleaseKitError::Config("[workspace] must contain labelled sections".into())
            })?;
            for (label, entry) in section {
                let entry = entry.as_table().ok_or_else(|| {
                    ReleaseKitError::Config(format!("[workspace.{label}] must be a table"))
                })?;
                for key in entry.keys() {
                    if !WORKSPACE_KEYS.contains(&key.as_str()) {
                        return Err(unknown_key_error(
                            key,
                            WORKSPACE_KEYS,
                            &format!("[workspace.{label}]"),
                        ));
                    }
                }
                let ecosystem = get_str(entry, "ecosystem").ok_or_else(|| {
                    ReleaseKitError::Config(format!(
                        "[workspace.{label}] is missing required key 'ecosystem'"
                    ))
                })?;
                let ws_tag_format = get_str(entry, "tag_format");
                if let Some(fmt) = &ws_tag_format {
                    validate_tag_format(fmt)?;
                }
                workspaces.push(WorkspaceConfig {
                    label: label.clone(),
                    ecosystem,
                    tool: get_str(entry, "tool"),
                    root: get_str(entry, "root").unwrap_or_else(|| ".".to_string()),
                    tag_format: ws_tag_format,
                    umbrella_tag: get_str(entry, "umbrella_tag"),
                    synchronize: entry.get("synchronize").and_then(|v| v.as_bool()),
                    versioning_scheme: get_str(entry, "versioning_scheme"),
                    hooks: get_str_array(entry, "hooks"),
                });
            }
        }

        Ok(Self {
            forge,
            repo_owner,
            repo_name,
            default_branch,
            pr_title_template,
            tag_format,
            concurrency,
            max_retries,
            poll_interval,
            poll_timeout,
            release_mode,
            synchronize,
            versioning_scheme,
            bootstrap_sha,
            hooks,
            workspaces,
        })
    }

    /// Load per-package overrides from `releasekit.toml` inside a package
    /// directory. A missing file yields the defaults.
    pub fn load_package_overrides(package_dir: &Path) -> Result<PackageOverrides, ReleaseKitError> {
        let path = package_dir.join(PACKAGE_CONFIG_FILE);
        if !path.exists() {
            return Ok(PackageOverrides::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| {
            ReleaseKitError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let value: toml::Value = text
            .parse()
            .map_err(|e| ReleaseKitError::Config(format!("{}: {e}", path.display())))?;
        let table = value.as_table().ok_or_else(|| {
            ReleaseKitError::Config(format!("{} must be a table", path.display()))
        })?;
        for key in table.keys() {
            if !PACKAGE_KEYS.contains(&key.as_str()) {
                return Err(unknown_key_error(key, PACKAGE_KEYS, "package config"));
            }
        }
        Ok(PackageOverrides {
            group: get_str(table, "group"),
            tag_format: get_str(table, "tag_format"),
            versioning_scheme: get_str(table, "versioning_scheme"),
            hooks: get_str_array(table, "hooks"),
            hooks_replace: table
                .get("hooks_replace")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }

    /// Resolve the tag format for a package: package > workspace > root.
    pub fn resolved_tag_format(
        &self,
        workspace_label: Option<&str>,
        overrides: Option<&PackageOverrides>,
    ) -> String {
        if let Some(fmt) = overrides.and_then(|o| o.tag_format.clone()) {
            return fmt;
        }
        if let Some(label) = workspace_label {
            if let Some(ws) = self.workspaces.iter().find(|w| w.label == label) {
                if let Some(fmt) = &ws.tag_format {
                    return fmt.clone();
                }
            }
        }
        self.tag_format.clone()
    }

    /// Resolve the versioning scheme name: package > workspace > root.
    pub fn resolved_scheme(
        &self,
        workspace_label: Option<&str>,
        overrides: Option<&PackageOverrides>,
    ) -> String {
        if let Some(scheme) = overrides.and_then(|o| o.versioning_scheme.clone()) {
            return scheme;
        }
        if let Some(label) = workspace_label {
            if let Some(ws) = self.workspaces.iter().find(|w| w.label == label) {
                if let Some(scheme) = &ws.versioning_scheme {
                    return scheme.clone();
                }
            }
        }
        self.versioning_scheme.clone()
    }

    /// Resolve hook commands for a package. Hooks concatenate across the
    /// root, workspace, and package tiers unless the package sets
    /// `hooks_replace = true`.
    pub fn resolved_hooks(
        &self,
        workspace_label: Option<&str>,
        overrides: Option<&PackageOverrides>,
    ) -> Vec<String> {
        if let Some(o) = overrides {
            if o.hooks_replace {
                return o.hooks.clone();
            }
        }
        let mut hooks = self.hooks.clone();
        if let Some(label) = workspace_label {
            if let Some(ws) = self.workspaces.iter().find(|w| w.label == label) {
                hooks.extend(ws.hooks.iter().cloned());
            }
        }
        if let Some(o) = overrides {
            hooks.extend(o.hooks.iter().cloned());
        }
        hooks
    }

    /// Expand a tag format with the package name and version.
    pub fn format_tag(format: &str, name: &str, version: &str) -> String {
        format.replace("{name}", name).replace("{version}", version)
    }
}

fn get_str(table: &toml::value::Table, key: &str) -> Option<String> {
    table
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn get_uint(table: &toml::value::Table, key: &str) -> Result<Option<u64>, ReleaseKitError> {
    match table.get(key) {
        None => Ok(None),
        Some(value) => {
            let raw = value.as_integer().ok_or_else(|| {
                ReleaseKitError::Config(format!("'{key}' must be an integer, got {value}"))
            })?;
            u64::try_from(raw)
                .map(Some)
                .map_err(|_| ReleaseKitError::Config(format!("'{key}' must be non-negative")))
        }
    }
}

fn get_str_array(table: &toml::value::Table, key: &str) -> Vec<String> {
    table
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn validate_tag_format(format: &str) -> Result<(), ReleaseKitError> {
    if !format.contains("{version}") {
        return Err(ReleaseKitError::Config(format!(
            "tag_format '{format}' must contain the {{version}} placeholder"
        )));
    }
    Ok(())
}

fn unknown_key_error(key: &str, known: &[&str], context: &str) -> ReleaseKitError {
    let suggestion = known
        .iter()
        .map(|candidate| (candidate, edit_distance(key, candidate)))
        .filter(|(_, d)| *d <= 2)
        .min_by_key(|(_, d)| *d)
        .map(|(candidate, _)| format!(" (did you mean '{candidate}'?)"))
        .unwrap_or_default();
    ReleaseKitError::Config(format!("unknown key '{key}' at {context}{suggestion}"))
}

/// Levenshtein distance, used only for unknown-key suggestions.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (prev[j + 1] + 1).min(current[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_when_missing() {
        let temp = tempfile::tempdir().unwrap();
        let config = Config::load(temp.path()).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.release_mode, ReleaseMode::Pr);
        assert_eq!(config.tag_format, "{name}-v{version}");
    }

    #[test]
    fn parses_top_level_and_workspaces() {
        let text = r#"
forge = "github"
repo_owner = "acme"
repo_name = "monorepo"
concurrency = 8
release_mode = "continuous"
synchronize = true

[workspace.rust]
ecosystem = "cargo"
root = "rust"
umbrella_tag = "v{version}"

[workspace.web]
ecosystem = "npm"
tool = "pnpm"
root = "web"
tag_format = "{name}@{version}"
"#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.repo_owner.as_deref(), Some("acme"));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.release_mode, ReleaseMode::Continuous);
        assert!(config.synchronize);
        assert_eq!(config.workspaces.len(), 2);
        let web = config.workspaces.iter().find(|w| w.label == "web").unwrap();
        assert_eq!(web.tool.as_deref(), Some("pnpm"));
        assert_eq!(web.tag_format.as_deref(), Some("{name}@{version}"));
    }

    #[test]
    fn unknown_key_suggests_close_match() {
        let err = Config::parse("concurency = 4\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown key 'concurency'"), "{msg}");
        assert!(msg.contains("did you mean 'concurrency'"), "{msg}");
    }

    #[test]
    fn unknown_key_without_close_match_has_no_suggestion() {
        let err = Config::parse("zzzzzz = 1\n").unwrap_err();
        assert!(!err.to_string().contains("did you mean"));
    }

    #[test]
    fn rejects_tag_format_without_version() {
        let err = Config::parse("tag_format = \"{name}\"\n").unwrap_err();
        assert!(err.to_string().contains("{version}"));
    }

    #[test]
    fn rejects_bad_release_mode() {
        let err = Config::parse("release_mode = \"yolo\"\n").unwrap_err();
        assert!(err.to_string().contains("release_mode"));
    }

    #[test]
    fn workspace_requires_ecosystem() {
        let err = Config::parse("[workspace.rust]\nroot = \"rust\"\n").unwrap_err();
        assert!(err.to_string().contains("ecosystem"));
    }

    #[test]
    fn package_overrides_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(
            temp.path().join(PACKAGE_CONFIG_FILE),
            "group = \"plugins\"\nhooks = [\"cargo test\"]\nhooks_replace = true\n",
        )
        .unwrap();
        let overrides = Config::load_package_overrides(temp.path()).unwrap();
        assert_eq!(overrides.group.as_deref(), Some("plugins"));
        assert!(overrides.hooks_replace);
    }

    #[test]
    fn hooks_concatenate_across_tiers() {
        let config = Config::parse(
            "hooks = [\"root-hook\"]\n[workspace.rust]\necosystem = \"cargo\"\nhooks = [\"ws-hook\"]\n",
        )
        .unwrap();
        let overrides = PackageOverrides {
            hooks: vec!["pkg-hook".into()],
            ..Default::default()
        };
        let hooks = config.resolved_hooks(Some("rust"), Some(&overrides));
        assert_eq!(hooks, vec!["root-hook", "ws-hook", "pkg-hook"]);
    }

    #[test]
    fn hooks_replace_drops_outer_tiers() {
        let config = Config::parse("hooks = [\"root-hook\"]\n").unwrap();
        let overrides = PackageOverrides {
            hooks: vec!["pkg-hook".into()],
            hooks_replace: true,
            ..Default::default()
        };
        assert_eq!(
            config.resolved_hooks(None, Some(&overrides)),
            vec!["pkg-hook"]
        );
    }

    #[test]
    fn resolution_order_package_then_workspace_then_root() {
        let config = Config::parse(
            "tag_format = \"{name}-v{version}\"\n[workspace.rust]\necosystem = \"cargo\"\ntag_format = \"rust-{name}-v{version}\"\n",
        )
        .unwrap();
        assert_eq!(
            config.resolved_tag_format(Some("rust"), None),
            "rust-{name}-v{version}"
        );
        let overrides = PackageOverrides {
            tag_format: Some("special-{version}".into()),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_tag_format(Some("rust"), Some(&overrides)),
            "special-{version}"
        );
        assert_eq!(config.resolved_tag_format(None, None), "{name}-v{version}");
    }

    #[test]
    fn format_tag_expands_placeholders() {
        assert_eq!(
            Config::format_tag("{name}-v{version}", "core", "1.2.3"),
            "core-v1.2.3"
        );
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("abc", "abc"), 0);
        assert_eq!(edit_distance("abc", "abd"), 1);
        assert_eq!(edit_distance("concurency", "concurrency"), 1);
    }
}
