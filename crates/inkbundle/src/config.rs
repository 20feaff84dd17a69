//! Layered configuration
//!
//! TOML layers merge table by table; arrays such as `entries` are replaced
//! wholesale.

use std::{
    collections::BTreeSet,
    fmt, fs,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use etcetera::{BaseStrategy, choose_base_strategy};
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    entry::{DEFAULT_BINDING, EntrySpec, default_entries},
    error::BundleError,
    patch::PatchRule,
};

/// File name of the project-level configuration, looked up in the root
pub const PROJECT_CONFIG_FILE: &str = "inkbundle.toml";

pub const ENV_MODE: &str = "INKBUNDLE_MODE";
pub const ENV_OUT_DIR: &str = "INKBUNDLE_OUT_DIR";
pub const ENV_MINIFY: &str = "INKBUNDLE_MINIFY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Development,
    #[default]
    Production,
}

impl Mode {
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => f.write_str("development"),
            Self::Production => f.write_str("production"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Project root; every relative path below is taken relative to it
    #[serde(skip)]
    pub root: PathBuf,
    pub mode: Mode,
    pub out_dir: PathBuf,
    pub minify: bool,
    /// Dotted expression -> replacement source text
    pub define: IndexMap<String, String>,
    /// Exact package name -> development build
    pub overrides: IndexMap<String, PathBuf>,
    pub guard: PatchRule,
    pub entries: Vec<EntrySpec>,
}

impl Default for Config {
    fn default() -> Self {
        let mut define = IndexMap::new();
        define.insert(
            "process.env.NODE_ENV".to_owned(),
            "\"production\"".to_owned(),
        );

        let overrides = [
            ("react", "node_modules/react/cjs/react.development.js"),
            (
                "react-dom",
                "node_modules/react-dom/cjs/react-dom.development.js",
            ),
            (
                "scheduler",
                "node_modules/scheduler/cjs/scheduler.development.js",
            ),
            (
                "react/jsx-runtime",
                "node_modules/react/cjs/react-jsx-runtime.development.js",
            ),
            (
                "react/jsx-dev-runtime",
                "node_modules/react/cjs/react-jsx-dev-runtime.development.js",
            ),
        ]
        .into_iter()
        .map(|(package, path)| (package.to_owned(), PathBuf::from(path)))
        .collect();

        Self {
            root: PathBuf::from("."),
            mode: Mode::default(),
            out_dir: PathBuf::from("node_modules/.cache/inkbundle"),
            minify: true,
            define,
            overrides,
            guard: PatchRule::environment_guard(),
            entries: default_entries(),
        }
    }
}

impl Config {
    /// Defaults anchored at `root`, with no file or environment layers applied
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load every configuration layer for the project at `root`
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        Self::load_from(root, user_config_path().as_deref(), explicit)
    }

    /// Same as [`Config::load`] with the user config location supplied by the caller
    pub fn load_from(root: &Path, user: Option<&Path>, explicit: Option<&Path>) -> Result<Self> {
        let toml::Value::Table(mut merged) = toml::Value::try_from(Self::default())
            .context("Failed to serialize built-in configuration")?
        else {
            bail!("built-in configuration did not serialize to a table");
        };

        let project = root.join(PROJECT_CONFIG_FILE);
        let optional_layers = [user, Some(project.as_path())];
        for path in optional_layers.into_iter().flatten() {
            if path.is_file() {
                merge_tables(&mut merged, read_layer(path)?);
            }
        }
        if let Some(path) = explicit {
            // An explicitly named file must exist
            merge_tables(&mut merged, read_layer(path)?);
        }

        let mut config: Self = toml::Value::Table(merged)
            .try_into()
            .context("Invalid inkbundle configuration")?;
        config.root = root.to_path_buf();
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(ENV_MODE) {
            self.mode = Mode::from_str(&value, true)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("Invalid {ENV_MODE} value '{value}'"))?;
        }
        if let Ok(value) = std::env::var(ENV_OUT_DIR) {
            self.out_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var(ENV_MINIFY) {
            self.minify = parse_flag(&value)
                .with_context(|| format!("Invalid {ENV_MINIFY} value '{value}'"))?;
        }
        Ok(())
    }

    /// Absolute output directory, with `.` and `..` resolved lexically
    pub fn out_dir_path(&self) -> PathBuf {
        normalize_lexically(&self.root.join(&self.out_dir))
    }

    /// Path of the artifact produced for `entry`
    pub fn artifact_path(&self, entry: &EntrySpec) -> PathBuf {
        self.out_dir_path().join(entry.artifact_file_name())
    }

    /// The entry that bundles the core runtime with no externals
    pub fn standalone_entry(&self) -> Option<&EntrySpec> {
        self.entries.iter().find(|e| e.standalone)
    }

    /// Check the structural invariants the pipeline relies on
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.entries.is_empty() {
            return Err(BundleError::Config("no entries configured".to_owned()));
        }

        let standalone = self.entries.iter().filter(|e| e.standalone).count();
        if standalone != 1 {
            return Err(BundleError::Config(format!(
                "exactly one standalone entry is required, found {standalone}"
            )));
        }

        let mut names = BTreeSet::new();
        for entry in &self.entries {
            if !names.insert(entry.name.as_str()) {
                return Err(BundleError::Config(format!(
                    "duplicate entry name '{}'",
                    entry.name
                )));
            }
            if entry.symbols.is_empty() {
                return Err(BundleError::Config(format!(
                    "entry '{}' does not export any symbols",
                    entry.name
                )));
            }
            let mut symbols = BTreeSet::new();
            for symbol in &entry.symbols {
                if symbol == "default" || symbol == DEFAULT_BINDING {
                    return Err(BundleError::Config(format!(
                        "entry '{}' exports the reserved name '{symbol}'",
                        entry.name
                    )));
                }
                if !symbols.insert(symbol.as_str()) {
                    return Err(BundleError::Config(format!(
                        "entry '{}' exports '{symbol}' more than once",
                        entry.name
                    )));
                }
            }
            if !self.overrides.contains_key(&entry.package) {
                return Err(BundleError::Config(format!(
                    "entry '{}' uses package '{}' which has no development override",
                    entry.name, entry.package
                )));
            }
        }

        if self.guard.find.is_empty() {
            return Err(BundleError::Config(format!(
                "patch rule '{}' has an empty pattern",
                self.guard.name
            )));
        }
        self.validate_out_dir()
    }

    /// The output directory is replaced wholesale, so it must not hold project files
    fn validate_out_dir(&self) -> crate::error::Result<()> {
        let out_dir = self.out_dir_path();
        let root = normalize_lexically(&self.root);
        if root.starts_with(&out_dir) {
            return Err(BundleError::Config(format!(
                "output directory {} is the project root or one of its parents",
                out_dir.display()
            )));
        }
        for (package, path) in &self.overrides {
            if normalize_lexically(&root.join(path)).starts_with(&out_dir) {
                return Err(BundleError::Config(format!(
                    "output directory {} contains the development build of '{package}'",
                    out_dir.display()
                )));
            }
        }
        Ok(())
    }
}

/// Resolve `.` and `..` components without touching the filesystem
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let at_start = matches!(
                    normalized.components().next_back(),
                    None | Some(Component::ParentDir)
                );
                if at_start {
                    normalized.push("..");
                } else {
                    normalized.pop();
                }
            }
            other => normalized.push(other),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

/// `<config dir>/inkbundle/config.toml` for the current user, if a home exists
pub fn user_config_path() -> Option<PathBuf> {
    match choose_base_strategy() {
        Ok(strategy) => Some(strategy.config_dir().join("inkbundle").join("config.toml")),
        Err(e) => {
            debug!("No user configuration directory: {e}");
            None
        }
    }
}

fn read_layer(path: &Path) -> Result<toml::Table> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    debug!("Loaded configuration layer {}", path.display());
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Merge `overlay` into `base`; nested tables merge, everything else is replaced
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;

    /// Sets an environment variable for the lifetime of the guard
    #[must_use = "EnvGuard must be held in scope to ensure cleanup"]
    struct EnvGuard {
        key: &'static str,
        original_value: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let original_value = std::env::var(key).ok();
            // SAFETY: tests touching the environment run under #[serial]
            unsafe {
                std::env::set_var(key, value);
            }
            Self {
                key,
                original_value,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            // SAFETY: see EnvGuard::set
            unsafe {
                match &self.original_value {
                    Some(value) => std::env::set_var(self.key, value),
                    None => std::env::remove_var(self.key),
                }
            }
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::for_root("/srv/site");
        config.validate().expect("defaults should validate");
        assert_eq!(config.mode, Mode::Production);
        assert_eq!(
            config.out_dir_path(),
            PathBuf::from("/srv/site/node_modules/.cache/inkbundle")
        );
        assert_eq!(config.overrides.len(), 5);
        assert_eq!(
            config.standalone_entry().map(|e| e.name.as_str()),
            Some("core")
        );
    }

    #[test]
    #[serial]
    fn test_project_layer_merges_tables() {
        let root = TempDir::new().expect("tempdir");
        fs::write(
            root.path().join(PROJECT_CONFIG_FILE),
            r#"
minify = false

[guard]
find = "if ('production' !== process.env.NODE_ENV) {"

[overrides]
"react-is" = "node_modules/react-is/cjs/react-is.development.js"
"#,
        )
        .expect("write config");

        let config = Config::load_from(root.path(), None, None).expect("config loads");
        assert!(!config.minify);
        assert_eq!(
            config.guard.find,
            "if ('production' !== process.env.NODE_ENV) {"
        );
        // Untouched keys of a merged table survive
        assert_eq!(config.guard.replace, "if (true) {");
        assert_eq!(config.overrides.len(), 6);
        assert_eq!(config.root, root.path());
    }

    #[test]
    #[serial]
    fn test_explicit_layer_wins_over_project() {
        let root = TempDir::new().expect("tempdir");
        fs::write(root.path().join(PROJECT_CONFIG_FILE), "out_dir = \"a\"\n").expect("write");
        let user = root.path().join("user.toml");
        fs::write(&user, "out_dir = \"from-user\"\nminify = false\n").expect("write");
        let explicit = root.path().join("ci.toml");
        fs::write(&explicit, "out_dir = \"b\"\n").expect("write");

        let config =
            Config::load_from(root.path(), Some(user.as_path()), Some(explicit.as_path())).expect("config loads");
        assert_eq!(config.out_dir, PathBuf::from("b"));
        assert!(!config.minify, "user layer still applies where not overridden");
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        let root = TempDir::new().expect("tempdir");
        let err = Config::load_from(root.path(), None, Some(root.path().join("nope.toml").as_path()))
            .expect_err("explicit config must exist");
        assert!(format!("{err:#}").contains("nope.toml"));
    }

    #[test]
    #[serial]
    fn test_unknown_keys_are_rejected() {
        let root = TempDir::new().expect("tempdir");
        fs::write(root.path().join(PROJECT_CONFIG_FILE), "minfy = false\n").expect("write");
        assert!(Config::load_from(root.path(), None, None).is_err());
    }

    #[test]
    #[serial]
    fn test_environment_overrides_files() {
        let root = TempDir::new().expect("tempdir");
        fs::write(root.path().join(PROJECT_CONFIG_FILE), "minify = true\n").expect("write");

        let _mode = EnvGuard::set(ENV_MODE, "Development");
        let _minify = EnvGuard::set(ENV_MINIFY, "0");
        let _out = EnvGuard::set(ENV_OUT_DIR, "/tmp/inkbundle-out");

        let config = Config::load_from(root.path(), None, None).expect("config loads");
        assert_eq!(config.mode, Mode::Development);
        assert!(!config.minify);
        assert_eq!(config.out_dir_path(), PathBuf::from("/tmp/inkbundle-out"));
    }

    #[test]
    #[serial]
    fn test_invalid_environment_value() {
        let root = TempDir::new().expect("tempdir");
        let _minify = EnvGuard::set(ENV_MINIFY, "sometimes");
        let err = Config::load_from(root.path(), None, None).expect_err("bad flag");
        assert!(format!("{err:#}").contains(ENV_MINIFY));
    }

    #[test]
    fn test_validate_rejects_broken_entry_tables() {
        let mut config = Config::for_root("/srv/site");
        config.entries[1].standalone = true;
        assert!(matches!(config.validate(), Err(BundleError::Config(m)) if m.contains("exactly one")));

        let mut config = Config::for_root("/srv/site");
        config.entries[2].name = "dom".to_owned();
        assert!(matches!(config.validate(), Err(BundleError::Config(m)) if m.contains("duplicate")));

        let mut config = Config::for_root("/srv/site");
        config.overrides.shift_remove("react-dom");
        assert!(matches!(config.validate(), Err(BundleError::Config(m)) if m.contains("react-dom")));
    }

    #[test]
    fn test_validate_rejects_unusable_symbol_lists() {
        let mut config = Config::for_root("/srv/site");
        config.entries[1].symbols = vec!["a".to_owned(), "a".to_owned()];
        assert!(matches!(
            config.validate(),
            Err(BundleError::Config(m)) if m.contains("'dom'") && m.contains("'a' more than once")
        ));

        for reserved in ["default", DEFAULT_BINDING] {
            let mut config = Config::for_root("/srv/site");
            config.entries[2].symbols.push(reserved.to_owned());
            assert!(matches!(
                config.validate(),
                Err(BundleError::Config(m)) if m.contains("'jsx-runtime'") && m.contains("reserved")
            ));
        }
    }

    #[test]
    fn test_validate_rejects_output_over_project_files() {
        for out_dir in [".", "", "./", "..", "public/../", "node_modules", "node_modules/react"] {
            let mut config = Config::for_root("/srv/site");
            config.out_dir = PathBuf::from(out_dir);
            assert!(
                matches!(config.validate(), Err(BundleError::Config(m)) if m.contains("output directory")),
                "out_dir {out_dir:?} must be rejected"
            );
        }

        let mut config = Config::for_root("/srv/site");
        config.out_dir = PathBuf::from("/srv");
        assert!(config.validate().is_err(), "an ancestor of the root is rejected");

        for out_dir in ["public/runtime", "node_modules/.cache/inkbundle", "/var/cache/inkbundle"] {
            let mut config = Config::for_root("/srv/site");
            config.out_dir = PathBuf::from(out_dir);
            config.validate().expect("output outside project files is accepted");
        }
    }

    #[test]
    fn test_out_dir_path_is_normalized() {
        let mut config = Config::for_root("/srv/site");
        config.out_dir = PathBuf::from("./public/../dist/runtime");
        assert_eq!(config.out_dir_path(), PathBuf::from("/srv/site/dist/runtime"));
        config.out_dir = PathBuf::new();
        assert_eq!(config.out_dir_path(), PathBuf::from("/srv/site"));
    }
}
